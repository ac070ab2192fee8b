//! Proxy process spawning and termination.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use crate::error::{TunnelError, TunnelResult};
use crate::runtime::FilesystemLayout;
use crate::runtime::constants::process::POLL_INTERVAL;

/// Spawns the proxy with stdio redirected to a log file.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    log_path: PathBuf,
    grace_period: Duration,
}

/// A running proxy process.
#[derive(Debug)]
pub struct ProxyProcess {
    child: Child,
    pid: u32,
    exit_status: Option<ExitStatus>,
}

impl ProxyProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking exit check. Returns the status once the process is gone.
    pub fn try_exit_status(&mut self) -> Option<ExitStatus> {
        if self.exit_status.is_none() {
            match self.child.try_wait() {
                Ok(status) => self.exit_status = status,
                Err(e) => tracing::debug!(pid = self.pid, "try_wait failed: {}", e),
            }
        }
        self.exit_status
    }

    pub fn is_running(&mut self) -> bool {
        self.try_exit_status().is_none()
    }
}

impl ProcessSupervisor {
    pub fn new(log_path: PathBuf, grace_period: Duration) -> Self {
        Self {
            log_path,
            grace_period,
        }
    }

    /// Start `program` with `args`. stdin is null, stdout and stderr append
    /// to the proxy log.
    pub fn spawn(&self, program: &Path, args: &[String]) -> TunnelResult<ProxyProcess> {
        let stdout = FilesystemLayout::open_log(&self.log_path)?;
        let stderr = stdout.try_clone().map_err(|e| {
            TunnelError::ProcessSpawnFailed(format!("failed to clone log handle: {}", e))
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        let child = cmd.spawn().map_err(|e| {
            let err_msg = format!("{}: {}", program.display(), e);
            tracing::error!("Failed to spawn proxy process {}", err_msg);
            TunnelError::ProcessSpawnFailed(err_msg)
        })?;

        let pid = child.id();
        tracing::info!(pid, program = %program.display(), "Spawned proxy process");

        Ok(ProxyProcess {
            child,
            pid,
            exit_status: None,
        })
    }

    /// SIGTERM, wait up to the grace period, then SIGKILL and reap.
    ///
    /// Never fails. Errors are logged. Calling it on an exited process is a no-op.
    pub fn terminate(&self, process: &mut ProxyProcess) {
        let pid = process.pid;

        if let Some(status) = process.try_exit_status() {
            tracing::debug!(pid, %status, "Proxy process already exited");
            return;
        }

        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::warn!(pid, "Failed to send SIGTERM to proxy: {}", e);
        }

        let deadline = Instant::now() + self.grace_period;
        loop {
            if let Some(status) = process.try_exit_status() {
                tracing::info!(pid, %status, "Proxy process exited after SIGTERM");
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }

        tracing::warn!(
            pid,
            grace_ms = self.grace_period.as_millis() as u64,
            "Proxy ignored SIGTERM, sending SIGKILL"
        );
        if let Err(e) = process.child.kill() {
            tracing::warn!(pid, "Failed to SIGKILL proxy: {}", e);
        }
        match process.child.wait() {
            Ok(status) => {
                process.exit_status = Some(status);
                tracing::info!(pid, %status, "Proxy process killed");
            }
            Err(e) => tracing::warn!(pid, "Failed to reap proxy: {}", e),
        }
    }
}

impl Drop for ProxyProcess {
    fn drop(&mut self) {
        if self.exit_status.is_none() && self.is_running() {
            tracing::warn!(pid = self.pid, "ProxyProcess dropped while running, killing");
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::is_process_alive;
    use std::io::Read;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use tempfile::tempdir;

    fn cloexec_pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn supervisor(dir: &Path) -> ProcessSupervisor {
        ProcessSupervisor::new(dir.join("proxy.log"), Duration::from_secs(1))
    }

    #[test]
    fn test_spawn_writes_output_to_log() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path());
        let mut proc = sup
            .spawn(
                Path::new("/bin/sh"),
                &["-c".to_string(), "echo hello; echo oops >&2".to_string()],
            )
            .unwrap();

        let status = proc.child.wait().unwrap();
        assert!(status.success());
        let log = std::fs::read_to_string(dir.path().join("proxy.log")).unwrap();
        assert!(log.contains("hello"));
        assert!(log.contains("oops"));
    }

    #[test]
    fn test_spawn_missing_program_fails() {
        let dir = tempdir().unwrap();
        let err = supervisor(dir.path())
            .spawn(Path::new("/nonexistent/proxy-binary"), &[])
            .unwrap_err();
        assert!(matches!(err, TunnelError::ProcessSpawnFailed(_)));
    }

    #[test]
    fn test_terminate_graceful_and_idempotent() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path());
        let mut proc = sup
            .spawn(Path::new("/bin/sleep"), &["30".to_string()])
            .unwrap();
        let pid = proc.pid();

        let start = Instant::now();
        sup.terminate(&mut proc);
        assert!(start.elapsed() < Duration::from_millis(900));
        assert!(!is_process_alive(pid));

        sup.terminate(&mut proc);
    }

    #[test]
    fn test_terminate_escalates_to_sigkill() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path());
        let mut proc = sup
            .spawn(
                Path::new("/bin/sh"),
                &[
                    "-c".to_string(),
                    "trap '' TERM; while true; do sleep 0.05; done".to_string(),
                ],
            )
            .unwrap();
        let pid = proc.pid();
        std::thread::sleep(Duration::from_millis(100));

        let start = Instant::now();
        sup.terminate(&mut proc);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(900), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(3), "elapsed {:?}", elapsed);
        assert!(!is_process_alive(pid));
    }

    #[test]
    fn test_cloexec_descriptor_not_visible_to_proxy() {
        let dir = tempdir().unwrap();
        let (read_end, write_end) = cloexec_pipe();
        let script = format!("printf ok >&{}", write_end.as_raw_fd());

        let mut proc = supervisor(dir.path())
            .spawn(Path::new("/bin/sh"), &["-c".to_string(), script])
            .unwrap();
        let _ = proc.child.wait().unwrap();
        drop(write_end);

        let mut out = String::new();
        std::fs::File::from(read_end).read_to_string(&mut out).unwrap();
        assert_eq!(out, "");
    }
}
