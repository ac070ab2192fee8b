//! Fork/exec launcher that keeps selected descriptors open across exec.
//!
//! Every descriptor this crate opens is close-on-exec, and `std::process`
//! offers no way to hand one to a child at a chosen number. The relay needs
//! the TUN device at a known slot, so it is started here instead.
//!
//! Between `fork` and `exec` the child may only make async-signal-safe calls:
//! all strings, descriptors and the fd scan are prepared in the parent.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::fcntl::OFlag;
use nix::unistd::{ForkResult, Pid, fork, pipe2};

use crate::error::{TunnelError, TunnelResult};
use crate::process::find_binary;
use crate::runtime::FilesystemLayout;
use crate::runtime::constants::process::POLL_INTERVAL;

/// SIGTERM polls before escalating to SIGKILL.
const KILL_POLL_ATTEMPTS: u32 = 10;

/// Child-side failure stages reported through the status pipe.
const STAGE_REDIRECT: i32 = 1;
const STAGE_EXEC: i32 = 2;

/// A descriptor to place at `slot` in the child.
#[derive(Debug, Clone, Copy)]
pub struct InheritedFd<'a> {
    pub fd: BorrowedFd<'a>,
    pub slot: RawFd,
}

/// A relay started by [`FdPreservingLauncher`]. Only the pid is held.
#[derive(Debug)]
pub struct RelayProcess {
    pid: Pid,
    exited: Option<WaitStatus>,
}

impl RelayProcess {
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Reap without blocking. Returns the wait status once the relay is gone.
    pub fn try_reap(&mut self) -> Option<WaitStatus> {
        if self.exited.is_none() {
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(status) => self.exited = Some(status),
                // Not our child anymore; treat as gone.
                Err(Errno::ECHILD) => self.exited = Some(WaitStatus::Exited(self.pid, 0)),
                Err(e) => tracing::debug!(pid = self.pid(), "waitpid failed: {}", e),
            }
        }
        self.exited
    }

    pub fn is_running(&mut self) -> bool {
        self.try_reap().is_none()
    }
}

/// Starts processes with descriptors at fixed slots.
#[derive(Debug, Clone)]
pub struct FdPreservingLauncher {
    log_path: PathBuf,
}

impl FdPreservingLauncher {
    /// `log_path` receives the child's stdout and stderr.
    pub fn new(log_path: PathBuf) -> Self {
        Self { log_path }
    }

    /// Launch with a single inherited descriptor.
    pub fn launch_preserving_descriptor(
        &self,
        program: &Path,
        args: &[String],
        fd: BorrowedFd<'_>,
        slot: RawFd,
    ) -> TunnelResult<RelayProcess> {
        self.spawn_with_inherited_descriptors(program, args, &[InheritedFd { fd, slot }])
    }

    /// Fork, place each descriptor at its slot, close everything else, exec.
    ///
    /// stdin is `/dev/null`; stdout and stderr go to the log file. An exec
    /// failure comes back as `LaunchFailed` with the child's errno.
    pub fn spawn_with_inherited_descriptors(
        &self,
        program: &Path,
        args: &[String],
        inherited: &[InheritedFd<'_>],
    ) -> TunnelResult<RelayProcess> {
        validate_slots(inherited)?;

        let resolved = find_binary(program).ok_or_else(|| {
            TunnelError::LaunchFailed(format!("{}: program not found", program.display()))
        })?;
        let program_c = CString::new(resolved.as_os_str().as_bytes()).map_err(|_| {
            TunnelError::LaunchFailed("program path contains null byte".to_string())
        })?;
        let mut argv_c: Vec<CString> = Vec::with_capacity(1 + args.len());
        argv_c.push(program_c.clone());
        for arg in args {
            argv_c.push(CString::new(arg.as_bytes()).map_err(|_| {
                TunnelError::LaunchFailed(format!("argument contains null byte: {}", arg))
            })?);
        }
        let argv_ptrs: Vec<*const libc::c_char> = argv_c
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        let dev_null = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/null")
            .map_err(|e| TunnelError::LaunchFailed(format!("open /dev/null: {}", e)))?;
        let log = FilesystemLayout::open_log(&self.log_path)
            .map_err(|e| TunnelError::LaunchFailed(e.to_string()))?;
        let (status_read, status_write) = cloexec_pipe()
            .map_err(|e| TunnelError::LaunchFailed(format!("status pipe: {}", e)))?;

        let mut placements: Vec<(RawFd, RawFd)> = vec![
            (dev_null.as_raw_fd(), libc::STDIN_FILENO),
            (log.as_raw_fd(), libc::STDOUT_FILENO),
            (log.as_raw_fd(), libc::STDERR_FILENO),
        ];
        placements.extend(inherited.iter().map(|i| (i.fd.as_raw_fd(), i.slot)));
        let mut staged: Vec<RawFd> = vec![-1; placements.len()];

        let highest_slot = placements.iter().map(|(_, slot)| *slot).max().unwrap_or(2);
        let keep: Vec<RawFd> = placements.iter().map(|(_, slot)| *slot).collect();
        let max_fd = get_max_fd();
        let status_fd = status_write.as_raw_fd();

        // SAFETY: the child only makes async-signal-safe calls before exec or _exit.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => unsafe {
                child_exec(
                    &program_c,
                    &argv_ptrs,
                    &placements,
                    &mut staged,
                    highest_slot,
                    &keep,
                    max_fd,
                    status_fd,
                )
            },
            Ok(ForkResult::Parent { child }) => {
                drop(status_write);
                drop(dev_null);
                drop(log);
                let relay = RelayProcess {
                    pid: child,
                    exited: None,
                };
                self.await_exec(relay, status_read, &resolved)
            }
            Err(e) => Err(TunnelError::LaunchFailed(format!("fork failed: {}", e))),
        }
    }

    /// Block until the child execs (pipe closes) or reports a failure.
    fn await_exec(
        &self,
        relay: RelayProcess,
        status_read: OwnedFd,
        program: &Path,
    ) -> TunnelResult<RelayProcess> {
        if relay.pid.as_raw() <= 0 {
            return Err(TunnelError::LaunchFailed(format!(
                "invalid pid {}",
                relay.pid
            )));
        }

        let mut buf = [0u8; 8];
        let mut filled = 0;
        let mut pipe = File::from(status_read);
        while filled < buf.len() {
            match pipe.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(pid = relay.pid(), "Failed to read launch status: {}", e);
                    break;
                }
            }
        }

        if filled == 0 {
            tracing::info!(pid = relay.pid(), program = %program.display(), "Launched relay process");
            return Ok(relay);
        }

        let stage = i32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let errno = i32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if let Err(e) = waitpid(relay.pid, None) {
            tracing::debug!(pid = relay.pid(), "Failed to reap failed launch: {}", e);
        }

        let what = if stage == STAGE_EXEC { "exec" } else { "descriptor setup" };
        Err(TunnelError::LaunchFailed(format!(
            "{} of {} failed: {}",
            what,
            program.display(),
            std::io::Error::from_raw_os_error(errno)
        )))
    }
}

/// SIGTERM, poll for up to a second, then SIGKILL and reap.
///
/// Returns `true` if the process is gone (or already was), `false` if
/// signalling was refused.
pub fn kill_process(relay: &mut RelayProcess) -> bool {
    let pid = relay.pid;
    if relay.try_reap().is_some() {
        return true;
    }

    match kill(pid, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            relay.exited = Some(WaitStatus::Exited(pid, 0));
            return true;
        }
        Err(e) => {
            tracing::warn!(pid = pid.as_raw(), "Failed to signal relay: {}", e);
            return false;
        }
    }

    for _ in 0..KILL_POLL_ATTEMPTS {
        if let Some(status) = relay.try_reap() {
            tracing::info!(pid = pid.as_raw(), ?status, "Relay exited after SIGTERM");
            return true;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    tracing::warn!(pid = pid.as_raw(), "Relay ignored SIGTERM, sending SIGKILL");
    match kill(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            tracing::warn!(pid = pid.as_raw(), "Failed to SIGKILL relay: {}", e);
            return false;
        }
    }
    match waitpid(pid, None) {
        Ok(status) => relay.exited = Some(status),
        Err(e) => {
            tracing::debug!(pid = pid.as_raw(), "waitpid after SIGKILL: {}", e);
            relay.exited = Some(WaitStatus::Signaled(pid, Signal::SIGKILL, false));
        }
    }
    true
}

fn validate_slots(inherited: &[InheritedFd<'_>]) -> TunnelResult<()> {
    for (i, entry) in inherited.iter().enumerate() {
        if entry.slot <= libc::STDERR_FILENO {
            return Err(TunnelError::LaunchFailed(format!(
                "slot {} is reserved for stdio",
                entry.slot
            )));
        }
        if inherited[..i].iter().any(|other| other.slot == entry.slot) {
            return Err(TunnelError::LaunchFailed(format!(
                "slot {} requested twice",
                entry.slot
            )));
        }
    }
    Ok(())
}

fn cloexec_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    Ok(pipe2(OFlag::O_CLOEXEC)?)
}

/// Highest open descriptor number. Runs in the parent since it allocates.
fn get_max_fd() -> RawFd {
    if let Ok(entries) = std::fs::read_dir("/proc/self/fd") {
        return entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse::<RawFd>().ok()))
            .max()
            .unwrap_or(1024);
    }
    let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    if max > 0 {
        std::cmp::min(max as RawFd, 65536)
    } else {
        1024
    }
}

/// Child side of the fork. Never returns.
///
/// Sources are first copied above every target slot so that a later `dup2`
/// cannot clobber a source that happens to sit on an earlier slot. The
/// copies are close-on-exec; `dup2` into the slot clears that flag.
#[allow(clippy::too_many_arguments)]
unsafe fn child_exec(
    program: &CString,
    argv: &[*const libc::c_char],
    placements: &[(RawFd, RawFd)],
    staged: &mut [RawFd],
    highest_slot: RawFd,
    keep: &[RawFd],
    max_fd: RawFd,
    status_fd: RawFd,
) -> ! {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        let mut empty: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut empty);
        libc::sigprocmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut());

        // The status pipe must not sit on a slot either.
        let status = libc::fcntl(status_fd, libc::F_DUPFD_CLOEXEC, highest_slot + 1);
        if status < 0 {
            report_and_exit(status_fd, STAGE_REDIRECT);
        }

        for (i, (source, _)) in placements.iter().enumerate() {
            let copy = libc::fcntl(*source, libc::F_DUPFD_CLOEXEC, highest_slot + 1);
            if copy < 0 {
                report_and_exit(status, STAGE_REDIRECT);
            }
            staged[i] = copy;
        }

        for (i, (_, slot)) in placements.iter().enumerate() {
            if libc::dup2(staged[i], *slot) < 0 {
                report_and_exit(status, STAGE_REDIRECT);
            }
        }

        for fd in (libc::STDERR_FILENO + 1)..=max_fd {
            if fd != status && !keep.contains(&fd) {
                libc::close(fd);
            }
        }

        libc::execv(program.as_ptr(), argv.as_ptr());
        report_and_exit(status, STAGE_EXEC)
    }
}

/// Send (stage, errno) to the parent and exit 127.
unsafe fn report_and_exit(status_fd: RawFd, stage: i32) -> ! {
    let errno = std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO);
    let mut msg = [0u8; 8];
    msg[..4].copy_from_slice(&stage.to_ne_bytes());
    msg[4..].copy_from_slice(&errno.to_ne_bytes());
    unsafe {
        libc::write(status_fd, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::_exit(127)
    }
}
