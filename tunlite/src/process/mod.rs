//! Child process management.
//!
//! - [`ProcessSupervisor`] runs the proxy through `std::process::Command`.
//!   Nothing but stdio crosses exec.
//! - [`FdPreservingLauncher`] runs the relay through fork/exec and places
//!   chosen descriptors at fixed slots in the child.

mod launcher;
mod supervisor;

pub use launcher::{FdPreservingLauncher, InheritedFd, RelayProcess, kill_process};
pub use supervisor::{ProcessSupervisor, ProxyProcess};

use std::path::{Path, PathBuf};

/// Substitute `placeholder` in every argument.
pub fn expand_args(args: &[String], placeholder: &str, value: &str) -> Vec<String> {
    args.iter()
        .map(|arg| arg.replace(placeholder, value))
        .collect()
}

/// Resolve a bare program name against `PATH`. Paths with a `/` are returned as is.
pub fn find_binary(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 || program.is_absolute() {
        return Some(program.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Check if a process with the given PID exists.
///
/// Uses `libc::kill(pid, 0)`. Zombies still count as alive.
pub fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}
