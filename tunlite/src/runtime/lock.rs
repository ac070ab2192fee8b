//! Exclusive lock on a controller home directory.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::{TunnelError, TunnelResult};

/// Advisory `flock` held for the lifetime of a controller.
///
/// The kernel drops the lock when the file is closed, including on crash.
#[derive(Debug)]
pub struct RuntimeLock {
    path: PathBuf,
    _file: File,
}

impl RuntimeLock {
    /// Try to take the lock without blocking.
    pub fn acquire(path: &Path) -> TunnelResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                TunnelError::Storage(format!("Failed to open lock {}: {}", path.display(), e))
            })?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(TunnelError::Storage(format!(
                    "another controller already owns {}",
                    path.display()
                )));
            }
            return Err(TunnelError::Storage(format!(
                "Failed to lock {}: {}",
                path.display(),
                err
            )));
        }

        tracing::debug!(path = %path.display(), "Acquired runtime lock");
        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_second_acquire_fails_until_released() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tunlite.lock");

        let first = RuntimeLock::acquire(&path).unwrap();
        let err = RuntimeLock::acquire(&path).unwrap_err();
        assert!(err.to_string().contains("another controller"));

        drop(first);
        assert!(RuntimeLock::acquire(&path).is_ok());
    }
}
