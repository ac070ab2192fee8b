//! On-disk layout of a controller home directory.
//!
//! ```text
//! <home>/
//! ├── tunlite.lock
//! ├── run/
//! │   ├── proxy_config.json
//! │   └── relay_config.yml
//! └── logs/
//!     ├── tunlite.log
//!     ├── proxy.log
//!     └── relay.log
//! ```

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::error::{TunnelError, TunnelResult};
use crate::runtime::constants::{dirs, filenames};

#[derive(Debug, Clone)]
pub struct FilesystemLayout {
    home_dir: PathBuf,
}

impl FilesystemLayout {
    pub fn new(home_dir: PathBuf) -> Self {
        Self { home_dir }
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    /// Directory holding generated config files: ~/.local/share/tunlite/run
    pub fn run_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::RUN)
    }

    /// Directory holding logs: ~/.local/share/tunlite/logs
    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::LOGS)
    }

    pub fn proxy_config_path(&self) -> PathBuf {
        self.run_dir().join(filenames::PROXY_CONFIG)
    }

    pub fn relay_config_path(&self) -> PathBuf {
        self.run_dir().join(filenames::RELAY_CONFIG)
    }

    pub fn proxy_log_path(&self) -> PathBuf {
        self.logs_dir().join(filenames::PROXY_LOG)
    }

    pub fn relay_log_path(&self) -> PathBuf {
        self.logs_dir().join(filenames::RELAY_LOG)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.home_dir.join(filenames::LOCK_FILE)
    }

    /// Create home, run and logs directories.
    pub fn prepare(&self) -> TunnelResult<()> {
        for dir in [self.home_dir.clone(), self.run_dir(), self.logs_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                TunnelError::Storage(format!(
                    "Failed to create directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Remove the generated config files. Missing files are fine.
    pub fn remove_run_files(&self) {
        for path in [self.proxy_config_path(), self.relay_config_path()] {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "Removed config file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Failed to remove config file: {}", e)
                }
            }
        }
    }

    /// Open a log file for appending, close-on-exec.
    pub fn open_log(path: &Path) -> TunnelResult<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o640)
            .open(path)
            .map_err(|e| {
                TunnelError::Storage(format!("Failed to open log {}: {}", path.display(), e))
            })
    }
}
