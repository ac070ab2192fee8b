//! Process-wide tracing setup.
//!
//! Logs go to stderr and to `<home>/logs/tunlite.log` through a non-blocking
//! writer. `RUST_LOG` overrides the default `info` filter.

use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::error::{TunnelError, TunnelResult};
use crate::runtime::FilesystemLayout;
use crate::runtime::constants::filenames;

/// Keeps the file writer flushing for the rest of the process.
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber for `layout`. Later calls are no-ops.
pub fn init_logging_for(layout: &FilesystemLayout) -> TunnelResult<()> {
    if LOG_GUARD.get().is_some() {
        return Ok(());
    }

    let logs_dir = layout.logs_dir();
    std::fs::create_dir_all(&logs_dir).map_err(|e| {
        TunnelError::Storage(format!(
            "Failed to create logs directory {}: {}",
            logs_dir.display(),
            e
        ))
    })?;

    let file_appender = tracing_appender::rolling::never(&logs_dir, filenames::LOG_FILE);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(
            fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_thread_ids(true),
        )
        .try_init();

    // Another subscriber may already be set (tests, embedding apps). Keep it.
    if installed.is_ok() {
        let _ = LOG_GUARD.set(guard);
    }
    Ok(())
}
