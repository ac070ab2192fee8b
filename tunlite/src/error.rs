//! Error types shared across the crate.

use crate::tunnel::TunnelState;

/// Errors produced by the tunnel lifecycle and its collaborators.
///
/// The `Display` text of a start-sequence error is what callers later see in
/// `TunnelStatus::last_error`, so messages are written for humans.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("tunnel is already active (state: {0})")]
    AlreadyActive(TunnelState),

    #[error("no proxy configuration supplied")]
    ConfigMissing,

    #[error("failed to spawn proxy process: {0}")]
    ProcessSpawnFailed(String),

    #[error("timeout waiting for port {port}: proxy not listening after {timeout_ms} ms")]
    PortTimeout { port: u16, timeout_ms: u64 },

    #[error("failed to establish virtual interface: {0}")]
    InterfaceEstablishFailed(String),

    #[error("failed to launch relay process: {0}")]
    LaunchFailed(String),

    #[error("start aborted by stop request")]
    StartAborted,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type TunnelResult<T> = Result<T, TunnelError>;
