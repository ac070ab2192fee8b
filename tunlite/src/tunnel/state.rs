//! Lifecycle states and the status views built from them.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::metrics::StartMetrics;

/// Tunnel lifecycle state.
///
/// ```text
/// Idle → Starting → Running → Stopping → Idle
///            └────→ Failed ──────────────→ Idle
/// ```
///
/// `Failed` only exists while a failed start is being cleaned up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Idle,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl TunnelState {
    /// Whether a start may be accepted.
    pub fn can_start(&self) -> bool {
        matches!(self, TunnelState::Idle)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelState::Idle => "idle",
            TunnelState::Starting => "starting",
            TunnelState::Running => "running",
            TunnelState::Stopping => "stopping",
            TunnelState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a UI polls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelStatus {
    pub running: bool,
    pub last_error: Option<String>,
}

/// Detailed snapshot of the current session.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    pub state: TunnelState,
    pub session_id: Option<String>,
    pub socks_port: Option<u16>,
    pub proxy_pid: Option<u32>,
    pub relay_pid: Option<u32>,
    pub interface: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub start_metrics: Option<StartMetrics>,
    pub last_error: Option<String>,
}
