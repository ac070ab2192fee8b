//! The per-controller session and the resources it owns.

use chrono::{DateTime, Utc};
use ulid::Ulid;

use super::metrics::StartMetrics;
use super::state::TunnelState;
use crate::config::ProxyConfig;
use crate::net::InterfaceHandle;
use crate::process::{ProcessSupervisor, ProxyProcess, RelayProcess, kill_process};
use crate::runtime::FilesystemLayout;

/// Identifies one start attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Ulid);

impl SessionId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Short form for logs.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything a start acquires. Each field is present only once acquired.
#[derive(Default)]
pub struct SessionResources {
    pub interface: Option<Box<dyn InterfaceHandle>>,
    pub proxy: Option<ProxyProcess>,
    pub relay: Option<RelayProcess>,
    /// Config files were written and must be removed.
    pub config_written: bool,
}

impl std::fmt::Debug for SessionResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionResources")
            .field("interface", &self.interface.as_ref().map(|i| i.name().to_string()))
            .field("proxy", &self.proxy.as_ref().map(|p| p.pid()))
            .field("relay", &self.relay.as_ref().map(|r| r.pid()))
            .field("config_written", &self.config_written)
            .finish()
    }
}

impl SessionResources {
    pub fn is_empty(&self) -> bool {
        self.interface.is_none()
            && self.proxy.is_none()
            && self.relay.is_none()
            && !self.config_written
    }

    /// Release in order: relay, proxy, interface, config files.
    ///
    /// Blocking (termination grace periods). Every step runs even if an
    /// earlier one fails; failures are logged.
    pub fn release(&mut self, supervisor: &ProcessSupervisor, layout: &FilesystemLayout) {
        if let Some(mut relay) = self.relay.take() {
            let pid = relay.pid();
            if !kill_process(&mut relay) {
                tracing::warn!(pid, "Relay could not be signalled during cleanup");
            }
        }

        if let Some(mut proxy) = self.proxy.take() {
            supervisor.terminate(&mut proxy);
        }

        if let Some(mut interface) = self.interface.take() {
            let name = interface.name().to_string();
            if let Err(e) = interface.close() {
                tracing::warn!(interface = %name, "Failed to close interface during cleanup: {}", e);
            }
        }

        if self.config_written {
            layout.remove_run_files();
            self.config_written = false;
        }
    }
}

/// Mutable state of a controller, guarded by one mutex.
#[derive(Debug)]
pub struct TunnelSession {
    pub id: Option<SessionId>,
    pub state: TunnelState,
    pub proxy_config: Option<ProxyConfig>,
    pub socks_port: Option<u16>,
    pub resources: SessionResources,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub start_metrics: Option<StartMetrics>,
}

impl TunnelSession {
    pub fn new() -> Self {
        Self {
            id: None,
            state: TunnelState::Idle,
            proxy_config: None,
            socks_port: None,
            resources: SessionResources::default(),
            last_error: None,
            started_at: None,
            start_metrics: None,
        }
    }

    /// Back to Idle. Keeps `last_error`; resources must already be released.
    pub fn reset(&mut self) {
        debug_assert!(self.resources.is_empty(), "reset with live resources");
        self.id = None;
        self.state = TunnelState::Idle;
        self.proxy_config = None;
        self.socks_port = None;
        self.started_at = None;
        self.start_metrics = None;
    }
}

impl Default for TunnelSession {
    fn default() -> Self {
        Self::new()
    }
}
