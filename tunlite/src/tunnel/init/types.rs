//! Type definitions for the start pipeline.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;

use crate::config::ProxyConfig;
use crate::net::{InterfaceHandle, InterfaceParams, InterfaceProvider};
use crate::process::{FdPreservingLauncher, ProcessSupervisor, ProxyProcess, RelayProcess};
use crate::runtime::{FilesystemLayout, TunnelOptions};
use crate::tunnel::session::{SessionId, SessionResources};

/// RAII guard for cleanup on start failure.
///
/// Owns everything acquired so far. The failure path calls
/// [`CleanupGuard::take_resources`] and releases them off the async runtime;
/// `Drop` only catches what that path never reached (a panicking task).
pub struct CleanupGuard {
    session_id: SessionId,
    supervisor: ProcessSupervisor,
    layout: FilesystemLayout,
    resources: SessionResources,
    armed: bool,
}

impl CleanupGuard {
    pub fn new(session_id: SessionId, supervisor: ProcessSupervisor, layout: FilesystemLayout) -> Self {
        Self {
            session_id,
            supervisor,
            layout,
            resources: SessionResources::default(),
            armed: true,
        }
    }

    /// Register written config files for cleanup on failure.
    pub fn set_config_written(&mut self) {
        self.resources.config_written = true;
    }

    pub fn set_proxy(&mut self, proxy: ProxyProcess) {
        self.resources.proxy = Some(proxy);
    }

    pub fn set_interface(&mut self, interface: Box<dyn InterfaceHandle>) {
        self.resources.interface = Some(interface);
    }

    pub fn set_relay(&mut self, relay: RelayProcess) {
        self.resources.relay = Some(relay);
    }

    pub fn interface(&self) -> Option<&dyn InterfaceHandle> {
        self.resources.interface.as_deref()
    }

    /// Take ownership of everything acquired (success or explicit cleanup).
    pub fn take_resources(&mut self) -> SessionResources {
        std::mem::take(&mut self.resources)
    }

    /// Disarm the guard (call on success).
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.armed || self.resources.is_empty() {
            return;
        }

        tracing::warn!(
            session_id = %self.session_id.short(),
            "Tunnel start abandoned, cleaning up"
        );
        self.resources.release(&self.supervisor, &self.layout);
    }
}

/// Shared start pipeline context.
///
/// Holds inputs, outputs passed between tasks, and the cleanup guard.
pub struct StartPipelineContext {
    pub session_id: SessionId,
    pub options: Arc<TunnelOptions>,
    pub layout: FilesystemLayout,
    pub supervisor: ProcessSupervisor,
    pub launcher: FdPreservingLauncher,
    pub provider: Arc<dyn InterfaceProvider>,
    pub proxy_config: ProxyConfig,
    pub socks_port: u16,
    pub abort: watch::Receiver<bool>,
    pub guard: CleanupGuard,
    pub interface_params: Option<InterfaceParams>,
    pub relay_config_path: Option<PathBuf>,
}

impl StartPipelineContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: SessionId,
        options: Arc<TunnelOptions>,
        layout: FilesystemLayout,
        supervisor: ProcessSupervisor,
        launcher: FdPreservingLauncher,
        provider: Arc<dyn InterfaceProvider>,
        proxy_config: ProxyConfig,
        socks_port: u16,
        abort: watch::Receiver<bool>,
    ) -> Self {
        let guard = CleanupGuard::new(session_id, supervisor.clone(), layout.clone());
        Self {
            session_id,
            options,
            layout,
            supervisor,
            launcher,
            provider,
            proxy_config,
            socks_port,
            abort,
            guard,
            interface_params: None,
            relay_config_path: None,
        }
    }
}
