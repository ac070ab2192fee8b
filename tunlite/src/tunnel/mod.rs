//! Tunnel lifecycle controller.
//!
//! One [`TunnelController`] owns one session at a time:
//!
//! ```text
//! start ─► Starting ─► (6 tasks) ─► Running ─► stop/revoke ─► Stopping ─► Idle
//!              │                                    ▲
//!              └─ failure or abort ─► Failed ─► cleanup ─► Idle
//! ```
//!
//! Session fields sit behind a short-lived `parking_lot` mutex so status
//! reads never wait on a start. Start sequences and teardowns are
//! serialized by an async operation lock.

mod init;
mod lifecycle;
mod metrics;
mod session;
mod state;

pub use metrics::StartMetrics;
pub use session::SessionId;
pub use state::{TunnelInfo, TunnelState, TunnelStatus};

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{OwnedMutexGuard, watch};

use crate::config::ProxyConfig;
use crate::error::{TunnelError, TunnelResult};
use crate::logging::init_logging_for;
use crate::net::InterfaceProvider;
use crate::process::{FdPreservingLauncher, ProcessSupervisor};
use crate::runtime::{FilesystemLayout, RuntimeLock, TunnelOptions};
use crate::stats::{StatsQuery, TrafficStats};

use init::{StartOutcome, StartSequence};
use session::{SessionResources, TunnelSession};

/// Handle to a tunnel. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct TunnelController {
    inner: Arc<ControllerInner>,
}

pub(crate) struct ControllerInner {
    options: Arc<TunnelOptions>,
    layout: FilesystemLayout,
    supervisor: ProcessSupervisor,
    launcher: FdPreservingLauncher,
    provider: Arc<dyn InterfaceProvider>,
    stats: StatsQuery,
    session: Mutex<TunnelSession>,
    /// Proxy config and port waiting for `start_prepared`.
    pending: Mutex<Option<(ProxyConfig, u16)>>,
    /// Serializes start sequences and teardowns.
    op_lock: Arc<tokio::sync::Mutex<()>>,
    /// Set to abort an in-flight start.
    abort_tx: watch::Sender<bool>,
    _runtime_lock: RuntimeLock,
}

impl TunnelController {
    /// Create a controller using the platform interface provider.
    #[cfg(target_os = "linux")]
    pub fn new(options: TunnelOptions) -> TunnelResult<Self> {
        Self::with_interface_provider(
            options,
            Arc::new(crate::net::LinuxInterfaceProvider::new()),
        )
    }

    /// Create a controller with a custom interface provider.
    pub fn with_interface_provider(
        options: TunnelOptions,
        provider: Arc<dyn InterfaceProvider>,
    ) -> TunnelResult<Self> {
        options.sanitize()?;

        let layout = FilesystemLayout::new(options.home_dir.clone());
        layout.prepare().map_err(|e| {
            TunnelError::Storage(format!(
                "Failed to initialize filesystem at {}: {}",
                layout.home_dir().display(),
                e
            ))
        })?;

        init_logging_for(&layout)?;

        let runtime_lock = RuntimeLock::acquire(&layout.lock_path())?;

        let supervisor = ProcessSupervisor::new(layout.proxy_log_path(), options.grace_period());
        let launcher = FdPreservingLauncher::new(layout.relay_log_path());
        let stats = StatsQuery::from_options(&options.proxy);
        let (abort_tx, _) = watch::channel(false);

        tracing::info!(
            home = %layout.home_dir().display(),
            lock = %runtime_lock.path().display(),
            "Tunnel controller ready"
        );

        Ok(Self {
            inner: Arc::new(ControllerInner {
                options: Arc::new(options),
                layout,
                supervisor,
                launcher,
                provider,
                stats,
                session: Mutex::new(TunnelSession::new()),
                pending: Mutex::new(None),
                op_lock: Arc::new(tokio::sync::Mutex::new(())),
                abort_tx,
                _runtime_lock: runtime_lock,
            }),
        })
    }

    pub fn options(&self) -> &TunnelOptions {
        &self.inner.options
    }

    pub fn layout(&self) -> &FilesystemLayout {
        &self.inner.layout
    }

    /// Store the proxy config and port for a later [`start_prepared`](Self::start_prepared).
    pub fn prepare(&self, config: ProxyConfig, socks_port: u16) {
        *self.inner.pending.lock() = Some((config, socks_port));
    }

    /// Bring the tunnel up with `config`, proxy listening on `socks_port`.
    ///
    /// Returns once the session is Running, or after a failed attempt has
    /// been fully cleaned up and the session is Idle again.
    pub async fn start(&self, config: ProxyConfig, socks_port: u16) -> TunnelResult<()> {
        self.prepare(config, socks_port);
        self.start_prepared().await
    }

    /// Start from the values given to [`prepare`](Self::prepare).
    pub async fn start_prepared(&self) -> TunnelResult<()> {
        let pending = self.inner.pending.lock().clone();
        let (config, socks_port) = pending.unwrap_or_default();

        // Reject without queueing behind a running teardown.
        let state = self.inner.session.lock().state;
        if !state.can_start() {
            return Err(TunnelError::AlreadyActive(state));
        }

        // Held from before Starting is visible until the sequence has settled,
        // so a stop can never observe Starting without a start behind it.
        let op = Arc::clone(&self.inner.op_lock).lock_owned().await;
        let session_id = self.inner.accept_start(&config, socks_port)?;

        // The sequence runs on its own task so that dropping this future
        // cannot strand the session in Starting.
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            inner.run_start(op, session_id, config, socks_port).await
        });
        handle
            .await
            .map_err(|e| TunnelError::Internal(format!("start task failed: {}", e)))?
    }

    /// Tear the tunnel down. No-op when idle.
    pub async fn stop(&self) -> TunnelResult<()> {
        self.inner.stop().await
    }

    /// The host withdrew the tunnel. Same as [`stop`](Self::stop).
    pub async fn revoke(&self, reason: &str) -> TunnelResult<()> {
        tracing::warn!(reason, "Tunnel revoked");
        self.inner.stop().await
    }

    pub fn status(&self) -> TunnelStatus {
        let session = self.inner.session.lock();
        TunnelStatus {
            running: session.state == TunnelState::Running,
            last_error: session.last_error.clone(),
        }
    }

    pub fn state(&self) -> TunnelState {
        self.inner.session.lock().state
    }

    pub fn info(&self) -> TunnelInfo {
        let session = self.inner.session.lock();
        TunnelInfo {
            state: session.state,
            session_id: session.id.map(|id| id.to_string()),
            socks_port: session.socks_port,
            proxy_pid: session.resources.proxy.as_ref().map(|p| p.pid()),
            relay_pid: session.resources.relay.as_ref().map(|r| r.pid()),
            interface: session
                .resources
                .interface
                .as_ref()
                .map(|i| i.name().to_string()),
            started_at: session.started_at,
            start_metrics: session.start_metrics.clone(),
            last_error: session.last_error.clone(),
        }
    }

    /// Cumulative proxy traffic. Zeros when not running or on any failure.
    pub async fn query_stats(&self) -> TrafficStats {
        if self.state() != TunnelState::Running {
            return TrafficStats::default();
        }
        match self.inner.stats.query().await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::debug!("Stats query failed: {}", e);
                TrafficStats::default()
            }
        }
    }

    /// Resolve once the session leaves Running (stop, revoke or health watch).
    pub async fn wait_until_idle(&self, poll: std::time::Duration) {
        while self.state() != TunnelState::Idle {
            tokio::time::sleep(poll).await;
        }
    }
}

impl ControllerInner {
    /// Move Idle → Starting under the session lock.
    fn accept_start(&self, config: &ProxyConfig, socks_port: u16) -> TunnelResult<SessionId> {
        let mut session = self.session.lock();
        if !session.state.can_start() {
            return Err(TunnelError::AlreadyActive(session.state));
        }
        if config.is_empty() {
            let err = TunnelError::ConfigMissing;
            session.last_error = Some(err.to_string());
            return Err(err);
        }

        let id = SessionId::new();
        session.id = Some(id);
        session.state = TunnelState::Starting;
        session.proxy_config = Some(config.clone());
        session.socks_port = Some(socks_port);
        session.last_error = None;
        self.abort_tx.send_replace(false);

        tracing::info!(session_id = %id.short(), socks_port, "Tunnel start accepted");
        Ok(id)
    }

    async fn run_start(
        self: Arc<Self>,
        _op: OwnedMutexGuard<()>,
        session_id: SessionId,
        config: ProxyConfig,
        socks_port: u16,
    ) -> TunnelResult<()> {
        let sequence = StartSequence::new(
            session_id,
            Arc::clone(&self.options),
            self.layout.clone(),
            self.supervisor.clone(),
            self.launcher.clone(),
            Arc::clone(&self.provider),
        );
        let outcome = sequence
            .run(config, socks_port, self.abort_tx.subscribe())
            .await;

        let (error, resources) = match outcome {
            StartOutcome::Started { resources, metrics } => {
                match self.commit(session_id, resources, metrics) {
                    Ok(()) => {
                        lifecycle::spawn_health_watch(&self, session_id);
                        return Ok(());
                    }
                    Err((error, resources)) => (error, resources),
                }
            }
            StartOutcome::Failed { error, resources } => (error, resources),
        };

        self.fail_start(session_id, error, resources).await
    }

    /// Starting → Running, unless a stop arrived after the last task.
    fn commit(
        &self,
        session_id: SessionId,
        resources: SessionResources,
        metrics: StartMetrics,
    ) -> Result<(), (TunnelError, SessionResources)> {
        let mut session = self.session.lock();
        if *self.abort_tx.borrow() {
            return Err((TunnelError::StartAborted, resources));
        }

        session.resources = resources;
        session.state = TunnelState::Running;
        session.started_at = Some(Utc::now());
        metrics.log_start_stages();
        session.start_metrics = Some(metrics);

        tracing::info!(
            session_id = %session_id.short(),
            proxy_pid = ?session.resources.proxy.as_ref().map(|p| p.pid()),
            relay_pid = ?session.resources.relay.as_ref().map(|r| r.pid()),
            interface = ?session.resources.interface.as_ref().map(|i| i.name().to_string()),
            "Tunnel running"
        );
        Ok(())
    }

    /// Record the error, release everything, return to Idle.
    async fn fail_start(
        &self,
        session_id: SessionId,
        error: TunnelError,
        resources: SessionResources,
    ) -> TunnelResult<()> {
        {
            let mut session = self.session.lock();
            session.state = TunnelState::Failed;
            session.last_error = Some(error.to_string());
        }
        tracing::warn!(session_id = %session_id.short(), error = %error, "Tunnel start failed, cleaning up");

        self.release(resources).await;

        self.session.lock().reset();
        Err(error)
    }

    /// Release resources on the blocking pool.
    async fn release(&self, mut resources: SessionResources) {
        if resources.is_empty() {
            return;
        }
        let supervisor = self.supervisor.clone();
        let layout = self.layout.clone();
        let released = tokio::task::spawn_blocking(move || {
            resources.release(&supervisor, &layout);
        })
        .await;
        if let Err(e) = released {
            tracing::warn!("Resource release task failed: {}", e);
        }
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        let session = self.session.get_mut();
        if !session.resources.is_empty() {
            tracing::warn!("Tunnel controller dropped while active, releasing resources");
            session.resources.release(&self.supervisor, &self.layout);
        }
    }
}
