//! Teardown and the running-session health watch.

use std::sync::{Arc, Weak};

use super::ControllerInner;
use super::session::SessionId;
use super::state::TunnelState;
use crate::error::TunnelResult;

/// Why the health watcher ended a session.
#[derive(Debug, Clone, PartialEq, Eq)]
enum HealthEvent {
    InterfaceGone(String),
    ProxyExited(u32),
    RelayExited(u32),
}

impl ControllerInner {
    pub(super) async fn stop(&self) -> TunnelResult<()> {
        let state = self.session.lock().state;
        match state {
            TunnelState::Idle => return Ok(()),
            TunnelState::Starting => {
                tracing::info!("Stop requested during start, aborting");
                self.abort_tx.send_replace(true);
            }
            _ => {}
        }

        let _op = self.op_lock.lock().await;
        self.teardown(None).await
    }

    /// Running → Stopping → Idle, with `final_error` as the resulting `last_error`.
    ///
    /// Caller holds the operation lock. A session that is already Idle (an
    /// aborted start finished first) only gets its error replaced.
    async fn teardown(&self, final_error: Option<String>) -> TunnelResult<()> {
        let resources = {
            let mut session = self.session.lock();
            match session.state {
                TunnelState::Running => {
                    session.state = TunnelState::Stopping;
                    std::mem::take(&mut session.resources)
                }
                TunnelState::Idle => {
                    session.last_error = final_error;
                    return Ok(());
                }
                // Starting and Failed only exist while a start holds the lock.
                other => {
                    tracing::debug!(state = %other, "Teardown skipped");
                    return Ok(());
                }
            }
        };

        tracing::info!("Tearing down tunnel");
        self.release(resources).await;

        let mut session = self.session.lock();
        session.reset();
        session.last_error = final_error;
        tracing::info!("Tunnel stopped");
        Ok(())
    }

    /// One health check. `None` while everything is alive.
    fn check_health(&self, session_id: SessionId) -> Option<HealthEvent> {
        let mut session = self.session.lock();
        if session.id != Some(session_id) || session.state != TunnelState::Running {
            return None;
        }

        let resources = &mut session.resources;
        if let Some(interface) = resources.interface.as_ref()
            && !interface.is_present()
        {
            return Some(HealthEvent::InterfaceGone(interface.name().to_string()));
        }
        if let Some(proxy) = resources.proxy.as_mut()
            && !proxy.is_running()
        {
            return Some(HealthEvent::ProxyExited(proxy.pid()));
        }
        if let Some(relay) = resources.relay.as_mut()
            && !relay.is_running()
        {
            return Some(HealthEvent::RelayExited(relay.pid()));
        }
        None
    }

    fn is_current(&self, session_id: SessionId) -> bool {
        let session = self.session.lock();
        session.id == Some(session_id) && session.state == TunnelState::Running
    }

    async fn handle_health_event(&self, session_id: SessionId, event: HealthEvent) {
        let _op = self.op_lock.lock().await;
        // A stop may have won the race for the lock.
        if !self.is_current(session_id) {
            return;
        }

        let result = match event {
            HealthEvent::InterfaceGone(name) => {
                tracing::warn!(interface = %name, reason = "interface removed", "Tunnel revoked");
                self.teardown(None).await
            }
            HealthEvent::ProxyExited(pid) => {
                tracing::error!(pid, "Proxy exited unexpectedly");
                self.teardown(Some(format!("proxy process exited unexpectedly (pid {})", pid)))
                    .await
            }
            HealthEvent::RelayExited(pid) => {
                tracing::error!(pid, "Relay exited unexpectedly");
                self.teardown(Some(format!("relay process exited unexpectedly (pid {})", pid)))
                    .await
            }
        };
        if let Err(e) = result {
            tracing::warn!("Health teardown failed: {}", e);
        }
    }
}

/// Watch a running session until it ends or the controller is dropped.
pub(super) fn spawn_health_watch(inner: &Arc<ControllerInner>, session_id: SessionId) {
    let Some(interval) = inner.options.health_interval() else {
        return;
    };
    let weak: Weak<ControllerInner> = Arc::downgrade(inner);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if !inner.is_current(session_id) {
                tracing::debug!(session_id = %session_id.short(), "Health watch finished");
                return;
            }
            if let Some(event) = inner.check_health(session_id) {
                inner.handle_health_event(session_id, event).await;
                return;
            }
        }
    });
}

