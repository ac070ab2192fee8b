//! Start pipeline tasks.

mod interface;
mod port_probe;
mod proxy_config;
mod proxy_spawn;
mod relay_config;
mod relay_launch;

pub use interface::InterfaceTask;
pub use port_probe::PortProbeTask;
pub use proxy_config::ProxyConfigTask;
pub use proxy_spawn::ProxySpawnTask;
pub use relay_config::RelayConfigTask;
pub use relay_launch::RelayLaunchTask;

use std::sync::Arc;

use tokio::sync::{Mutex, watch};

use super::types::StartPipelineContext;
use crate::error::{TunnelError, TunnelResult};
use crate::tunnel::session::SessionId;

pub type InitCtx = Arc<Mutex<StartPipelineContext>>;

async fn task_start(ctx: &InitCtx, task_name: &str) -> SessionId {
    let session_id = ctx.lock().await.session_id;
    tracing::debug!(session_id = %session_id.short(), task = task_name, "Starting task");
    session_id
}

fn log_task_error(session_id: &SessionId, task_name: &str, error: &TunnelError) {
    tracing::error!(
        session_id = %session_id.short(),
        task = task_name,
        error = %error,
        "Task failed"
    );
}

/// Resolve once `abort` turns true. Never resolves if the sender is gone.
async fn aborted(abort: &mut watch::Receiver<bool>) {
    if abort.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Run blocking work off the runtime.
async fn blocking<T, F>(f: F) -> TunnelResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> TunnelResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TunnelError::Internal(format!("blocking task failed: {}", e)))?
}
