//! Task: wait for the proxy to listen on the SOCKS port.

use async_trait::async_trait;

use super::{InitCtx, aborted, log_task_error, task_start};
use crate::error::{TunnelError, TunnelResult};
use crate::pipeline::PipelineTask;
use crate::probe::{Readiness, wait_until_listening_with_interval};

pub struct PortProbeTask;

#[async_trait]
impl PipelineTask<InitCtx> for PortProbeTask {
    async fn run(self: Box<Self>, ctx: InitCtx) -> TunnelResult<()> {
        let task_name = self.name();
        let session_id = task_start(&ctx, task_name).await;

        // Do not hold the context lock while waiting.
        let (port, probe, mut abort) = {
            let ctx = ctx.lock().await;
            (ctx.socks_port, ctx.options.probe.clone(), ctx.abort.clone())
        };

        let readiness = tokio::select! {
            readiness = wait_until_listening_with_interval(port, probe.timeout(), probe.interval()) => readiness,
            _ = aborted(&mut abort) => {
                tracing::info!(session_id = %session_id.short(), port, "Port probe interrupted by stop");
                return Err(TunnelError::StartAborted);
            }
        };

        match readiness {
            Readiness::Ready { elapsed } => {
                tracing::info!(
                    session_id = %session_id.short(),
                    port,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Proxy is listening"
                );
                Ok(())
            }
            Readiness::TimedOut { .. } => {
                let err = TunnelError::PortTimeout {
                    port,
                    timeout_ms: probe.timeout_ms,
                };
                log_task_error(&session_id, task_name, &err);
                Err(err)
            }
        }
    }

    fn name(&self) -> &str {
        "port_probe"
    }
}
