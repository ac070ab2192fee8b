//! Task: establish the tunnel interface with routing and self-exclusion.

use std::sync::Arc;

use async_trait::async_trait;

use super::{InitCtx, blocking, log_task_error, task_start};
use crate::error::TunnelResult;
use crate::net::InterfaceParams;
use crate::pipeline::PipelineTask;

pub struct InterfaceTask;

#[async_trait]
impl PipelineTask<InitCtx> for InterfaceTask {
    async fn run(self: Box<Self>, ctx: InitCtx) -> TunnelResult<()> {
        let task_name = self.name();
        let session_id = task_start(&ctx, task_name).await;

        let (provider, params) = {
            let ctx = ctx.lock().await;
            (
                Arc::clone(&ctx.provider),
                InterfaceParams::from_options(&ctx.options.interface),
            )
        };

        let establish_params = params.clone();
        let interface = blocking(move || provider.establish(&establish_params))
            .await
            .inspect_err(|e| log_task_error(&session_id, task_name, e))?;

        tracing::info!(
            session_id = %session_id.short(),
            interface = interface.name(),
            fd = ?interface.raw_descriptor(),
            "Interface established"
        );
        if let Some(plan) = interface.routing() {
            tracing::debug!(
                session_id = %session_id.short(),
                exclusion = ?plan.exclusion_rule().map(|c| c.to_string()),
                capture = ?plan.capture_rule().map(|c| c.to_string()),
                "Routing in effect"
            );
        }

        let mut ctx = ctx.lock().await;
        ctx.guard.set_interface(interface);
        ctx.interface_params = Some(params);
        Ok(())
    }

    fn name(&self) -> &str {
        "interface_establish"
    }
}
