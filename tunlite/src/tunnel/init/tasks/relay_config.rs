//! Task: write the relay config naming the descriptor slot.

use async_trait::async_trait;

use super::{InitCtx, log_task_error, task_start};
use crate::config::{RelayConfig, write_relay_config};
use crate::error::{TunnelError, TunnelResult};
use crate::pipeline::PipelineTask;

pub struct RelayConfigTask;

#[async_trait]
impl PipelineTask<InitCtx> for RelayConfigTask {
    async fn run(self: Box<Self>, ctx: InitCtx) -> TunnelResult<()> {
        let task_name = self.name();
        let session_id = task_start(&ctx, task_name).await;

        let mut ctx = ctx.lock().await;
        let params = ctx
            .interface_params
            .as_ref()
            .ok_or_else(|| TunnelError::Internal("interface task must run first".into()))?;

        // The relay sees the device at the slot, not at our descriptor number.
        let relay_opts = &ctx.options.relay;
        let config = RelayConfig::from_options(relay_opts, relay_opts.fd_slot, ctx.socks_port)
            .with_interface(params.ipv4(), params.mtu);

        let path = ctx.layout.relay_config_path();
        write_relay_config(&path, &config)
            .inspect_err(|e| log_task_error(&session_id, task_name, e))?;

        ctx.relay_config_path = Some(path);
        Ok(())
    }

    fn name(&self) -> &str {
        "relay_config"
    }
}
