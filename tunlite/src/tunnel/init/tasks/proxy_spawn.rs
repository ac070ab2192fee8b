//! Task: start the proxy process.

use async_trait::async_trait;

use super::{InitCtx, log_task_error, task_start};
use crate::error::TunnelResult;
use crate::pipeline::PipelineTask;
use crate::process::expand_args;
use crate::runtime::constants::CONFIG_PLACEHOLDER;

pub struct ProxySpawnTask;

#[async_trait]
impl PipelineTask<InitCtx> for ProxySpawnTask {
    async fn run(self: Box<Self>, ctx: InitCtx) -> TunnelResult<()> {
        let task_name = self.name();
        let session_id = task_start(&ctx, task_name).await;

        let mut ctx = ctx.lock().await;
        let config_path = ctx.layout.proxy_config_path();
        let args = expand_args(
            &ctx.options.proxy.args,
            CONFIG_PLACEHOLDER,
            &config_path.to_string_lossy(),
        );

        // Command::spawn returns as soon as exec succeeds.
        let proxy = ctx
            .supervisor
            .spawn(&ctx.options.proxy.program, &args)
            .inspect_err(|e| log_task_error(&session_id, task_name, e))?;

        ctx.guard.set_proxy(proxy);
        Ok(())
    }

    fn name(&self) -> &str {
        "proxy_spawn"
    }
}
