//! Task: write the proxy config file.

use async_trait::async_trait;

use super::{InitCtx, log_task_error, task_start};
use crate::config::write_proxy_config;
use crate::error::TunnelResult;
use crate::pipeline::PipelineTask;

pub struct ProxyConfigTask;

#[async_trait]
impl PipelineTask<InitCtx> for ProxyConfigTask {
    async fn run(self: Box<Self>, ctx: InitCtx) -> TunnelResult<()> {
        let task_name = self.name();
        let session_id = task_start(&ctx, task_name).await;

        let mut ctx = ctx.lock().await;
        let path = ctx.layout.proxy_config_path();
        // Set first: a partially failed write may still leave a temp file behind.
        ctx.guard.set_config_written();
        write_proxy_config(&path, &ctx.proxy_config)
            .inspect_err(|e| log_task_error(&session_id, task_name, e))?;

        tracing::debug!(session_id = %session_id.short(), path = %path.display(), "Proxy config written");
        Ok(())
    }

    fn name(&self) -> &str {
        "proxy_config"
    }
}
