//! Task: launch the relay with the TUN descriptor at its slot.

use async_trait::async_trait;

use super::{InitCtx, blocking, log_task_error, task_start};
use crate::error::{TunnelError, TunnelResult};
use crate::pipeline::PipelineTask;
use crate::process::expand_args;
use crate::runtime::constants::CONFIG_PLACEHOLDER;

pub struct RelayLaunchTask;

#[async_trait]
impl PipelineTask<InitCtx> for RelayLaunchTask {
    async fn run(self: Box<Self>, ctx: InitCtx) -> TunnelResult<()> {
        let task_name = self.name();
        let session_id = task_start(&ctx, task_name).await;

        let (launcher, program, args, slot, tun_fd) = {
            let ctx = ctx.lock().await;
            let config_path = ctx
                .relay_config_path
                .clone()
                .ok_or_else(|| TunnelError::Internal("relay_config task must run first".into()))?;
            let interface = ctx
                .guard
                .interface()
                .ok_or_else(|| TunnelError::Internal("interface task must run first".into()))?;
            // A close-on-exec duplicate the launcher can own on the blocking pool.
            let tun_fd = interface
                .descriptor()
                .ok_or_else(|| TunnelError::LaunchFailed("interface descriptor is closed".into()))?
                .try_clone_to_owned()
                .map_err(|e| TunnelError::LaunchFailed(format!("dup of TUN descriptor: {}", e)))?;

            let relay = &ctx.options.relay;
            (
                ctx.launcher.clone(),
                relay.program.clone(),
                expand_args(&relay.args, CONFIG_PLACEHOLDER, &config_path.to_string_lossy()),
                relay.fd_slot,
                tun_fd,
            )
        };

        let relay = blocking(move || {
            use std::os::fd::AsFd;
            launcher.launch_preserving_descriptor(&program, &args, tun_fd.as_fd(), slot)
        })
        .await
        .inspect_err(|e| log_task_error(&session_id, task_name, e))?;

        tracing::info!(session_id = %session_id.short(), pid = relay.pid(), slot, "Relay launched");

        ctx.lock().await.guard.set_relay(relay);
        Ok(())
    }

    fn name(&self) -> &str {
        "relay_launch"
    }
}
