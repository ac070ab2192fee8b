//! Tunnel start orchestration.
//!
//! ## Architecture
//!
//! ```text
//! 1. ProxyConfig   (write proxy config file)
//! 2. ProxySpawn    (start proxy, stdio to logs/proxy.log)
//! 3. PortProbe     (wait for the SOCKS port, abortable)
//! 4. Interface     (TUN device, routing, self-exclusion, DNS)
//! 5. RelayConfig   (relay document naming the descriptor slot)
//! 6. RelayLaunch   (fork/exec with the TUN descriptor at its slot)
//! ```
//!
//! `CleanupGuard` owns what has been acquired until the sequence succeeds.

mod tasks;
mod types;

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, watch};

use crate::config::ProxyConfig;
use crate::error::{TunnelError, TunnelResult};
use crate::net::InterfaceProvider;
use crate::pipeline::{BoxedTask, ExecutionPlan, PipelineBuilder, PipelineExecutor};
use crate::process::{FdPreservingLauncher, ProcessSupervisor};
use crate::runtime::{FilesystemLayout, TunnelOptions};
use crate::tunnel::metrics::StartMetrics;
use crate::tunnel::session::{SessionId, SessionResources};

use tasks::{
    InitCtx, InterfaceTask, PortProbeTask, ProxyConfigTask, ProxySpawnTask, RelayConfigTask,
    RelayLaunchTask,
};
use types::StartPipelineContext;

fn get_execution_plan() -> ExecutionPlan<InitCtx> {
    let tasks: Vec<BoxedTask<InitCtx>> = vec![
        Box::new(ProxyConfigTask),
        Box::new(ProxySpawnTask),
        Box::new(PortProbeTask),
        Box::new(InterfaceTask),
        Box::new(RelayConfigTask),
        Box::new(RelayLaunchTask),
    ];
    ExecutionPlan::new(tasks)
}

/// Outcome of a start sequence. Either way the caller owns the resources.
pub(crate) enum StartOutcome {
    Started {
        resources: SessionResources,
        metrics: StartMetrics,
    },
    Failed {
        error: TunnelError,
        resources: SessionResources,
    },
}

/// Runs the start pipeline for one session.
pub(crate) struct StartSequence {
    session_id: SessionId,
    options: Arc<TunnelOptions>,
    layout: FilesystemLayout,
    supervisor: ProcessSupervisor,
    launcher: FdPreservingLauncher,
    provider: Arc<dyn InterfaceProvider>,
}

impl StartSequence {
    pub(crate) fn new(
        session_id: SessionId,
        options: Arc<TunnelOptions>,
        layout: FilesystemLayout,
        supervisor: ProcessSupervisor,
        launcher: FdPreservingLauncher,
        provider: Arc<dyn InterfaceProvider>,
    ) -> Self {
        Self {
            session_id,
            options,
            layout,
            supervisor,
            launcher,
            provider,
        }
    }

    /// Execute all tasks and hand everything acquired back to the caller.
    pub(crate) async fn run(
        self,
        proxy_config: ProxyConfig,
        socks_port: u16,
        abort: watch::Receiver<bool>,
    ) -> StartOutcome {
        let total_start = Instant::now();
        let session_id = self.session_id;

        let ctx = StartPipelineContext::new(
            self.session_id,
            self.options,
            self.layout,
            self.supervisor,
            self.launcher,
            self.provider,
            proxy_config,
            socks_port,
            abort.clone(),
        );
        let ctx: InitCtx = Arc::new(Mutex::new(ctx));

        let pipeline = PipelineBuilder::from_plan(get_execution_plan());
        let result = PipelineExecutor::execute(pipeline, Arc::clone(&ctx), &abort).await;

        let mut ctx = ctx.lock().await;
        let resources = ctx.guard.take_resources();

        match result {
            Ok(pipeline_metrics) => {
                let metrics =
                    StartMetrics::from_pipeline(&pipeline_metrics, total_start.elapsed().as_millis());
                tracing::debug!(session_id = %session_id.short(), "Start pipeline completed");
                ctx.guard.disarm();
                StartOutcome::Started { resources, metrics }
            }
            Err(error) => {
                ctx.guard.disarm();
                StartOutcome::Failed { error, resources }
            }
        }
    }
}
