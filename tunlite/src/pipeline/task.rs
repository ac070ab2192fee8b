//! Task trait for pipeline execution.

use async_trait::async_trait;

use crate::error::TunnelResult;

/// A unit of work run with the shared pipeline context.
#[async_trait]
pub trait PipelineTask<Ctx>: Send + Sync {
    async fn run(self: Box<Self>, ctx: Ctx) -> TunnelResult<()>;

    /// Name used in logs and metrics.
    fn name(&self) -> &str;
}

pub type BoxedTask<Ctx> = Box<dyn PipelineTask<Ctx>>;
