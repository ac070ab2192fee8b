//! Pipeline executor.

use std::time::Instant;

use tokio::sync::watch;

use super::metrics::{PipelineMetrics, TaskMetrics};
use super::task::BoxedTask;
use crate::error::{TunnelError, TunnelResult};

pub struct ExecutionPlan<Ctx> {
    tasks: Vec<BoxedTask<Ctx>>,
}

impl<Ctx> ExecutionPlan<Ctx> {
    pub fn new(tasks: Vec<BoxedTask<Ctx>>) -> Self {
        Self { tasks }
    }

    pub fn tasks(self) -> Vec<BoxedTask<Ctx>> {
        self.tasks
    }
}

pub struct Pipeline<Ctx> {
    tasks: Vec<BoxedTask<Ctx>>,
}

impl<Ctx> Pipeline<Ctx> {
    pub fn new(tasks: Vec<BoxedTask<Ctx>>) -> Self {
        Self { tasks }
    }
}

pub struct PipelineBuilder;

impl PipelineBuilder {
    pub fn from_plan<Ctx>(plan: ExecutionPlan<Ctx>) -> Pipeline<Ctx> {
        Pipeline::new(plan.tasks())
    }
}

pub struct PipelineExecutor;

impl PipelineExecutor {
    /// Run every task in order.
    ///
    /// `abort` is checked before each task; once it reads `true` the pipeline
    /// stops with [`TunnelError::StartAborted`]. Tasks that wait on something
    /// slow should watch it too.
    pub async fn execute<Ctx>(
        pipeline: Pipeline<Ctx>,
        ctx: Ctx,
        abort: &watch::Receiver<bool>,
    ) -> TunnelResult<PipelineMetrics>
    where
        Ctx: Clone,
    {
        let total_start = Instant::now();
        let mut task_metrics = Vec::with_capacity(pipeline.tasks.len());

        for task in pipeline.tasks {
            if *abort.borrow() {
                tracing::info!(next_task = task.name(), "Pipeline aborted");
                return Err(TunnelError::StartAborted);
            }

            let name = task.name().to_string();
            let task_start = Instant::now();
            task.run(ctx.clone()).await?;
            task_metrics.push(TaskMetrics {
                name,
                duration_ms: task_start.elapsed().as_millis(),
            });
        }

        Ok(PipelineMetrics {
            total_duration_ms: total_start.elapsed().as_millis(),
            tasks: task_metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineTask;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    struct Record(&'static str);

    #[async_trait]
    impl PipelineTask<Log> for Record {
        async fn run(self: Box<Self>, ctx: Log) -> TunnelResult<()> {
            ctx.lock().push(self.0);
            Ok(())
        }

        fn name(&self) -> &str {
            self.0
        }
    }

    struct Fail;

    #[async_trait]
    impl PipelineTask<Log> for Fail {
        async fn run(self: Box<Self>, _ctx: Log) -> TunnelResult<()> {
            Err(TunnelError::Internal("boom".into()))
        }

        fn name(&self) -> &str {
            "fail"
        }
    }

    struct AbortAfter(&'static str, watch::Sender<bool>);

    #[async_trait]
    impl PipelineTask<Log> for AbortAfter {
        async fn run(self: Box<Self>, ctx: Log) -> TunnelResult<()> {
            ctx.lock().push(self.0);
            let _ = self.1.send(true);
            Ok(())
        }

        fn name(&self) -> &str {
            self.0
        }
    }

    #[tokio::test]
    async fn test_runs_in_order_with_metrics() {
        let log: Log = Arc::default();
        let (_tx, rx) = watch::channel(false);
        let plan = ExecutionPlan::new(vec![
            Box::new(Record("a")) as BoxedTask<Log>,
            Box::new(Record("b")),
        ]);

        let metrics = PipelineExecutor::execute(PipelineBuilder::from_plan(plan), log.clone(), &rx)
            .await
            .unwrap();

        assert_eq!(*log.lock(), vec!["a", "b"]);
        assert_eq!(metrics.tasks.len(), 2);
        assert!(metrics.task_duration_ms("b").is_some());
        assert!(metrics.task_duration_ms("c").is_none());
    }

    #[tokio::test]
    async fn test_error_stops_pipeline() {
        let log: Log = Arc::default();
        let (_tx, rx) = watch::channel(false);
        let plan = ExecutionPlan::new(vec![
            Box::new(Record("a")) as BoxedTask<Log>,
            Box::new(Fail),
            Box::new(Record("never")),
        ]);

        let err = PipelineExecutor::execute(PipelineBuilder::from_plan(plan), log.clone(), &rx)
            .await
            .unwrap_err();

        assert!(matches!(err, TunnelError::Internal(_)));
        assert_eq!(*log.lock(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_abort_checked_between_tasks() {
        let log: Log = Arc::default();
        let (tx, rx) = watch::channel(false);
        let plan = ExecutionPlan::new(vec![
            Box::new(AbortAfter("first", tx)) as BoxedTask<Log>,
            Box::new(Record("second")),
        ]);

        let err = PipelineExecutor::execute(PipelineBuilder::from_plan(plan), log.clone(), &rx)
            .await
            .unwrap_err();

        assert!(matches!(err, TunnelError::StartAborted));
        assert_eq!(*log.lock(), vec!["first"]);
    }
}
