//! 工作流
//! Built workflow
//!
//! A [`Workflow`] is immutable once built. Every run gets its own
//! [`ExecutionContext`], so one instance (or clones of it, which share the
//! graph) can serve any number of concurrent runs.

use super::config::EngineConfig;
use super::executor::{Outcome, WorkflowExecutor};
use super::fault_tolerance::CircuitBreakerRegistry;
use super::graph::WorkflowGraph;
use loomflow_kernel::workflow::{
    Checkpoint, ExecutionContext, NodeError, RunFailure, WorkflowResult, WorkflowValue,
};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Validating transform applied to the input at the start of each run.
pub type InputSchema = Arc<dyn Fn(WorkflowValue) -> Result<WorkflowValue, NodeError> + Send + Sync>;

/// 可执行的工作流
/// Runnable workflow, produced by [`WorkflowBuilder`](super::builder::WorkflowBuilder).
#[derive(Clone)]
pub struct Workflow {
    executor: WorkflowExecutor,
    input_schema: Option<InputSchema>,
    breakers: Arc<CircuitBreakerRegistry>,
    config: EngineConfig,
}

impl Workflow {
    pub(crate) fn new(
        executor: WorkflowExecutor,
        input_schema: Option<InputSchema>,
        breakers: Arc<CircuitBreakerRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            executor,
            input_schema,
            breakers,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.executor.graph().name
    }

    pub fn graph(&self) -> &WorkflowGraph {
        self.executor.graph()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Breakers used by this workflow's circuit-breaker wrappers.
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// 执行工作流
    /// Run to completion.
    pub async fn run(&self, input: impl Into<WorkflowValue>) -> WorkflowResult {
        self.run_with_cancel(input, CancellationToken::new()).await
    }

    /// Run until completion or until `cancel` fires, in which case the run
    /// fails with `Cancelled`.
    pub async fn run_with_cancel(
        &self,
        input: impl Into<WorkflowValue>,
        cancel: CancellationToken,
    ) -> WorkflowResult {
        let started = Instant::now();
        let raw = input.into();
        let input = match &self.input_schema {
            None => raw,
            Some(schema) => match schema(raw.clone()) {
                Ok(validated) => validated,
                Err(err) => {
                    warn!(workflow = %self.name(), "input rejected: {err}");
                    let ctx = ExecutionContext::new(self.name(), raw);
                    return self.executor.conclude(
                        ctx,
                        Outcome::Failed(RunFailure::before_start(&err)),
                        started,
                    );
                }
            },
        };
        let ctx = ExecutionContext::new(self.name(), input);
        self.executor.execute(ctx, cancel).await
    }

    /// 从检查点恢复
    /// Continue a run from a checkpoint emitted by this workflow.
    pub async fn resume(&self, checkpoint: Checkpoint) -> WorkflowResult {
        self.resume_with_cancel(checkpoint, CancellationToken::new())
            .await
    }

    pub async fn resume_with_cancel(
        &self,
        checkpoint: Checkpoint,
        cancel: CancellationToken,
    ) -> WorkflowResult {
        self.executor.resume(checkpoint, cancel).await
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name())
            .field("executor", &self.executor)
            .field("input_schema", &self.input_schema.is_some())
            .finish()
    }
}
