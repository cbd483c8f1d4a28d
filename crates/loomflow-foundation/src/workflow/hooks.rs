//! 生命周期钩子实现
//! Built-in lifecycle hook implementations
//!
//! - [`TracingHooks`]: one structured log line per transition
//! - [`ChannelHooks`]: forwards [`ExecutionEvent`]s over a bounded channel
//!   without ever blocking the executor
//! - [`HookSet`]: several observers behind one handle

use super::execution_event::{ExecutionEvent, ExecutionEventEnvelope};
use loomflow_kernel::workflow::{
    ExecutionContext, NodeError, RunFailure, WorkflowHooks, WorkflowResult, WorkflowValue,
    guard_hook,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Logs every transition through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHooks;

impl WorkflowHooks for TracingHooks {
    fn on_node_start(&self, node: &str, ctx: &ExecutionContext) -> anyhow::Result<()> {
        debug!(
            workflow = %ctx.workflow,
            execution_id = %ctx.execution_id,
            node,
            iteration = ctx.iteration(node),
            "node started"
        );
        Ok(())
    }

    fn on_node_complete(
        &self,
        node: &str,
        output: &WorkflowValue,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<()> {
        debug!(
            workflow = %ctx.workflow,
            execution_id = %ctx.execution_id,
            node,
            output = %output.render(),
            "node completed"
        );
        Ok(())
    }

    fn on_node_error(
        &self,
        node: &str,
        error: &NodeError,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<()> {
        warn!(
            workflow = %ctx.workflow,
            execution_id = %ctx.execution_id,
            node,
            kind = %error.kind,
            retriable = error.retriable,
            "node failed: {}",
            error.message
        );
        Ok(())
    }

    fn on_complete(&self, result: &WorkflowResult) -> anyhow::Result<()> {
        info!(
            workflow = %result.outputs.workflow,
            execution_id = %result.execution_id,
            duration_ms = result.duration_ms,
            "workflow completed"
        );
        Ok(())
    }

    fn on_error(&self, failure: &RunFailure, ctx: &ExecutionContext) -> anyhow::Result<()> {
        warn!(
            workflow = %ctx.workflow,
            execution_id = %ctx.execution_id,
            node = failure.node.as_deref().unwrap_or("-"),
            kind = %failure.kind,
            "workflow failed: {}",
            failure.message
        );
        Ok(())
    }
}

/// 事件通道钩子
/// Sends each transition as an [`ExecutionEventEnvelope`] with `try_send`.
/// A full or closed channel drops the event; the executor never waits on
/// the consumer.
#[derive(Debug)]
pub struct ChannelHooks {
    tx: mpsc::Sender<ExecutionEventEnvelope>,
    sequence: AtomicU64,
}

impl ChannelHooks {
    pub fn new(tx: mpsc::Sender<ExecutionEventEnvelope>) -> Self {
        Self {
            tx,
            sequence: AtomicU64::new(0),
        }
    }

    /// Hooks plus the receiving end of a channel holding `capacity` events.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ExecutionEventEnvelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    fn emit(&self, event: ExecutionEvent) -> anyhow::Result<()> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.tx
            .try_send(ExecutionEventEnvelope::new(sequence, event))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(env) => {
                    anyhow::anyhow!("event channel full, dropped event #{}", env.sequence)
                }
                mpsc::error::TrySendError::Closed(env) => {
                    anyhow::anyhow!("event channel closed, dropped event #{}", env.sequence)
                }
            })
    }
}

impl WorkflowHooks for ChannelHooks {
    fn on_node_start(&self, node: &str, ctx: &ExecutionContext) -> anyhow::Result<()> {
        self.emit(ExecutionEvent::NodeStarted {
            execution_id: ctx.execution_id.clone(),
            node: node.to_string(),
        })
    }

    fn on_node_complete(
        &self,
        node: &str,
        output: &WorkflowValue,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<()> {
        self.emit(ExecutionEvent::node_completed(&ctx.execution_id, node, output))
    }

    fn on_node_error(
        &self,
        node: &str,
        error: &NodeError,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<()> {
        self.emit(ExecutionEvent::node_failed(&ctx.execution_id, node, error))
    }

    fn on_complete(&self, result: &WorkflowResult) -> anyhow::Result<()> {
        self.emit(ExecutionEvent::finished(result))
    }

    fn on_error(&self, failure: &RunFailure, ctx: &ExecutionContext) -> anyhow::Result<()> {
        self.emit(ExecutionEvent::workflow_failed(&ctx.execution_id, failure))
    }
}

/// Broadcasts to several hooks. Each observer is guarded separately so one
/// failing observer does not silence the others.
#[derive(Clone, Default)]
pub struct HookSet {
    hooks: Vec<Arc<dyn WorkflowHooks>>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, hooks: Arc<dyn WorkflowHooks>) {
        self.hooks.push(hooks);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl WorkflowHooks for HookSet {
    fn on_node_start(&self, node: &str, ctx: &ExecutionContext) -> anyhow::Result<()> {
        for h in &self.hooks {
            guard_hook("on_node_start", || h.on_node_start(node, ctx));
        }
        Ok(())
    }

    fn on_node_complete(
        &self,
        node: &str,
        output: &WorkflowValue,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<()> {
        for h in &self.hooks {
            guard_hook("on_node_complete", || h.on_node_complete(node, output, ctx));
        }
        Ok(())
    }

    fn on_node_error(
        &self,
        node: &str,
        error: &NodeError,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<()> {
        for h in &self.hooks {
            guard_hook("on_node_error", || h.on_node_error(node, error, ctx));
        }
        Ok(())
    }

    fn on_complete(&self, result: &WorkflowResult) -> anyhow::Result<()> {
        for h in &self.hooks {
            guard_hook("on_complete", || h.on_complete(result));
        }
        Ok(())
    }

    fn on_error(&self, failure: &RunFailure, ctx: &ExecutionContext) -> anyhow::Result<()> {
        for h in &self.hooks {
            guard_hook("on_error", || h.on_error(failure, ctx));
        }
        Ok(())
    }
}

impl std::fmt::Debug for HookSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookSet")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}
