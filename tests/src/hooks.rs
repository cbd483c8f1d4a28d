use loomflow_kernel::workflow::{
    ExecutionContext, NodeError, RunFailure, WorkflowHooks, WorkflowResult, WorkflowValue,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

/// One observed transition.
#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    NodeStarted(String),
    NodeCompleted(String, WorkflowValue),
    NodeFailed(String, NodeError),
    Completed(Option<WorkflowValue>),
    Failed(RunFailure),
}

/// Records every hook call in order for later assertions.
#[derive(Debug, Clone, Default)]
pub struct RecordingHooks {
    events: Arc<Mutex<Vec<HookEvent>>>,
}

impl RecordingHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().clone()
    }

    /// Nodes in the order `on_node_start` saw them.
    pub fn started(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                HookEvent::NodeStarted(node) => Some(node.clone()),
                _ => None,
            })
            .collect()
    }

    /// Errors reported for `node`, absorbed ones included.
    pub fn errors_for(&self, node: &str) -> Vec<NodeError> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                HookEvent::NodeFailed(n, err) if n == node => Some(err.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of terminal (`on_complete` / `on_error`) events.
    pub fn terminal_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, HookEvent::Completed(_) | HookEvent::Failed(_)))
            .count()
    }

    fn push(&self, event: HookEvent) {
        trace!(?event, "hook recorded");
        self.events.lock().push(event);
    }
}

impl WorkflowHooks for RecordingHooks {
    fn on_node_start(&self, node: &str, _ctx: &ExecutionContext) -> anyhow::Result<()> {
        self.push(HookEvent::NodeStarted(node.to_string()));
        Ok(())
    }

    fn on_node_complete(
        &self,
        node: &str,
        output: &WorkflowValue,
        _ctx: &ExecutionContext,
    ) -> anyhow::Result<()> {
        self.push(HookEvent::NodeCompleted(node.to_string(), output.clone()));
        Ok(())
    }

    fn on_node_error(
        &self,
        node: &str,
        error: &NodeError,
        _ctx: &ExecutionContext,
    ) -> anyhow::Result<()> {
        self.push(HookEvent::NodeFailed(node.to_string(), error.clone()));
        Ok(())
    }

    fn on_complete(&self, result: &WorkflowResult) -> anyhow::Result<()> {
        self.push(HookEvent::Completed(result.final_output.clone()));
        Ok(())
    }

    fn on_error(&self, failure: &RunFailure, _ctx: &ExecutionContext) -> anyhow::Result<()> {
        self.push(HookEvent::Failed(failure.clone()));
        Ok(())
    }
}
