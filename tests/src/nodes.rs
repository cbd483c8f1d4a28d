use async_trait::async_trait;
use loomflow_kernel::workflow::{Node, NodeContext, NodeError, NodeKind, NodeOutput, WorkflowValue};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Fails with a fixed error for the first `failures` calls, then returns
/// `value`. Counts every call.
#[derive(Clone)]
pub struct FlakyNode {
    name: String,
    failures: u32,
    error: NodeError,
    value: WorkflowValue,
    calls: Arc<AtomicU32>,
}

impl FlakyNode {
    /// Transient network failures before succeeding.
    pub fn new(name: &str, failures: u32, value: impl Into<WorkflowValue>) -> Self {
        Self {
            name: name.to_string(),
            failures,
            error: NodeError::transient(format!("{name} unavailable")),
            value: value.into(),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Never succeeds.
    pub fn always_failing(name: &str, error: NodeError) -> Self {
        Self {
            name: name.to_string(),
            failures: u32::MAX,
            error,
            value: WorkflowValue::Null,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Shared call counter, readable after the node moved into a workflow.
    pub fn counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Node for FlakyNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Tool
    }

    async fn execute(
        &self,
        _input: WorkflowValue,
        _ctx: &NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(self.error.clone());
        }
        Ok(NodeOutput::new(self.value.clone()))
    }
}
