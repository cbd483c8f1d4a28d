//! Execution context
//!
//! One [`ExecutionContext`] exists per workflow run. It is owned by the
//! executor and only written between frontiers; running nodes see an
//! immutable snapshot through [`NodeContext`].

use super::error::{ErrorKind, NodeError};
use super::hooks::{WorkflowHooks, guard_hook};
use super::result::NodeResult;
use super::value::WorkflowValue;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-node visit counter. `iteration` is 0 on the first invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopState {
    pub iteration: u32,
}

/// Store of every node's latest result plus run metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub workflow: String,
    pub execution_id: String,
    pub started_at: DateTime<Utc>,
    input: WorkflowValue,
    outputs: HashMap<String, NodeResult>,
    loop_state: HashMap<String, LoopState>,
    element_results: HashMap<String, Vec<NodeResult>>,
    trace: Vec<String>,
}

impl ExecutionContext {
    pub fn new(workflow: impl Into<String>, input: WorkflowValue) -> Self {
        Self {
            workflow: workflow.into(),
            execution_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            input,
            outputs: HashMap::new(),
            loop_state: HashMap::new(),
            element_results: HashMap::new(),
            trace: Vec::new(),
        }
    }

    /// The (validated) workflow input.
    pub fn input(&self) -> &WorkflowValue {
        &self.input
    }

    pub fn output(&self, node: &str) -> Option<&NodeResult> {
        self.outputs.get(node)
    }

    /// Success payload of `node`, if it ran and succeeded.
    pub fn value(&self, node: &str) -> Option<&WorkflowValue> {
        self.outputs.get(node).and_then(NodeResult::value)
    }

    pub fn has_result(&self, node: &str) -> bool {
        self.outputs.contains_key(node)
    }

    /// Typed access to a node's output.
    ///
    /// Fails with `NotFound` when the node has no result yet, with the
    /// recorded error when it failed, and with `InvalidInput` when the payload
    /// does not decode into `T`.
    pub fn decode<T: DeserializeOwned>(&self, node: &str) -> Result<T, NodeError> {
        match self.outputs.get(node) {
            None => Err(NodeError::new(
                ErrorKind::NotFound,
                format!("no output recorded for node '{node}'"),
            )),
            Some(NodeResult::Failure(e)) => Err(e.clone()),
            Some(NodeResult::Success(v)) => v.decode().map_err(|e| {
                NodeError::new(
                    ErrorKind::InvalidInput,
                    format!("output of '{node}' has unexpected shape: {e}"),
                )
            }),
        }
    }

    pub fn outputs(&self) -> &HashMap<String, NodeResult> {
        &self.outputs
    }

    /// Visit counter for `node`; 0 if it never ran.
    pub fn iteration(&self, node: &str) -> u32 {
        self.loop_state.get(node).map(|s| s.iteration).unwrap_or(0)
    }

    pub fn loop_state(&self) -> &HashMap<String, LoopState> {
        &self.loop_state
    }

    /// Ordered per-element results of a map-reduce node.
    pub fn element_results(&self, node: &str) -> &[NodeResult] {
        self.element_results
            .get(node)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Node names in invocation order (repeats for revisited nodes).
    pub fn trace(&self) -> &[String] {
        &self.trace
    }

    pub fn visited(&self) -> HashSet<&str> {
        self.trace.iter().map(String::as_str).collect()
    }

    /// Record a node result; a later write for the same node replaces it.
    pub fn record(&mut self, node: impl Into<String>, result: NodeResult) {
        self.outputs.insert(node.into(), result);
    }

    /// Register one invocation of `node`, advancing its loop counter.
    pub fn record_invocation(&mut self, node: &str) {
        let first = !self.trace.iter().any(|n| n == node);
        let state = self.loop_state.entry(node.to_string()).or_default();
        if !first {
            state.iteration += 1;
        }
        self.trace.push(node.to_string());
    }

    pub fn record_elements(&mut self, node: impl Into<String>, results: Vec<NodeResult>) {
        self.element_results.insert(node.into(), results);
    }
}

/// Predecessor that put a node on the frontier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activation {
    pub from: String,
    pub via_error: bool,
}

/// A node waiting to run, with the edges that activated it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingNode {
    pub name: String,
    pub activations: Vec<Activation>,
}

impl PendingNode {
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            activations: Vec::new(),
        }
    }
}

/// Resumable snapshot taken between frontiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub context: ExecutionContext,
    pub pending: Vec<PendingNode>,
    pub invocations: u64,
    pub step: u64,
}

/// What a running node sees.
#[derive(Clone)]
pub struct NodeContext {
    execution: Arc<ExecutionContext>,
    node: String,
    cancel: CancellationToken,
    hooks: Arc<dyn WorkflowHooks>,
}

impl NodeContext {
    pub fn new(
        execution: Arc<ExecutionContext>,
        node: impl Into<String>,
        cancel: CancellationToken,
        hooks: Arc<dyn WorkflowHooks>,
    ) -> Self {
        Self {
            execution,
            node: node.into(),
            cancel,
            hooks,
        }
    }

    /// Detached context for invoking a node outside of a run (tests, tools).
    pub fn detached(node: impl Into<String>) -> Self {
        Self::new(
            Arc::new(ExecutionContext::new("detached", WorkflowValue::Null)),
            node,
            CancellationToken::new(),
            Arc::new(super::hooks::NoopHooks),
        )
    }

    pub fn execution(&self) -> &ExecutionContext {
        &self.execution
    }

    pub fn shared_execution(&self) -> Arc<ExecutionContext> {
        Arc::clone(&self.execution)
    }

    /// Name of the graph node being executed.
    pub fn node_name(&self) -> &str {
        &self.node
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Same context with a different cancellation token.
    pub fn with_cancellation(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }

    /// Context for a member of a composite node (a parallel child).
    pub fn for_child(&self, node: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            node: node.into(),
            cancel,
            ..self.clone()
        }
    }

    /// Report an intermediate failure (absorbed by a wrapper) to the
    /// `on_node_error` hook.
    pub fn report_error(&self, error: &NodeError) {
        guard_hook("on_node_error", || {
            self.hooks.on_node_error(&self.node, error, &self.execution)
        });
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("node", &self.node)
            .field("execution_id", &self.execution.execution_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
