//! Node and workflow results

use super::context::ExecutionContext;
use super::error::{ErrorKind, NodeError};
use super::value::WorkflowValue;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of one node invocation as recorded in the execution context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeResult {
    Success(WorkflowValue),
    Failure(NodeError),
}

impl NodeResult {
    pub fn is_success(&self) -> bool {
        matches!(self, NodeResult::Success(_))
    }

    pub fn value(&self) -> Option<&WorkflowValue> {
        match self {
            NodeResult::Success(v) => Some(v),
            NodeResult::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&NodeError> {
        match self {
            NodeResult::Success(_) => None,
            NodeResult::Failure(e) => Some(e),
        }
    }
}

impl From<Result<WorkflowValue, NodeError>> for NodeResult {
    fn from(result: Result<WorkflowValue, NodeError>) -> Self {
        match result {
            Ok(v) => NodeResult::Success(v),
            Err(e) => NodeResult::Failure(e),
        }
    }
}

/// Why a run ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    /// Originating node; `None` only when the run failed before any node ran
    /// (input rejected, cancelled before start).
    pub node: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

impl RunFailure {
    pub fn at_node(node: impl Into<String>, error: &NodeError) -> Self {
        Self {
            node: Some(node.into()),
            kind: error.kind,
            message: error.message.clone(),
        }
    }

    pub fn before_start(error: &NodeError) -> Self {
        Self {
            node: None,
            kind: error.kind,
            message: error.message.clone(),
        }
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node {
            Some(node) => write!(f, "node '{}' failed ({}): {}", node, self.kind, self.message),
            None => write!(f, "run failed ({}): {}", self.kind, self.message),
        }
    }
}

/// Terminal status of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Completed,
    Failed(RunFailure),
}

/// Everything a caller gets back from `Workflow::run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    /// Snapshot of the execution context; partial when the run failed.
    pub outputs: ExecutionContext,
    pub final_output: Option<WorkflowValue>,
    pub duration_ms: u64,
    pub execution_id: String,
    pub status: WorkflowStatus,
}

impl WorkflowResult {
    pub fn is_completed(&self) -> bool {
        matches!(self.status, WorkflowStatus::Completed)
    }

    pub fn failure(&self) -> Option<&RunFailure> {
        match &self.status {
            WorkflowStatus::Failed(f) => Some(f),
            WorkflowStatus::Completed => None,
        }
    }
}
