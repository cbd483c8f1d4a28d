//! Execution Event Schema
//!
//! Serializable records of run transitions, produced by
//! [`ChannelHooks`](super::hooks::ChannelHooks) for monitoring or offline
//! trace inspection.
//!
//! # Schema Version
//!
//! Every event travels inside an [`ExecutionEventEnvelope`] carrying the
//! schema version. Versions are integers starting from 1.

use loomflow_kernel::workflow::{
    NodeError, RunFailure, WorkflowResult, WorkflowStatus, WorkflowValue,
};
use serde::{Deserialize, Serialize};

/// Current schema version for execution events
pub const SCHEMA_VERSION: u32 = 1;

/// One run transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum ExecutionEvent {
    /// A node was dispatched
    NodeStarted { execution_id: String, node: String },

    /// A node produced a value
    NodeCompleted {
        execution_id: String,
        node: String,
        output: serde_json::Value,
    },

    /// A node failed; also emitted for failures a wrapper absorbed
    NodeFailed {
        execution_id: String,
        node: String,
        kind: String,
        message: String,
        retriable: bool,
    },

    /// The run reached `Completed`
    WorkflowCompleted {
        execution_id: String,
        final_output: Option<serde_json::Value>,
        duration_ms: u64,
    },

    /// The run reached `Failed`
    WorkflowFailed {
        execution_id: String,
        node: Option<String>,
        kind: String,
        message: String,
    },
}

impl ExecutionEvent {
    pub fn node_completed(execution_id: &str, node: &str, output: &WorkflowValue) -> Self {
        Self::NodeCompleted {
            execution_id: execution_id.to_string(),
            node: node.to_string(),
            output: output.to_json(),
        }
    }

    pub fn node_failed(execution_id: &str, node: &str, error: &NodeError) -> Self {
        Self::NodeFailed {
            execution_id: execution_id.to_string(),
            node: node.to_string(),
            kind: error.kind.as_str().to_string(),
            message: error.message.clone(),
            retriable: error.retriable,
        }
    }

    /// Terminal event for a finished run.
    pub fn finished(result: &WorkflowResult) -> Self {
        match &result.status {
            WorkflowStatus::Completed => Self::WorkflowCompleted {
                execution_id: result.execution_id.clone(),
                final_output: result.final_output.as_ref().map(WorkflowValue::to_json),
                duration_ms: result.duration_ms,
            },
            WorkflowStatus::Failed(failure) => Self::workflow_failed(&result.execution_id, failure),
        }
    }

    pub fn workflow_failed(execution_id: &str, failure: &RunFailure) -> Self {
        Self::WorkflowFailed {
            execution_id: execution_id.to_string(),
            node: failure.node.clone(),
            kind: failure.kind.as_str().to_string(),
            message: failure.message.clone(),
        }
    }

    pub fn execution_id(&self) -> &str {
        match self {
            Self::NodeStarted { execution_id, .. }
            | Self::NodeCompleted { execution_id, .. }
            | Self::NodeFailed { execution_id, .. }
            | Self::WorkflowCompleted { execution_id, .. }
            | Self::WorkflowFailed { execution_id, .. } => execution_id,
        }
    }

    /// `true` for `WorkflowCompleted` and `WorkflowFailed`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. } | Self::WorkflowFailed { .. }
        )
    }
}

/// Envelope wrapper for execution events with schema version
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionEventEnvelope {
    /// Schema version for this event
    pub schema_version: u32,

    /// Position of the event in the emitting hook's stream, starting at 0
    pub sequence: u64,

    /// Unix timestamp in milliseconds
    pub emitted_at: i64,

    /// The wrapped execution event
    pub event: ExecutionEvent,
}

impl ExecutionEventEnvelope {
    /// Create a new envelope with the current schema version
    pub fn new(sequence: u64, event: ExecutionEvent) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            sequence,
            emitted_at: chrono::Utc::now().timestamp_millis(),
            event,
        }
    }

    pub fn is_compatible(&self) -> bool {
        self.schema_version == SCHEMA_VERSION
    }
}
