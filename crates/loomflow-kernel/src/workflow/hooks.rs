//! Lifecycle hooks and checkpoint sink
//!
//! Hooks are observers. They are invoked synchronously at each transition,
//! must not block, and can never fail a run: returned errors and panics are
//! swallowed by [`guard_hook`] and logged.

use super::context::{Checkpoint, ExecutionContext};
use super::error::NodeError;
use super::result::{RunFailure, WorkflowResult};
use super::value::WorkflowValue;
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::warn;

// ============================================================================
// WorkflowHooks
// ============================================================================

/// Callbacks fired around node and run transitions.
///
/// Every method defaults to a no-op.
pub trait WorkflowHooks: Send + Sync {
    fn on_node_start(&self, _node: &str, _ctx: &ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_node_complete(
        &self,
        _node: &str,
        _output: &WorkflowValue,
        _ctx: &ExecutionContext,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Also fired for failures absorbed by a wrapper (Fallback primary,
    /// retried attempts).
    fn on_node_error(
        &self,
        _node: &str,
        _error: &NodeError,
        _ctx: &ExecutionContext,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Fired once when a run reaches `Completed`.
    fn on_complete(&self, _result: &WorkflowResult) -> anyhow::Result<()> {
        Ok(())
    }

    /// Fired once when a run reaches `Failed`.
    fn on_error(&self, _failure: &RunFailure, _ctx: &ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl WorkflowHooks for NoopHooks {}

/// Run a hook body, logging (never propagating) errors and panics.
pub fn guard_hook<F>(hook: &str, f: F)
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(hook, error = %e, "workflow hook returned an error"),
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            warn!(hook, panic = %msg, "workflow hook panicked");
        }
    }
}

// ============================================================================
// CheckpointSink
// ============================================================================

/// Opaque persistence hook. Receives a snapshot between frontiers; the
/// format and storage are up to the implementor.
pub trait CheckpointSink: Send + Sync {
    fn checkpoint(&self, checkpoint: &Checkpoint) -> anyhow::Result<()>;
}
