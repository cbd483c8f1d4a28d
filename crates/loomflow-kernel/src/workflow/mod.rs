//! Workflow Module
//!
//! Core types and traits of the loomflow workflow engine:
//!
//! - **Values**: [`WorkflowValue`], the payload passed between nodes
//! - **Nodes**: the [`Node`] trait and its [`NodeOutput`]/[`Directive`]
//! - **Context**: the per-run [`ExecutionContext`] and the [`NodeContext`] a node sees
//! - **Errors**: [`NodeError`] with its [`ErrorKind`]/[`ErrorCategory`] taxonomy
//! - **Hooks**: [`WorkflowHooks`] observers and the [`CheckpointSink`]
//! - **Collaborators**: [`LlmClient`], [`ToolExecutor`], [`ArgumentValidator`]
//!
//! # Architecture
//!
//! This module defines traits and data only (kernel layer). The graph,
//! executor, resilience wrappers and node catalogue are provided in
//! `loomflow-foundation`.

pub mod collaborator;
pub mod context;
pub mod error;
pub mod hooks;
pub mod node;
pub mod policy;
pub mod result;
pub mod value;

pub use collaborator::{
    ArgumentValidator, ChatMessage, LlmClient, ModelConfig, ProviderError, Role, ToolError,
    ToolExecutor, ValidationError,
};
pub use context::{Activation, Checkpoint, ExecutionContext, LoopState, NodeContext, PendingNode};
pub use error::{ErrorCategory, ErrorKind, NodeError};
pub use hooks::{CheckpointSink, NoopHooks, WorkflowHooks, guard_hook};
pub use node::{Directive, Node, NodeKind, NodeOutput};
pub use policy::{CircuitBreakerConfig, CircuitState, RetryPolicy, TimeoutPolicy};
pub use result::{NodeResult, RunFailure, WorkflowResult, WorkflowStatus};
pub use value::WorkflowValue;
