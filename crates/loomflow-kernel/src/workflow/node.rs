//! Node abstraction
//!
//! 节点抽象 / Node abstraction
//!
//! A node is a named async unit of work. It receives the value routed to it
//! and a [`NodeContext`], and returns a [`NodeOutput`] or a [`NodeError`].

use super::context::NodeContext;
use super::error::NodeError;
use super::value::WorkflowValue;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Node category. Informational except for `Condition`/`Switch`, which the
/// graph validator treats as branching nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Llm,
    Tool,
    Transform,
    Condition,
    Switch,
    Parallel,
    MapReduce,
    Delay,
    Validation,
    Log,
}

impl NodeKind {
    pub fn is_branching(self) -> bool {
        matches!(self, NodeKind::Condition | NodeKind::Switch)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeKind::Llm => "llm",
            NodeKind::Tool => "tool",
            NodeKind::Transform => "transform",
            NodeKind::Condition => "condition",
            NodeKind::Switch => "switch",
            NodeKind::Parallel => "parallel",
            NodeKind::MapReduce => "map_reduce",
            NodeKind::Delay => "delay",
            NodeKind::Validation => "validation",
            NodeKind::Log => "log",
        };
        f.write_str(s)
    }
}

/// Routing instruction returned alongside a node's value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Directive {
    /// Follow the node's outgoing edges.
    #[default]
    Continue,
    /// Follow only the edge labelled with this branch key (or the default edge).
    Branch(String),
    /// Stop the run after the current step; this value becomes the final output.
    Finish,
}

/// Value plus routing directive.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeOutput {
    pub value: WorkflowValue,
    pub directive: Directive,
}

impl NodeOutput {
    pub fn new(value: impl Into<WorkflowValue>) -> Self {
        Self {
            value: value.into(),
            directive: Directive::Continue,
        }
    }

    pub fn branch(value: impl Into<WorkflowValue>, key: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            directive: Directive::Branch(key.into()),
        }
    }

    pub fn finish(value: impl Into<WorkflowValue>) -> Self {
        Self {
            value: value.into(),
            directive: Directive::Finish,
        }
    }
}

impl From<WorkflowValue> for NodeOutput {
    fn from(value: WorkflowValue) -> Self {
        NodeOutput::new(value)
    }
}

/// Executable unit of a workflow.
#[async_trait]
pub trait Node: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> NodeKind;

    /// Nodes that must have a recorded result before this one may run.
    fn dependencies(&self) -> &[String] {
        &[]
    }

    async fn execute(&self, input: WorkflowValue, ctx: &NodeContext)
    -> Result<NodeOutput, NodeError>;
}
