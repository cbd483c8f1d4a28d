//! Graph-based Workflow Orchestration
//!
//! 提供基于有向图的工作流编排系统，支持：
//! - 多种节点类型（任务、条件、分支、并行、映射归约、延迟、校验、日志、LLM、工具）
//! - 按前沿推进的执行与汇合屏障
//! - 重试、回退、超时与熔断
//! - 生命周期钩子与执行事件
//! - 检查点与恢复
//!
//! Build with [`WorkflowBuilder`], run with [`Workflow::run`].

mod builder;
mod config;
mod engine;
pub mod execution_event;
mod executor;
mod fault_tolerance;
mod graph;
mod hooks;
mod node;

pub use builder::*;
pub use config::*;
pub use engine::*;
pub use execution_event::{ExecutionEvent, ExecutionEventEnvelope};
pub use executor::WorkflowExecutor;
pub use fault_tolerance::*;
pub use graph::*;
pub use hooks::*;
pub use node::*;
