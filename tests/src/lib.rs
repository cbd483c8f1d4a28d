//! loomflow Testing Framework
//!
//! Provides mock collaborators and observers for testing workflows
//! without live LLM providers or tool runtimes.

pub mod backend;
pub mod hooks;
pub mod nodes;
pub mod tools;

pub use backend::MockLlmClient;
pub use hooks::{HookEvent, RecordingHooks};
pub use nodes::FlakyNode;
pub use tools::{MockTool, MockValidator};
