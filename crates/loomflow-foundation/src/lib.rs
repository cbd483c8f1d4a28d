//! loomflow foundation
//!
//! Implementation layer of the loomflow workflow engine: the node
//! catalogue, graph builder and validation, the frontier executor and the
//! resilience wrappers. Contracts shared with callers live in
//! `loomflow-kernel` and are re-exported here for convenience.

// workflow module
pub mod workflow;

pub use loomflow_kernel::workflow as kernel;
