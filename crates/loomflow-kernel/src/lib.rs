//! loomflow kernel
//!
//! Trait and type layer of the loomflow workflow engine. Concrete node
//! implementations, the graph builder and the executor live in
//! `loomflow-foundation`; this crate only defines the contracts they share.

// config module
pub mod config;

// error module
pub mod error;

// logging module
pub mod logging;

// workflow contracts
pub mod workflow;

pub use error::{KernelError, KernelResult};
