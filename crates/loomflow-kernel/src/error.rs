//! Crate-level error types for `loomflow-kernel`.
//!
//! Node-level failures are data ([`NodeError`](crate::workflow::NodeError))
//! and travel inside the execution context. [`KernelError`] is for the things
//! around a run that can go wrong: configuration, serialization and I/O. It is
//! used together with [`error_stack::Report`] so callers can attach context as
//! the error propagates.
//!
//! ```rust,ignore
//! use error_stack::ResultExt;
//! use loomflow_kernel::{KernelError, KernelResult};
//!
//! fn engine_settings() -> KernelResult<EngineConfig> {
//!     loomflow_kernel::config::load_config("loomflow.toml")
//!         .map_err(KernelError::from)
//!         .map_err(error_stack::Report::new)
//!         .attach("loading loomflow.toml")
//! }
//! ```

use crate::config::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KernelError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

/// `Result` carrying an [`error_stack::Report`] of [`KernelError`].
pub type KernelResult<T> = Result<T, error_stack::Report<KernelError>>;
