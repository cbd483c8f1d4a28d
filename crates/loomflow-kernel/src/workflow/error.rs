//! Node failure taxonomy
//!
//! A failed node invocation is described by a [`NodeError`]: what kind of
//! failure it was, a message, and whether a retry may help. Kinds fold into
//! four categories that drive the resilience wrappers:
//!
//! | Category | Kinds | Retried by default |
//! |---|---|---|
//! | `Transient` | rate limit, network, timeout, provider | yes |
//! | `Permanent` | validation, auth, not-found, invalid input, tool, unsatisfied dependency | no |
//! | `Resource` | circuit open, iteration limit, cancelled | no (control-flow signal) |
//! | `Unknown` | anything else, panics | no |

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Coarse failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Transient,
    Permanent,
    Resource,
    Unknown,
}

/// Concrete failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorKind {
    RateLimited,
    Network,
    Timeout,
    Provider,
    Validation,
    Auth,
    NotFound,
    InvalidInput,
    Tool,
    DependencyUnsatisfied,
    CircuitOpen,
    IterationLimitExceeded,
    Cancelled,
    Unknown,
}

impl ErrorKind {
    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorKind::RateLimited
            | ErrorKind::Network
            | ErrorKind::Timeout
            | ErrorKind::Provider => ErrorCategory::Transient,
            ErrorKind::Validation
            | ErrorKind::Auth
            | ErrorKind::NotFound
            | ErrorKind::InvalidInput
            | ErrorKind::Tool
            | ErrorKind::DependencyUnsatisfied => ErrorCategory::Permanent,
            ErrorKind::CircuitOpen | ErrorKind::IterationLimitExceeded | ErrorKind::Cancelled => {
                ErrorCategory::Resource
            }
            ErrorKind::Unknown => ErrorCategory::Unknown,
        }
    }

    /// Stable snake_case name, used in error records handed to on-error edges.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Provider => "provider",
            ErrorKind::Validation => "validation",
            ErrorKind::Auth => "auth",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Tool => "tool",
            ErrorKind::DependencyUnsatisfied => "dependency_unsatisfied",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::IterationLimitExceeded => "iteration_limit_exceeded",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure produced by one node invocation.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct NodeError {
    pub kind: ErrorKind,
    pub message: String,
    pub retriable: bool,
}

impl NodeError {
    /// Create an error whose retriability follows the kind's category.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retriable: kind.category() == ErrorCategory::Transient,
        }
    }

    /// Override the default retriability.
    pub fn with_retriable(mut self, retriable: bool) -> Self {
        self.retriable = retriable;
        self
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    /// Validation failures are never retriable.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn timeout(duration_ms: u64) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("operation timed out after {duration_ms}ms"),
        )
    }

    pub fn circuit_open(breaker: &str) -> Self {
        Self::new(
            ErrorKind::CircuitOpen,
            format!("circuit breaker '{breaker}' is open"),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "execution cancelled")
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::new(ErrorKind::InvalidInput, err.to_string())
    }
}

impl From<anyhow::Error> for NodeError {
    fn from(err: anyhow::Error) -> Self {
        NodeError::unknown(format!("{err:#}"))
    }
}
