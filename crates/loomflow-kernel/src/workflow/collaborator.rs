//! External collaborator contracts
//!
//! LLM providers, tool runtimes and argument validators live outside the
//! engine. Nodes reach them through these narrow traits; each error type
//! knows whether a retry may help and converts into a [`NodeError`].

use super::error::{ErrorKind, NodeError};
use super::value::WorkflowValue;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// LLM
// ============================================================================

/// Chat role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Model selection and sampling parameters passed through to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ModelConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider timed out: {0}")]
    Timeout(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("provider error: {0}")]
    Other(String),
}

impl ProviderError {
    /// Transport-level failures and rate limits are worth retrying.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited(_)
                | ProviderError::Transport(_)
                | ProviderError::Timeout(_)
                | ProviderError::Other(_)
        )
    }

    fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::RateLimited(_) => ErrorKind::RateLimited,
            ProviderError::Transport(_) => ErrorKind::Network,
            ProviderError::Timeout(_) => ErrorKind::Timeout,
            ProviderError::Auth(_) => ErrorKind::Auth,
            ProviderError::InvalidRequest(_) => ErrorKind::Validation,
            ProviderError::Other(_) => ErrorKind::Provider,
        }
    }
}

impl From<ProviderError> for NodeError {
    fn from(err: ProviderError) -> Self {
        NodeError::new(err.kind(), err.to_string()).with_retriable(err.is_retriable())
    }
}

/// Language model provider.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn invoke(
        &self,
        messages: &[ChatMessage],
        config: &ModelConfig,
    ) -> Result<WorkflowValue, ProviderError>;
}

// ============================================================================
// Tools
// ============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ToolError {
    #[error("tool '{tool}' not found")]
    NotFound { tool: String },
    #[error("tool execution failed: {message}")]
    Execution { message: String, retriable: bool },
}

impl ToolError {
    pub fn execution(message: impl Into<String>) -> Self {
        ToolError::Execution {
            message: message.into(),
            retriable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        ToolError::Execution {
            message: message.into(),
            retriable: false,
        }
    }

    pub fn is_retriable(&self) -> bool {
        match self {
            ToolError::NotFound { .. } => false,
            ToolError::Execution { retriable, .. } => *retriable,
        }
    }
}

impl From<ToolError> for NodeError {
    fn from(err: ToolError) -> Self {
        let kind = match err {
            ToolError::NotFound { .. } => ErrorKind::NotFound,
            ToolError::Execution { .. } => ErrorKind::Tool,
        };
        NodeError::new(kind, err.to_string()).with_retriable(err.is_retriable())
    }
}

/// Executes a tool with already-validated arguments.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, args: WorkflowValue) -> Result<WorkflowValue, ToolError>;
}

// ============================================================================
// Argument validation
// ============================================================================

/// Arguments rejected before reaching a tool. Never retriable.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid arguments{}: {message}", field.as_deref().map(|f| format!(" at '{f}'")).unwrap_or_default())]
pub struct ValidationError {
    pub field: Option<String>,
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            field: None,
            message: message.into(),
        }
    }

    pub fn at(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
            message: message.into(),
        }
    }
}

impl From<ValidationError> for NodeError {
    fn from(err: ValidationError) -> Self {
        NodeError::validation(err.to_string())
    }
}

/// Checks raw arguments against a schema and returns the typed arguments.
pub trait ArgumentValidator: Send + Sync {
    fn validate(
        &self,
        raw: &WorkflowValue,
        schema: &serde_json::Value,
    ) -> Result<WorkflowValue, ValidationError>;
}
