//! 引擎配置
//! Engine configuration
//!
//! Serde records with defaults for every field, so a config file only needs
//! the keys it changes:
//!
//! ```toml
//! [executor]
//! max_iterations = 200
//! max_parallelism = 4
//!
//! [retry]
//! max_retries = 2
//! base_delay_ms = 250
//!
//! [breakers.llm]
//! threshold = 3
//! cooldown_ms = 10000
//! ```

use super::fault_tolerance::CircuitBreakerRegistry;
use error_stack::{Report, ResultExt};
use loomflow_kernel::config::{self, FileFormat};
use loomflow_kernel::workflow::{CircuitBreakerConfig, RetryPolicy, TimeoutPolicy};
use loomflow_kernel::{KernelError, KernelResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// 执行器配置
/// Executor limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Total node invocations allowed per run, parallel children and
    /// map elements included
    pub max_iterations: u64,
    /// Frontier members running at the same time
    pub max_parallelism: usize,
    /// Emit a checkpoint every N steps; 0 disables checkpoints
    pub checkpoint_interval: u64,
    /// Default for parallel groups that do not set `fail_fast` themselves
    pub parallel_fail_fast: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            max_parallelism: 10,
            checkpoint_interval: 0,
            parallel_fail_fast: false,
        }
    }
}

/// Top-level engine settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub executor: ExecutorConfig,
    /// Policy used by `WorkflowBuilder::with_default_retry`
    pub retry: RetryPolicy,
    /// Policy used by `WorkflowBuilder::with_default_timeout`
    pub timeout: Option<TimeoutPolicy>,
    /// Per-name circuit breaker settings
    pub breakers: HashMap<String, CircuitBreakerConfig>,
}

impl EngineConfig {
    /// Load from a file; the format follows the extension.
    pub fn load(path: impl AsRef<Path>) -> KernelResult<Self> {
        let path = path.as_ref();
        config::load_config(path)
            .map_err(|e| Report::new(KernelError::from(e)))
            .attach(format!("loading engine config from {}", path.display()))
    }

    /// Merge several files; later files override earlier ones.
    pub fn load_layered<P: AsRef<Path>>(paths: &[P]) -> KernelResult<Self> {
        config::load_layered(paths)
            .map_err(|e| Report::new(KernelError::from(e)))
            .attach("loading layered engine config")
    }

    pub fn from_str(content: &str, format: FileFormat) -> KernelResult<Self> {
        config::from_str(content, format)
            .map_err(|e| Report::new(KernelError::from(e)))
            .attach("parsing engine config")
    }

    /// Fresh breaker registry seeded with [`Self::breakers`].
    pub fn breaker_registry(&self) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::with_configs(self.breakers.clone())
    }
}
