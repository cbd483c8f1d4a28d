//! 容错原语 / Resilience wrappers
//!
//! 节点装饰器：重试、回退、超时和断路器
//! Node decorators that change how a node's failures are handled: retry
//! with backoff, fallback to a secondary node, a timeout race, and a shared
//! circuit breaker.
//!
//! 包装器可以嵌套；最内层的包装器最先看到错误。
//! Wrappers nest; the innermost wrapper sees a failure first. The builder
//! applies `Timeout` inside `Retry` so each attempt gets its own deadline.

use async_trait::async_trait;
use dashmap::DashMap;
use loomflow_kernel::workflow::{
    CircuitBreakerConfig, CircuitState, ErrorKind, Node, NodeContext, NodeError, NodeKind,
    NodeOutput, RetryPolicy, WorkflowValue,
};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Decides whether a failed attempt is retried. Receives the error and the
/// 1-based number of the attempt that just failed.
pub type RetryPredicate = Arc<dyn Fn(&NodeError, u32) -> bool + Send + Sync>;

// ────────────────────── Retry ──────────────────────

/// 重试包装器
/// Re-invokes the inner node up to `max_retries` more times while the
/// predicate allows it (default: `error.retriable`). The last error surfaces
/// once retries are exhausted.
#[derive(Clone)]
pub struct Retry {
    inner: Arc<dyn Node>,
    policy: RetryPolicy,
    predicate: Option<RetryPredicate>,
}

impl Retry {
    pub fn new(inner: Arc<dyn Node>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            predicate: None,
        }
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&NodeError, u32) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    fn should_retry(&self, error: &NodeError, attempt: u32) -> bool {
        match &self.predicate {
            Some(predicate) => predicate(error, attempt),
            None => error.retriable,
        }
    }

    /// Delay before retry number `retry` (0-indexed), jittered by ±50% when
    /// enabled.
    fn backoff(&self, retry: u32) -> Duration {
        let delay = self.policy.delay_for_attempt(retry);
        if self.policy.jitter {
            let factor: f64 = rand::thread_rng().gen_range(0.5..=1.5);
            delay.mul_f64(factor)
        } else {
            delay
        }
    }
}

#[async_trait]
impl Node for Retry {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> NodeKind {
        self.inner.kind()
    }

    fn dependencies(&self) -> &[String] {
        self.inner.dependencies()
    }

    async fn execute(
        &self,
        input: WorkflowValue,
        ctx: &NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        let mut retry = 0u32;
        loop {
            let error = match self.inner.execute(input.clone(), ctx).await {
                Ok(output) => return Ok(output),
                Err(error) => error,
            };
            let attempt = retry + 1;
            if retry >= self.policy.max_retries
                || ctx.is_cancelled()
                || !self.should_retry(&error, attempt)
            {
                return Err(error);
            }

            ctx.report_error(&error);
            let delay = self.backoff(retry);
            warn!(
                node = self.inner.name(),
                attempt,
                max_retries = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying node after failure"
            );
            tokio::select! {
                _ = ctx.cancellation().cancelled() => return Err(NodeError::cancelled()),
                _ = tokio::time::sleep(delay) => {}
            }
            retry += 1;
        }
    }
}

// ────────────────────── Fallback ──────────────────────

/// 回退包装器
/// Runs `secondary` with the same input when `primary` fails. The primary's
/// error is reported to the hooks but never becomes the node's result.
#[derive(Clone)]
pub struct Fallback {
    primary: Arc<dyn Node>,
    secondary: Arc<dyn Node>,
}

impl Fallback {
    pub fn new(primary: Arc<dyn Node>, secondary: Arc<dyn Node>) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl Node for Fallback {
    fn name(&self) -> &str {
        self.primary.name()
    }

    fn kind(&self) -> NodeKind {
        self.primary.kind()
    }

    fn dependencies(&self) -> &[String] {
        self.primary.dependencies()
    }

    async fn execute(
        &self,
        input: WorkflowValue,
        ctx: &NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        match self.primary.execute(input.clone(), ctx).await {
            Ok(output) => Ok(output),
            Err(error) if ctx.is_cancelled() => Err(error),
            Err(error) => {
                ctx.report_error(&error);
                info!(
                    node = self.primary.name(),
                    fallback = self.secondary.name(),
                    error = %error,
                    "primary failed, using fallback"
                );
                self.secondary.execute(input, ctx).await
            }
        }
    }
}

// ────────────────────── Timeout ──────────────────────

/// 超时包装器
/// Races the inner node against a timer. On expiry the inner work is
/// signalled through a child cancellation token and dropped; the node fails
/// with `Timeout` or, if configured, succeeds with the fallback payload.
#[derive(Clone)]
pub struct Timeout {
    inner: Arc<dyn Node>,
    duration: Duration,
    on_timeout: Option<WorkflowValue>,
}

impl Timeout {
    pub fn new(inner: Arc<dyn Node>, duration: Duration) -> Self {
        Self {
            inner,
            duration,
            on_timeout: None,
        }
    }

    pub fn on_timeout(mut self, payload: impl Into<WorkflowValue>) -> Self {
        self.on_timeout = Some(payload.into());
        self
    }
}

#[async_trait]
impl Node for Timeout {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> NodeKind {
        self.inner.kind()
    }

    fn dependencies(&self) -> &[String] {
        self.inner.dependencies()
    }

    async fn execute(
        &self,
        input: WorkflowValue,
        ctx: &NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        let token = ctx.cancellation().child_token();
        let scoped = ctx.with_cancellation(token.clone());
        tokio::select! {
            result = self.inner.execute(input, &scoped) => result,
            _ = tokio::time::sleep(self.duration) => {
                token.cancel();
                let duration_ms = self.duration.as_millis() as u64;
                warn!(node = self.inner.name(), duration_ms, "node timed out");
                match &self.on_timeout {
                    Some(payload) => Ok(NodeOutput::new(payload.clone())),
                    None => Err(NodeError::timeout(duration_ms)),
                }
            }
        }
    }
}

// ────────────────────── CircuitBreaker ──────────────────────

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// 断路器共享状态
/// Shared state of one named circuit breaker.
///
/// `Closed` counts consecutive failures and opens at `threshold`. `Open`
/// rejects every call until `cooldown` has elapsed, then admits exactly one
/// probe (`HalfOpen`). The probe's success closes the circuit; its failure
/// re-opens it and restarts the cooldown.
#[derive(Debug)]
pub struct BreakerState {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl BreakerState {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. An open circuit whose cooldown elapsed still reports
    /// `Open` until a call takes the probe slot.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Operator override: close the circuit and clear the counter.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    /// Admit a call, or `None` when it must be rejected.
    fn try_acquire(self: &Arc<Self>) -> Option<BreakerPermit> {
        let mut inner = self.inner.lock();
        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.config.cooldown());
                if !cooled {
                    return None;
                }
                debug!(breaker = %self.name, "cooldown elapsed, admitting probe");
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return None;
                }
                inner.probe_in_flight = true;
                true
            }
        };
        Some(BreakerPermit {
            breaker: Arc::clone(self),
            probe,
            settled: false,
        })
    }

    /// Only the probe may close a tripped circuit. Calls admitted before the
    /// trip that settle afterwards leave `Open`/`HalfOpen` untouched.
    fn on_success(&self, probe: bool) {
        let mut inner = self.inner.lock();
        if probe {
            info!(breaker = %self.name, "circuit closed");
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.opened_at = None;
            inner.probe_in_flight = false;
        } else if inner.state == CircuitState::Closed {
            inner.consecutive_failures = 0;
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let trip = inner.state == CircuitState::Closed
            && inner.consecutive_failures >= self.config.threshold;
        if probe || trip {
            warn!(
                breaker = %self.name,
                consecutive_failures = inner.consecutive_failures,
                threshold = self.config.threshold,
                "circuit opened"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
        if probe {
            inner.probe_in_flight = false;
        }
    }

    /// Cancelled calls say nothing about the dependency's health.
    fn on_abandoned(&self, probe: bool) {
        if probe {
            self.inner.lock().probe_in_flight = false;
        }
    }
}

/// Admission ticket. A probe dropped before settling frees the probe slot.
struct BreakerPermit {
    breaker: Arc<BreakerState>,
    probe: bool,
    settled: bool,
}

impl BreakerPermit {
    fn settle(mut self, result: &Result<NodeOutput, NodeError>) {
        self.settled = true;
        match result {
            Ok(_) => self.breaker.on_success(self.probe),
            Err(e) if e.kind == ErrorKind::Cancelled => self.breaker.on_abandoned(self.probe),
            Err(_) => self.breaker.on_failure(self.probe),
        }
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandoned(self.probe);
        }
    }
}

/// 断路器包装器
/// Guards the inner node with a shared [`BreakerState`]. Rejected calls fail
/// with `CircuitOpen` without invoking the inner node.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<dyn Node>,
    state: Arc<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(inner: Arc<dyn Node>, state: Arc<BreakerState>) -> Self {
        Self { inner, state }
    }

    pub fn state(&self) -> &Arc<BreakerState> {
        &self.state
    }
}

#[async_trait]
impl Node for CircuitBreaker {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> NodeKind {
        self.inner.kind()
    }

    fn dependencies(&self) -> &[String] {
        self.inner.dependencies()
    }

    async fn execute(
        &self,
        input: WorkflowValue,
        ctx: &NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        let Some(permit) = self.state.try_acquire() else {
            debug!(node = self.inner.name(), breaker = self.state.name(), "call rejected");
            return Err(NodeError::circuit_open(self.state.name()));
        };
        let result = self.inner.execute(input, ctx).await;
        permit.settle(&result);
        result
    }
}

// ────────────────────── Registry ──────────────────────

/// 断路器注册表
/// Named breakers shared by every node (and every run) holding the same
/// registry. Inject one registry per scope that should share breaker state.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<BreakerState>>,
    configs: HashMap<String, CircuitBreakerConfig>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with per-name settings, e.g. `EngineConfig::breakers`.
    pub fn with_configs(configs: HashMap<String, CircuitBreakerConfig>) -> Self {
        Self {
            breakers: DashMap::new(),
            configs,
        }
    }

    /// Breaker `name`, created from its configured (or default) settings on
    /// first use.
    pub fn breaker(&self, name: &str) -> Arc<BreakerState> {
        let config = self.configs.get(name).cloned().unwrap_or_default();
        self.breaker_with(name, config)
    }

    /// Breaker `name`; `config` only applies if it does not exist yet.
    pub fn breaker_with(&self, name: &str, config: CircuitBreakerConfig) -> Arc<BreakerState> {
        let entry = self
            .breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(BreakerState::new(name, config)));
        Arc::clone(entry.value())
    }

    pub fn get(&self, name: &str) -> Option<Arc<BreakerState>> {
        self.breakers.get(name).map(|b| Arc::clone(b.value()))
    }

    /// Snapshot of every breaker's state.
    pub fn states(&self) -> HashMap<String, CircuitState> {
        self.breakers
            .iter()
            .map(|b| (b.key().clone(), b.value().state()))
            .collect()
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.value().reset();
        }
    }
}
