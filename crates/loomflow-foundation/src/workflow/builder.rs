//! 工作流构建器
//! Workflow Builder
//!
//! 提供流式 API 构建工作流
//! Fluent API for assembling a [`Workflow`]. Each node added is connected
//! from the previously added one unless the chain was broken with
//! [`WorkflowBuilder::detach`] or redirected with [`WorkflowBuilder::goto`].
//!
//! Resilience wrappers are recorded per node and applied at build time in a
//! fixed order, whatever order they were declared in:
//!
//! ```text
//! Fallback( CircuitBreaker( Retry( Timeout( node ) ) ) )
//! ```
//!
//! so a timeout bounds a single attempt, the breaker counts one failure per
//! exhausted retry sequence, and the fallback sees the final error.

use super::config::EngineConfig;
use super::engine::{InputSchema, Workflow};
use super::executor::WorkflowExecutor;
use super::fault_tolerance::{
    CircuitBreaker, CircuitBreakerRegistry, Fallback, Retry, RetryPredicate, Timeout,
};
use super::graph::{Edge, GraphError, MapReduceSpec, WorkflowGraph, WorkflowNode};
use super::hooks::HookSet;
use super::node::{
    ConditionNode, DelayNode, FnNode, LlmNode, LogNode, SwitchNode, ToolNode, ValidationNode,
};
use loomflow_kernel::workflow::{
    ArgumentValidator, CheckpointSink, ExecutionContext, LlmClient, ModelConfig, Node,
    NodeContext, NodeError, NodeOutput, RetryPolicy, ToolExecutor, WorkflowHooks, WorkflowValue,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Policy taken from [`EngineConfig`] at build time, or given explicitly.
enum Setting<T> {
    FromConfig,
    Explicit(T),
}

#[derive(Default)]
struct NodePolicies {
    timeout: Option<(Setting<Duration>, Option<WorkflowValue>)>,
    retry: Option<(Setting<RetryPolicy>, Option<RetryPredicate>)>,
    breaker: Option<String>,
    fallback: Option<Arc<dyn Node>>,
}

/// 工作流构建器
/// Workflow builder
pub struct WorkflowBuilder {
    graph: WorkflowGraph,
    current: Option<String>,
    config: EngineConfig,
    hooks: HookSet,
    checkpoint_sink: Option<Arc<dyn CheckpointSink>>,
    input_schema: Option<InputSchema>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    policies: HashMap<String, NodePolicies>,
    /// Policy declared for a missing node; reported by `build`.
    pending_error: Option<GraphError>,
}

impl WorkflowBuilder {
    /// 创建新的构建器
    /// Create a new builder
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            graph: WorkflowGraph::new(name),
            current: None,
            config: EngineConfig::default(),
            hooks: HookSet::new(),
            checkpoint_sink: None,
            input_schema: None,
            breakers: None,
            policies: HashMap::new(),
            pending_error: None,
        }
    }

    /// 设置描述
    /// Set description
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.graph.description = desc.into();
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    // ────────────────────── Nodes ──────────────────────

    /// Add a node and connect it from the current one.
    pub fn add(mut self, node: WorkflowNode) -> Self {
        let name = node.name().to_string();
        self.graph.add_node(node);
        if let Some(prev) = self.current.take() {
            self.graph.add_edge(Edge::new(prev, name.clone()));
        }
        self.current = Some(name);
        self
    }

    /// 添加自定义节点
    /// Add any [`Node`] implementation.
    pub fn node(self, node: Arc<dyn Node>) -> Self {
        self.add(WorkflowNode::leaf(node))
    }

    /// 添加任务节点
    /// Add an async task node.
    pub fn task<F, Fut, O>(self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(WorkflowValue, NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, NodeError>> + Send + 'static,
        O: Into<NodeOutput> + Send + 'static,
    {
        self.node(Arc::new(FnNode::new(name, func)))
    }

    /// 添加转换节点
    /// Add a synchronous transform node.
    pub fn transform<F, O>(self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(WorkflowValue, &ExecutionContext) -> Result<O, NodeError> + Send + Sync + 'static,
        O: Into<NodeOutput> + Send + 'static,
    {
        self.node(Arc::new(FnNode::transform(name, func)))
    }

    /// 开始条件分支
    /// Start a boolean branch.
    pub fn condition<F>(self, name: impl Into<String>, predicate: F) -> ConditionBuilder
    where
        F: Fn(&WorkflowValue, &ExecutionContext) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        let parent = self.node(Arc::new(ConditionNode::new(name.clone(), predicate)));
        ConditionBuilder {
            parent,
            condition: name,
            tails: Vec::new(),
        }
    }

    /// 开始多路分支
    /// Start a multi-way branch.
    pub fn switch<F>(self, name: impl Into<String>, selector: F) -> SwitchBuilder
    where
        F: Fn(&WorkflowValue, &ExecutionContext) -> String + Send + Sync + 'static,
    {
        let name = name.into();
        let parent = self.node(Arc::new(SwitchNode::new(name.clone(), selector)));
        SwitchBuilder {
            parent,
            switch: name,
            tails: Vec::new(),
        }
    }

    /// 开始并行分支
    /// Start a parallel group; finish it with [`ParallelBuilder::join`].
    pub fn parallel(self, name: impl Into<String>) -> ParallelBuilder {
        ParallelBuilder {
            parent: self,
            name: name.into(),
            children: Vec::new(),
            fail_fast: None,
        }
    }

    pub fn map_reduce(self, name: impl Into<String>, spec: MapReduceSpec) -> Self {
        self.add(WorkflowNode::map_reduce(name, spec))
    }

    pub fn delay(self, name: impl Into<String>, duration: Duration) -> Self {
        self.node(Arc::new(DelayNode::new(name, duration)))
    }

    pub fn validate<F>(self, name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&WorkflowValue, &ExecutionContext) -> Result<(), String> + Send + Sync + 'static,
    {
        self.node(Arc::new(ValidationNode::new(name, check)))
    }

    pub fn log(self, name: impl Into<String>, message: impl Into<String>) -> Self {
        self.node(Arc::new(LogNode::new(name, message)))
    }

    /// LLM call with a prompt template rendered from the input and context.
    /// Use [`Self::node`] with an [`LlmNode`] for full control.
    pub fn llm(
        self,
        name: impl Into<String>,
        client: Arc<dyn LlmClient>,
        model: ModelConfig,
        prompt: impl Into<String>,
    ) -> Self {
        self.node(Arc::new(
            LlmNode::new(name, client, model).with_prompt(prompt),
        ))
    }

    pub fn tool(self, name: impl Into<String>, tool: Arc<dyn ToolExecutor>) -> Self {
        self.node(Arc::new(ToolNode::new(name, tool)))
    }

    /// Let the current node have several unconditional successors.
    pub fn fan_out(mut self) -> Self {
        if let Some(node) = self
            .current
            .as_deref()
            .and_then(|current| self.graph.node_mut(current))
        {
            node.set_fan_out();
        }
        self
    }

    // ────────────────────── Navigation ──────────────────────

    /// 跳转到指定节点
    /// Make `node` current without adding an edge.
    pub fn goto(mut self, node: impl Into<String>) -> Self {
        self.current = Some(node.into());
        self
    }

    /// 连接到已存在的节点
    /// Connect the current node to an existing one and make it current.
    pub fn then(mut self, node: impl Into<String>) -> Self {
        let node = node.into();
        if let Some(prev) = self.current.take() {
            self.graph.add_edge(Edge::new(prev, node.clone()));
        }
        self.current = Some(node);
        self
    }

    /// The next node added starts a new chain.
    pub fn detach(mut self) -> Self {
        self.current = None;
        self
    }

    // ────────────────────── Edges ──────────────────────

    /// 添加边
    /// Add an unconditional edge.
    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.graph.add_edge(Edge::new(from, to));
        self
    }

    /// 添加条件边
    /// Edge taken on success when `predicate` holds for the context. The
    /// source's value is already recorded there under its own name.
    pub fn edge_when<F>(mut self, from: impl Into<String>, to: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&ExecutionContext) -> bool + Send + Sync + 'static,
    {
        self.graph.add_edge(Edge::when(from, to, predicate));
        self
    }

    pub fn branch(
        mut self,
        from: impl Into<String>,
        key: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        self.graph.add_edge(Edge::branch(from, key, to));
        self
    }

    pub fn default_branch(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.graph.add_edge(Edge::default_branch(from, to));
        self
    }

    /// 添加错误处理边
    /// Route failures of `from` to `to`.
    pub fn on_error(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.graph.add_edge(Edge::on_error(from, to));
        self
    }

    pub fn start(mut self, node: impl Into<String>) -> Self {
        self.graph.set_start(node);
        self
    }

    pub fn output(mut self, node: impl Into<String>) -> Self {
        self.graph.set_output(node);
        self
    }

    // ────────────────────── Resilience ──────────────────────

    fn policy(&mut self, node: &str) -> Option<&mut NodePolicies> {
        if !self.graph.contains(node) {
            if self.pending_error.is_none() {
                self.pending_error = Some(GraphError::UnknownNode(node.to_string()));
            }
            return None;
        }
        Some(self.policies.entry(node.to_string()).or_default())
    }

    /// Retry `node` on retriable failures.
    pub fn with_retry(mut self, node: &str, policy: RetryPolicy) -> Self {
        if let Some(p) = self.policy(node) {
            p.retry = Some((Setting::Explicit(policy), None));
        }
        self
    }

    /// Retry with the policy from [`EngineConfig::retry`].
    pub fn with_default_retry(mut self, node: &str) -> Self {
        if let Some(p) = self.policy(node) {
            p.retry = Some((Setting::FromConfig, None));
        }
        self
    }

    /// Retry while `predicate(error, attempt)` holds, ignoring the error's
    /// own retriability.
    pub fn with_retry_when<F>(mut self, node: &str, policy: RetryPolicy, predicate: F) -> Self
    where
        F: Fn(&NodeError, u32) -> bool + Send + Sync + 'static,
    {
        if let Some(p) = self.policy(node) {
            p.retry = Some((Setting::Explicit(policy), Some(Arc::new(predicate))));
        }
        self
    }

    /// Bound each attempt of `node` to `duration`.
    pub fn with_timeout(mut self, node: &str, duration: Duration) -> Self {
        if let Some(p) = self.policy(node) {
            p.timeout = Some((Setting::Explicit(duration), None));
        }
        self
    }

    /// Like [`Self::with_timeout`] but succeed with `payload` on expiry.
    pub fn with_timeout_or(
        mut self,
        node: &str,
        duration: Duration,
        payload: impl Into<WorkflowValue>,
    ) -> Self {
        let payload = payload.into();
        if let Some(p) = self.policy(node) {
            p.timeout = Some((Setting::Explicit(duration), Some(payload)));
        }
        self
    }

    /// Timeout from [`EngineConfig::timeout`]; nothing is applied when the
    /// config has none.
    pub fn with_default_timeout(mut self, node: &str) -> Self {
        if let Some(p) = self.policy(node) {
            p.timeout = Some((Setting::FromConfig, None));
        }
        self
    }

    /// Run `secondary` with the same input when `node` fails.
    pub fn with_fallback(mut self, node: &str, secondary: Arc<dyn Node>) -> Self {
        if let Some(p) = self.policy(node) {
            p.fallback = Some(secondary);
        }
        self
    }

    /// Guard `node` with the breaker registered as `breaker`. Nodes naming
    /// the same breaker share its state.
    pub fn with_circuit_breaker(mut self, node: &str, breaker: impl Into<String>) -> Self {
        let breaker = breaker.into();
        if let Some(p) = self.policy(node) {
            p.breaker = Some(breaker);
        }
        self
    }

    /// Share breaker state with other workflows. Defaults to a fresh
    /// registry seeded from [`EngineConfig::breakers`].
    pub fn breaker_registry(mut self, registry: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(registry);
        self
    }

    // ────────────────────── Run settings ──────────────────────

    /// Validating transform applied to the input once per run. A failure
    /// fails the run before any node runs.
    pub fn input_schema<F>(mut self, schema: F) -> Self
    where
        F: Fn(WorkflowValue) -> Result<WorkflowValue, NodeError> + Send + Sync + 'static,
    {
        self.input_schema = Some(Arc::new(schema));
        self
    }

    /// Input schema backed by an [`ArgumentValidator`].
    pub fn input_validator(
        self,
        validator: Arc<dyn ArgumentValidator>,
        schema: serde_json::Value,
    ) -> Self {
        self.input_schema(move |raw| validator.validate(&raw, &schema).map_err(NodeError::from))
    }

    /// Add an observer; may be called several times.
    pub fn hooks(mut self, hooks: Arc<dyn WorkflowHooks>) -> Self {
        self.hooks.push(hooks);
        self
    }

    pub fn checkpoint_sink(mut self, sink: Arc<dyn CheckpointSink>) -> Self {
        self.checkpoint_sink = Some(sink);
        self
    }

    /// 构建工作流
    /// Apply wrappers, validate the graph and build the workflow.
    pub fn build(mut self) -> Result<Workflow, GraphError> {
        if let Some(err) = self.pending_error.take() {
            return Err(err);
        }
        let breakers = self
            .breakers
            .take()
            .unwrap_or_else(|| Arc::new(self.config.breaker_registry()));
        self.apply_policies(&breakers)?;
        self.graph.validate()?;

        debug!(
            workflow = %self.graph.name,
            nodes = self.graph.node_count(),
            edges = self.graph.edge_count(),
            "workflow built"
        );

        let graph = Arc::new(self.graph);
        let mut executor = WorkflowExecutor::new(Arc::clone(&graph), self.config.executor.clone());
        if !self.hooks.is_empty() {
            executor = executor.with_hooks(Arc::new(self.hooks));
        }
        if let Some(sink) = self.checkpoint_sink {
            executor = executor.with_checkpoint_sink(sink);
        }
        Ok(Workflow::new(executor, self.input_schema, breakers, self.config))
    }

    fn apply_policies(&mut self, breakers: &CircuitBreakerRegistry) -> Result<(), GraphError> {
        let policies = std::mem::take(&mut self.policies);
        for (name, p) in policies {
            let timeout = match p.timeout {
                Some((Setting::Explicit(duration), payload)) => Some((duration, payload)),
                Some((Setting::FromConfig, payload)) => self
                    .config
                    .timeout
                    .as_ref()
                    .map(|t| (t.duration(), payload)),
                None => None,
            };
            let retry = p.retry.map(|(setting, predicate)| match setting {
                Setting::Explicit(policy) => (policy, predicate),
                Setting::FromConfig => (self.config.retry.clone(), predicate),
            });
            let breaker = p.breaker.map(|b| breakers.breaker(&b));
            let fallback = p.fallback;

            let Some(node) = self.graph.node_mut(&name) else {
                return Err(GraphError::UnknownNode(name));
            };
            node.wrap_leaf(|inner| {
                let mut wrapped = inner;
                if let Some((duration, payload)) = timeout {
                    let mut t = Timeout::new(wrapped, duration);
                    if let Some(payload) = payload {
                        t = t.on_timeout(payload);
                    }
                    wrapped = Arc::new(t);
                }
                if let Some((policy, predicate)) = retry {
                    let mut r = Retry::new(wrapped, policy);
                    if let Some(predicate) = predicate {
                        r = r.with_predicate(move |e, attempt| predicate(e, attempt));
                    }
                    wrapped = Arc::new(r);
                }
                if let Some(state) = breaker {
                    wrapped = Arc::new(CircuitBreaker::new(wrapped, state));
                }
                if let Some(secondary) = fallback {
                    wrapped = Arc::new(Fallback::new(wrapped, secondary));
                }
                wrapped
            })?;
        }
        Ok(())
    }
}

// ────────────────────── Condition ──────────────────────

/// 条件分支构建器
/// Condition branch builder
pub struct ConditionBuilder {
    parent: WorkflowBuilder,
    condition: String,
    /// Branch nodes added here, joined by `merge`.
    tails: Vec<String>,
}

impl ConditionBuilder {
    fn arm<F, Fut, O>(mut self, key: &str, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(WorkflowValue, NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, NodeError>> + Send + 'static,
        O: Into<NodeOutput> + Send + 'static,
    {
        let name = name.into();
        self.parent
            .graph
            .add_node(WorkflowNode::leaf(Arc::new(FnNode::new(name.clone(), func))));
        self.parent
            .graph
            .add_edge(Edge::branch(&self.condition, key, name.clone()));
        self.tails.push(name);
        self
    }

    /// 条件为真时执行
    /// Task run when the condition holds.
    pub fn on_true<F, Fut, O>(self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(WorkflowValue, NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, NodeError>> + Send + 'static,
        O: Into<NodeOutput> + Send + 'static,
    {
        self.arm(ConditionNode::TRUE, name, func)
    }

    /// 条件为假时执行
    /// Task run when the condition does not hold.
    pub fn on_false<F, Fut, O>(self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(WorkflowValue, NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, NodeError>> + Send + 'static,
        O: Into<NodeOutput> + Send + 'static,
    {
        self.arm(ConditionNode::FALSE, name, func)
    }

    /// Route the true branch to an existing node, e.g. back to a loop body.
    pub fn on_true_to(mut self, target: impl Into<String>) -> Self {
        self.parent
            .graph
            .add_edge(Edge::branch(&self.condition, ConditionNode::TRUE, target));
        self
    }

    pub fn on_false_to(mut self, target: impl Into<String>) -> Self {
        self.parent
            .graph
            .add_edge(Edge::branch(&self.condition, ConditionNode::FALSE, target));
        self
    }

    /// 合并分支
    /// Join the branch tasks into `name`, which becomes current.
    pub fn merge<F, Fut, O>(self, name: impl Into<String>, func: F) -> WorkflowBuilder
    where
        F: Fn(WorkflowValue, NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, NodeError>> + Send + 'static,
        O: Into<NodeOutput> + Send + 'static,
    {
        join_tails(self.parent, self.tails, Arc::new(FnNode::new(name, func)))
    }

    /// 结束条件分支
    /// End the branch without a join; the next node added starts a new chain.
    pub fn end_condition(self) -> WorkflowBuilder {
        self.parent.detach()
    }
}

// ────────────────────── Switch ──────────────────────

/// Multi-way branch builder
pub struct SwitchBuilder {
    parent: WorkflowBuilder,
    switch: String,
    tails: Vec<String>,
}

impl SwitchBuilder {
    /// Task run when the selector returns `key`.
    pub fn case<F, Fut, O>(mut self, key: impl Into<String>, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(WorkflowValue, NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, NodeError>> + Send + 'static,
        O: Into<NodeOutput> + Send + 'static,
    {
        let name = name.into();
        self.parent
            .graph
            .add_node(WorkflowNode::leaf(Arc::new(FnNode::new(name.clone(), func))));
        self.parent
            .graph
            .add_edge(Edge::branch(&self.switch, key, name.clone()));
        self.tails.push(name);
        self
    }

    pub fn case_to(mut self, key: impl Into<String>, target: impl Into<String>) -> Self {
        self.parent
            .graph
            .add_edge(Edge::branch(&self.switch, key, target));
        self
    }

    /// Task run for keys without a case.
    pub fn default<F, Fut, O>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(WorkflowValue, NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, NodeError>> + Send + 'static,
        O: Into<NodeOutput> + Send + 'static,
    {
        let name = name.into();
        self.parent
            .graph
            .add_node(WorkflowNode::leaf(Arc::new(FnNode::new(name.clone(), func))));
        self.parent
            .graph
            .add_edge(Edge::default_branch(&self.switch, name.clone()));
        self.tails.push(name);
        self
    }

    pub fn default_to(mut self, target: impl Into<String>) -> Self {
        self.parent
            .graph
            .add_edge(Edge::default_branch(&self.switch, target));
        self
    }

    pub fn merge<F, Fut, O>(self, name: impl Into<String>, func: F) -> WorkflowBuilder
    where
        F: Fn(WorkflowValue, NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, NodeError>> + Send + 'static,
        O: Into<NodeOutput> + Send + 'static,
    {
        join_tails(self.parent, self.tails, Arc::new(FnNode::new(name, func)))
    }

    pub fn end_switch(self) -> WorkflowBuilder {
        self.parent.detach()
    }
}

/// Add the join node and an unconditional edge from every branch tail.
fn join_tails(mut parent: WorkflowBuilder, tails: Vec<String>, join: Arc<dyn Node>) -> WorkflowBuilder {
    let name = join.name().to_string();
    parent.graph.add_node(WorkflowNode::leaf(join));
    for tail in tails {
        parent.graph.add_edge(Edge::new(tail, name.clone()));
    }
    parent.current = Some(name);
    parent
}

// ────────────────────── Parallel ──────────────────────

/// 并行分支构建器
/// Parallel group builder
pub struct ParallelBuilder {
    parent: WorkflowBuilder,
    name: String,
    children: Vec<Arc<dyn Node>>,
    fail_fast: Option<bool>,
}

impl ParallelBuilder {
    /// 添加并行分支
    /// Add a child task.
    pub fn branch<F, Fut, O>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(WorkflowValue, NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, NodeError>> + Send + 'static,
        O: Into<NodeOutput> + Send + 'static,
    {
        self.children.push(Arc::new(FnNode::new(name, func)));
        self
    }

    pub fn branch_node(mut self, node: Arc<dyn Node>) -> Self {
        self.children.push(node);
        self
    }

    /// Cancel the remaining children on the first failure. Defaults to
    /// `ExecutorConfig::parallel_fail_fast`.
    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = Some(fail_fast);
        self
    }

    /// 汇合并行分支
    /// Close the group; its output is a map of child name to value.
    pub fn join(self) -> WorkflowBuilder {
        let mut group = WorkflowNode::parallel(self.name, self.children);
        if let Some(fail_fast) = self.fail_fast {
            group = group.with_fail_fast(fail_fast);
        }
        self.parent.add(group)
    }
}
