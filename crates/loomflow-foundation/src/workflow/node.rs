//! 工作流节点定义
//! Workflow node catalogue
//!
//! Concrete [`Node`] implementations: closures, branching, delays,
//! validation, logging, and calls into LLM and tool collaborators.
//! Parallel groups and map-reduce are composites owned by the graph (see
//! [`super::graph::NodeBody`]).

use async_trait::async_trait;
use futures::future::BoxFuture;
use loomflow_kernel::workflow::{
    ArgumentValidator, ChatMessage, ExecutionContext, LlmClient, ModelConfig, Node, NodeContext,
    NodeError, NodeKind, NodeOutput, ToolExecutor, WorkflowValue,
};
use regex::Regex;
use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{Level, debug, error, info, trace, warn};

/// 节点执行函数类型
/// Node execution function type
pub type TaskFn = Arc<
    dyn Fn(WorkflowValue, NodeContext) -> BoxFuture<'static, Result<NodeOutput, NodeError>>
        + Send
        + Sync,
>;

/// Synchronous predicate over the routed input and the context snapshot.
pub type PredicateFn = Arc<dyn Fn(&WorkflowValue, &ExecutionContext) -> bool + Send + Sync>;

/// Synchronous key selector for switch nodes.
pub type SelectorFn = Arc<dyn Fn(&WorkflowValue, &ExecutionContext) -> String + Send + Sync>;

/// Derives a value (messages, tool arguments) from the input and context.
pub type DeriveFn<T> = Arc<dyn Fn(&WorkflowValue, &ExecutionContext) -> T + Send + Sync>;

// ────────────────────── FnNode ──────────────────────

/// 任务节点
/// Task node backed by an async closure.
#[derive(Clone)]
pub struct FnNode {
    name: String,
    kind: NodeKind,
    dependencies: Vec<String>,
    func: TaskFn,
}

impl FnNode {
    /// Async task. The closure may return anything convertible into a
    /// [`NodeOutput`], so plain values and explicit directives both work.
    pub fn new<F, Fut, O>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(WorkflowValue, NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, NodeError>> + Send + 'static,
        O: Into<NodeOutput> + Send + 'static,
    {
        let func = Arc::new(func);
        Self {
            name: name.into(),
            kind: NodeKind::Transform,
            dependencies: Vec::new(),
            func: Arc::new(move |input, ctx| {
                let fut = func(input, ctx);
                Box::pin(async move { fut.await.map(Into::into) })
            }),
        }
    }

    /// Pure synchronous transform of the input and prior outputs.
    pub fn transform<F, O>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(WorkflowValue, &ExecutionContext) -> Result<O, NodeError> + Send + Sync + 'static,
        O: Into<NodeOutput> + Send + 'static,
    {
        let func = Arc::new(func);
        Self {
            name: name.into(),
            kind: NodeKind::Transform,
            dependencies: Vec::new(),
            func: Arc::new(move |input, ctx| {
                let result = func(input, ctx.execution()).map(Into::into);
                Box::pin(async move { result })
            }),
        }
    }

    pub fn with_kind(mut self, kind: NodeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl Node for FnNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    async fn execute(
        &self,
        input: WorkflowValue,
        ctx: &NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        (self.func)(input, ctx.clone()).await
    }
}

// ────────────────────── Branching ──────────────────────

/// 条件节点
/// Boolean branch. Records the selected key (`"true"` / `"false"`) as its
/// output and routes along the edge labelled with that key.
#[derive(Clone)]
pub struct ConditionNode {
    name: String,
    predicate: PredicateFn,
}

impl ConditionNode {
    pub const TRUE: &'static str = "true";
    pub const FALSE: &'static str = "false";

    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&WorkflowValue, &ExecutionContext) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }
}

#[async_trait]
impl Node for ConditionNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Condition
    }

    async fn execute(
        &self,
        input: WorkflowValue,
        ctx: &NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        let key = if (self.predicate)(&input, ctx.execution()) {
            Self::TRUE
        } else {
            Self::FALSE
        };
        debug!(node = %self.name, branch = key, "condition evaluated");
        Ok(NodeOutput::branch(key, key))
    }
}

/// 分支选择节点
/// Multi-way branch keyed by an arbitrary string. Keys without a matching
/// edge fall through to the default edge.
#[derive(Clone)]
pub struct SwitchNode {
    name: String,
    selector: SelectorFn,
}

impl SwitchNode {
    pub fn new<F>(name: impl Into<String>, selector: F) -> Self
    where
        F: Fn(&WorkflowValue, &ExecutionContext) -> String + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            selector: Arc::new(selector),
        }
    }
}

#[async_trait]
impl Node for SwitchNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Switch
    }

    async fn execute(
        &self,
        input: WorkflowValue,
        ctx: &NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        let key = (self.selector)(&input, ctx.execution());
        debug!(node = %self.name, case = %key, "switch evaluated");
        Ok(NodeOutput::branch(key.clone(), key))
    }
}

// ────────────────────── Delay ──────────────────────

/// 延迟节点
/// Waits, then passes its input through unchanged. Fails only when the run
/// is cancelled during the wait.
#[derive(Debug, Clone)]
pub struct DelayNode {
    name: String,
    duration: Duration,
}

impl DelayNode {
    pub fn new(name: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            duration,
        }
    }
}

#[async_trait]
impl Node for DelayNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Delay
    }

    async fn execute(
        &self,
        input: WorkflowValue,
        ctx: &NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        tokio::select! {
            _ = ctx.cancellation().cancelled() => Err(NodeError::cancelled()),
            _ = tokio::time::sleep(self.duration) => Ok(input.into()),
        }
    }
}

// ────────────────────── Validation ──────────────────────

/// 校验节点
/// Runs a check and outputs `true`, or fails with a non-retriable
/// `Validation` error.
#[derive(Clone)]
pub struct ValidationNode {
    name: String,
    check: Arc<dyn Fn(&WorkflowValue, &ExecutionContext) -> Result<(), String> + Send + Sync>,
}

impl ValidationNode {
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&WorkflowValue, &ExecutionContext) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }
}

#[async_trait]
impl Node for ValidationNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Validation
    }

    async fn execute(
        &self,
        input: WorkflowValue,
        ctx: &NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        (self.check)(&input, ctx.execution())
            .map(|()| NodeOutput::new(true))
            .map_err(|reason| NodeError::validation(reason).with_retriable(false))
    }
}

// ────────────────────── Log ──────────────────────

/// Emits the input as a structured log line and passes it through.
#[derive(Debug, Clone)]
pub struct LogNode {
    name: String,
    message: String,
    level: Level,
}

impl LogNode {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            level: Level::INFO,
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }
}

#[async_trait]
impl Node for LogNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Log
    }

    async fn execute(
        &self,
        input: WorkflowValue,
        ctx: &NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        let workflow = &ctx.execution().workflow;
        let payload = input.render();
        let message = &self.message;
        if self.level == Level::ERROR {
            error!(node = %self.name, %workflow, %payload, "{message}");
        } else if self.level == Level::WARN {
            warn!(node = %self.name, %workflow, %payload, "{message}");
        } else if self.level == Level::DEBUG {
            debug!(node = %self.name, %workflow, %payload, "{message}");
        } else if self.level == Level::TRACE {
            trace!(node = %self.name, %workflow, %payload, "{message}");
        } else {
            info!(node = %self.name, %workflow, %payload, "{message}");
        }
        Ok(input.into())
    }
}

// ────────────────────── LLM ──────────────────────

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z0-9_\-]+)\}").expect("static regex is valid")
});

/// Fill `{input}` with the routed input and `{node}` with that node's
/// recorded output. Unknown placeholders are left as written.
pub fn render_prompt(template: &str, input: &WorkflowValue, ctx: &ExecutionContext) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures| {
            let key = &caps[1];
            if key == "input" {
                return input.render();
            }
            ctx.value(key)
                .map(WorkflowValue::render)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// 大模型调用节点
/// LLM call node
///
/// Message derivation, in order of precedence:
/// 1. a custom builder set with [`LlmNode::with_messages`]
/// 2. a prompt template set with [`LlmNode::with_prompt`], sent as one user message
/// 3. the rendered input as one user message
///
/// An optional system prompt is prepended in cases 2 and 3.
#[derive(Clone)]
pub struct LlmNode {
    name: String,
    client: Arc<dyn LlmClient>,
    model: ModelConfig,
    system: Option<String>,
    prompt: Option<String>,
    messages: Option<DeriveFn<Vec<ChatMessage>>>,
}

impl LlmNode {
    pub fn new(name: impl Into<String>, client: Arc<dyn LlmClient>, model: ModelConfig) -> Self {
        Self {
            name: name.into(),
            client,
            model,
            system: None,
            prompt: None,
            messages: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_prompt(mut self, template: impl Into<String>) -> Self {
        self.prompt = Some(template.into());
        self
    }

    pub fn with_messages<F>(mut self, build: F) -> Self
    where
        F: Fn(&WorkflowValue, &ExecutionContext) -> Vec<ChatMessage> + Send + Sync + 'static,
    {
        self.messages = Some(Arc::new(build));
        self
    }

    fn build_messages(&self, input: &WorkflowValue, ctx: &ExecutionContext) -> Vec<ChatMessage> {
        if let Some(build) = &self.messages {
            return build(input, ctx);
        }
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system {
            messages.push(ChatMessage::system(system.clone()));
        }
        let content = match &self.prompt {
            Some(template) => render_prompt(template, input, ctx),
            None => input.render(),
        };
        messages.push(ChatMessage::user(content));
        messages
    }
}

#[async_trait]
impl Node for LlmNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Llm
    }

    async fn execute(
        &self,
        input: WorkflowValue,
        ctx: &NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        let messages = self.build_messages(&input, ctx.execution());
        debug!(
            node = %self.name,
            model = %self.model.model,
            messages = messages.len(),
            "invoking llm"
        );
        tokio::select! {
            _ = ctx.cancellation().cancelled() => Err(NodeError::cancelled()),
            result = self.client.invoke(&messages, &self.model) => {
                result.map(NodeOutput::new).map_err(NodeError::from)
            }
        }
    }
}

// ────────────────────── Tool ──────────────────────

/// 工具调用节点
/// Tool call node: derive arguments, validate them, execute the tool.
#[derive(Clone)]
pub struct ToolNode {
    name: String,
    tool: Arc<dyn ToolExecutor>,
    args: Option<DeriveFn<WorkflowValue>>,
    validator: Option<(Arc<dyn ArgumentValidator>, serde_json::Value)>,
}

impl ToolNode {
    pub fn new(name: impl Into<String>, tool: Arc<dyn ToolExecutor>) -> Self {
        Self {
            name: name.into(),
            tool,
            args: None,
            validator: None,
        }
    }

    /// Derive raw arguments from the input and context; defaults to the
    /// input itself.
    pub fn with_args<F>(mut self, derive: F) -> Self
    where
        F: Fn(&WorkflowValue, &ExecutionContext) -> WorkflowValue + Send + Sync + 'static,
    {
        self.args = Some(Arc::new(derive));
        self
    }

    pub fn with_validator(
        mut self,
        validator: Arc<dyn ArgumentValidator>,
        schema: serde_json::Value,
    ) -> Self {
        self.validator = Some((validator, schema));
        self
    }
}

#[async_trait]
impl Node for ToolNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Tool
    }

    async fn execute(
        &self,
        input: WorkflowValue,
        ctx: &NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        let raw = match &self.args {
            Some(derive) => derive(&input, ctx.execution()),
            None => input,
        };
        let args = match &self.validator {
            Some((validator, schema)) => validator.validate(&raw, schema)?,
            None => raw,
        };
        debug!(node = %self.name, tool = self.tool.name(), "executing tool");
        tokio::select! {
            _ = ctx.cancellation().cancelled() => Err(NodeError::cancelled()),
            result = self.tool.execute(args) => {
                result.map(NodeOutput::new).map_err(NodeError::from)
            }
        }
    }
}
