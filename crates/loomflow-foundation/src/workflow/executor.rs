//! 工作流执行器
//! Workflow Executor
//!
//! 负责工作流的执行调度
//! Frontier scheduler. Each step takes every pending node whose declared
//! dependencies have a recorded result, runs them concurrently behind a join
//! barrier, merges their results into the [`ExecutionContext`] in frontier
//! order, and evaluates outgoing edges to build the next frontier.
//!
//! The control loop is the only writer of the context. Running nodes see an
//! immutable snapshot taken when the frontier was dispatched.

use super::config::ExecutorConfig;
use super::graph::{EdgeGuard, ItemSource, MapFailurePolicy, MapReduceSpec, NodeBody, WorkflowGraph};
use futures::FutureExt;
use futures::future::join_all;
use loomflow_kernel::workflow::{
    Activation, Checkpoint, CheckpointSink, Directive, ErrorKind, ExecutionContext, Node,
    NodeContext, NodeError, NodeOutput, NodeResult, NoopHooks, PendingNode, RunFailure,
    WorkflowHooks, WorkflowResult, WorkflowStatus, WorkflowValue, guard_hook,
};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

/// How a run ended, before the final output is resolved.
#[derive(Debug)]
pub(crate) enum Outcome {
    Completed { finished: Option<WorkflowValue> },
    Failed(RunFailure),
}

/// Mutable state of one run, owned by the control loop.
struct RunState {
    ctx: ExecutionContext,
    pending: Vec<PendingNode>,
    invocations: u64,
    step: u64,
}

/// What the executor does for one frontier member.
#[derive(Clone)]
enum Job {
    Leaf(Arc<dyn Node>),
    Parallel {
        children: Vec<Arc<dyn Node>>,
        fail_fast: bool,
    },
    MapReduce {
        spec: MapReduceSpec,
        items: Vec<WorkflowValue>,
    },
    /// Failed before dispatch, e.g. map-reduce items that are not a list.
    Rejected(NodeError),
}

impl Job {
    /// Invocations charged against `max_iterations`.
    fn cost(&self) -> u64 {
        match self {
            Job::Leaf(_) | Job::Rejected(_) => 1,
            Job::Parallel { children, .. } => children.len().max(1) as u64,
            Job::MapReduce { items, .. } => items.len() as u64 + 1,
        }
    }
}

struct Dispatch {
    name: String,
    input: WorkflowValue,
    job: Job,
}

struct Completion {
    output: Result<NodeOutput, NodeError>,
    /// Parallel children, recorded under their own names.
    children: Vec<(String, NodeResult)>,
    /// Map-reduce per-element results in input order.
    elements: Option<Vec<NodeResult>>,
}

impl Completion {
    fn leaf(output: Result<NodeOutput, NodeError>) -> Self {
        Self {
            output,
            children: Vec::new(),
            elements: None,
        }
    }
}

/// 工作流执行器
/// Workflow Executor
///
/// Stateless between runs: one executor serves any number of concurrent
/// runs of the same graph.
#[derive(Clone)]
pub struct WorkflowExecutor {
    graph: Arc<WorkflowGraph>,
    config: ExecutorConfig,
    hooks: Arc<dyn WorkflowHooks>,
    checkpoint_sink: Option<Arc<dyn CheckpointSink>>,
}

impl WorkflowExecutor {
    /// `graph` must already be validated.
    pub fn new(graph: Arc<WorkflowGraph>, config: ExecutorConfig) -> Self {
        Self {
            graph,
            config,
            hooks: Arc::new(NoopHooks),
            checkpoint_sink: None,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn WorkflowHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_checkpoint_sink(mut self, sink: Arc<dyn CheckpointSink>) -> Self {
        self.checkpoint_sink = Some(sink);
        self
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run from the start node with a fresh context.
    pub async fn execute(&self, ctx: ExecutionContext, cancel: CancellationToken) -> WorkflowResult {
        let started = Instant::now();
        let Some(start) = self.graph.start_node().map(str::to_string) else {
            let error = NodeError::new(ErrorKind::NotFound, "workflow has no start node");
            return self.conclude(ctx, Outcome::Failed(RunFailure::before_start(&error)), started);
        };
        info!(
            workflow = %self.graph.name,
            execution_id = %ctx.execution_id,
            start = %start,
            "starting workflow"
        );
        let state = RunState {
            ctx,
            pending: vec![PendingNode::root(start)],
            invocations: 0,
            step: 0,
        };
        self.drive(state, cancel, started).await
    }

    /// Continue a run from a checkpoint taken between frontiers.
    pub async fn resume(&self, checkpoint: Checkpoint, cancel: CancellationToken) -> WorkflowResult {
        let started = Instant::now();
        info!(
            workflow = %self.graph.name,
            execution_id = %checkpoint.context.execution_id,
            step = checkpoint.step,
            pending = checkpoint.pending.len(),
            "resuming workflow from checkpoint"
        );
        let state = RunState {
            ctx: checkpoint.context,
            pending: checkpoint.pending,
            invocations: checkpoint.invocations,
            step: checkpoint.step,
        };
        self.drive(state, cancel, started).await
    }

    async fn drive(
        &self,
        mut state: RunState,
        cancel: CancellationToken,
        started: Instant,
    ) -> WorkflowResult {
        let outcome = loop {
            if state.pending.is_empty() {
                break Outcome::Completed { finished: None };
            }
            if cancel.is_cancelled() {
                break Outcome::Failed(cancelled_failure(&state.ctx, None));
            }

            let (ready, waiting): (Vec<PendingNode>, Vec<PendingNode>) =
                std::mem::take(&mut state.pending)
                    .into_iter()
                    .partition(|p| self.is_ready(&p.name, &state.ctx));
            if ready.is_empty() {
                break Outcome::Failed(self.unsatisfied(&waiting, &state.ctx));
            }

            let frontier: Vec<Dispatch> = ready
                .into_iter()
                .map(|p| self.prepare(p, &state.ctx))
                .collect();

            let cost: u64 = frontier.iter().map(|d| d.job.cost()).sum();
            if state.invocations + cost > self.config.max_iterations {
                let node = frontier.first().map(|d| d.name.clone()).unwrap_or_default();
                warn!(
                    workflow = %self.graph.name,
                    execution_id = %state.ctx.execution_id,
                    node = %node,
                    invocations = state.invocations,
                    max_iterations = self.config.max_iterations,
                    "iteration limit reached"
                );
                let error = NodeError::new(
                    ErrorKind::IterationLimitExceeded,
                    format!(
                        "iteration limit of {} invocations exceeded",
                        self.config.max_iterations
                    ),
                );
                break Outcome::Failed(RunFailure::at_node(node, &error));
            }
            state.invocations += cost;

            for dispatch in &frontier {
                state.ctx.record_invocation(&dispatch.name);
                guard_hook("on_node_start", || {
                    self.hooks.on_node_start(&dispatch.name, &state.ctx)
                });
                if let Job::Parallel { children, .. } = &dispatch.job {
                    for child in children {
                        state.ctx.record_invocation(child.name());
                        guard_hook("on_node_start", || {
                            self.hooks.on_node_start(child.name(), &state.ctx)
                        });
                    }
                }
            }

            debug!(
                workflow = %self.graph.name,
                step = state.step,
                frontier = frontier.len(),
                "dispatching frontier"
            );
            let completions = match self.run_frontier(&frontier, &state, &cancel).await {
                Ok(completions) => completions,
                Err(node) => break Outcome::Failed(cancelled_failure(&state.ctx, Some(node))),
            };

            if let Some(outcome) = self.merge(&mut state, frontier, completions, waiting) {
                break outcome;
            }
            state.step += 1;
            self.maybe_checkpoint(&state);
        };

        self.conclude(state.ctx, outcome, started)
    }

    fn is_ready(&self, name: &str, ctx: &ExecutionContext) -> bool {
        match self.graph.node(name) {
            Some(node) => node.dependencies().iter().all(|d| ctx.has_result(d)),
            // Unknown names fail at dispatch.
            None => true,
        }
    }

    fn unsatisfied(&self, waiting: &[PendingNode], ctx: &ExecutionContext) -> RunFailure {
        let name = waiting.first().map(|p| p.name.as_str()).unwrap_or_default();
        let missing: Vec<&str> = self
            .graph
            .node(name)
            .map(|n| {
                n.dependencies()
                    .iter()
                    .filter(|d| !ctx.has_result(d))
                    .map(String::as_str)
                    .collect()
            })
            .unwrap_or_default();
        let error = NodeError::new(
            ErrorKind::DependencyUnsatisfied,
            format!(
                "node '{name}' waits on {} which never produced a result",
                missing.join(", ")
            ),
        );
        RunFailure::at_node(name, &error)
    }

    fn prepare(&self, pending: PendingNode, ctx: &ExecutionContext) -> Dispatch {
        let input = node_input(&pending, ctx);
        let job = match self.graph.node(&pending.name) {
            None => Job::Rejected(NodeError::new(
                ErrorKind::NotFound,
                format!("node '{}' is not part of the graph", pending.name),
            )),
            Some(node) => match node.body() {
                NodeBody::Leaf(leaf) => Job::Leaf(Arc::clone(leaf)),
                NodeBody::Parallel(spec) => Job::Parallel {
                    children: spec.children.clone(),
                    fail_fast: spec.fail_fast.unwrap_or(self.config.parallel_fail_fast),
                },
                NodeBody::MapReduce(spec) => match map_items(&pending.name, spec, &input, ctx) {
                    Ok(items) => Job::MapReduce {
                        spec: spec.clone(),
                        items,
                    },
                    Err(error) => Job::Rejected(error),
                },
            },
        };
        Dispatch {
            name: pending.name,
            input,
            job,
        }
    }

    /// Run every frontier member and wait for all of them. `Err` carries the
    /// frontier's lead node when the run was cancelled mid-step.
    async fn run_frontier(
        &self,
        frontier: &[Dispatch],
        state: &RunState,
        cancel: &CancellationToken,
    ) -> Result<Vec<Completion>, String> {
        let snapshot = Arc::new(state.ctx.clone());
        let permits = Arc::new(Semaphore::new(self.config.max_parallelism.max(1)));
        let mut tasks = JoinSet::new();

        for (index, dispatch) in frontier.iter().enumerate() {
            let node_ctx = NodeContext::new(
                Arc::clone(&snapshot),
                dispatch.name.clone(),
                cancel.clone(),
                Arc::clone(&self.hooks),
            );
            let job = dispatch.job.clone();
            let input = dispatch.input.clone();
            let permits = Arc::clone(&permits);
            let span = info_span!(
                "node",
                workflow = %self.graph.name,
                execution_id = %snapshot.execution_id,
                node = %dispatch.name,
                step = state.step,
            );
            tasks.spawn(
                async move {
                    let _permit = permits.acquire_owned().await;
                    (index, run_job(job, input, node_ctx).await)
                }
                .instrument(span),
            );
        }

        let mut slots: Vec<Option<Completion>> = frontier.iter().map(|_| None).collect();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    let lead = frontier.first().map(|d| d.name.clone()).unwrap_or_default();
                    warn!(
                        workflow = %self.graph.name,
                        execution_id = %snapshot.execution_id,
                        node = %lead,
                        "run cancelled while a frontier was in flight"
                    );
                    return Err(lead);
                }
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok((index, completion))) => slots[index] = Some(completion),
                    Some(Err(e)) => warn!(error = %e, "node task ended abnormally"),
                },
            }
        }

        Ok(slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    Completion::leaf(Err(NodeError::unknown("node task ended without a result")))
                })
            })
            .collect())
    }

    /// Record a frontier's results, then route. Returns the terminal outcome
    /// when the step ends the run.
    fn merge(
        &self,
        state: &mut RunState,
        frontier: Vec<Dispatch>,
        completions: Vec<Completion>,
        waiting: Vec<PendingNode>,
    ) -> Option<Outcome> {
        let mut settled: Vec<(String, Directive)> = Vec::with_capacity(frontier.len());
        for (dispatch, completion) in frontier.into_iter().zip(completions) {
            for (child, result) in completion.children {
                state.ctx.record(child.clone(), result.clone());
                self.notify(&child, &result, &state.ctx);
            }
            if let Some(elements) = completion.elements {
                state.ctx.record_elements(dispatch.name.clone(), elements);
            }
            let (result, directive) = match completion.output {
                Ok(output) => (NodeResult::Success(output.value), output.directive),
                Err(error) => (NodeResult::Failure(error), Directive::Continue),
            };
            state.ctx.record(dispatch.name.clone(), result.clone());
            self.notify(&dispatch.name, &result, &state.ctx);
            settled.push((dispatch.name, directive));
        }

        let mut next = waiting;
        let mut failure: Option<RunFailure> = None;
        let mut finished: Option<WorkflowValue> = None;
        for (name, directive) in &settled {
            match state.ctx.output(name) {
                Some(NodeResult::Success(value)) => {
                    if *directive == Directive::Finish {
                        debug!(node = %name, "node requested finish");
                        if finished.is_none() {
                            finished = Some(value.clone());
                        }
                        continue;
                    }
                    for target in self.successors(name, directive, &state.ctx) {
                        activate(&mut next, target, name, false);
                    }
                }
                Some(NodeResult::Failure(error)) => {
                    let handlers: Vec<String> = self
                        .graph
                        .outgoing(name)
                        .filter(|e| e.is_error_edge())
                        .map(|e| e.to.clone())
                        .collect();
                    if handlers.is_empty() {
                        if failure.is_none() {
                            failure = Some(RunFailure::at_node(name.clone(), error));
                        }
                    } else {
                        debug!(node = %name, handlers = ?handlers, "failure routed to on-error edge");
                        for target in handlers {
                            activate(&mut next, target, name, true);
                        }
                    }
                }
                None => {}
            }
        }
        state.pending = next;

        if let Some(failure) = failure {
            return Some(Outcome::Failed(failure));
        }
        if finished.is_some() {
            return Some(Outcome::Completed { finished });
        }
        None
    }

    /// Targets of the edges a successful node activates.
    fn successors(&self, node: &str, directive: &Directive, ctx: &ExecutionContext) -> Vec<String> {
        let mut targets = Vec::new();
        let mut defaults = Vec::new();
        let mut matched = false;
        for edge in self.graph.outgoing(node) {
            match &edge.guard {
                EdgeGuard::Always => targets.push(edge.to.clone()),
                EdgeGuard::When(predicate) => {
                    if predicate(ctx) {
                        targets.push(edge.to.clone());
                    }
                }
                EdgeGuard::Branch(key) => {
                    if matches!(directive, Directive::Branch(k) if k == key) {
                        matched = true;
                        targets.push(edge.to.clone());
                    }
                }
                EdgeGuard::Default => defaults.push(edge.to.clone()),
                EdgeGuard::OnError => {}
            }
        }
        if matches!(directive, Directive::Branch(_)) && !matched {
            targets.extend(defaults);
        }
        targets
    }

    fn notify(&self, node: &str, result: &NodeResult, ctx: &ExecutionContext) {
        match result {
            NodeResult::Success(value) => guard_hook("on_node_complete", || {
                self.hooks.on_node_complete(node, value, ctx)
            }),
            NodeResult::Failure(error) => guard_hook("on_node_error", || {
                self.hooks.on_node_error(node, error, ctx)
            }),
        }
    }

    fn maybe_checkpoint(&self, state: &RunState) {
        let interval = self.config.checkpoint_interval;
        let Some(sink) = &self.checkpoint_sink else {
            return;
        };
        if interval == 0 || state.step % interval != 0 || state.pending.is_empty() {
            return;
        }
        let checkpoint = Checkpoint {
            context: state.ctx.clone(),
            pending: state.pending.clone(),
            invocations: state.invocations,
            step: state.step,
        };
        guard_hook("checkpoint", || sink.checkpoint(&checkpoint));
        debug!(step = state.step, pending = state.pending.len(), "checkpoint emitted");
    }

    /// Resolve the final output, fire the terminal hook and build the result.
    pub(crate) fn conclude(
        &self,
        ctx: ExecutionContext,
        outcome: Outcome,
        started: Instant,
    ) -> WorkflowResult {
        let duration_ms = started.elapsed().as_millis() as u64;
        let execution_id = ctx.execution_id.clone();
        match outcome {
            Outcome::Completed { finished } => {
                let final_output = finished.or_else(|| {
                    self.graph
                        .output_node()
                        .and_then(|node| ctx.value(node).cloned())
                });
                info!(
                    workflow = %self.graph.name,
                    execution_id = %execution_id,
                    duration_ms,
                    invocations = ctx.trace().len(),
                    "workflow completed"
                );
                let result = WorkflowResult {
                    outputs: ctx,
                    final_output,
                    duration_ms,
                    execution_id,
                    status: WorkflowStatus::Completed,
                };
                guard_hook("on_complete", || self.hooks.on_complete(&result));
                result
            }
            Outcome::Failed(failure) => {
                warn!(
                    workflow = %self.graph.name,
                    execution_id = %execution_id,
                    duration_ms,
                    "workflow failed: {failure}"
                );
                guard_hook("on_error", || self.hooks.on_error(&failure, &ctx));
                WorkflowResult {
                    outputs: ctx,
                    final_output: None,
                    duration_ms,
                    execution_id,
                    status: WorkflowStatus::Failed(failure),
                }
            }
        }
    }
}

impl std::fmt::Debug for WorkflowExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowExecutor")
            .field("graph", &self.graph.name)
            .field("config", &self.config)
            .field("checkpoints", &self.checkpoint_sink.is_some())
            .finish()
    }
}

// ============================================================================
// Routing helpers
// ============================================================================

fn activate(pending: &mut Vec<PendingNode>, target: String, from: &str, via_error: bool) {
    let activation = Activation {
        from: from.to_string(),
        via_error,
    };
    match pending.iter_mut().find(|p| p.name == target) {
        Some(existing) => {
            if !existing.activations.contains(&activation) {
                existing.activations.push(activation);
            }
        }
        None => pending.push(PendingNode {
            name: target,
            activations: vec![activation],
        }),
    }
}

fn node_input(pending: &PendingNode, ctx: &ExecutionContext) -> WorkflowValue {
    match pending.activations.as_slice() {
        [] => ctx.input().clone(),
        [single] => activation_value(single, ctx),
        many => WorkflowValue::Map(
            many.iter()
                .map(|a| (a.from.clone(), activation_value(a, ctx)))
                .collect(),
        ),
    }
}

fn activation_value(activation: &Activation, ctx: &ExecutionContext) -> WorkflowValue {
    match ctx.output(&activation.from) {
        Some(NodeResult::Success(value)) if !activation.via_error => value.clone(),
        Some(NodeResult::Failure(error)) if activation.via_error => error_record(
            error,
            "node",
            WorkflowValue::from(activation.from.as_str()),
        ),
        _ => WorkflowValue::Null,
    }
}

/// `{error, kind, <origin_key>: origin}` as handed to error handlers and
/// reducers.
fn error_record(error: &NodeError, origin_key: &str, origin: WorkflowValue) -> WorkflowValue {
    WorkflowValue::map([
        ("error", WorkflowValue::from(error.message.as_str())),
        ("kind", WorkflowValue::from(error.kind.as_str())),
        (origin_key, origin),
    ])
}

fn map_items(
    name: &str,
    spec: &MapReduceSpec,
    input: &WorkflowValue,
    ctx: &ExecutionContext,
) -> Result<Vec<WorkflowValue>, NodeError> {
    let source = match &spec.items {
        ItemSource::Input => Some(input),
        ItemSource::Output(node) => ctx.value(node),
    };
    match source {
        Some(WorkflowValue::List(items)) => Ok(items.clone()),
        Some(other) => Err(NodeError::new(
            ErrorKind::InvalidInput,
            format!(
                "map-reduce '{name}' expects a list of items, got {}",
                other.render()
            ),
        )),
        None => Err(NodeError::new(
            ErrorKind::DependencyUnsatisfied,
            format!("map-reduce '{name}' has no items: the source produced no value"),
        )),
    }
}

fn cancelled_failure(ctx: &ExecutionContext, node: Option<String>) -> RunFailure {
    let error = NodeError::cancelled();
    match node.or_else(|| ctx.trace().last().cloned()) {
        Some(node) => RunFailure::at_node(node, &error),
        None => RunFailure::before_start(&error),
    }
}

// ============================================================================
// Node invocation
// ============================================================================

async fn run_job(job: Job, input: WorkflowValue, ctx: NodeContext) -> Completion {
    match job {
        Job::Leaf(node) => Completion::leaf(invoke(&node, input, &ctx).await),
        Job::Parallel {
            children,
            fail_fast,
        } => run_parallel(children, fail_fast, input, &ctx).await,
        Job::MapReduce { spec, items } => run_map_reduce(spec, items, &ctx).await,
        Job::Rejected(error) => Completion::leaf(Err(error)),
    }
}

/// Execute one node, turning a panic into an `Unknown` failure.
async fn invoke(
    node: &Arc<dyn Node>,
    input: WorkflowValue,
    ctx: &NodeContext,
) -> Result<NodeOutput, NodeError> {
    match AssertUnwindSafe(node.execute(input, ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(NodeError::unknown(format!(
            "node '{}' panicked: {}",
            node.name(),
            panic_message(panic.as_ref())
        ))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// First failure in order, preferring a real error over a sibling that was
/// only cancelled because of it.
fn lead_failure<'a, I>(failures: I) -> Option<(usize, &'a NodeError)>
where
    I: IntoIterator<Item = (usize, &'a NodeError)>,
{
    let failures: Vec<(usize, &NodeError)> = failures.into_iter().collect();
    failures
        .iter()
        .find(|(_, e)| e.kind != ErrorKind::Cancelled)
        .or_else(|| failures.first())
        .copied()
}

async fn run_parallel(
    children: Vec<Arc<dyn Node>>,
    fail_fast: bool,
    input: WorkflowValue,
    ctx: &NodeContext,
) -> Completion {
    let token = ctx.cancellation().child_token();
    let runs = children.iter().map(|child| {
        let child = Arc::clone(child);
        let child_ctx = ctx.for_child(child.name(), token.clone());
        let token = token.clone();
        let input = input.clone();
        async move {
            let result = tokio::select! {
                biased;
                result = invoke(&child, input, &child_ctx) => result,
                _ = token.cancelled() => Err(NodeError::cancelled()),
            };
            if fail_fast && result.is_err() {
                token.cancel();
            }
            (
                child.name().to_string(),
                NodeResult::from(result.map(|out| out.value)),
            )
        }
    });
    let results: Vec<(String, NodeResult)> = join_all(runs).await;

    let failed = lead_failure(
        results
            .iter()
            .enumerate()
            .filter_map(|(i, (_, r))| r.error().map(|e| (i, e))),
    );
    let output = match failed {
        None => Ok(NodeOutput::new(WorkflowValue::Map(
            results
                .iter()
                .filter_map(|(name, r)| r.value().map(|v| (name.clone(), v.clone())))
                .collect(),
        ))),
        Some((_, lead)) => {
            let detail: Vec<String> = results
                .iter()
                .filter_map(|(name, r)| r.error().map(|e| format!("{name}: {}", e.message)))
                .collect();
            Err(NodeError::new(
                lead.kind,
                format!(
                    "{} of {} parallel children failed: {}",
                    detail.len(),
                    results.len(),
                    detail.join("; ")
                ),
            )
            .with_retriable(false))
        }
    };
    Completion {
        output,
        children: results,
        elements: None,
    }
}

async fn run_map_reduce(
    spec: MapReduceSpec,
    items: Vec<WorkflowValue>,
    ctx: &NodeContext,
) -> Completion {
    let token = ctx.cancellation().child_token();
    let limit = Arc::new(Semaphore::new(spec.max_concurrency.max(1)));
    let fail_fast = spec.policy == MapFailurePolicy::FailFast;

    let runs = items.into_iter().map(|item| {
        let map = Arc::clone(&spec.map);
        let element_ctx = ctx.with_cancellation(token.clone());
        let token = token.clone();
        let limit = Arc::clone(&limit);
        async move {
            let _permit = tokio::select! {
                biased;
                _ = token.cancelled() => return NodeResult::Failure(NodeError::cancelled()),
                permit = limit.acquire_owned() => permit,
            };
            let result = tokio::select! {
                biased;
                result = invoke(&map, item, &element_ctx) => result,
                _ = token.cancelled() => Err(NodeError::cancelled()),
            };
            if fail_fast && result.is_err() {
                token.cancel();
            }
            NodeResult::from(result.map(|out| out.value))
        }
    });
    let elements: Vec<NodeResult> = join_all(runs).await;

    if fail_fast
        && let Some((index, error)) = lead_failure(
            elements
                .iter()
                .enumerate()
                .filter_map(|(i, r)| r.error().map(|e| (i, e))),
        )
    {
        let error = NodeError::new(
            error.kind,
            format!("map element {index} failed: {}", error.message),
        )
        .with_retriable(error.retriable);
        return Completion {
            output: Err(error),
            children: Vec::new(),
            elements: Some(elements),
        };
    }

    let reduce_input = WorkflowValue::List(
        elements
            .iter()
            .enumerate()
            .map(|(index, result)| match result {
                NodeResult::Success(value) => value.clone(),
                NodeResult::Failure(error) => {
                    ctx.report_error(error);
                    error_record(error, "index", WorkflowValue::from(index))
                }
            })
            .collect(),
    );
    let output = invoke(&spec.reduce, reduce_input, ctx).await;
    Completion {
        output,
        children: Vec::new(),
        elements: Some(elements),
    }
}
