//! 工作流图结构
//! Workflow graph structure
//!
//! Nodes, guarded edges and the build-time checks that make a graph safe to
//! run: unique names, resolvable endpoints, unambiguous successors, no data
//! dependencies between fan-out siblings and a resolvable output node.

use loomflow_kernel::workflow::{ExecutionContext, Node, NodeKind};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Predicate over the execution context, used by conditional edges.
pub type EdgePredicate = Arc<dyn Fn(&ExecutionContext) -> bool + Send + Sync>;

/// Graph construction and validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum GraphError {
    #[error("workflow has no nodes")]
    Empty,
    #[error("duplicate node name '{0}'")]
    DuplicateNode(String),
    #[error("unknown node '{0}'")]
    UnknownNode(String),
    #[error("edge {from} -> {to} references unknown node '{missing}'")]
    UnknownEdgeEndpoint {
        from: String,
        to: String,
        missing: String,
    },
    #[error("no start node declared")]
    MissingStart,
    #[error("start node '{0}' does not exist")]
    UnknownStart(String),
    #[error("node '{0}' has more than one unconditional edge but is not a fan-out node")]
    MultipleUnconditionalEdges(String),
    #[error("fan-out siblings of '{fan_out}': '{node}' depends on sibling '{dependency}'")]
    SiblingDependency {
        fan_out: String,
        node: String,
        dependency: String,
    },
    #[error("fan-out siblings of '{fan_out}' are connected by edge {from} -> {to}")]
    EdgeBetweenSiblings {
        fan_out: String,
        from: String,
        to: String,
    },
    #[error("parallel group '{0}' has no children")]
    EmptyParallel(String),
    #[error("switch '{node}' must have exactly one default edge, found {found}")]
    SwitchDefault { node: String, found: usize },
    #[error("node '{node}' has more than one edge for branch key '{key}'")]
    DuplicateBranchKey { node: String, key: String },
    #[error("node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },
    #[error("cannot infer the output node; sink candidates: {0:?}")]
    AmbiguousOutput(Vec<String>),
    #[error("output node '{0}' does not exist")]
    UnknownOutput(String),
    #[error("node '{0}' is a composite; resilience wrappers apply to leaf nodes only")]
    NotALeaf(String),
}

// ────────────────────── Edges ──────────────────────

/// 边类型
/// Edge guard: when an edge is eligible for traversal.
#[derive(Clone)]
pub enum EdgeGuard {
    /// Unconditional, evaluated on success.
    Always,
    /// Conditional on the context, evaluated on success.
    When(EdgePredicate),
    /// Taken when the source returned `Directive::Branch(key)`.
    Branch(String),
    /// Taken when the source branched to a key with no matching edge.
    Default,
    /// Taken only when the source failed.
    OnError,
}

impl fmt::Debug for EdgeGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeGuard::Always => f.write_str("Always"),
            EdgeGuard::When(_) => f.write_str("When(<predicate>)"),
            EdgeGuard::Branch(key) => f.debug_tuple("Branch").field(key).finish(),
            EdgeGuard::Default => f.write_str("Default"),
            EdgeGuard::OnError => f.write_str("OnError"),
        }
    }
}

/// 边配置
/// Directed, guarded edge.
#[derive(Debug, Clone)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub guard: EdgeGuard,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::guarded(from, to, EdgeGuard::Always)
    }

    pub fn when<F>(from: impl Into<String>, to: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&ExecutionContext) -> bool + Send + Sync + 'static,
    {
        Self::guarded(from, to, EdgeGuard::When(Arc::new(predicate)))
    }

    pub fn branch(from: impl Into<String>, key: impl Into<String>, to: impl Into<String>) -> Self {
        Self::guarded(from, to, EdgeGuard::Branch(key.into()))
    }

    pub fn default_branch(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::guarded(from, to, EdgeGuard::Default)
    }

    pub fn on_error(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::guarded(from, to, EdgeGuard::OnError)
    }

    pub fn guarded(from: impl Into<String>, to: impl Into<String>, guard: EdgeGuard) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            guard,
        }
    }

    pub fn is_error_edge(&self) -> bool {
        matches!(self.guard, EdgeGuard::OnError)
    }
}

// ────────────────────── Nodes ──────────────────────

/// Where a map-reduce node takes its items from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ItemSource {
    /// The value routed to the node.
    #[default]
    Input,
    /// The recorded output of another node.
    Output(String),
}

/// What a failed map element does to the whole map-reduce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapFailurePolicy {
    /// Cancel outstanding elements and fail the node.
    #[default]
    FailFast,
    /// Keep going; failed elements reach the reducer as error records.
    Collect,
}

/// 映射归约配置
/// Map-reduce composite.
#[derive(Clone)]
pub struct MapReduceSpec {
    pub items: ItemSource,
    pub map: Arc<dyn Node>,
    pub reduce: Arc<dyn Node>,
    pub max_concurrency: usize,
    pub policy: MapFailurePolicy,
}

impl MapReduceSpec {
    pub fn new(map: Arc<dyn Node>, reduce: Arc<dyn Node>) -> Self {
        Self {
            items: ItemSource::Input,
            map,
            reduce,
            max_concurrency: 4,
            policy: MapFailurePolicy::FailFast,
        }
    }

    pub fn items_from(mut self, node: impl Into<String>) -> Self {
        self.items = ItemSource::Output(node.into());
        self
    }

    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit.max(1);
        self
    }

    pub fn policy(mut self, policy: MapFailurePolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// 并行组配置
/// Parallel group composite.
#[derive(Clone)]
pub struct ParallelSpec {
    pub children: Vec<Arc<dyn Node>>,
    /// `None` defers to the executor's `parallel_fail_fast` setting.
    pub fail_fast: Option<bool>,
}

/// What the executor does when a node is scheduled.
#[derive(Clone)]
pub enum NodeBody {
    Leaf(Arc<dyn Node>),
    Parallel(ParallelSpec),
    MapReduce(MapReduceSpec),
}

/// 工作流节点
/// A named node in the graph.
#[derive(Clone)]
pub struct WorkflowNode {
    name: String,
    dependencies: Vec<String>,
    fan_out: bool,
    body: NodeBody,
}

impl WorkflowNode {
    pub fn leaf(node: Arc<dyn Node>) -> Self {
        Self {
            name: node.name().to_string(),
            dependencies: node.dependencies().to_vec(),
            fan_out: false,
            body: NodeBody::Leaf(node),
        }
    }

    /// Parallel group. Dependencies declared by the children are hoisted onto
    /// the group so the whole group waits for them.
    pub fn parallel(name: impl Into<String>, children: Vec<Arc<dyn Node>>) -> Self {
        let mut dependencies: Vec<String> = Vec::new();
        for child in &children {
            for dep in child.dependencies() {
                if !dependencies.contains(dep) {
                    dependencies.push(dep.clone());
                }
            }
        }
        Self {
            name: name.into(),
            dependencies,
            fan_out: true,
            body: NodeBody::Parallel(ParallelSpec {
                children,
                fail_fast: None,
            }),
        }
    }

    pub fn map_reduce(name: impl Into<String>, spec: MapReduceSpec) -> Self {
        let mut dependencies = Vec::new();
        if let ItemSource::Output(source) = &spec.items {
            dependencies.push(source.clone());
        }
        Self {
            name: name.into(),
            dependencies,
            fan_out: true,
            body: NodeBody::MapReduce(spec),
        }
    }

    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        let dependency = dependency.into();
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    /// Allow several unconditional successors; they run as concurrent siblings.
    pub fn fan_out(mut self) -> Self {
        self.fan_out = true;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        if let NodeBody::Parallel(spec) = &mut self.body {
            spec.fail_fast = Some(fail_fast);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn is_fan_out(&self) -> bool {
        self.fan_out
    }

    pub fn body(&self) -> &NodeBody {
        &self.body
    }

    pub fn kind(&self) -> NodeKind {
        match &self.body {
            NodeBody::Leaf(node) => node.kind(),
            NodeBody::Parallel(_) => NodeKind::Parallel,
            NodeBody::MapReduce(_) => NodeKind::MapReduce,
        }
    }

    /// Replace a leaf implementation, e.g. with a resilience wrapper.
    pub(crate) fn wrap_leaf<F>(&mut self, wrap: F) -> Result<(), GraphError>
    where
        F: FnOnce(Arc<dyn Node>) -> Arc<dyn Node>,
    {
        match &self.body {
            NodeBody::Leaf(node) => {
                self.body = NodeBody::Leaf(wrap(Arc::clone(node)));
                Ok(())
            }
            _ => Err(GraphError::NotALeaf(self.name.clone())),
        }
    }

    pub(crate) fn set_fan_out(&mut self) {
        self.fan_out = true;
    }

    /// Names this node records results under besides its own.
    fn child_names(&self) -> Vec<&str> {
        match &self.body {
            NodeBody::Parallel(spec) => spec.children.iter().map(|c| c.name()).collect(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Debug for WorkflowNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowNode")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("dependencies", &self.dependencies)
            .field("fan_out", &self.fan_out)
            .finish()
    }
}

// ────────────────────── Graph ──────────────────────

/// 工作流图
/// Workflow graph
#[derive(Clone, Default)]
pub struct WorkflowGraph {
    pub name: String,
    pub description: String,
    nodes: HashMap<String, WorkflowNode>,
    /// Insertion order, for deterministic iteration.
    order: Vec<String>,
    edges: Vec<Edge>,
    duplicates: Vec<String>,
    start: Option<String>,
    output: Option<String>,
}

impl WorkflowGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// 添加节点
    /// Add node. A repeated name is reported by [`WorkflowGraph::validate`].
    pub fn add_node(&mut self, node: WorkflowNode) -> &mut Self {
        let name = node.name().to_string();
        if self.nodes.contains_key(&name) {
            self.duplicates.push(name);
            return self;
        }
        if self.start.is_none() && self.order.is_empty() {
            debug!(node = %name, "first node becomes the default start node");
        }
        self.order.push(name.clone());
        self.nodes.insert(name, node);
        self
    }

    /// 添加边
    /// Add edge
    pub fn add_edge(&mut self, edge: Edge) -> &mut Self {
        self.edges.push(edge);
        self
    }

    pub fn set_start(&mut self, name: impl Into<String>) -> &mut Self {
        self.start = Some(name.into());
        self
    }

    pub fn set_output(&mut self, name: impl Into<String>) -> &mut Self {
        self.output = Some(name.into());
        self
    }

    pub fn node(&self, name: &str) -> Option<&WorkflowNode> {
        self.nodes.get(name)
    }

    pub(crate) fn node_mut(&mut self, name: &str) -> Option<&mut WorkflowNode> {
        self.nodes.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Node names in insertion order.
    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Start node: the declared one, else the first node added.
    pub fn start_node(&self) -> Option<&str> {
        self.start
            .as_deref()
            .or_else(|| self.order.first().map(String::as_str))
    }

    /// Declared output node, or the inferred one once validated.
    pub fn output_node(&self) -> Option<&str> {
        self.output.as_deref()
    }

    /// 获取节点的出边
    /// Outgoing edges of `name` in declaration order.
    pub fn outgoing<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.from == name)
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Nodes without any outgoing edge, in insertion order.
    pub fn sinks(&self) -> Vec<&str> {
        let sources: HashSet<&str> = self.edges.iter().map(|e| e.from.as_str()).collect();
        self.order
            .iter()
            .map(String::as_str)
            .filter(|n| !sources.contains(n))
            .collect()
    }

    /// 验证图的完整性
    /// Validate the graph and resolve the output node.
    pub fn validate(&mut self) -> Result<(), GraphError> {
        if self.nodes.is_empty() {
            return Err(GraphError::Empty);
        }
        if let Some(dup) = self.duplicates.first() {
            return Err(GraphError::DuplicateNode(dup.clone()));
        }
        self.check_child_names()?;
        self.check_start()?;
        self.check_edges()?;
        self.check_dependencies()?;
        self.check_successors()?;
        self.check_branches()?;
        let output = self.resolve_output()?;
        self.output = Some(output);
        Ok(())
    }

    fn check_child_names(&self) -> Result<(), GraphError> {
        let mut seen: HashSet<&str> = self.nodes.keys().map(String::as_str).collect();
        for name in &self.order {
            let node = &self.nodes[name];
            if let NodeBody::Parallel(spec) = node.body()
                && spec.children.is_empty()
            {
                return Err(GraphError::EmptyParallel(name.clone()));
            }
            for child in node.child_names() {
                if !seen.insert(child) {
                    return Err(GraphError::DuplicateNode(child.to_string()));
                }
            }
        }
        Ok(())
    }

    fn check_start(&self) -> Result<(), GraphError> {
        match self.start_node() {
            None => Err(GraphError::MissingStart),
            Some(start) if !self.nodes.contains_key(start) => {
                Err(GraphError::UnknownStart(start.to_string()))
            }
            Some(_) => Ok(()),
        }
    }

    fn check_edges(&self) -> Result<(), GraphError> {
        for edge in &self.edges {
            for end in [&edge.from, &edge.to] {
                if !self.nodes.contains_key(end) {
                    return Err(GraphError::UnknownEdgeEndpoint {
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                        missing: end.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Dependencies must name a graph node or a parallel child; a parallel
    /// child may not depend on its own siblings.
    fn check_dependencies(&self) -> Result<(), GraphError> {
        let mut known: HashSet<&str> = self.nodes.keys().map(String::as_str).collect();
        for node in self.nodes.values() {
            known.extend(node.child_names());
        }
        for name in &self.order {
            let node = &self.nodes[name];
            if let NodeBody::Parallel(spec) = node.body() {
                let siblings: HashSet<&str> = spec.children.iter().map(|c| c.name()).collect();
                for child in &spec.children {
                    if let Some(dep) = child
                        .dependencies()
                        .iter()
                        .find(|d| siblings.contains(d.as_str()))
                    {
                        return Err(GraphError::SiblingDependency {
                            fan_out: name.clone(),
                            node: child.name().to_string(),
                            dependency: dep.clone(),
                        });
                    }
                }
            }
            for dep in node.dependencies() {
                if !known.contains(dep.as_str()) {
                    return Err(GraphError::UnknownDependency {
                        node: name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// At most one unconditional edge unless the node fans out; fan-out
    /// siblings must be independent of each other.
    fn check_successors(&self) -> Result<(), GraphError> {
        for name in &self.order {
            let node = &self.nodes[name];
            let targets: Vec<&str> = self
                .outgoing(name)
                .filter(|e| matches!(e.guard, EdgeGuard::Always))
                .map(|e| e.to.as_str())
                .collect();
            if targets.len() <= 1 {
                continue;
            }
            if !node.is_fan_out() {
                return Err(GraphError::MultipleUnconditionalEdges(name.clone()));
            }
            let siblings: HashSet<&str> = targets.iter().copied().collect();
            for sibling in &targets {
                let sibling_node = &self.nodes[*sibling];
                if let Some(dep) = sibling_node
                    .dependencies()
                    .iter()
                    .find(|d| siblings.contains(d.as_str()))
                {
                    return Err(GraphError::SiblingDependency {
                        fan_out: name.clone(),
                        node: sibling.to_string(),
                        dependency: dep.clone(),
                    });
                }
                if let Some(edge) = self
                    .outgoing(sibling)
                    .find(|e| siblings.contains(e.to.as_str()))
                {
                    return Err(GraphError::EdgeBetweenSiblings {
                        fan_out: name.clone(),
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn check_branches(&self) -> Result<(), GraphError> {
        for name in &self.order {
            let mut keys: HashSet<&str> = HashSet::new();
            let mut defaults = 0;
            for edge in self.outgoing(name) {
                match &edge.guard {
                    EdgeGuard::Branch(key) => {
                        if !keys.insert(key.as_str()) {
                            return Err(GraphError::DuplicateBranchKey {
                                node: name.clone(),
                                key: key.clone(),
                            });
                        }
                    }
                    EdgeGuard::Default => defaults += 1,
                    _ => {}
                }
            }
            if self.nodes[name].kind() == NodeKind::Switch && defaults != 1 {
                return Err(GraphError::SwitchDefault {
                    node: name.clone(),
                    found: defaults,
                });
            }
        }
        Ok(())
    }

    fn resolve_output(&self) -> Result<String, GraphError> {
        if let Some(output) = &self.output {
            return if self.nodes.contains_key(output) {
                Ok(output.clone())
            } else {
                Err(GraphError::UnknownOutput(output.clone()))
            };
        }
        match self.sinks().as_slice() {
            [single] => Ok(single.to_string()),
            candidates => Err(GraphError::AmbiguousOutput(
                candidates.iter().map(|s| s.to_string()).collect(),
            )),
        }
    }
}

impl fmt::Debug for WorkflowGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowGraph")
            .field("name", &self.name)
            .field("nodes", &self.order)
            .field("edges", &self.edges)
            .field("start", &self.start_node())
            .field("output", &self.output)
            .finish()
    }
}
