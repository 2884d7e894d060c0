//! Stage topology
//!
//! Turns a registry plus declared edges into an [`ExecutionPlan`]: a
//! deterministic stage order and structural diagnostics.
//!
//! # Ordering
//!
//! Kahn's algorithm over the stage graph. The ready queue is FIFO, seeded
//! with every zero in-degree stage in lexicographic order; stages that
//! become ready in the same step are appended in lexicographic order. The
//! same registry and edges therefore always yield the same order.
//!
//! Edges come from two places:
//! - plugin dependencies: `stage(dependency) -> stage(plugin)`, weight 1,
//!   skipped when both plugins share a stage
//! - explicit edges added through [`TopologyBuilder::edge`]

use crate::error::TopologyError;
use crate::id::{PluginId, Stage};
use crate::registry::Registry;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Default fan-out above which a stage counts as a fork
pub const DEFAULT_MAX_FAN_OUT: usize = 4;

/// Must-run-before relationship between two stages
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Upstream stage
    pub from: Stage,
    /// Downstream stage
    pub to: Stage,
    /// Relative weight, informational
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl Edge {
    /// Create edge with weight 1
    #[inline]
    #[must_use]
    pub fn new(from: Stage, to: Stage) -> Self {
        Self {
            from,
            to,
            weight: default_weight(),
        }
    }

    /// With weight
    #[inline]
    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

/// Topology build settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyOptions {
    /// Return a partial order instead of failing on cycles
    pub allow_cycles: bool,
    /// Outgoing edge count above which a stage is reported as a fork
    pub max_fan_out: usize,
}

impl Default for TopologyOptions {
    fn default() -> Self {
        Self {
            allow_cycles: false,
            max_fan_out: DEFAULT_MAX_FAN_OUT,
        }
    }
}

/// Structural facts about the stage graph
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlanDiagnostics {
    /// Stages with no incoming edges
    pub sources: Vec<Stage>,
    /// Stages with no outgoing edges
    pub sinks: Vec<Stage>,
    /// Number of stages whose fan-out exceeds `max_fan_out`
    pub fork_count: usize,
    /// Those stages, sorted
    pub forks: Vec<Stage>,
    /// Whether ordering stopped short because of a cycle
    pub has_cycle: bool,
    /// Stages left unordered because of a cycle
    pub residual: Vec<Stage>,
    /// Total stages in the graph
    pub node_count: usize,
    /// Distinct stage-to-stage edges
    pub edge_count: usize,
}

/// Stage order plus diagnostics
///
/// Immutable once built. Rebuild it if the registry or edges change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Stages in execution order
    pub ordered_stages: Vec<Stage>,
    /// Structural diagnostics
    pub diagnostics: PlanDiagnostics,
}

impl ExecutionPlan {
    /// Number of ordered stages
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.ordered_stages.len()
    }

    /// Check if no stage is ordered
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ordered_stages.is_empty()
    }

    /// Position of `stage` in the order
    #[must_use]
    pub fn position(&self, stage: &Stage) -> Option<usize> {
        self.ordered_stages.iter().position(|s| s == stage)
    }

    /// Whether every stage of the graph is ordered
    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.diagnostics.has_cycle
    }

    /// Iterate stages in order
    pub fn iter(&self) -> impl Iterator<Item = &Stage> {
        self.ordered_stages.iter()
    }
}

/// Builds an [`ExecutionPlan`] from a registry
#[derive(Debug)]
pub struct TopologyBuilder<'r> {
    registry: &'r Registry,
    edges: Vec<Edge>,
    options: TopologyOptions,
}

impl<'r> TopologyBuilder<'r> {
    /// Create builder over `registry` with default options
    #[must_use]
    pub fn new(registry: &'r Registry) -> Self {
        Self {
            registry,
            edges: Vec::new(),
            options: TopologyOptions::default(),
        }
    }

    /// Add an explicit edge
    #[must_use]
    pub fn edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Add several explicit edges
    #[must_use]
    pub fn edges(mut self, edges: impl IntoIterator<Item = Edge>) -> Self {
        self.edges.extend(edges);
        self
    }

    /// Replace options
    #[must_use]
    pub fn with_options(mut self, options: TopologyOptions) -> Self {
        self.options = options;
        self
    }

    /// Permit cycles (partial order) or not (error)
    #[must_use]
    pub fn allow_cycles(mut self, allow: bool) -> Self {
        self.options.allow_cycles = allow;
        self
    }

    /// Set fork threshold
    #[must_use]
    pub fn max_fan_out(mut self, max: usize) -> Self {
        self.options.max_fan_out = max;
        self
    }

    /// Compute the plan
    ///
    /// # Errors
    /// - [`TopologyError::InvalidFanOut`] if `max_fan_out` is zero
    /// - [`TopologyError::UnknownDependency`] for a dependency on an
    ///   unregistered plugin
    /// - [`TopologyError::UnknownEdgeEndpoint`] for an edge naming a stage
    ///   with no plugin
    /// - [`TopologyError::CycleDetected`] if stages remain unordered and
    ///   cycles are not allowed
    pub fn build(&self) -> Result<ExecutionPlan, TopologyError> {
        if self.options.max_fan_out == 0 {
            return Err(TopologyError::InvalidFanOut);
        }

        let graph = self.stage_graph()?;
        let (ordered, remaining) = kahn_order(&graph);

        let residual: BTreeSet<Stage> = remaining.iter().map(|n| graph[*n].clone()).collect();
        let has_cycle = !residual.is_empty();
        if has_cycle && !self.options.allow_cycles {
            tracing::debug!(residual = ?residual, "topology rejected, cycle detected");
            return Err(TopologyError::CycleDetected { residual });
        }
        if has_cycle {
            tracing::warn!(
                ordered = ordered.len(),
                residual = residual.len(),
                "cycle tolerated, plan is partial"
            );
        }

        let diagnostics = diagnose(&graph, self.options.max_fan_out, has_cycle, residual);
        let ordered_stages: Vec<Stage> = ordered.into_iter().map(|n| graph[n].clone()).collect();
        tracing::debug!(
            stages = ordered_stages.len(),
            edges = diagnostics.edge_count,
            forks = diagnostics.fork_count,
            "execution plan built"
        );

        Ok(ExecutionPlan {
            ordered_stages,
            diagnostics,
        })
    }

    /// Stage graph with deduplicated edges, nodes added in sorted order
    fn stage_graph(&self) -> Result<DiGraph<Stage, u32>, TopologyError> {
        let stages: BTreeSet<&Stage> = self.registry.stages().collect();
        let mut graph = DiGraph::with_capacity(stages.len(), self.edges.len());
        let mut index: HashMap<Stage, NodeIndex> = HashMap::with_capacity(stages.len());
        for stage in stages {
            index.insert(stage.clone(), graph.add_node(stage.clone()));
        }

        for manifest in self.registry.manifests() {
            for dep in &manifest.depends_on {
                let dep_stage = self
                    .registry
                    .stage_of(dep)
                    .ok_or_else(|| unknown_dependency(&manifest.id, dep))?;
                if dep_stage == &manifest.stage {
                    continue;
                }
                connect(&mut graph, index[dep_stage], index[&manifest.stage], 1);
            }
        }

        for edge in &self.edges {
            let from = lookup(&index, edge, &edge.from)?;
            let to = lookup(&index, edge, &edge.to)?;
            connect(&mut graph, from, to, edge.weight);
        }

        Ok(graph)
    }
}

/// Build a plan from a registry and explicit edges
///
/// # Errors
/// See [`TopologyBuilder::build`].
pub fn build_topology(
    registry: &Registry,
    edges: impl IntoIterator<Item = Edge>,
    options: TopologyOptions,
) -> Result<ExecutionPlan, TopologyError> {
    TopologyBuilder::new(registry)
        .edges(edges)
        .with_options(options)
        .build()
}

fn unknown_dependency(plugin: &PluginId, missing: &PluginId) -> TopologyError {
    TopologyError::UnknownDependency {
        plugin: plugin.clone(),
        missing: missing.clone(),
    }
}

fn lookup(
    index: &HashMap<Stage, NodeIndex>,
    edge: &Edge,
    endpoint: &Stage,
) -> Result<NodeIndex, TopologyError> {
    index
        .get(endpoint)
        .copied()
        .ok_or_else(|| TopologyError::UnknownEdgeEndpoint {
            from: edge.from.clone(),
            to: edge.to.clone(),
            missing: endpoint.clone(),
        })
}

/// Add `from -> to`, or keep the larger weight if it already exists
fn connect(graph: &mut DiGraph<Stage, u32>, from: NodeIndex, to: NodeIndex, weight: u32) {
    match graph.find_edge(from, to) {
        Some(existing) => {
            if graph[existing] < weight {
                graph[existing] = weight;
            }
        }
        None => {
            graph.add_edge(from, to, weight);
        }
    }
}

fn sorted_by_name(graph: &DiGraph<Stage, u32>, nodes: &mut [NodeIndex]) {
    nodes.sort_by(|a, b| graph[*a].cmp(&graph[*b]));
}

/// Kahn's algorithm with lexicographic tie-breaks
///
/// Returns the ordered nodes and the nodes that never reached in-degree
/// zero.
fn kahn_order(graph: &DiGraph<Stage, u32>) -> (Vec<NodeIndex>, Vec<NodeIndex>) {
    let count = graph.node_count();
    let mut indegree: Vec<usize> = graph
        .node_indices()
        .map(|n| graph.edges_directed(n, Direction::Incoming).count())
        .collect();
    let adjacency: Vec<Vec<NodeIndex>> = graph
        .node_indices()
        .map(|n| graph.neighbors_directed(n, Direction::Outgoing).collect())
        .collect();

    let mut seed: Vec<NodeIndex> = graph
        .node_indices()
        .filter(|n| indegree[n.index()] == 0)
        .collect();
    sorted_by_name(graph, &mut seed);
    let mut queue: VecDeque<NodeIndex> = seed.into();

    let mut ordered = Vec::with_capacity(count);
    let mut ready = Vec::new();
    while let Some(node) = queue.pop_front() {
        ordered.push(node);
        for next in &adjacency[node.index()] {
            let slot = &mut indegree[next.index()];
            *slot -= 1;
            if *slot == 0 {
                ready.push(*next);
            }
        }
        sorted_by_name(graph, &mut ready);
        queue.extend(ready.drain(..));
    }

    let remaining = graph
        .node_indices()
        .filter(|n| indegree[n.index()] > 0)
        .collect();
    (ordered, remaining)
}

fn diagnose(
    graph: &DiGraph<Stage, u32>,
    max_fan_out: usize,
    has_cycle: bool,
    residual: BTreeSet<Stage>,
) -> PlanDiagnostics {
    let collect = |pred: &dyn Fn(NodeIndex) -> bool| -> Vec<Stage> {
        let mut stages: Vec<Stage> = graph
            .node_indices()
            .filter(|n| pred(*n))
            .map(|n| graph[n].clone())
            .collect();
        stages.sort();
        stages
    };

    let sources = collect(&|n| graph.edges_directed(n, Direction::Incoming).next().is_none());
    let sinks = collect(&|n| graph.edges_directed(n, Direction::Outgoing).next().is_none());
    let forks = collect(&|n| graph.edges_directed(n, Direction::Outgoing).count() > max_fan_out);

    PlanDiagnostics {
        sources,
        sinks,
        fork_count: forks.len(),
        forks,
        has_cycle,
        residual: residual.into_iter().collect(),
        node_count: graph.node_count(),
        edge_count: graph.edge_count(),
    }
}
