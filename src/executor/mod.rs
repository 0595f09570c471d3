// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Compiled graphs and their runtime configuration.
//!
//! [`CompiledGraph`] is the immutable, validated artifact produced by
//! `StateGraph::compile()`. It carries the node table, the edge tables, the
//! merge schema and the runtime knobs (timeouts, superstep limit, cycle
//! bounds, parallelism cap, callbacks). The superstep loop itself lives in
//! [`execution`].

mod execution;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::edge::{ConditionalEdge, Edge, FanOutEdge, ParallelEdge};
use crate::event::{GraphCallback, GraphEvent};
use crate::metrics::ExecutionMetrics;
use crate::node::NodeEntry;
use crate::state::{State, StateSchema};

/// Wall-clock budget for an entire run.
pub const DEFAULT_GRAPH_TIMEOUT: Duration = Duration::from_secs(300);

/// Wall-clock budget for a single node activation.
pub const DEFAULT_NODE_TIMEOUT: Duration = Duration::from_secs(60);

/// Hard ceiling on supersteps per run. Guards unbounded cycles that have no
/// declared iteration bound.
pub const DEFAULT_SUPERSTEP_LIMIT: u32 = 25;

/// Iteration bound applied to conditional edges that declare an exit route.
pub const DEFAULT_MAX_CYCLE_ITERATIONS: usize = 10;

/// Concurrent node tasks per superstep.
pub const DEFAULT_MAX_PARALLEL_TASKS: usize = 16;

/// A validated, runnable graph.
///
/// Cheap to share behind an `Arc`; `invoke` takes `&self`, so one compiled
/// graph serves any number of concurrent runs.
pub struct CompiledGraph {
    pub(crate) nodes: HashMap<String, NodeEntry>,
    pub(crate) edges: Vec<Edge>,
    pub(crate) parallel_edges: Vec<ParallelEdge>,
    pub(crate) conditional_edges: Vec<ConditionalEdge>,
    pub(crate) fanout_edges: Vec<FanOutEdge>,
    pub(crate) entry: Arc<String>,
    pub(crate) schema: Arc<StateSchema>,
    pub(crate) graph_name: Arc<String>,
    pub(crate) graph_timeout: Option<Duration>,
    pub(crate) node_timeout: Option<Duration>,
    pub(crate) superstep_limit: u32,
    pub(crate) max_cycle_iterations: usize,
    pub(crate) max_parallel_tasks: usize,
    pub(crate) callbacks: Vec<Arc<dyn GraphCallback>>,
    pub(crate) metrics: Arc<ExecutionMetrics>,
}

impl CompiledGraph {
    pub(crate) fn new(
        nodes: HashMap<String, NodeEntry>,
        edges: Vec<Edge>,
        parallel_edges: Vec<ParallelEdge>,
        conditional_edges: Vec<ConditionalEdge>,
        fanout_edges: Vec<FanOutEdge>,
        entry: Arc<String>,
        schema: Arc<StateSchema>,
    ) -> Self {
        Self {
            nodes,
            edges,
            parallel_edges,
            conditional_edges,
            fanout_edges,
            entry,
            schema,
            graph_name: Arc::new("stategraph".to_string()),
            graph_timeout: Some(DEFAULT_GRAPH_TIMEOUT),
            node_timeout: Some(DEFAULT_NODE_TIMEOUT),
            superstep_limit: DEFAULT_SUPERSTEP_LIMIT,
            max_cycle_iterations: DEFAULT_MAX_CYCLE_ITERATIONS,
            max_parallel_tasks: DEFAULT_MAX_PARALLEL_TASKS,
            callbacks: Vec::new(),
            metrics: ExecutionMetrics::new(),
        }
    }

    /// Name used in logs, spans and events.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.graph_name = Arc::new(name.into());
        self
    }

    /// Override the whole-run timeout.
    #[must_use]
    pub fn with_graph_timeout(mut self, timeout: Duration) -> Self {
        self.graph_timeout = Some(timeout);
        self
    }

    /// Override the per-node timeout.
    #[must_use]
    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = Some(timeout);
        self
    }

    /// Disable both graph and node timeouts.
    #[must_use]
    pub fn without_timeouts(mut self) -> Self {
        self.graph_timeout = None;
        self.node_timeout = None;
        self
    }

    /// Override the superstep ceiling.
    #[must_use]
    pub fn with_superstep_limit(mut self, limit: u32) -> Self {
        self.superstep_limit = limit;
        self
    }

    /// Iteration bound for cycles closed by a conditional edge with a
    /// declared exit route. Counting starts at the cycle's first activation,
    /// so a bound of `k` lets the conditional node run at most `k` times.
    #[must_use]
    pub fn with_max_cycle_iterations(mut self, bound: usize) -> Self {
        self.max_cycle_iterations = bound;
        self
    }

    /// Cap on concurrently executing node tasks within a superstep.
    #[must_use]
    pub fn with_max_parallel_tasks(mut self, tasks: usize) -> Self {
        self.max_parallel_tasks = tasks.max(1);
        self
    }

    /// Register an event callback. Callbacks run inline on the executor
    /// task and must not block.
    #[must_use]
    pub fn with_callback(mut self, callback: Arc<dyn GraphCallback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    /// The merge schema the graph was compiled with.
    #[must_use]
    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    /// Shared metrics store, aggregated across runs.
    #[must_use]
    pub fn metrics(&self) -> Arc<ExecutionMetrics> {
        Arc::clone(&self.metrics)
    }

    /// The graph's display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.graph_name
    }

    pub(crate) fn emit(&self, event: &GraphEvent) {
        for callback in &self.callbacks {
            callback.on_event(event);
        }
    }
}

/// Outcome of a successful run.
#[derive(Debug)]
pub struct ExecutionResult {
    /// State after the final superstep's merge.
    pub final_state: State,
    /// Supersteps executed.
    pub supersteps: usize,
    /// Node names in merge order, one entry per activation.
    pub nodes_executed: Vec<Arc<String>>,
    /// Activation counts for bounded-cycle conditional nodes.
    pub cycle_iterations: HashMap<String, usize>,
    /// Unique id assigned to this run.
    pub request_id: Arc<String>,
}

impl ExecutionResult {
    /// How many times a bounded cycle's conditional node ran, 0 if never.
    #[must_use]
    pub fn cycle_iterations_for(&self, node: &str) -> usize {
        self.cycle_iterations.get(node).copied().unwrap_or(0)
    }
}
