// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Graph definition and builder.
//!
//! [`StateGraph`] collects nodes, edges and key declarations, then
//! [`StateGraph::compile`] validates the structure once and produces an
//! immutable [`CompiledGraph`] that can run any number of times.
//!
//! Builder methods are infallible; every structural error is reported by
//! `compile()` so callers get all the validation in one place, before the
//! first run can start.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::edge::{ConditionalEdge, Edge, FanOutEdge, ParallelEdge, WorkItem, END};
use crate::error::{Error, Result};
use crate::executor::CompiledGraph;
use crate::node::{BoxedNode, FnNode, Node, NodeContext, NodeEntry, NodeFuture};
use crate::state::{MergePolicy, StateSchema, StateSnapshot};

/// Mutable graph builder.
///
/// # Example
///
/// ```rust,ignore
/// let mut graph = StateGraph::new();
/// graph.add_node_from_fn("generate", &["joke"], generate);
/// graph.add_node_from_fn("polish", &["final_joke"], polish);
/// graph.set_entry_point("generate");
/// graph.add_edge("generate", "polish");
/// graph.add_edge("polish", END);
/// let app = graph.compile()?;
/// ```
#[derive(Default)]
pub struct StateGraph {
    nodes: HashMap<String, NodeEntry>,
    duplicates: Vec<String>,
    edges: Vec<Edge>,
    parallel_edges: Vec<ParallelEdge>,
    conditional_edges: Vec<ConditionalEdge>,
    fanout_edges: Vec<FanOutEdge>,
    entry_point: Option<String>,
    schema: StateSchema,
}

impl StateGraph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the merge policy for a state key.
    ///
    /// Undeclared keys default to [`MergePolicy::Overwrite`]; `Accumulate`
    /// keys must be declared here so sibling fragments combine instead of
    /// clobbering each other.
    pub fn declare_key(&mut self, key: impl Into<String>, policy: MergePolicy) -> &mut Self {
        self.schema.declare(key, policy);
        self
    }

    /// Add a node with its declared output keys.
    ///
    /// Fragments from this node may only write the listed keys. Duplicate
    /// names are recorded and reported by `compile()`.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        output_keys: &[&str],
        node: impl Node + 'static,
    ) -> &mut Self {
        self.add_boxed_node(name.into(), output_keys, Arc::new(node))
    }

    /// Add a node from an async closure.
    ///
    /// The closure receives the superstep snapshot and the activation
    /// context (carrying the work item for fan-out workers).
    pub fn add_node_from_fn<F>(
        &mut self,
        name: impl Into<String>,
        output_keys: &[&str],
        f: F,
    ) -> &mut Self
    where
        F: Fn(StateSnapshot, NodeContext) -> NodeFuture + Send + Sync + 'static,
    {
        self.add_boxed_node(name.into(), output_keys, Arc::new(FnNode::new(f)))
    }

    fn add_boxed_node(&mut self, name: String, output_keys: &[&str], node: BoxedNode) -> &mut Self {
        let entry = NodeEntry {
            node,
            output_keys: Arc::new(output_keys.iter().map(|k| (*k).to_string()).collect()),
        };
        if self.nodes.insert(name.clone(), entry).is_some() {
            self.duplicates.push(name);
        }
        self
    }

    /// Designate the single entry node.
    pub fn set_entry_point(&mut self, name: impl Into<String>) -> &mut Self {
        self.entry_point = Some(name.into());
        self
    }

    /// Add an unconditional edge. The target may be [`END`].
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges.push(Edge {
            from: Arc::new(from.into()),
            to: Arc::new(to.into()),
        });
        self
    }

    /// Add a static fan-out: all targets activate together in one superstep.
    pub fn add_parallel_edges(
        &mut self,
        from: impl Into<String>,
        to: impl IntoIterator<Item = impl Into<String>>,
    ) -> &mut Self {
        self.parallel_edges.push(ParallelEdge {
            from: Arc::new(from.into()),
            to: Arc::new(to.into_iter().map(Into::into).collect()),
        });
        self
    }

    /// Add a conditional edge with its declared routing map.
    ///
    /// `condition` is evaluated against the post-merge snapshot; its return
    /// value must be one of the declared route symbols or the run aborts
    /// with [`Error::Routing`].
    pub fn add_conditional_edges<F, K, V>(
        &mut self,
        from: impl Into<String>,
        condition: F,
        routes: impl IntoIterator<Item = (K, V)>,
    ) -> &mut Self
    where
        F: Fn(&StateSnapshot) -> String + Send + Sync + 'static,
        K: Into<String>,
        V: Into<String>,
    {
        self.push_conditional(from.into(), condition, routes, None)
    }

    /// Add a conditional edge that closes a cycle, naming the route the
    /// executor forces when the cycle's iteration bound is reached.
    ///
    /// The exit symbol must appear in `routes`; `compile()` verifies this.
    pub fn add_conditional_edges_with_exit<F, K, V>(
        &mut self,
        from: impl Into<String>,
        condition: F,
        routes: impl IntoIterator<Item = (K, V)>,
        exit_route: impl Into<String>,
    ) -> &mut Self
    where
        F: Fn(&StateSnapshot) -> String + Send + Sync + 'static,
        K: Into<String>,
        V: Into<String>,
    {
        self.push_conditional(from.into(), condition, routes, Some(exit_route.into()))
    }

    fn push_conditional<F, K, V>(
        &mut self,
        from: String,
        condition: F,
        routes: impl IntoIterator<Item = (K, V)>,
        exit_route: Option<String>,
    ) -> &mut Self
    where
        F: Fn(&StateSnapshot) -> String + Send + Sync + 'static,
        K: Into<String>,
        V: Into<String>,
    {
        let routes: HashMap<String, Arc<String>> = routes
            .into_iter()
            .map(|(symbol, target)| (symbol.into(), Arc::new(target.into())))
            .collect();
        self.conditional_edges.push(ConditionalEdge {
            from: Arc::new(from),
            condition: Box::new(condition),
            routes,
            exit_route,
        });
        self
    }

    /// Add a dynamic fan-out edge: `planner` expands each activation of
    /// `from` into one `worker` instance per emitted [`WorkItem`].
    pub fn add_fanout_edge<F>(
        &mut self,
        from: impl Into<String>,
        planner: F,
        worker: impl Into<String>,
    ) -> &mut Self
    where
        F: Fn(&StateSnapshot) -> Vec<WorkItem> + Send + Sync + 'static,
    {
        self.fanout_edges.push(FanOutEdge {
            from: Arc::new(from.into()),
            planner: Box::new(planner),
            worker: Arc::new(worker.into()),
        });
        self
    }

    /// Validate the structure and produce an immutable, runnable graph.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateNode`] - a node name was added twice
    /// - [`Error::NoEntryPoint`] - `set_entry_point` was never called
    /// - [`Error::NodeNotFound`] - the entry point or an edge source is undeclared
    /// - [`Error::DanglingEdge`] - an edge target is undeclared (and not [`END`])
    /// - [`Error::IncompleteRoutingMap`] - a conditional edge has no routes,
    ///   or its exit route is not among them
    /// - [`Error::NoTerminalPath`] - no sequence of edges from the entry
    ///   point can reach [`END`]
    pub fn compile(self) -> Result<CompiledGraph> {
        if let Some(name) = self.duplicates.first() {
            return Err(Error::DuplicateNode(name.clone()));
        }

        let entry = self.entry_point.clone().ok_or(Error::NoEntryPoint)?;
        if !self.nodes.contains_key(&entry) {
            return Err(Error::NodeNotFound(entry));
        }

        self.check_edge_references()?;
        self.check_terminal_path(&entry)?;

        Ok(CompiledGraph::new(
            self.nodes,
            self.edges,
            self.parallel_edges,
            self.conditional_edges,
            self.fanout_edges,
            Arc::new(entry),
            Arc::new(self.schema),
        ))
    }

    fn node_exists(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    fn check_target(&self, from: &str, to: &str) -> Result<()> {
        if to != END && !self.node_exists(to) {
            return Err(Error::DanglingEdge {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }

    fn check_edge_references(&self) -> Result<()> {
        // Routing follows at most one plain edge per node, so a second one
        // could never fire. Reject it here instead of shadowing it.
        let mut plain_sources: HashSet<&str> = HashSet::new();
        for edge in &self.edges {
            if !self.node_exists(&edge.from) {
                return Err(Error::NodeNotFound((*edge.from).clone()));
            }
            if !plain_sources.insert(edge.from.as_str()) {
                return Err(Error::DuplicateEdge((*edge.from).clone()));
            }
            self.check_target(&edge.from, &edge.to)?;
        }

        for edge in &self.parallel_edges {
            if !self.node_exists(&edge.from) {
                return Err(Error::NodeNotFound((*edge.from).clone()));
            }
            if edge.to.is_empty() {
                return Err(Error::DanglingEdge {
                    from: (*edge.from).clone(),
                    to: "<empty parallel target list>".to_string(),
                });
            }
            for target in edge.to.iter() {
                self.check_target(&edge.from, target)?;
            }
        }

        for edge in &self.conditional_edges {
            if !self.node_exists(&edge.from) {
                return Err(Error::NodeNotFound((*edge.from).clone()));
            }
            if edge.routes.is_empty() {
                return Err(Error::IncompleteRoutingMap((*edge.from).clone()));
            }
            for target in edge.routes.values() {
                self.check_target(&edge.from, target)?;
            }
            if let Some(exit) = &edge.exit_route {
                if !edge.routes.contains_key(exit) {
                    return Err(Error::IncompleteRoutingMap((*edge.from).clone()));
                }
            }
        }

        for edge in &self.fanout_edges {
            if !self.node_exists(&edge.from) {
                return Err(Error::NodeNotFound((*edge.from).clone()));
            }
            if !self.node_exists(&edge.worker) {
                return Err(Error::DanglingEdge {
                    from: (*edge.from).clone(),
                    to: (*edge.worker).clone(),
                });
            }
        }

        Ok(())
    }

    /// BFS over every possible transition, checking END is reachable.
    ///
    /// A node with no outgoing edge terminates implicitly, so reaching such
    /// a node also counts as reaching END.
    fn check_terminal_path(&self, entry: &str) -> Result<()> {
        let mut queue: VecDeque<&str> = VecDeque::new();
        let mut seen: HashSet<&str> = HashSet::new();
        queue.push_back(entry);
        seen.insert(entry);

        while let Some(current) = queue.pop_front() {
            let mut targets: Vec<&str> = Vec::new();
            for edge in &self.conditional_edges {
                if edge.from.as_str() == current {
                    targets.extend(edge.routes.values().map(|t| t.as_str()));
                }
            }
            for edge in &self.fanout_edges {
                if edge.from.as_str() == current {
                    targets.push(edge.worker.as_str());
                }
            }
            for edge in &self.parallel_edges {
                if edge.from.as_str() == current {
                    targets.extend(edge.to.iter().map(String::as_str));
                }
            }
            for edge in &self.edges {
                if edge.from.as_str() == current {
                    targets.push(edge.to.as_str());
                }
            }

            // No outgoing edges: implicit end.
            if targets.is_empty() {
                return Ok(());
            }

            for target in targets {
                if target == END {
                    return Ok(());
                }
                if seen.insert(target) {
                    queue.push_back(target);
                }
            }
        }

        Err(Error::NoTerminalPath {
            entry: entry.to_string(),
        })
    }
}
