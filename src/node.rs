// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Node trait and function-node adapter.
//!
//! A node is a named unit of computation over a state snapshot. It returns
//! a [`StateFragment`] - never a mutated state - and may call the external
//! generation service while computing. Side effects beyond that call are the
//! executor's business (events, metrics, tracing), not the node's.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::edge::WorkItem;
use crate::error::Result;
use crate::state::{StateFragment, StateSnapshot};

/// Boxed future returned by function nodes.
pub type NodeFuture = Pin<Box<dyn Future<Output = Result<StateFragment>> + Send>>;

/// Per-activation context handed to a node by the executor.
///
/// Regular nodes get a bare context. Fan-out worker instances additionally
/// carry their [`WorkItem`] and spawn index; the spawn index is what makes
/// `Accumulate` merges deterministic.
#[derive(Debug, Clone)]
pub struct NodeContext {
    /// Name of the node being activated.
    pub node: Arc<String>,
    /// Position of this instance within its superstep's spawn order.
    pub spawn_index: usize,
    /// The work item this worker instance was spawned for, if any.
    pub work_item: Option<WorkItem>,
}

impl NodeContext {
    pub(crate) fn new(node: Arc<String>, spawn_index: usize, work_item: Option<WorkItem>) -> Self {
        Self {
            node,
            spawn_index,
            work_item,
        }
    }
}

/// A unit of computation over state.
///
/// Implementations must be pure with respect to the snapshot apart from
/// calls to the generation service: same snapshot, same fragment (modulo
/// what the service returns). Nodes never observe sibling writes from the
/// same superstep.
#[async_trait]
pub trait Node: Send + Sync {
    /// Compute this node's output fragment from the snapshot.
    ///
    /// # Errors
    ///
    /// Any error aborts the whole run; there is no per-node retry.
    async fn compute(&self, snapshot: StateSnapshot, ctx: NodeContext) -> Result<StateFragment>;
}

/// Shared, type-erased node handle stored in the graph.
pub type BoxedNode = Arc<dyn Node>;

/// Adapter turning an async closure into a [`Node`].
///
/// This is what [`StateGraph::add_node_from_fn`](crate::graph::StateGraph::add_node_from_fn)
/// wraps. The closure receives the snapshot and the activation context and
/// returns a boxed future.
pub struct FnNode<F>
where
    F: Fn(StateSnapshot, NodeContext) -> NodeFuture + Send + Sync,
{
    f: F,
}

impl<F> FnNode<F>
where
    F: Fn(StateSnapshot, NodeContext) -> NodeFuture + Send + Sync,
{
    /// Wrap a closure as a node.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Node for FnNode<F>
where
    F: Fn(StateSnapshot, NodeContext) -> NodeFuture + Send + Sync,
{
    async fn compute(&self, snapshot: StateSnapshot, ctx: NodeContext) -> Result<StateFragment> {
        (self.f)(snapshot, ctx).await
    }
}

/// A declared node plus the output keys its fragments may write.
#[derive(Clone)]
pub(crate) struct NodeEntry {
    pub node: BoxedNode,
    pub output_keys: Arc<Vec<String>>,
}

impl NodeEntry {
    pub(crate) fn allows_key(&self, key: &str) -> bool {
        self.output_keys.iter().any(|k| k == key)
    }
}
