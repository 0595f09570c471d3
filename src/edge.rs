// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Edge types: unconditional, parallel, conditional, and dynamic fan-out.
//!
//! Edges are declared at build time and immutable afterwards. Only the
//! *value space* of a conditional decision is open to run-time data; the
//! set of legal targets is fixed in the routing map when the edge is added.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::StateSnapshot;

/// Special node name marking graph termination.
pub const END: &str = "__end__";

/// Decision function of a conditional edge: snapshot in, route symbol out.
pub type RouteFn = Box<dyn Fn(&StateSnapshot) -> String + Send + Sync>;

/// Planner function of a fan-out edge: snapshot in, work items out.
pub type PlanFn = Box<dyn Fn(&StateSnapshot) -> Vec<WorkItem> + Send + Sync>;

/// A simple unconditional edge between two nodes.
#[derive(Debug, Clone)]
pub struct Edge {
    /// Source node name.
    pub from: Arc<String>,
    /// Target node name (may be [`END`]).
    pub to: Arc<String>,
}

/// A static fan-out: one source activates several targets in the same
/// superstep. Their fragments merge deterministically in declaration order.
#[derive(Debug, Clone)]
pub struct ParallelEdge {
    /// Source node name.
    pub from: Arc<String>,
    /// Targets activated together.
    pub to: Arc<Vec<String>>,
}

/// A conditional edge: a decision function picks one of the declared routes.
///
/// An undeclared symbol at run time is fatal ([`Error::Routing`]); it cannot
/// be verified at build time because the symbol comes from run-time data.
///
/// [`Error::Routing`]: crate::error::Error::Routing
pub struct ConditionalEdge {
    /// Source node name.
    pub from: Arc<String>,
    /// Decision function evaluated against the post-merge snapshot.
    pub condition: RouteFn,
    /// Declared symbol -> target map. Never empty after compilation.
    pub routes: HashMap<String, Arc<String>>,
    /// Route symbol the executor forces when this edge closes a cycle and
    /// the cycle's iteration bound is reached.
    pub exit_route: Option<String>,
}

impl ConditionalEdge {
    /// Evaluate the decision function against a snapshot.
    #[must_use]
    pub fn evaluate(&self, snapshot: &StateSnapshot) -> String {
        (self.condition)(snapshot)
    }

    /// Target for a route symbol, if declared.
    #[must_use]
    pub fn target(&self, symbol: &str) -> Option<&Arc<String>> {
        self.routes.get(symbol)
    }
}

impl fmt::Debug for ConditionalEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionalEdge")
            .field("from", &self.from)
            .field("routes", &self.routes)
            .field("exit_route", &self.exit_route)
            .finish_non_exhaustive()
    }
}

/// A dynamic fan-out edge: a planner expands one activation into N
/// independent instances of the worker node, one per emitted [`WorkItem`].
///
/// The planner runs once per activation of the source node, against the
/// post-merge snapshot. Zero items is legal: execution proceeds as if all
/// spawned branches (none) completed immediately.
pub struct FanOutEdge {
    /// Source node name.
    pub from: Arc<String>,
    /// Planner producing the work items.
    pub planner: PlanFn,
    /// Worker node instantiated once per work item.
    pub worker: Arc<String>,
}

impl FanOutEdge {
    /// Run the planner against a snapshot.
    #[must_use]
    pub fn plan(&self, snapshot: &StateSnapshot) -> Vec<WorkItem> {
        (self.planner)(snapshot)
    }
}

impl fmt::Debug for FanOutEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanOutEdge")
            .field("from", &self.from)
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

/// Opaque payload handed to one fan-out worker instance.
///
/// The spawn index lives in [`NodeContext`](crate::node::NodeContext), not
/// here: emission order is assigned by the executor when the plan expands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Planner-chosen payload for this worker.
    pub payload: Value,
}

impl WorkItem {
    /// Wrap a payload as a work item.
    #[must_use]
    pub fn new(payload: Value) -> Self {
        Self { payload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;
    use serde_json::json;

    #[test]
    fn test_conditional_edge_evaluate_and_target() {
        let mut routes = HashMap::new();
        routes.insert("pass".to_string(), Arc::new("improve".to_string()));
        routes.insert("fail".to_string(), Arc::new(END.to_string()));

        let edge = ConditionalEdge {
            from: Arc::new("gate".to_string()),
            condition: Box::new(|snapshot| {
                if snapshot.contains_key("joke") {
                    "pass".to_string()
                } else {
                    "fail".to_string()
                }
            }),
            routes,
            exit_route: None,
        };

        let with_joke = State::new().with("joke", json!("why did...")).snapshot();
        assert_eq!(edge.evaluate(&with_joke), "pass");
        assert_eq!(edge.target("pass").unwrap().as_str(), "improve");

        let without = State::new().snapshot();
        assert_eq!(edge.evaluate(&without), "fail");
        assert!(edge.target("nope").is_none());
    }

    #[test]
    fn test_fanout_edge_plans_from_snapshot() {
        let edge = FanOutEdge {
            from: Arc::new("orchestrator".to_string()),
            planner: Box::new(|snapshot| {
                snapshot
                    .get("sections")
                    .and_then(Value::as_array)
                    .map(|sections| {
                        sections
                            .iter()
                            .map(|s| WorkItem::new(s.clone()))
                            .collect()
                    })
                    .unwrap_or_default()
            }),
            worker: Arc::new("worker".to_string()),
        };

        let state = State::new().with("sections", json!(["intro", "body"]));
        let items = edge.plan(&state.snapshot());
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].payload, json!("intro"));

        let empty = edge.plan(&State::new().snapshot());
        assert!(empty.is_empty());
    }

    #[test]
    fn test_end_is_reserved_name() {
        assert_eq!(END, "__end__");
    }
}
