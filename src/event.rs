// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Execution observability events.
//!
//! The executor emits a [`GraphEvent`] at each significant point of a run:
//! graph start and end, superstep boundaries, node activations, routing
//! decisions, fan-out planning and cycle bound hits. Consumers register a
//! [`GraphCallback`] on the compiled graph; events are delivered inline on
//! the executor task, so callbacks should be cheap and must never block.

use std::sync::Arc;
use std::time::Duration;

use crate::edge::WorkItem;

/// One observable moment in a graph run.
#[derive(Debug, Clone)]
pub enum GraphEvent {
    /// A run began. `request_id` is unique per `invoke` call.
    GraphStart {
        graph_name: Arc<String>,
        request_id: Arc<String>,
    },
    /// A superstep is about to execute the listed frontier.
    SuperstepStart {
        superstep: usize,
        frontier: Vec<Arc<String>>,
    },
    /// A superstep finished and its fragments were merged.
    SuperstepEnd { superstep: usize },
    /// A node instance began computing.
    NodeStart {
        node: Arc<String>,
        spawn_index: usize,
    },
    /// A node instance finished successfully.
    NodeEnd {
        node: Arc<String>,
        spawn_index: usize,
        duration: Duration,
    },
    /// A node instance returned an error. The run will abort after this.
    NodeError {
        node: Arc<String>,
        spawn_index: usize,
        message: String,
    },
    /// A conditional edge resolved to a route.
    RoutingDecision {
        node: Arc<String>,
        symbol: String,
        target: Arc<String>,
        /// Route symbols that were declared but not taken.
        alternatives: Vec<String>,
    },
    /// A fan-out planner produced its work items.
    FanOutPlanned {
        node: Arc<String>,
        worker: Arc<String>,
        items: Vec<WorkItem>,
    },
    /// A cycle hit its iteration bound and the exit route was forced.
    CycleBoundReached {
        node: Arc<String>,
        iterations: usize,
        exit_route: String,
    },
    /// The run ended. `error` carries the failure message, if any.
    GraphEnd {
        request_id: Arc<String>,
        supersteps: usize,
        error: Option<String>,
    },
}

/// Receiver for [`GraphEvent`]s during a run.
pub trait GraphCallback: Send + Sync {
    fn on_event(&self, event: &GraphEvent);
}

impl<F> GraphCallback for F
where
    F: Fn(&GraphEvent) + Send + Sync,
{
    fn on_event(&self, event: &GraphEvent) {
        self(event)
    }
}

/// Records every event it sees. Test helper.
#[derive(Default)]
pub struct RecordingCallback {
    events: parking_lot::Mutex<Vec<GraphEvent>>,
}

impl RecordingCallback {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events recorded so far.
    pub fn events(&self) -> Vec<GraphEvent> {
        self.events.lock().clone()
    }
}

impl GraphCallback for RecordingCallback {
    fn on_event(&self, event: &GraphEvent) {
        self.events.lock().push(event.clone());
    }
}
