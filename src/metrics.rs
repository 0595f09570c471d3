// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! In-process execution metrics.
//!
//! Each run accumulates counters into a [`LocalMetricsBatch`] without any
//! locking, then applies the whole batch to the shared [`ExecutionMetrics`]
//! under a single lock acquisition at the end of the run. Parallel node
//! tasks record their timings into per-task batches that are folded into
//! the run's batch when the superstep joins.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Aggregate metrics across all runs of a compiled graph.
#[derive(Debug, Default, Clone)]
pub struct MetricsSnapshot {
    /// Completed runs, successful or not.
    pub runs: u64,
    /// Runs that ended in an error.
    pub failed_runs: u64,
    /// Total supersteps across all runs.
    pub supersteps: u64,
    /// Node activations (fan-out workers count once per instance).
    pub node_activations: u64,
    /// Conditional routing decisions taken, by `node:symbol`.
    pub routing_decisions: HashMap<String, u64>,
    /// Work items spawned by fan-out planners, by planner node.
    pub fanout_spawns: HashMap<String, u64>,
    /// Cycle bound hits, by conditional node.
    pub forced_exits: HashMap<String, u64>,
    /// Cumulative compute time per node across all activations.
    pub node_durations: HashMap<String, Duration>,
    /// Cumulative wall-clock time across all runs.
    pub total_duration: Duration,
}

/// Shared, thread-safe metrics store for a compiled graph.
#[derive(Debug, Default)]
pub struct ExecutionMetrics {
    inner: Mutex<MetricsSnapshot>,
}

impl ExecutionMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Apply a run's batch under one lock acquisition.
    pub fn apply(&self, batch: LocalMetricsBatch) {
        let mut snap = self.inner.lock();
        snap.runs += 1;
        if batch.failed {
            snap.failed_runs += 1;
        }
        snap.supersteps += batch.supersteps;
        snap.node_activations += batch.node_activations;
        snap.total_duration += batch.run_duration;
        for (key, count) in batch.routing_decisions {
            *snap.routing_decisions.entry(key).or_default() += count;
        }
        for (node, count) in batch.fanout_spawns {
            *snap.fanout_spawns.entry(node).or_default() += count;
        }
        for (node, count) in batch.forced_exits {
            *snap.forced_exits.entry(node).or_default() += count;
        }
        for (node, duration) in batch.node_durations {
            *snap.node_durations.entry(node).or_default() += duration;
        }
    }

    /// Copy of the current aggregates.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().clone()
    }
}

/// Lock-free per-run accumulator, applied to [`ExecutionMetrics`] once.
#[derive(Debug, Default)]
pub struct LocalMetricsBatch {
    pub(crate) failed: bool,
    pub(crate) supersteps: u64,
    pub(crate) node_activations: u64,
    pub(crate) routing_decisions: HashMap<String, u64>,
    pub(crate) fanout_spawns: HashMap<String, u64>,
    pub(crate) forced_exits: HashMap<String, u64>,
    pub(crate) node_durations: HashMap<String, Duration>,
    pub(crate) run_duration: Duration,
}

impl LocalMetricsBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_superstep(&mut self) {
        self.supersteps += 1;
    }

    pub fn record_node(&mut self, node: &str, duration: Duration) {
        self.node_activations += 1;
        *self.node_durations.entry(node.to_string()).or_default() += duration;
    }

    pub fn record_routing(&mut self, node: &str, symbol: &str) {
        *self
            .routing_decisions
            .entry(format!("{node}:{symbol}"))
            .or_default() += 1;
    }

    pub fn record_fanout(&mut self, node: &str, items: u64) {
        *self.fanout_spawns.entry(node.to_string()).or_default() += items;
    }

    pub fn record_forced_exit(&mut self, node: &str) {
        *self.forced_exits.entry(node.to_string()).or_default() += 1;
    }

    pub fn record_failure(&mut self) {
        self.failed = true;
    }

    pub fn record_run_duration(&mut self, duration: Duration) {
        self.run_duration = duration;
    }

    /// Fold another batch into this one. Used when joining parallel tasks
    /// and when a superstep's counters reach the run batch at the boundary.
    /// `failed` and `run_duration` are run-level and do not fold.
    pub fn merge(&mut self, other: LocalMetricsBatch) {
        self.supersteps += other.supersteps;
        self.node_activations += other.node_activations;
        for (key, count) in other.routing_decisions {
            *self.routing_decisions.entry(key).or_default() += count;
        }
        for (node, count) in other.fanout_spawns {
            *self.fanout_spawns.entry(node).or_default() += count;
        }
        for (node, count) in other.forced_exits {
            *self.forced_exits.entry(node).or_default() += count;
        }
        for (node, duration) in other.node_durations {
            *self.node_durations.entry(node).or_default() += duration;
        }
    }
}
