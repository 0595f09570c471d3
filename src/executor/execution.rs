// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The superstep loop.
//!
//! A run holds a frontier of node instances. Each superstep executes the
//! whole frontier concurrently against one immutable snapshot, then merges
//! the resulting fragments in spawn order under the graph's merge schema,
//! then routes each frontier member to compute the next frontier. Nodes
//! never observe each other's writes within a superstep; all cross-node
//! visibility happens at the merge boundary.
//!
//! Routing priority per node: conditional edge, then fan-out edge, then
//! parallel edges, then the plain edge. A node with no outgoing edge
//! terminates its branch implicitly.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::{CompiledGraph, ExecutionResult};
use crate::edge::{ConditionalEdge, WorkItem, END};
use crate::error::{Error, Result, RunFailure};
use crate::event::{GraphCallback, GraphEvent};
use crate::metrics::LocalMetricsBatch;
use crate::node::{NodeContext, NodeEntry};
use crate::state::{State, StateFragment, StateSnapshot};

/// One scheduled activation of a node within a superstep.
///
/// Fan-out workers from the same planner share a name but differ in
/// `spawn_index`; everything else carries spawn index 0.
#[derive(Clone)]
struct NodeInstance {
    name: Arc<String>,
    spawn_index: usize,
    work_item: Option<WorkItem>,
}

impl NodeInstance {
    fn plain(name: Arc<String>) -> Self {
        Self {
            name,
            spawn_index: 0,
            work_item: None,
        }
    }
}

impl CompiledGraph {
    /// Run the graph to completion on the given input state.
    ///
    /// On failure the returned [`RunFailure`] carries the state as of the
    /// last completed superstep boundary; a failing superstep's fragments
    /// are never visible in it.
    pub async fn invoke(&self, input: State) -> std::result::Result<ExecutionResult, RunFailure> {
        let request_id = Arc::new(Uuid::new_v4().to_string());
        let span = info_span!(
            "graph.invoke",
            graph = %self.graph_name,
            request_id = %request_id,
        );

        // Updated at every superstep boundary so failures (including a
        // graph timeout, which drops the run future) can report the last
        // consistent state.
        let last_state = Arc::new(Mutex::new(input.clone()));
        // Counters fold in here at the same boundaries, so a timed-out run
        // still accounts for the supersteps it completed.
        let run_batch = Arc::new(Mutex::new(LocalMetricsBatch::new()));

        self.emit(&GraphEvent::GraphStart {
            graph_name: Arc::clone(&self.graph_name),
            request_id: Arc::clone(&request_id),
        });

        let started = Instant::now();
        let fut = self
            .superstep_loop(
                input,
                Arc::clone(&request_id),
                Arc::clone(&last_state),
                Arc::clone(&run_batch),
            )
            .instrument(span);

        let outcome = match self.graph_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::Timeout(limit)),
            },
            None => fut.await,
        };

        let mut batch = std::mem::take(&mut *run_batch.lock());
        let completed_supersteps = batch.supersteps as usize;
        batch.record_run_duration(started.elapsed());
        if outcome.is_err() {
            batch.record_failure();
        }
        self.metrics.apply(batch);

        match outcome {
            Ok(result) => {
                info!(
                    graph = %self.graph_name,
                    request_id = %request_id,
                    supersteps = result.supersteps,
                    "graph run complete"
                );
                self.emit(&GraphEvent::GraphEnd {
                    request_id,
                    supersteps: result.supersteps,
                    error: None,
                });
                Ok(result)
            }
            Err(error) => {
                warn!(
                    graph = %self.graph_name,
                    request_id = %request_id,
                    error = %error,
                    "graph run aborted"
                );
                self.emit(&GraphEvent::GraphEnd {
                    request_id,
                    supersteps: completed_supersteps,
                    error: Some(error.to_string()),
                });
                let partial_state = last_state.lock().clone();
                Err(RunFailure {
                    error,
                    partial_state,
                })
            }
        }
    }

    async fn superstep_loop(
        &self,
        input: State,
        request_id: Arc<String>,
        last_state: Arc<Mutex<State>>,
        run_batch: Arc<Mutex<LocalMetricsBatch>>,
    ) -> Result<ExecutionResult> {
        let mut state = input;
        let mut frontier = vec![NodeInstance::plain(Arc::clone(&self.entry))];
        let mut cycle_visits: HashMap<String, usize> = HashMap::new();
        let mut nodes_executed: Vec<Arc<String>> = Vec::new();
        let mut superstep: usize = 0;

        while !frontier.is_empty() {
            if superstep >= self.superstep_limit as usize {
                return Err(Error::SuperstepLimit {
                    limit: self.superstep_limit,
                });
            }
            superstep += 1;
            // Counters stay local to this superstep; they fold into the
            // run batch only once the boundary is reached, so a failing
            // superstep contributes nothing.
            let mut step_batch = LocalMetricsBatch::new();
            step_batch.record_superstep();
            debug!(superstep, frontier = frontier.len(), "superstep start");
            self.emit(&GraphEvent::SuperstepStart {
                superstep,
                frontier: frontier.iter().map(|i| Arc::clone(&i.name)).collect(),
            });

            let snapshot = state.snapshot();
            let fragments = if frontier.len() == 1 {
                vec![self.run_single(&frontier[0], snapshot, &mut step_batch).await?]
            } else {
                self.run_parallel(&frontier, snapshot, &mut step_batch).await?
            };

            // Merge in spawn order. Output-key enforcement happens before
            // any of the instance's entries land in the state.
            for (instance, fragment) in frontier.iter().zip(fragments) {
                let entry = self.node_entry(&instance.name)?;
                for (key, _) in fragment.iter() {
                    if !entry.allows_key(key) {
                        return Err(Error::UndeclaredOutputKey {
                            node: (*instance.name).clone(),
                            key: key.clone(),
                        });
                    }
                }
                state.apply(fragment, &self.schema)?;
                nodes_executed.push(Arc::clone(&instance.name));
            }
            *last_state.lock() = state.clone();
            run_batch.lock().merge(step_batch);
            self.emit(&GraphEvent::SuperstepEnd { superstep });

            // Route against the post-merge snapshot.
            let snapshot = state.snapshot();
            let mut next: Vec<NodeInstance> = Vec::new();
            let mut seen: HashSet<Arc<String>> = HashSet::new();
            let mut route_batch = LocalMetricsBatch::new();
            for instance in &frontier {
                self.successors(
                    &instance.name,
                    &snapshot,
                    &mut cycle_visits,
                    &mut next,
                    &mut seen,
                    &mut route_batch,
                )?;
            }
            run_batch.lock().merge(route_batch);
            frontier = next;
        }

        Ok(ExecutionResult {
            final_state: state,
            supersteps: superstep,
            nodes_executed,
            cycle_iterations: cycle_visits,
            request_id,
        })
    }

    fn node_entry(&self, name: &str) -> Result<&NodeEntry> {
        self.nodes
            .get(name)
            .ok_or_else(|| Error::NodeNotFound(name.to_string()))
    }

    async fn run_single(
        &self,
        instance: &NodeInstance,
        snapshot: StateSnapshot,
        batch: &mut LocalMetricsBatch,
    ) -> Result<StateFragment> {
        let entry = self.node_entry(&instance.name)?.clone();
        execute_instance(
            entry,
            instance.clone(),
            snapshot,
            self.node_timeout,
            &self.callbacks,
            batch,
        )
        .await
    }

    /// Execute a multi-instance frontier on spawned tasks, bounded by the
    /// parallelism semaphore. Results come back in spawn order; on error
    /// all tasks are still awaited so the first error in spawn order wins
    /// deterministically.
    async fn run_parallel(
        &self,
        frontier: &[NodeInstance],
        snapshot: StateSnapshot,
        batch: &mut LocalMetricsBatch,
    ) -> Result<Vec<StateFragment>> {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel_tasks));
        let mut handles = Vec::with_capacity(frontier.len());

        for instance in frontier {
            let entry = self.node_entry(&instance.name)?.clone();
            let instance = instance.clone();
            let snapshot = snapshot.clone();
            let semaphore = Arc::clone(&semaphore);
            let callbacks = self.callbacks.clone();
            let node_timeout = self.node_timeout;
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|e| {
                    Error::InternalExecution(format!("parallelism semaphore closed: {e}"))
                })?;
                let mut task_batch = LocalMetricsBatch::new();
                let fragment = execute_instance(
                    entry,
                    instance,
                    snapshot,
                    node_timeout,
                    &callbacks,
                    &mut task_batch,
                )
                .await?;
                Ok::<_, Error>((fragment, task_batch))
            }));
        }

        let mut fragments = Vec::with_capacity(handles.len());
        let mut first_error: Option<Error> = None;
        for joined in future::join_all(handles).await {
            match joined {
                Ok(Ok((fragment, task_batch))) => {
                    batch.merge(task_batch);
                    fragments.push(fragment);
                }
                Ok(Err(error)) => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
                Err(join_error) => {
                    if first_error.is_none() {
                        first_error =
                            Some(Error::InternalExecution(format!("node task panicked: {join_error}")));
                    }
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(fragments),
        }
    }

    /// Append the successors of one frontier member to the next frontier.
    ///
    /// Plain activations are deduplicated by node name so a fan-in target
    /// with several completing parents activates once. Fan-out worker
    /// instances are never deduplicated.
    fn successors(
        &self,
        from: &Arc<String>,
        snapshot: &StateSnapshot,
        cycle_visits: &mut HashMap<String, usize>,
        next: &mut Vec<NodeInstance>,
        seen: &mut HashSet<Arc<String>>,
        batch: &mut LocalMetricsBatch,
    ) -> Result<()> {
        let push_plain = |target: Arc<String>, next: &mut Vec<NodeInstance>, seen: &mut HashSet<Arc<String>>| {
            if target.as_str() != END && seen.insert(Arc::clone(&target)) {
                next.push(NodeInstance::plain(target));
            }
        };

        if let Some(edge) = self.conditional_edges.iter().find(|e| *e.from == **from) {
            let target = self.resolve_conditional(edge, snapshot, cycle_visits, batch)?;
            push_plain(target, next, seen);
            return Ok(());
        }

        if let Some(edge) = self.fanout_edges.iter().find(|e| *e.from == **from) {
            let items = edge.plan(snapshot);
            batch.record_fanout(from, items.len() as u64);
            debug!(node = %from, worker = %edge.worker, items = items.len(), "fan-out planned");
            self.emit(&GraphEvent::FanOutPlanned {
                node: Arc::clone(from),
                worker: Arc::clone(&edge.worker),
                items: items.clone(),
            });
            if items.is_empty() {
                // No work: skip the worker stage and continue from where
                // the workers would have routed.
                return self.successors(&edge.worker, snapshot, cycle_visits, next, seen, batch);
            }
            for (index, item) in items.into_iter().enumerate() {
                next.push(NodeInstance {
                    name: Arc::clone(&edge.worker),
                    spawn_index: index,
                    work_item: Some(item),
                });
            }
            return Ok(());
        }

        if let Some(edge) = self.parallel_edges.iter().find(|e| *e.from == **from) {
            for target in edge.to.iter() {
                push_plain(Arc::new(target.clone()), next, seen);
            }
            return Ok(());
        }

        if let Some(edge) = self.edges.iter().find(|e| *e.from == **from) {
            push_plain(Arc::clone(&edge.to), next, seen);
        }

        // No outgoing edge: implicit END for this branch.
        Ok(())
    }

    fn resolve_conditional(
        &self,
        edge: &ConditionalEdge,
        snapshot: &StateSnapshot,
        cycle_visits: &mut HashMap<String, usize>,
        batch: &mut LocalMetricsBatch,
    ) -> Result<Arc<String>> {
        if let Some(exit) = &edge.exit_route {
            let visits = cycle_visits.entry((*edge.from).clone()).or_insert(0);
            *visits += 1;
            if *visits >= self.max_cycle_iterations {
                let target = edge.target(exit).ok_or_else(|| {
                    Error::InternalExecution(format!(
                        "exit route '{exit}' missing from routes of '{}'",
                        edge.from
                    ))
                })?;
                batch.record_forced_exit(&edge.from);
                info!(
                    node = %edge.from,
                    iterations = *visits,
                    exit_route = %exit,
                    "cycle bound reached, forcing exit route"
                );
                self.emit(&GraphEvent::CycleBoundReached {
                    node: Arc::clone(&edge.from),
                    iterations: *visits,
                    exit_route: exit.clone(),
                });
                return Ok(Arc::clone(target));
            }
        }

        let symbol = edge.evaluate(snapshot);
        let target = edge
            .target(&symbol)
            .ok_or_else(|| Error::Routing {
                node: (*edge.from).clone(),
                symbol: symbol.clone(),
            })?
            .clone();
        batch.record_routing(&edge.from, &symbol);
        debug!(node = %edge.from, symbol = %symbol, target = %target, "routing decision");
        self.emit(&GraphEvent::RoutingDecision {
            node: Arc::clone(&edge.from),
            symbol: symbol.clone(),
            target: Arc::clone(&target),
            alternatives: edge
                .routes
                .keys()
                .filter(|s| **s != symbol)
                .cloned()
                .collect(),
        });
        Ok(target)
    }
}

/// Run one node instance against the superstep snapshot.
///
/// Free function so the parallel path can move it onto a spawned task.
async fn execute_instance(
    entry: NodeEntry,
    instance: NodeInstance,
    snapshot: StateSnapshot,
    node_timeout: Option<Duration>,
    callbacks: &[Arc<dyn GraphCallback>],
    batch: &mut LocalMetricsBatch,
) -> Result<StateFragment> {
    emit_all(
        callbacks,
        &GraphEvent::NodeStart {
            node: Arc::clone(&instance.name),
            spawn_index: instance.spawn_index,
        },
    );

    let ctx = NodeContext::new(
        Arc::clone(&instance.name),
        instance.spawn_index,
        instance.work_item.clone(),
    );
    let started = Instant::now();
    let fut = entry.node.compute(snapshot, ctx);
    let outcome = match node_timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(limit)),
        },
        None => fut.await,
    };
    let elapsed = started.elapsed();

    match outcome {
        Ok(fragment) => {
            batch.record_node(&instance.name, elapsed);
            emit_all(
                callbacks,
                &GraphEvent::NodeEnd {
                    node: Arc::clone(&instance.name),
                    spawn_index: instance.spawn_index,
                    duration: elapsed,
                },
            );
            Ok(fragment)
        }
        Err(error) => {
            warn!(node = %instance.name, error = %error, "node failed");
            emit_all(
                callbacks,
                &GraphEvent::NodeError {
                    node: Arc::clone(&instance.name),
                    spawn_index: instance.spawn_index,
                    message: error.to_string(),
                },
            );
            Err(Error::NodeExecution {
                node: (*instance.name).clone(),
                source: Box::new(error),
            })
        }
    }
}

fn emit_all(callbacks: &[Arc<dyn GraphCallback>], event: &GraphEvent) {
    for callback in callbacks {
        callback.on_event(event);
    }
}
