// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Graph-structured execution for agent workflows.
//!
//! A workflow is a directed graph of async nodes sharing a key/value
//! [`State`](state::State). Build it with [`StateGraph`](graph::StateGraph),
//! compile it once, run it many times:
//!
//! ```rust,ignore
//! use stategraph::prelude::*;
//!
//! let mut graph = StateGraph::new();
//! graph.add_node_from_fn("generate", &["joke"], |snapshot, _ctx| {
//!     Box::pin(async move {
//!         let topic = snapshot.get_str("topic").unwrap_or("cats").to_string();
//!         Ok(StateFragment::new().with("joke", json!(format!("A joke about {topic}"))))
//!     })
//! });
//! graph.set_entry_point("generate");
//! graph.add_edge("generate", END);
//!
//! let app = graph.compile()?;
//! let result = app.invoke(State::new().with("topic", json!("rust"))).await?;
//! ```
//!
//! Execution proceeds in supersteps: every node in the current frontier
//! runs concurrently against one immutable snapshot, the fragments they
//! return merge deterministically under per-key
//! [`MergePolicy`](state::MergePolicy)s, and routing against the merged
//! state produces the next frontier. Conditional edges branch, parallel
//! edges fan out statically, fan-out edges spawn one worker per planned
//! [`WorkItem`](edge::WorkItem), and conditional edges with a declared
//! exit route close bounded cycles.
//!
//! Model-backed nodes go through [`GenerationService`](generation::GenerationService);
//! [`agent::agent_graph`] wires the standard model-plus-tools loop.

pub mod agent;
pub mod edge;
pub mod error;
pub mod event;
pub mod executor;
pub mod generation;
pub mod graph;
pub mod metrics;
pub mod node;
pub mod state;
pub mod tools;

pub use edge::{WorkItem, END};
pub use error::{ActionableError, ActionableSuggestion, Error, Result, RunFailure};
pub use executor::{CompiledGraph, ExecutionResult};
pub use graph::StateGraph;
pub use node::{Node, NodeContext, NodeFuture};
pub use state::{MergePolicy, State, StateFragment, StateSnapshot};

/// Common imports for building and running graphs.
pub mod prelude {
    pub use crate::edge::{WorkItem, END};
    pub use crate::error::{Error, Result, RunFailure};
    pub use crate::event::{GraphCallback, GraphEvent};
    pub use crate::executor::{CompiledGraph, ExecutionResult};
    pub use crate::generation::{
        GenerationRequest, GenerationResponse, GenerationService, Message, Role, ToolCall,
        ToolDefinition,
    };
    pub use crate::graph::StateGraph;
    pub use crate::node::{Node, NodeContext, NodeFuture};
    pub use crate::state::{MergePolicy, State, StateFragment, StateSnapshot};
    pub use crate::tools::{FunctionTool, Tool, ToolRegistry};
}
