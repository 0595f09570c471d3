// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Error types for stategraph
//!
//! This module provides actionable error messages for AI agents. All errors
//! include:
//! 1. What went wrong
//! 2. Why it's a problem
//! 3. How to fix it (with code snippets when applicable)

use std::fmt;
use thiserror::Error;

use crate::generation::GenerationError;
use crate::state::State;

/// An actionable suggestion for fixing an error, including optional code snippets.
///
/// AI agents can use this to understand how to fix issues without searching documentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionableSuggestion {
    /// Human-readable explanation of the fix
    pub description: String,
    /// Optional code snippet showing the fix
    pub code_snippet: Option<String>,
}

impl ActionableSuggestion {
    /// Create a new suggestion with just a description
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            code_snippet: None,
        }
    }

    /// Add a code snippet to the suggestion
    #[must_use]
    pub fn with_code_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.code_snippet = Some(snippet.into());
        self
    }
}

impl fmt::Display for ActionableSuggestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description)?;
        if let Some(snippet) = &self.code_snippet {
            write!(f, "\n\n```rust{}\n```", snippet)?;
        }
        Ok(())
    }
}

/// Trait for errors that provide actionable suggestions with code snippets.
///
/// AI agents can call `suggestion()` to get detailed fix instructions.
pub trait ActionableError {
    /// Returns an actionable suggestion for fixing this error, if available.
    fn suggestion(&self) -> Option<ActionableSuggestion>;

    /// Returns true if this error has an actionable suggestion.
    fn has_suggestion(&self) -> bool {
        self.suggestion().is_some()
    }

    /// Formats the error with its suggestion for display.
    fn format_with_suggestion(&self) -> String
    where
        Self: fmt::Display,
    {
        let base = self.to_string();
        match self.suggestion() {
            Some(suggestion) => format!("{}\n\nHow to fix:\n{}", base, suggestion),
            None => base,
        }
    }
}

/// stategraph error types
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    /// Graph has no entry point
    #[error("Graph has no entry point defined")]
    NoEntryPoint,

    /// No path from the entry point reaches END
    #[error("No path from entry point '{entry}' reaches END. Add an edge to END or a conditional route that can terminate.")]
    NoTerminalPath {
        /// The declared entry point.
        entry: String,
    },

    /// Duplicate node name
    #[error("Node '{0}' already exists in graph")]
    DuplicateNode(String),

    /// A node was given more than one unconditional outgoing edge
    #[error("Node '{0}' already has an unconditional outgoing edge. Only the first would ever be followed; use add_parallel_edges for static fan-out.")]
    DuplicateEdge(String),

    /// Edge references a node that was never declared
    #[error("Edge from '{from}' references undeclared node '{to}'")]
    DanglingEdge {
        /// Source node of the offending edge.
        from: String,
        /// The undeclared node the edge points at.
        to: String,
    },

    /// Conditional edge declared with an empty or unusable routing map
    #[error("Conditional edge from '{0}' has no declared routes. Every conditional edge needs a non-empty symbol -> node map.")]
    IncompleteRoutingMap(String),

    /// Node not found at execution time
    #[error("Node '{0}' not found in graph")]
    NodeNotFound(String),

    /// A conditional decision function returned a symbol with no declared target
    #[error("Conditional edge from '{node}' returned '{symbol}' but no route exists for it")]
    Routing {
        /// Node whose conditional edge was evaluated.
        node: String,
        /// The symbol the decision function returned.
        symbol: String,
    },

    /// Node execution error
    #[error("Node execution error in '{node}': {source}")]
    NodeExecution {
        /// Name of the node that failed.
        node: String,
        /// The underlying error that occurred.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A node produced a fragment key outside its declared output keys
    #[error("Node '{node}' wrote undeclared output key '{key}'. Declare it in the node's output keys.")]
    UndeclaredOutputKey {
        /// Node that produced the fragment.
        node: String,
        /// The offending key.
        key: String,
    },

    /// Generation service error
    #[error("Generation service error: {0}")]
    Generation(#[from] GenerationError),

    /// Execution timeout
    #[error("Execution timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// Superstep limit exceeded
    #[error("Superstep limit of {limit} reached. Graph execution exceeded maximum number of supersteps. This may indicate an unbounded cycle. Use with_superstep_limit() to increase the limit if needed.")]
    SuperstepLimit {
        /// The superstep limit that was exceeded.
        limit: u32,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal execution error (should not happen in normal operation)
    #[error("Internal execution error: {0}")]
    InternalExecution(String),
}

/// Result type for stategraph operations
pub type Result<T> = std::result::Result<T, Error>;

/// A run that aborted, carrying the last consistent state.
///
/// Fatal conditions during execution (routing failures, node errors,
/// generation-service errors) terminate the run immediately. The caller gets
/// the triggering [`Error`] plus the state as it stood before the failing
/// superstep's merge — never a partially merged one.
#[derive(Debug)]
pub struct RunFailure {
    /// The error that aborted the run.
    pub error: Error,
    /// State at the last consistent superstep boundary.
    pub partial_state: State,
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run aborted: {}", self.error)
    }
}

impl std::error::Error for RunFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl ActionableError for Error {
    fn suggestion(&self) -> Option<ActionableSuggestion> {
        match self {
            Error::NoEntryPoint => Some(
                ActionableSuggestion::new(
                    "Set an entry point for your graph using set_entry_point()",
                )
                .with_code_snippet(
                    r#"
let mut graph = StateGraph::new();
graph.add_node_from_fn("start", &["greeting"], start_node);
graph.set_entry_point("start");  // <-- Add this
graph.add_edge("start", END);
"#,
                ),
            ),

            Error::NoTerminalPath { entry } => Some(
                ActionableSuggestion::new(format!(
                    "Give the graph a way to finish from '{}'",
                    entry
                ))
                .with_code_snippet(
                    r#"
// Either end a chain explicitly:
graph.add_edge("last_node", END);

// Or route a conditional branch to END:
graph.add_conditional_edges("gate", predicate, [("pass", "next"), ("fail", END)]);
"#,
                ),
            ),

            Error::DuplicateNode(name) => Some(
                ActionableSuggestion::new("Use a unique name for each node").with_code_snippet(
                    format!(
                        r#"
graph.add_node_from_fn("{}_v2", &["out"], new_node);
"#,
                        name
                    ),
                ),
            ),

            Error::DuplicateEdge(from) => Some(
                ActionableSuggestion::new(format!(
                    "Node '{}' can only have one unconditional edge. For static fan-out, declare the targets together.",
                    from
                ))
                .with_code_snippet(format!(
                    r#"
graph.add_parallel_edges("{}", ["target_a", "target_b"]);
"#,
                    from
                )),
            ),

            Error::DanglingEdge { to, .. } => Some(
                ActionableSuggestion::new(format!(
                    "Add the missing node '{}' before wiring edges to it",
                    to
                ))
                .with_code_snippet(format!(
                    r#"
graph.add_node_from_fn("{}", &["out"], node_impl);
"#,
                    to
                )),
            ),

            Error::IncompleteRoutingMap(node) => Some(
                ActionableSuggestion::new(format!(
                    "Declare the full symbol -> node map for the conditional edge at '{}'",
                    node
                ))
                .with_code_snippet(
                    r#"
graph.add_conditional_edges(
    "gate",
    |snapshot| if ok(snapshot) { "pass".into() } else { "fail".into() },
    [("pass", "next_node"), ("fail", END)],
);
"#,
                ),
            ),

            Error::Routing { node, symbol } => Some(
                ActionableSuggestion::new(format!(
                    "The decision function at '{}' returned '{}'. Only symbols in the declared route map are legal.",
                    node, symbol
                ))
                .with_code_snippet(format!(
                    r#"
// Either add the route:
graph.add_conditional_edges("{}", decision, [("{}", "some_node"), ...]);

// Or fix the decision function to return a declared symbol.
"#,
                    node, symbol
                )),
            ),

            Error::UndeclaredOutputKey { node, key } => Some(
                ActionableSuggestion::new(format!(
                    "Declare '{}' among the output keys of node '{}'",
                    key, node
                ))
                .with_code_snippet(format!(
                    r#"
graph.add_node_from_fn("{}", &["{}"], node_impl);
"#,
                    node, key
                )),
            ),

            Error::SuperstepLimit { limit } => Some(
                ActionableSuggestion::new(format!(
                    "Superstep limit of {} reached. This may indicate an unbounded cycle.",
                    limit
                ))
                .with_code_snippet(format!(
                    r#"
// Option 1: Increase the limit if your graph legitimately needs more steps
let app = graph.compile()?.with_superstep_limit({});

// Option 2: Bound the cycle itself
let app = graph.compile()?.with_max_cycle_iterations(5);
"#,
                    limit * 2
                )),
            ),

            Error::Timeout(duration) => Some(
                ActionableSuggestion::new(format!(
                    "Increase the timeout (currently {:?}) or optimize your nodes",
                    duration
                ))
                .with_code_snippet(
                    r#"
// Option 1: Increase the timeout
let app = graph.compile()?.with_graph_timeout(Duration::from_secs(600));

// Option 2: Disable timeouts entirely (reference behavior)
let app = graph.compile()?.without_timeouts();
"#,
                ),
            ),

            // Errors without specific suggestions
            Error::NodeNotFound(_)
            | Error::NodeExecution { .. }
            | Error::Generation(_)
            | Error::Serialization(_)
            | Error::InternalExecution(_) => None,
        }
    }
}
