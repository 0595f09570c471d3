// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Prebuilt agent graph: a model-call node and a tool-dispatch node joined
//! in a bounded cycle.
//!
//! `call_model` sends the transcript (plus the registry's tool definitions)
//! to the generation service and appends the model's turn. When that turn
//! carries tool calls, the conditional edge routes to `tools`, which
//! executes every call and appends one tool message per call, then loops
//! back to `call_model`. A plain text turn routes to END. The loop edge
//! declares its exit route, so the executor's cycle bound can always force
//! termination.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::edge::END;
use crate::error::{Error, Result};
use crate::executor::CompiledGraph;
use crate::generation::{GenerationRequest, GenerationResponse, GenerationService, Message};
use crate::graph::StateGraph;
use crate::state::{MergePolicy, State, StateFragment, StateSnapshot};
use crate::tools::ToolRegistry;

/// State key holding the transcript, merged with `Accumulate`.
pub const MESSAGES_KEY: &str = "messages";

const CALL_MODEL: &str = "call_model";
const TOOLS: &str = "tools";
const ROUTE_TOOLS: &str = "tools";
const ROUTE_END: &str = "end";

/// Build the initial state for an agent run.
pub fn seed_messages(messages: &[Message]) -> Result<State> {
    let encoded = messages
        .iter()
        .map(serde_json::to_value)
        .collect::<std::result::Result<Vec<Value>, _>>()?;
    Ok(State::new().with(MESSAGES_KEY, Value::Array(encoded)))
}

/// Decode the transcript from a snapshot. Missing key means empty.
pub fn messages_from_snapshot(snapshot: &StateSnapshot) -> Result<Vec<Message>> {
    match snapshot.get(MESSAGES_KEY) {
        Some(value) => Ok(serde_json::from_value(value.clone())?),
        None => Ok(Vec::new()),
    }
}

/// The model's final text answer, if the run ended with one.
pub fn final_answer(state: &State) -> Option<String> {
    let messages: Vec<Message> = serde_json::from_value(state.get(MESSAGES_KEY)?.clone()).ok()?;
    messages
        .iter()
        .rev()
        .find(|m| m.role == crate::generation::Role::Ai && !m.has_tool_calls())
        .map(|m| m.content.clone())
}

fn append_fragment(message: &Message) -> Result<StateFragment> {
    let encoded = serde_json::to_value(message)?;
    Ok(StateFragment::new().with(MESSAGES_KEY, Value::Array(vec![encoded])))
}

fn append_all_fragment(messages: &[Message]) -> Result<StateFragment> {
    let encoded = messages
        .iter()
        .map(serde_json::to_value)
        .collect::<std::result::Result<Vec<Value>, _>>()?;
    Ok(StateFragment::new().with(MESSAGES_KEY, Value::Array(encoded)))
}

/// Compile the two-node agent loop over the given service and tools.
///
/// The caller configures bounds on the returned graph, typically
/// `with_max_cycle_iterations` to cap the number of model turns.
pub fn agent_graph(
    service: Arc<dyn GenerationService>,
    registry: Arc<ToolRegistry>,
) -> Result<CompiledGraph> {
    let mut graph = StateGraph::new();
    graph.declare_key(MESSAGES_KEY, MergePolicy::Accumulate);

    let call_service = Arc::clone(&service);
    let call_registry = Arc::clone(&registry);
    graph.add_node_from_fn(CALL_MODEL, &[MESSAGES_KEY], move |snapshot, _ctx| {
        let service = Arc::clone(&call_service);
        let registry = Arc::clone(&call_registry);
        Box::pin(async move {
            let messages = messages_from_snapshot(&snapshot)?;
            let request =
                GenerationRequest::from_messages(messages).with_tools(registry.definitions());
            let turn = match service.generate(request).await.map_err(Error::from)? {
                GenerationResponse::Text(text) => Message::ai(text),
                GenerationResponse::Structured(value) => Message::ai(value.to_string()),
                GenerationResponse::ToolCalls(calls) => Message::ai_with_tool_calls("", calls),
            };
            append_fragment(&turn)
        })
    });

    let tools_registry = Arc::clone(&registry);
    graph.add_node_from_fn(TOOLS, &[MESSAGES_KEY], move |snapshot, _ctx| {
        let registry = Arc::clone(&tools_registry);
        Box::pin(async move {
            let messages = messages_from_snapshot(&snapshot)?;
            let calls = messages
                .iter()
                .rev()
                .find(|m| m.has_tool_calls())
                .map(|m| m.tool_calls.clone())
                .unwrap_or_default();

            let mut results = Vec::with_capacity(calls.len());
            for call in &calls {
                // Failures go back to the model as tool output so it can
                // recover or rephrase.
                let content = match registry.execute(call).await {
                    Ok(value) => value.to_string(),
                    Err(error) => format!("Error: {error}"),
                };
                debug!(tool = %call.name, id = %call.id, "tool executed");
                results.push(Message::tool(call.id.clone(), content));
            }
            append_all_fragment(&results)
        })
    });

    graph.set_entry_point(CALL_MODEL);
    graph.add_conditional_edges_with_exit(
        CALL_MODEL,
        |snapshot: &StateSnapshot| match messages_from_snapshot(snapshot) {
            Ok(messages) => match messages.last() {
                Some(last) if last.has_tool_calls() => ROUTE_TOOLS.to_string(),
                _ => ROUTE_END.to_string(),
            },
            Err(_) => ROUTE_END.to_string(),
        },
        [(ROUTE_TOOLS, TOOLS), (ROUTE_END, END)],
        ROUTE_END,
    );
    graph.add_edge(TOOLS, CALL_MODEL);

    Ok(graph.compile()?.with_name("agent"))
}
