#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Integration tests for the standard agent workflow patterns.
//!
//! Each test builds a small graph the way an application would: sequential
//! chains with quality gates, static parallel sections, content routing,
//! dynamic orchestrator/worker fan-out and bounded refinement loops. Model
//! calls go through a scripted `MockGenerationService` so runs are fully
//! deterministic.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use stategraph::generation::{
    GenerationError, GenerationRequest, GenerationResponse, GenerationService, Message,
    MockGenerationService,
};
use stategraph::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn constant_node(
    key: &'static str,
    value: Value,
) -> impl Fn(StateSnapshot, NodeContext) -> NodeFuture {
    move |_snapshot, _ctx| {
        let value = value.clone();
        Box::pin(async move { Ok(StateFragment::new().with(key, value)) })
    }
}

/// Sequential chain with a quality gate: `generate -> gate -> polish`.
/// The gate predicate fails, so the run terminates early and the final
/// state has `generate`'s key but never `polish`'s.
#[tokio::test]
async fn quality_gate_failure_terminates_early() {
    init_tracing();
    let mut graph = StateGraph::new();
    graph.add_node_from_fn(
        "generate",
        &["joke"],
        constant_node("joke", json!("a joke with no punchline")),
    );
    graph.add_node_from_fn("polish", &["final_joke"], |snapshot: StateSnapshot, _ctx| {
        Box::pin(async move {
            let joke = snapshot.get_str("joke").unwrap_or_default().to_string();
            Ok(StateFragment::new().with("final_joke", json!(format!("{joke}!!"))))
        })
    });
    graph.set_entry_point("generate");
    graph.add_conditional_edges(
        "generate",
        |snapshot: &StateSnapshot| {
            let joke = snapshot.get_str("joke").unwrap_or_default();
            if joke.contains('?') || joke.contains('!') {
                "pass".to_string()
            } else {
                "fail".to_string()
            }
        },
        [("pass", "polish"), ("fail", END)],
    );
    graph.add_edge("polish", END);

    let app = graph.compile().unwrap();
    let result = app.invoke(State::new()).await.unwrap();

    assert!(result.final_state.contains_key("joke"));
    assert!(!result.final_state.contains_key("final_joke"));
    assert_eq!(result.supersteps, 1);
}

/// The same gate passing runs the full chain.
#[tokio::test]
async fn quality_gate_pass_runs_full_chain() {
    let mut graph = StateGraph::new();
    graph.add_node_from_fn(
        "generate",
        &["joke"],
        constant_node("joke", json!("why did the crab cross the road?")),
    );
    graph.add_node_from_fn("polish", &["final_joke"], |snapshot: StateSnapshot, _ctx| {
        Box::pin(async move {
            let joke = snapshot.get_str("joke").unwrap_or_default().to_string();
            Ok(StateFragment::new().with("final_joke", json!(format!("{joke} (polished)"))))
        })
    });
    graph.set_entry_point("generate");
    graph.add_conditional_edges(
        "generate",
        |snapshot: &StateSnapshot| {
            if snapshot.get_str("joke").unwrap_or_default().contains('?') {
                "pass".to_string()
            } else {
                "fail".to_string()
            }
        },
        [("pass", "polish"), ("fail", END)],
    );
    graph.add_edge("polish", END);

    let app = graph.compile().unwrap();
    let result = app.invoke(State::new()).await.unwrap();
    assert!(result
        .final_state
        .get_str("final_joke")
        .unwrap()
        .ends_with("(polished)"));
}

/// Static parallel section: three independent writers feed one aggregator.
/// Whatever order the three actually finish in, the aggregator sees all
/// three keys populated.
#[tokio::test]
async fn parallel_fan_in_sees_all_branch_outputs() {
    let mut graph = StateGraph::new();
    graph.add_node_from_fn("start", &[], |_s, _c| {
        Box::pin(async { Ok(StateFragment::new()) })
    });
    // Deliberately uneven completion times.
    for (name, delay_ms) in [("joke", 30u64), ("story", 1), ("poem", 15)] {
        graph.add_node_from_fn(name, &[name], move |_snapshot, ctx: NodeContext| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(StateFragment::new()
                    .with(ctx.node.as_str(), json!(format!("{} text", ctx.node))))
            })
        });
    }
    graph.add_node_from_fn("aggregator", &["combined"], |snapshot: StateSnapshot, _ctx| {
        Box::pin(async move {
            for key in ["joke", "story", "poem"] {
                assert!(snapshot.contains_key(key), "missing branch output {key}");
            }
            let combined = format!(
                "{} | {} | {}",
                snapshot.get_str("joke").unwrap(),
                snapshot.get_str("story").unwrap(),
                snapshot.get_str("poem").unwrap(),
            );
            Ok(StateFragment::new().with("combined", json!(combined)))
        })
    });
    graph.set_entry_point("start");
    graph.add_parallel_edges("start", ["joke", "story", "poem"]);
    for branch in ["joke", "story", "poem"] {
        graph.add_edge(branch, "aggregator");
    }
    graph.add_edge("aggregator", END);

    let app = graph.compile().unwrap();
    let result = app.invoke(State::new()).await.unwrap();
    assert_eq!(
        result.final_state.get_str("combined"),
        Some("joke text | story text | poem text")
    );
    // start, the three branches, aggregator once.
    assert_eq!(result.supersteps, 3);
    assert_eq!(result.nodes_executed.len(), 5);
}

/// Content routing: a classifier picks exactly one downstream handler.
#[tokio::test]
async fn router_selects_single_handler() {
    for (kind, expected) in [("story", "once upon a time"), ("joke", "knock knock"), ("poem", "roses are red")] {
        let mut graph = StateGraph::new();
        graph.add_node_from_fn("classify", &["kind"], constant_node("kind", json!(kind)));
        graph.add_node_from_fn("story", &["out"], constant_node("out", json!("once upon a time")));
        graph.add_node_from_fn("joke", &["out"], constant_node("out", json!("knock knock")));
        graph.add_node_from_fn("poem", &["out"], constant_node("out", json!("roses are red")));
        graph.set_entry_point("classify");
        graph.add_conditional_edges(
            "classify",
            |snapshot: &StateSnapshot| snapshot.get_str("kind").unwrap_or_default().to_string(),
            [("story", "story"), ("joke", "joke"), ("poem", "poem")],
        );
        for handler in ["story", "joke", "poem"] {
            graph.add_edge(handler, END);
        }

        let app = graph.compile().unwrap();
        let result = app.invoke(State::new()).await.unwrap();
        assert_eq!(result.final_state.get_str("out"), Some(expected));
        // classify plus exactly one handler.
        assert_eq!(result.nodes_executed.len(), 2);
    }
}

/// Dynamic fan-out: a planner emits four tagged work items, the engine
/// spawns four worker instances, and the accumulate key collects exactly
/// four entries in spawn-index order, independent of completion order.
#[tokio::test]
async fn orchestrator_worker_accumulates_in_spawn_order() {
    init_tracing();
    let mut graph = StateGraph::new();
    graph.declare_key("sections", MergePolicy::Accumulate);
    graph.add_node_from_fn(
        "orchestrator",
        &["plan"],
        constant_node("plan", json!(["A", "A", "B", "C"])),
    );
    graph.add_node_from_fn("worker", &["sections"], |_snapshot, ctx: NodeContext| {
        Box::pin(async move {
            let tag = ctx.work_item.as_ref().unwrap().payload.clone();
            // Later spawn indexes finish first.
            let delay = 40u64.saturating_sub(10 * ctx.spawn_index as u64);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(StateFragment::new().with(
                "sections",
                json!([format!("{}-{}", tag.as_str().unwrap(), ctx.spawn_index)]),
            ))
        })
    });
    graph.add_node_from_fn("synthesize", &["report"], |snapshot: StateSnapshot, _ctx| {
        Box::pin(async move {
            let sections = snapshot.get("sections").cloned().unwrap_or(json!([]));
            Ok(StateFragment::new().with("report", sections))
        })
    });
    graph.set_entry_point("orchestrator");
    graph.add_fanout_edge(
        "orchestrator",
        |snapshot: &StateSnapshot| {
            snapshot
                .get("plan")
                .and_then(Value::as_array)
                .map(|tags| tags.iter().cloned().map(WorkItem::new).collect())
                .unwrap_or_default()
        },
        "worker",
    );
    graph.add_edge("worker", "synthesize");
    graph.add_edge("synthesize", END);

    let app = graph.compile().unwrap();
    let result = app.invoke(State::new()).await.unwrap();
    assert_eq!(
        result.final_state.get("report"),
        Some(&json!(["A-0", "A-1", "B-2", "C-3"]))
    );
}

/// Bounded refinement loop where the predicate accepts on iteration 2 with
/// a bound of 5: the loop runs exactly 2 iterations and exits through the
/// predicate's declared route.
#[tokio::test]
async fn refinement_loop_exits_via_predicate() {
    let mut graph = StateGraph::new();
    graph.declare_key("drafts", MergePolicy::Accumulate);
    graph.add_node_from_fn("optimize", &["drafts"], |snapshot: StateSnapshot, _ctx| {
        Box::pin(async move {
            let version = snapshot
                .get("drafts")
                .and_then(Value::as_array)
                .map_or(0, Vec::len)
                + 1;
            Ok(StateFragment::new().with("drafts", json!([format!("v{version}")])))
        })
    });
    graph.add_node_from_fn("evaluate", &["verdict"], |snapshot: StateSnapshot, _ctx| {
        Box::pin(async move {
            let drafts = snapshot
                .get("drafts")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            let verdict = if drafts >= 2 { "optimized" } else { "again" };
            Ok(StateFragment::new().with("verdict", json!(verdict)))
        })
    });
    graph.set_entry_point("optimize");
    graph.add_edge("optimize", "evaluate");
    graph.add_conditional_edges_with_exit(
        "evaluate",
        |snapshot: &StateSnapshot| snapshot.get_str("verdict").unwrap_or("again").to_string(),
        [("again", "optimize"), ("optimized", END)],
        "optimized",
    );

    let app = graph.compile().unwrap().with_max_cycle_iterations(5);
    let result = app.invoke(State::new()).await.unwrap();
    assert_eq!(result.cycle_iterations_for("evaluate"), 2);
    assert_eq!(
        result.final_state.get("drafts"),
        Some(&json!(["v1", "v2"]))
    );
}

/// Bound exhaustion: the predicate never accepts, the bound is 3, so the
/// loop runs exactly 3 iterations and force-exits through the declared
/// exit route.
#[tokio::test]
async fn refinement_loop_force_exits_at_bound() {
    let mut graph = StateGraph::new();
    graph.declare_key("drafts", MergePolicy::Accumulate);
    graph.add_node_from_fn("optimize", &["drafts"], |_snapshot, _ctx| {
        Box::pin(async { Ok(StateFragment::new().with("drafts", json!(["draft"]))) })
    });
    graph.add_node_from_fn("evaluate", &["verdict"], constant_node("verdict", json!("again")));
    graph.set_entry_point("optimize");
    graph.add_edge("optimize", "evaluate");
    graph.add_conditional_edges_with_exit(
        "evaluate",
        |snapshot: &StateSnapshot| snapshot.get_str("verdict").unwrap_or("again").to_string(),
        [("again", "optimize"), ("optimized", END)],
        "optimized",
    );

    let app = graph.compile().unwrap().with_max_cycle_iterations(3);
    let result = app.invoke(State::new()).await.unwrap();
    assert_eq!(result.cycle_iterations_for("evaluate"), 3);
    assert_eq!(
        result.final_state.get("drafts"),
        Some(&json!(["draft", "draft", "draft"]))
    );
}

/// Linear chains populate exactly the union of declared output keys.
#[tokio::test]
async fn linear_chain_populates_all_declared_keys() {
    let mut graph = StateGraph::new();
    graph.add_node_from_fn("a", &["ka"], constant_node("ka", json!(1)));
    graph.add_node_from_fn("b", &["kb"], constant_node("kb", json!(2)));
    graph.add_node_from_fn("c", &["kc"], constant_node("kc", json!(3)));
    graph.set_entry_point("a");
    graph.add_edge("a", "b");
    graph.add_edge("b", "c");
    graph.add_edge("c", END);

    let app = graph.compile().unwrap();
    let result = app.invoke(State::new()).await.unwrap();
    let keys: Vec<&str> = result.final_state.keys().collect();
    assert_eq!(keys, vec!["ka", "kb", "kc"]);
    assert_eq!(result.supersteps, 3);
}

/// A model-backed chain: generate a joke with the generation service, gate
/// it, then improve it with a second call. Scripted responses keep the run
/// deterministic.
#[tokio::test]
async fn prompt_chain_with_generation_service() {
    let service: Arc<dyn GenerationService> = Arc::new(MockGenerationService::new(vec![
        GenerationResponse::Text("Why did the cat sit on the laptop?".to_string()),
        GenerationResponse::Text("Why did the cat sit on the laptop? To keep an eye on the mouse!".to_string()),
    ]));

    let mut graph = StateGraph::new();
    let generate_service = Arc::clone(&service);
    graph.add_node_from_fn("generate", &["joke"], move |snapshot, _ctx| {
        let service = Arc::clone(&generate_service);
        Box::pin(async move {
            let topic = snapshot.get_str("topic").unwrap_or("cats").to_string();
            let request = GenerationRequest::from_messages(vec![Message::human(format!(
                "Write a short joke about {topic}"
            ))]);
            match service.generate(request).await.map_err(Error::from)? {
                GenerationResponse::Text(text) => {
                    Ok(StateFragment::new().with("joke", json!(text)))
                }
                other => Err(Error::InternalExecution(format!(
                    "unexpected response: {other:?}"
                ))),
            }
        })
    });
    let improve_service = Arc::clone(&service);
    graph.add_node_from_fn("improve", &["final_joke"], move |snapshot, _ctx| {
        let service = Arc::clone(&improve_service);
        Box::pin(async move {
            let joke = snapshot.get_str("joke").unwrap_or_default().to_string();
            let request = GenerationRequest::from_messages(vec![Message::human(format!(
                "Add a punchline: {joke}"
            ))]);
            match service.generate(request).await.map_err(Error::from)? {
                GenerationResponse::Text(text) => {
                    Ok(StateFragment::new().with("final_joke", json!(text)))
                }
                other => Err(Error::InternalExecution(format!(
                    "unexpected response: {other:?}"
                ))),
            }
        })
    });
    graph.set_entry_point("generate");
    graph.add_conditional_edges(
        "generate",
        |snapshot: &StateSnapshot| {
            if snapshot.get_str("joke").unwrap_or_default().contains('?') {
                "pass".to_string()
            } else {
                "fail".to_string()
            }
        },
        [("pass", "improve"), ("fail", END)],
    );
    graph.add_edge("improve", END);

    let app = graph.compile().unwrap().with_name("joke_chain");
    let result = app
        .invoke(State::new().with("topic", json!("cats")))
        .await
        .unwrap();
    assert!(result
        .final_state
        .get_str("final_joke")
        .unwrap()
        .contains("mouse"));
}

/// Structured generation: a grader node requests a schema-conforming
/// response and unpacks it into state keys.
#[tokio::test]
async fn structured_response_round_trip() {
    let service = Arc::new(MockGenerationService::new(vec![
        GenerationResponse::Structured(json!({
            "grade": "Fail",
            "feedback": "needs a punchline"
        })),
    ]));

    let grade_schema = json!({
        "type": "object",
        "properties": {
            "grade": {"type": "string", "enum": ["Pass", "Fail"]},
            "feedback": {"type": "string"}
        },
        "required": ["grade", "feedback"]
    });

    let mut graph = StateGraph::new();
    let grader_service = Arc::clone(&service);
    let grader_schema = grade_schema.clone();
    graph.add_node_from_fn("grade", &["grade", "feedback"], move |snapshot, _ctx| {
        let service = Arc::clone(&grader_service);
        let schema = grader_schema.clone();
        Box::pin(async move {
            let joke = snapshot.get_str("joke").unwrap_or_default().to_string();
            let request = GenerationRequest::from_messages(vec![Message::human(format!(
                "Grade this joke: {joke}"
            ))])
            .with_response_schema(schema);
            match service.generate(request).await.map_err(Error::from)? {
                GenerationResponse::Structured(value) => Ok(StateFragment::new()
                    .with("grade", value["grade"].clone())
                    .with("feedback", value["feedback"].clone())),
                other => Err(Error::InternalExecution(format!(
                    "unexpected response: {other:?}"
                ))),
            }
        })
    });
    graph.set_entry_point("grade");
    graph.add_edge("grade", END);

    let app = graph.compile().unwrap();
    let result = app
        .invoke(State::new().with("joke", json!("a joke")))
        .await
        .unwrap();
    assert_eq!(result.final_state.get_str("grade"), Some("Fail"));
    assert_eq!(
        result.final_state.get_str("feedback"),
        Some("needs a punchline")
    );
    // The schema travelled on the request.
    let requests = service.requests();
    assert_eq!(requests[0].response_schema, Some(grade_schema));
}

/// A schema-conformance failure from the generation service aborts the run
/// and surfaces through the failing node, with the pre-failure state intact.
#[tokio::test]
async fn schema_conformance_failure_aborts_run() {
    let service = Arc::new(MockGenerationService::with_script(vec![Err(
        GenerationError::SchemaConformance("missing field 'grade'".to_string()),
    )]));

    let mut graph = StateGraph::new();
    graph.add_node_from_fn("draft", &["joke"], constant_node("joke", json!("a joke")));
    let grader_service = Arc::clone(&service);
    graph.add_node_from_fn("grade", &["grade"], move |_snapshot, _ctx| {
        let service = Arc::clone(&grader_service);
        Box::pin(async move {
            let request = GenerationRequest::from_messages(vec![Message::human("grade it")])
                .with_response_schema(json!({"type": "object"}));
            match service.generate(request).await.map_err(Error::from)? {
                GenerationResponse::Structured(value) => {
                    Ok(StateFragment::new().with("grade", value))
                }
                other => Err(Error::InternalExecution(format!(
                    "unexpected response: {other:?}"
                ))),
            }
        })
    });
    graph.set_entry_point("draft");
    graph.add_edge("draft", "grade");
    graph.add_edge("grade", END);

    let app = graph.compile().unwrap();
    let failure = app.invoke(State::new()).await.unwrap_err();

    match &failure.error {
        Error::NodeExecution { node, source } => {
            assert_eq!(node, "grade");
            let inner = source
                .downcast_ref::<Error>()
                .expect("source should be the engine error");
            assert!(matches!(
                inner,
                Error::Generation(GenerationError::SchemaConformance(_))
            ));
        }
        other => panic!("expected NodeExecution, got {other:?}"),
    }
    // The superstep that completed before the failure is preserved.
    assert_eq!(failure.partial_state.get_str("joke"), Some("a joke"));
    assert!(!failure.partial_state.contains_key("grade"));
}

/// Callbacks observe the run in order: graph start, supersteps, node
/// lifecycle, routing decisions, graph end.
#[tokio::test]
async fn callbacks_observe_run_lifecycle() {
    use stategraph::event::RecordingCallback;

    let recorder = Arc::new(RecordingCallback::new());
    let mut graph = StateGraph::new();
    graph.add_node_from_fn("classify", &["kind"], constant_node("kind", json!("story")));
    graph.add_node_from_fn("story", &["out"], constant_node("out", json!("tale")));
    graph.set_entry_point("classify");
    graph.add_conditional_edges(
        "classify",
        |snapshot: &StateSnapshot| snapshot.get_str("kind").unwrap_or_default().to_string(),
        [("story", "story")],
    );
    graph.add_edge("story", END);

    let callback: Arc<dyn GraphCallback> = recorder.clone();
    let app = graph.compile().unwrap().with_callback(callback);
    app.invoke(State::new()).await.unwrap();

    let events = recorder.events();
    assert!(matches!(events.first(), Some(GraphEvent::GraphStart { .. })));
    assert!(matches!(events.last(), Some(GraphEvent::GraphEnd { error: None, .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, GraphEvent::RoutingDecision { symbol, .. } if symbol == "story")));
    let node_ends = events
        .iter()
        .filter(|e| matches!(e, GraphEvent::NodeEnd { .. }))
        .count();
    assert_eq!(node_ends, 2);
}

/// Metrics aggregate across runs of the same compiled graph.
#[tokio::test]
async fn metrics_aggregate_across_runs() {
    let mut graph = StateGraph::new();
    graph.add_node_from_fn("only", &["x"], constant_node("x", json!(1)));
    graph.set_entry_point("only");
    graph.add_edge("only", END);

    let app = graph.compile().unwrap();
    for _ in 0..3 {
        app.invoke(State::new()).await.unwrap();
    }
    let snapshot = app.metrics().snapshot();
    assert_eq!(snapshot.runs, 3);
    assert_eq!(snapshot.failed_runs, 0);
    assert_eq!(snapshot.supersteps, 3);
    assert_eq!(snapshot.node_activations, 3);
    assert!(snapshot.node_durations.contains_key("only"));
}
