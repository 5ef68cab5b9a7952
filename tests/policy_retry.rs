//! Policy behavior through the walker: retries, timeouts, and error
//! routing over labeled edges.

use serde_json::json;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use runloom::engine::{Engine, EnqueueOptions};
use runloom::error::ErrorCode;
use runloom::event::RunEventKind;
use runloom::flow::{
    Edge, EdgeLabel, ErrorPolicy, Flow, FlowGraph, GotoTarget, Node, NodePolicy, RetryPolicy,
    TimeoutPolicy, TimeoutScope,
};
use runloom::plugin::NodeDefinition;
use runloom::storage::StoragePort;
use runloom::types::RunStatus;

mod common;
use common::*;

async fn engine_with_flaky(remaining_failures: u32) -> (Engine, Arc<AtomicU32>) {
    let counter = Arc::new(AtomicU32::new(remaining_failures));
    let registry = test_registry();
    registry.register(NodeDefinition::new(
        "flaky",
        Arc::new(Flaky {
            remaining_failures: counter.clone(),
        }),
    ));
    let engine = Engine::start(fast_config(), StoragePort::in_memory(), registry)
        .await
        .unwrap();
    (engine, counter)
}

fn retry_policy(retries: u32) -> NodePolicy {
    NodePolicy::default()
        .with_retry(RetryPolicy {
            retries,
            interval_ms: 0,
            ..RetryPolicy::default()
        })
        .with_on_error(ErrorPolicy::Retry { r#override: None })
}

#[tokio::test]
async fn retry_recovers_after_transient_failures() {
    let (engine, _counter) = engine_with_flaky(2).await;
    let flow = Flow::new(
        "flaky-flow",
        "flaky",
        FlowGraph::new("n").with_node(Node::new("n", "flaky").with_policy(retry_policy(3))),
    );
    engine.storage().flows.save(flow).await.unwrap();

    let (run_id, _) = engine
        .enqueue_run("flaky-flow", EnqueueOptions::default())
        .await
        .unwrap();
    wait_for_status(&engine, &run_id, RunStatus::Succeeded).await;

    let events = engine.get_events(&run_id).await.unwrap();
    let attempts: Vec<u32> = events
        .iter()
        .filter_map(|e| match &e.kind {
            RunEventKind::NodeStarted { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    let decisions: Vec<String> = events
        .iter()
        .filter_map(|e| match &e.kind {
            RunEventKind::NodeFailed { decision, .. } => Some(decision.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(decisions, vec!["retry", "retry"]);
    engine.shutdown().await;
}

#[tokio::test]
async fn exhausted_retry_budget_fails_the_run() {
    let (engine, _counter) = engine_with_flaky(10).await;
    let flow = Flow::new(
        "hopeless",
        "hopeless",
        FlowGraph::new("n").with_node(Node::new("n", "flaky").with_policy(retry_policy(1))),
    );
    engine.storage().flows.save(flow).await.unwrap();

    let (run_id, _) = engine
        .enqueue_run("hopeless", EnqueueOptions::default())
        .await
        .unwrap();
    let run = wait_for_status(&engine, &run_id, RunStatus::Failed).await;
    assert_eq!(run.error.unwrap().code, ErrorCode::ToolError);

    let events = engine.get_events(&run_id).await.unwrap();
    let decisions: Vec<String> = events
        .iter()
        .filter_map(|e| match &e.kind {
            RunEventKind::NodeFailed { decision, .. } => Some(decision.clone()),
            _ => None,
        })
        .collect();
    // Two attempts: one retry decision, then stop.
    assert_eq!(decisions, vec!["retry", "stop"]);
    engine.shutdown().await;
}

#[tokio::test]
async fn on_error_edge_routes_without_policy() {
    let engine = start_engine().await;
    let flow = Flow::new(
        "fallback",
        "fallback",
        FlowGraph::new("risky")
            .with_node(Node::new("risky", "test").with_config(json!({"action": "fail"})))
            .with_node(Node::new("rescue", "set").with_config(json!({"name": "rescued", "value": true})))
            .with_edge(Edge::labeled("risky", "rescue", EdgeLabel::OnError)),
    );
    engine.storage().flows.save(flow).await.unwrap();

    let (run_id, _) = engine
        .enqueue_run("fallback", EnqueueOptions::default())
        .await
        .unwrap();
    wait_for_status(&engine, &run_id, RunStatus::Succeeded).await;

    let events = engine.get_events(&run_id).await.unwrap();
    let rescued = events.iter().any(
        |e| matches!(&e.kind, RunEventKind::NodeSucceeded { node_id, .. } if node_id == "rescue"),
    );
    assert!(rescued);
    let decision = events.iter().find_map(|e| match &e.kind {
        RunEventKind::NodeFailed { decision, .. } => Some(decision.clone()),
        _ => None,
    });
    assert_eq!(decision.as_deref(), Some("onErrorEdge"));
    engine.shutdown().await;
}

#[tokio::test]
async fn continue_policy_advances_past_failures() {
    let engine = start_engine().await;
    let flow = Flow::new(
        "tolerant",
        "tolerant",
        FlowGraph::new("risky")
            .with_node(
                Node::new("risky", "test")
                    .with_config(json!({"action": "fail"}))
                    .with_policy(NodePolicy::default().with_on_error(ErrorPolicy::Continue)),
            )
            .with_node(Node::new("after", "test"))
            .with_edge(Edge::new("risky", "after")),
    );
    engine.storage().flows.save(flow).await.unwrap();

    let (run_id, _) = engine
        .enqueue_run("tolerant", EnqueueOptions::default())
        .await
        .unwrap();
    wait_for_status(&engine, &run_id, RunStatus::Succeeded).await;
    engine.shutdown().await;
}

#[tokio::test]
async fn goto_policy_jumps_to_a_named_node() {
    let engine = start_engine().await;
    let flow = Flow::new(
        "jumpy",
        "jumpy",
        FlowGraph::new("risky")
            .with_node(
                Node::new("risky", "test")
                    .with_config(json!({"action": "fail"}))
                    .with_policy(NodePolicy::default().with_on_error(ErrorPolicy::Goto {
                        target: GotoTarget::Node {
                            node_id: "handler".into(),
                        },
                    })),
            )
            .with_node(Node::new("never", "test"))
            .with_node(Node::new("handler", "test"))
            .with_edge(Edge::new("risky", "never")),
    );
    engine.storage().flows.save(flow).await.unwrap();

    let (run_id, _) = engine
        .enqueue_run("jumpy", EnqueueOptions::default())
        .await
        .unwrap();
    wait_for_status(&engine, &run_id, RunStatus::Succeeded).await;

    let events = engine.get_events(&run_id).await.unwrap();
    let ran_handler = events.iter().any(
        |e| matches!(&e.kind, RunEventKind::NodeSucceeded { node_id, .. } if node_id == "handler"),
    );
    let ran_never = events.iter().any(
        |e| matches!(&e.kind, RunEventKind::NodeStarted { node_id, .. } if node_id == "never"),
    );
    assert!(ran_handler);
    assert!(!ran_never);
    engine.shutdown().await;
}

#[tokio::test]
async fn attempt_timeout_fires_as_timeout_error() {
    let engine = start_engine().await;
    let flow = Flow::new(
        "slowpoke",
        "slowpoke",
        FlowGraph::new("n").with_node(
            Node::new("n", "test")
                .with_config(json!({"action": "sleep", "ms": 30_000}))
                .with_policy(NodePolicy::default().with_timeout_ms(50)),
        ),
    );
    engine.storage().flows.save(flow).await.unwrap();

    let (run_id, _) = engine
        .enqueue_run("slowpoke", EnqueueOptions::default())
        .await
        .unwrap();
    let run = wait_for_status(&engine, &run_id, RunStatus::Failed).await;
    assert_eq!(run.error.unwrap().code, ErrorCode::Timeout);
    engine.shutdown().await;
}

#[tokio::test]
async fn run_scope_timeout_cancels_the_run() {
    let engine = start_engine().await;
    // Five short sleeps with suspension points between them; the run-scope
    // deadline lands mid-chain and the cancel is observed at the next node
    // boundary.
    let mut graph = FlowGraph::new("n0");
    for i in 0..5 {
        graph = graph.with_node(
            Node::new(format!("n{i}"), "test").with_config(json!({"action": "sleep", "ms": 30})),
        );
        if i > 0 {
            graph = graph.with_edge(Edge::new(format!("n{}", i - 1), format!("n{i}")));
        }
    }
    let flow = Flow::new("bounded", "bounded", graph).with_default_node_policy(NodePolicy {
        timeout: Some(TimeoutPolicy {
            ms: 60,
            scope: TimeoutScope::Run,
        }),
        ..NodePolicy::default()
    });
    engine.storage().flows.save(flow).await.unwrap();

    let (run_id, _) = engine
        .enqueue_run("bounded", EnqueueOptions::default())
        .await
        .unwrap();
    let run = wait_for_status(&engine, &run_id, RunStatus::Canceled).await;
    assert_eq!(run.status, RunStatus::Canceled);
    assert!(engine.list_queue().await.unwrap().is_empty());

    let events = engine.get_events(&run_id).await.unwrap();
    let reason = events.iter().find_map(|e| match &e.kind {
        RunEventKind::RunCanceled { reason } => Some(reason.clone()),
        _ => None,
    });
    assert!(
        reason.flatten().is_some_and(|r| r.contains("run timeout")),
        "expected a run-timeout cancel reason"
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn run_scope_timeout_does_not_arm_the_attempt_timer() {
    let engine = start_engine().await;
    // A single node that finishes well before the run deadline; the run
    // completes normally and the deadline never fires.
    let flow = Flow::new(
        "roomy",
        "roomy",
        FlowGraph::new("n").with_node(
            Node::new("n", "test")
                .with_config(json!({"action": "sleep", "ms": 20}))
                .with_policy(NodePolicy {
                    timeout: Some(TimeoutPolicy {
                        ms: 5_000,
                        scope: TimeoutScope::Run,
                    }),
                    ..NodePolicy::default()
                }),
        ),
    );
    engine.storage().flows.save(flow).await.unwrap();

    let (run_id, _) = engine
        .enqueue_run("roomy", EnqueueOptions::default())
        .await
        .unwrap();
    wait_for_status(&engine, &run_id, RunStatus::Succeeded).await;
    engine.shutdown().await;
}

#[tokio::test]
async fn retry_on_gates_by_error_code() {
    let engine = start_engine().await;
    let flow = Flow::new(
        "gated",
        "gated",
        FlowGraph::new("n").with_node(
            Node::new("n", "test")
                .with_config(json!({"action": "fail"}))
                .with_policy(
                    NodePolicy::default()
                        .with_retry(RetryPolicy {
                            retries: 5,
                            interval_ms: 0,
                            retry_on: Some(vec![ErrorCode::NetworkRequestFailed]),
                            ..RetryPolicy::default()
                        })
                        .with_on_error(ErrorPolicy::Retry { r#override: None }),
                ),
        ),
    );
    engine.storage().flows.save(flow).await.unwrap();

    let (run_id, _) = engine
        .enqueue_run("gated", EnqueueOptions::default())
        .await
        .unwrap();
    // TOOL_ERROR is not in retryOn, so the first failure is terminal.
    let run = wait_for_status(&engine, &run_id, RunStatus::Failed).await;
    assert_eq!(run.error.unwrap().code, ErrorCode::ToolError);

    let events = engine.get_events(&run_id).await.unwrap();
    let starts = events
        .iter()
        .filter(|e| matches!(e.kind, RunEventKind::NodeStarted { .. }))
        .count();
    assert_eq!(starts, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn plugin_default_policy_applies_when_node_has_none() {
    let counter = Arc::new(AtomicU32::new(1));
    let registry = test_registry();
    registry.register(
        NodeDefinition::new(
            "flaky",
            Arc::new(Flaky {
                remaining_failures: counter.clone(),
            }),
        )
        .with_default_policy(retry_policy(2)),
    );
    let engine = Engine::start(fast_config(), StoragePort::in_memory(), registry)
        .await
        .unwrap();

    let flow = Flow::new(
        "defaulted",
        "defaulted",
        FlowGraph::new("n").with_node(Node::new("n", "flaky")),
    );
    engine.storage().flows.save(flow).await.unwrap();

    let (run_id, _) = engine
        .enqueue_run("defaulted", EnqueueOptions::default())
        .await
        .unwrap();
    wait_for_status(&engine, &run_id, RunStatus::Succeeded).await;
    engine.shutdown().await;
}
