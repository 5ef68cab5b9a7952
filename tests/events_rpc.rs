//! Event stream guarantees and the RPC surface.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use runloom::engine::EnqueueOptions;
use runloom::event::{EventFilter, RunEventKind};
use runloom::flow::{Edge, Flow, FlowGraph, Node};
use runloom::rpc::{Request, Response, RpcService, StreamMessage};
use runloom::types::RunStatus;

mod common;
use common::*;

fn three_node_flow(flow_id: &str) -> Flow {
    Flow::new(
        flow_id,
        flow_id,
        FlowGraph::new("a")
            .with_node(Node::new("a", "set").with_config(json!({"name": "x", "value": 1})))
            .with_node(Node::new("b", "set").with_config(json!({"name": "y", "value": 2})))
            .with_node(Node::new("c", "test"))
            .with_edge(Edge::new("a", "b"))
            .with_edge(Edge::new("b", "c")),
    )
}

#[tokio::test]
async fn subscribers_see_events_in_persisted_order() {
    let engine = start_engine().await;
    engine.storage().flows.save(three_node_flow("f1")).await.unwrap();

    let mut stream = engine.subscribe(EventFilter::all());
    let (run_id, _) = engine
        .enqueue_run("f1", EnqueueOptions::default())
        .await
        .unwrap();
    wait_for_status(&engine, &run_id, RunStatus::Succeeded).await;

    let persisted = engine.get_events(&run_id).await.unwrap();
    assert_dense_seq(&persisted);

    let mut streamed = Vec::new();
    while streamed.len() < persisted.len() {
        let event = stream
            .next_timeout(Duration::from_secs(1))
            .await
            .expect("streamed event");
        streamed.push(event);
    }
    assert_eq!(streamed, persisted);
    engine.shutdown().await;
}

#[tokio::test]
async fn run_scoped_subscription_filters_other_runs() {
    let engine = start_engine().await;
    engine.storage().flows.save(single_node_flow("f1", "succeed")).await.unwrap();

    // Pause-on-start parks the target run so the scoped subscription is in
    // place before the interesting events flow.
    let (target, _) = engine
        .enqueue_run("f1", EnqueueOptions::default().with_pause_on_start())
        .await
        .unwrap();
    wait_for_status(&engine, &target, RunStatus::Paused).await;
    let mut scoped = engine.subscribe(EventFilter::run(target.clone()));

    // Noise from an unrelated run.
    let (noise, _) = engine
        .enqueue_run("f1", EnqueueOptions::default())
        .await
        .unwrap();
    wait_for_status(&engine, &noise, RunStatus::Succeeded).await;

    engine.resume_run(&target).await.unwrap();
    wait_for_status(&engine, &target, RunStatus::Succeeded).await;

    let mut seen = 0usize;
    while let Some(event) = scoped.next_timeout(Duration::from_millis(100)).await {
        assert_eq!(event.run_id, target);
        seen += 1;
    }
    assert!(seen > 0, "scoped stream saw nothing");
    engine.shutdown().await;
}

#[tokio::test]
async fn rpc_enqueue_and_query_round_trip() {
    let engine = Arc::new(start_engine().await);
    engine.storage().flows.save(three_node_flow("f1")).await.unwrap();
    let service = RpcService::new(engine.clone());
    let conn = service.open_connection();

    // Subscribe to everything before enqueueing.
    assert_eq!(
        service.handle(&conn, Request::Subscribe { run_id: None }).await,
        Response::Ok
    );

    let response = service
        .handle(
            &conn,
            Request::EnqueueRun {
                flow_id: "f1".into(),
                args: None,
                start_node_id: None,
                debug: None,
                priority: None,
            },
        )
        .await;
    let run_id = match response {
        Response::Enqueued { run_id, position } => {
            assert_eq!(position, 0);
            run_id
        }
        other => panic!("unexpected response: {other:?}"),
    };

    wait_for_status(&engine, &run_id, RunStatus::Succeeded).await;

    // The connection received the full stream as envelopes.
    let mut seen = Vec::new();
    while let Some(StreamMessage::Event { event }) =
        conn.next_timeout(Duration::from_millis(200)).await
    {
        seen.push(event);
    }
    assert!(!seen.is_empty());
    assert_eq!(seen[0].kind.type_name(), "run.queued");

    match service.handle(&conn, Request::GetRun { run_id: run_id.clone() }).await {
        Response::Run { run } => assert_eq!(run.unwrap().status, RunStatus::Succeeded),
        other => panic!("unexpected response: {other:?}"),
    }
    match service
        .handle(&conn, Request::GetEvents { run_id: run_id.clone() })
        .await
    {
        Response::Events { events } => {
            assert_dense_seq(&events);
            assert_eq!(events.len(), seen.len());
        }
        other => panic!("unexpected response: {other:?}"),
    }
    match service.handle(&conn, Request::ListQueue).await {
        Response::Queue { items } => assert!(items.is_empty()),
        other => panic!("unexpected response: {other:?}"),
    }
    match service
        .handle(
            &conn,
            Request::ListRuns {
                status: Some(RunStatus::Succeeded),
            },
        )
        .await
    {
        Response::Runs { runs } => assert_eq!(runs.len(), 1),
        other => panic!("unexpected response: {other:?}"),
    }
    engine.shutdown().await;
}

#[tokio::test]
async fn rpc_errors_are_relayed_with_typed_codes() {
    let engine = Arc::new(start_engine().await);
    let service = RpcService::new(engine.clone());
    let conn = service.open_connection();

    let response = service
        .handle(
            &conn,
            Request::EnqueueRun {
                flow_id: "missing".into(),
                args: None,
                start_node_id: None,
                debug: None,
                priority: None,
            },
        )
        .await;
    match response {
        Response::Error { error } => {
            assert_eq!(error.code, runloom::error::ErrorCode::FlowNotFound);
        }
        other => panic!("unexpected response: {other:?}"),
    }
    engine.shutdown().await;
}

#[tokio::test]
async fn unsubscribed_connections_receive_nothing() {
    let engine = Arc::new(start_engine().await);
    engine.storage().flows.save(single_node_flow("f1", "succeed")).await.unwrap();
    let service = RpcService::new(engine.clone());
    let conn = service.open_connection();
    // No Subscribe request issued.

    let (run_id, _) = engine
        .enqueue_run("f1", EnqueueOptions::default())
        .await
        .unwrap();
    wait_for_status(&engine, &run_id, RunStatus::Succeeded).await;
    assert!(conn.next_timeout(Duration::from_millis(100)).await.is_none());
    engine.shutdown().await;
}

#[tokio::test]
async fn vars_patch_events_carry_ordered_ops() {
    let engine = start_engine().await;
    engine.storage().flows.save(three_node_flow("f1")).await.unwrap();
    let (run_id, _) = engine
        .enqueue_run("f1", EnqueueOptions::default())
        .await
        .unwrap();
    wait_for_status(&engine, &run_id, RunStatus::Succeeded).await;

    let events = engine.get_events(&run_id).await.unwrap();
    let patched: Vec<&str> = events
        .iter()
        .filter_map(|e| match &e.kind {
            RunEventKind::VarsPatch { node_id, .. } => Some(node_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(patched, vec!["a", "b"]);
    engine.shutdown().await;
}
