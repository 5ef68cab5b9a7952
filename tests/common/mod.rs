#![allow(dead_code)]

//! Shared fixtures: test node kinds, engine harness, and event helpers.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use runloom::config::EngineConfig;
use runloom::engine::Engine;
use runloom::error::ErrorInfo;
use runloom::event::RunEvent;
use runloom::flow::{EdgeLabel, Flow, FlowGraph, Node};
use runloom::plugin::{
    ControlDirective, ExecCtx, NodeDefinition, NodeExecutor, NodeOutcome, PluginRegistry,
};
use runloom::storage::StoragePort;
use runloom::types::{RunRecord, RunStatus};

/// `test` kind: `{action: "succeed" | "fail" | "sleep", ms?, outputKey?}`.
pub struct TestAction;

#[async_trait]
impl NodeExecutor for TestAction {
    async fn execute(
        &self,
        ctx: &mut ExecCtx<'_>,
        node: &Node,
    ) -> Result<NodeOutcome, ErrorInfo> {
        let action = node
            .config
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("succeed");
        match action {
            "succeed" => {
                let mut outcome = NodeOutcome::ok();
                if let Some(key) = node.config.get("outputKey").and_then(Value::as_str) {
                    let mut outputs = rustc_hash::FxHashMap::default();
                    outputs.insert(key.to_string(), json!(true));
                    outcome = outcome.with_outputs(outputs);
                }
                Ok(outcome)
            }
            "fail" => Err(ErrorInfo::tool("intentional failure")),
            "sleep" => {
                let ms = node.config.get("ms").and_then(Value::as_u64).unwrap_or(50);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(NodeOutcome::ok())
            }
            other => Err(ErrorInfo::validation(format!("unknown test action `{other}`"))),
        }
        .inspect(|_| ctx.log_info(format!("test action `{action}` done")))
    }
}

/// `set` kind: `{name, value}` writes one variable.
pub struct SetVar;

#[async_trait]
impl NodeExecutor for SetVar {
    async fn execute(
        &self,
        _ctx: &mut ExecCtx<'_>,
        node: &Node,
    ) -> Result<NodeOutcome, ErrorInfo> {
        let name = node
            .config
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ErrorInfo::validation("set requires `name`"))?;
        let value = node.config.get("value").cloned().unwrap_or(Value::Null);
        Ok(NodeOutcome::ok().set_var(name, value))
    }
}

/// `add` kind: `{target, source}` does `vars[target] += vars[source]` on
/// integers, treating missing values as 0.
pub struct AddVar;

#[async_trait]
impl NodeExecutor for AddVar {
    async fn execute(
        &self,
        ctx: &mut ExecCtx<'_>,
        node: &Node,
    ) -> Result<NodeOutcome, ErrorInfo> {
        let target = node
            .config
            .get("target")
            .and_then(Value::as_str)
            .ok_or_else(|| ErrorInfo::validation("add requires `target`"))?;
        let source = node
            .config
            .get("source")
            .and_then(Value::as_str)
            .ok_or_else(|| ErrorInfo::validation("add requires `source`"))?;
        let current = ctx.vars.get(target).and_then(Value::as_i64).unwrap_or(0);
        let addend = ctx.vars.get(source).and_then(Value::as_i64).unwrap_or(0);
        Ok(NodeOutcome::ok().set_var(target, json!(current + addend)))
    }
}

/// `control` kind: returns the control directive embedded in its config.
pub struct EmitControl;

#[async_trait]
impl NodeExecutor for EmitControl {
    async fn execute(
        &self,
        _ctx: &mut ExecCtx<'_>,
        node: &Node,
    ) -> Result<NodeOutcome, ErrorInfo> {
        let directive: ControlDirective =
            serde_json::from_value(node.config.get("directive").cloned().unwrap_or(Value::Null))
                .map_err(|e| ErrorInfo::validation(format!("bad directive: {e}")))?;
        Ok(NodeOutcome::ok().with_control(directive))
    }
}

/// `route` kind: `{label}` follows the labeled edge, or `{end: true}` ends.
pub struct Route;

#[async_trait]
impl NodeExecutor for Route {
    async fn execute(
        &self,
        _ctx: &mut ExecCtx<'_>,
        node: &Node,
    ) -> Result<NodeOutcome, ErrorInfo> {
        if node.config.get("end").and_then(Value::as_bool) == Some(true) {
            return Ok(NodeOutcome::ok().end());
        }
        let label = node
            .config
            .get("label")
            .and_then(Value::as_str)
            .ok_or_else(|| ErrorInfo::validation("route requires `label` or `end`"))?;
        Ok(NodeOutcome::ok().follow(EdgeLabel::parse(label)))
    }
}

/// `record` kind: `{mark}` appends a marker to a shared trace, for asserting
/// execution order across runs.
pub struct Recorder {
    pub trace: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl NodeExecutor for Recorder {
    async fn execute(
        &self,
        _ctx: &mut ExecCtx<'_>,
        node: &Node,
    ) -> Result<NodeOutcome, ErrorInfo> {
        let mark = node
            .config
            .get("mark")
            .and_then(Value::as_str)
            .unwrap_or("?")
            .to_string();
        self.trace.lock().push(mark);
        Ok(NodeOutcome::ok())
    }
}

/// `flaky` kind: fails with a retryable tool error until the shared counter
/// runs out, then succeeds.
pub struct Flaky {
    pub remaining_failures: Arc<AtomicU32>,
}

#[async_trait]
impl NodeExecutor for Flaky {
    async fn execute(
        &self,
        _ctx: &mut ExecCtx<'_>,
        _node: &Node,
    ) -> Result<NodeOutcome, ErrorInfo> {
        let before = self.remaining_failures.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |n| n.checked_sub(1),
        );
        match before {
            Ok(_) => Err(ErrorInfo::tool("flaky failure").with_retryable(true)),
            Err(_) => Ok(NodeOutcome::ok()),
        }
    }
}

/// Registry with the standard test kinds.
pub fn test_registry() -> Arc<PluginRegistry> {
    let registry = PluginRegistry::new();
    registry.register(NodeDefinition::new("test", Arc::new(TestAction)));
    registry.register(NodeDefinition::new("set", Arc::new(SetVar)));
    registry.register(NodeDefinition::new("add", Arc::new(AddVar)));
    registry.register(NodeDefinition::new("control", Arc::new(EmitControl)));
    registry.register(NodeDefinition::new("route", Arc::new(Route)));
    Arc::new(registry)
}

/// Fast engine config: kick-driven scheduling, short lease.
pub fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_max_parallel_runs(4)
        .with_lease_ttl_ms(5_000)
        .with_poll_interval_ms(0)
}

/// In-memory engine with the standard test registry.
pub async fn start_engine() -> Engine {
    Engine::start(fast_config(), StoragePort::in_memory(), test_registry())
        .await
        .expect("engine start")
}

/// A one-node flow running the `test` kind with the given action.
pub fn single_node_flow(flow_id: &str, action: &str) -> Flow {
    Flow::new(
        flow_id,
        flow_id,
        FlowGraph::new("only").with_node(
            Node::new("only", "test").with_config(json!({ "action": action })),
        ),
    )
}

/// Poll until the run reaches `status`; panics on an unexpected terminal.
pub async fn wait_for_status(engine: &Engine, run_id: &str, status: RunStatus) -> RunRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(run) = engine.get_run(run_id).await.expect("get_run") {
            if run.status == status {
                return run;
            }
            if run.status.is_terminal() {
                panic!(
                    "run {run_id} ended {:?} while waiting for {status:?}; error: {:?}",
                    run.status, run.error
                );
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for run {run_id} to reach {status:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until the run reaches any terminal status.
pub async fn wait_terminal(engine: &Engine, run_id: &str) -> RunRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(run) = engine.get_run(run_id).await.expect("get_run") {
            if run.status.is_terminal() {
                return run;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for run {run_id} to finish"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Event type names in seq order.
pub fn event_types(events: &[RunEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.kind.type_name()).collect()
}

/// Assert seq numbers are dense from 1.
pub fn assert_dense_seq(events: &[RunEvent]) {
    for (i, event) in events.iter().enumerate() {
        assert_eq!(
            event.seq,
            (i + 1) as u64,
            "seq gap at index {i}: {:?}",
            event_types(events)
        );
    }
}
