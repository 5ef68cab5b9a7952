//! The per-run graph walker.
//!
//! One [`RunRunner`] owns one run from claim to terminal status: it walks
//! the flow graph node by node, dispatches each node to its plugin, applies
//! variable patches, routes over labeled edges, enforces per-attempt
//! timeouts and retry policy, interprets control directives, and observes
//! pause/cancel at every suspension point.
//!
//! Suspension points are: before each node, between attempts, between
//! foreach/while iterations, and between execute-flow stages. Nothing else
//! is guaranteed to observe a cancel.

pub mod control;
pub mod gate;
pub mod writeq;

use chrono::Utc;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::instrument;

use crate::config::EngineConfig;
use crate::debug::BreakpointRegistry;
use crate::error::{ErrorCode, ErrorInfo};
use crate::event::{EventsBus, PauseReason, RunEventKind, VarOp};
use crate::flow::{
    decide_failure, resolve_policy, validate_graph, EdgeLabel, Flow, FlowGraph, FailureDecision,
    GotoTarget, Node, NodePolicy, TimeoutScope,
};
use crate::plugin::{ArtifactStore, ExecCtx, NextHint, NodeOutcome, PluginRegistry};
use crate::storage::StoragePort;
use crate::types::{Lease, NodeId, OwnerId, RunId, RunPatch, RunRecord, RunStatus};

pub use gate::{RunGate, RunHandle, RunnerRegistry, SharedVars};
pub use writeq::{RunWriter, WriterHandle};

use gate::WaitOutcome;

/// Scheduler-side bookkeeping for parked runs: a paused walker stops
/// counting against the parallelism bound.
pub trait ParkObserver: Send + Sync {
    fn parked(&self, run_id: &str);
    fn unparked(&self, run_id: &str);
}

/// Everything a walker needs from its environment.
#[derive(Clone)]
pub struct RunnerDeps {
    pub storage: StoragePort,
    pub bus: EventsBus,
    pub plugins: Arc<PluginRegistry>,
    pub breakpoints: Arc<BreakpointRegistry>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub config: Arc<EngineConfig>,
    pub owner_id: OwnerId,
    pub park: Option<Arc<dyn ParkObserver>>,
}

impl std::fmt::Debug for RunnerDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerDeps")
            .field("owner_id", &self.owner_id)
            .finish_non_exhaustive()
    }
}

/// How a graph traversal ended, short of failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WalkOutcome {
    Completed,
    Canceled,
}

/// Which graph of the current flow to traverse.
#[derive(Clone, Debug)]
pub(crate) enum GraphRef {
    Main,
    Subflow(String),
}

impl GraphRef {
    fn resolve<'a>(&self, flow: &'a Flow) -> Result<&'a FlowGraph, ErrorInfo> {
        match self {
            GraphRef::Main => Ok(&flow.graph),
            GraphRef::Subflow(name) => flow.subflow(name).ok_or_else(|| {
                ErrorInfo::validation(format!("subflow `{name}` not found in flow `{}`", flow.id))
            }),
        }
    }
}

enum Suspension {
    Continue,
    Canceled,
}

enum NodeExec {
    Advance(Option<NodeId>),
    Canceled,
}

/// Per-run state machine. Construct one per claim, call [`run`](Self::run)
/// exactly once.
pub struct RunRunner {
    deps: RunnerDeps,
    run_id: RunId,
    record: RunRecord,
    root: Arc<Flow>,
    gate: Arc<RunGate>,
    vars: SharedVars,
    writer: WriterHandle,
    writer_task: Option<RunWriter>,
    outputs: FxHashMap<String, Value>,
    pub(crate) control_depth: u32,
    pub(crate) flow_stack: Vec<String>,
}

impl RunRunner {
    /// Assemble a walker for one claimed run. `gate` and `vars` are shared
    /// with the [`RunHandle`] registered for debugger access.
    #[must_use]
    pub fn new(
        deps: RunnerDeps,
        record: RunRecord,
        flow: Flow,
        gate: Arc<RunGate>,
        vars: SharedVars,
    ) -> Self {
        let writer = RunWriter::spawn(
            record.id.clone(),
            deps.storage.runs.clone(),
            deps.bus.clone(),
        );
        let handle = writer.handle();
        Self {
            run_id: record.id.clone(),
            root: Arc::new(flow),
            gate,
            vars,
            writer: handle,
            writer_task: Some(writer),
            outputs: FxHashMap::default(),
            control_depth: 0,
            flow_stack: Vec::new(),
            deps,
            record,
        }
    }

    /// Drive the run to a terminal status. All event appends and run patches
    /// flow through the per-run serial write queue; the terminal write is
    /// flushed before this returns.
    #[instrument(skip(self), fields(run_id = %self.run_id))]
    pub async fn run(mut self) -> RunStatus {
        self.seed_vars().await;

        let now = Utc::now();
        let mut patch = RunPatch::status(RunStatus::Running);
        patch.started_at = Some(now);
        patch.attempt = Some(self.record.attempt);
        self.writer.patch(patch);
        self.writer.event(RunEventKind::RunStarted {
            attempt: self.record.attempt,
        });

        if self.record.debug.pause_on_start {
            self.gate.request_pause(PauseReason::Policy {
                node_id: None,
                reason: "pauseOnStart".to_string(),
            });
        }

        let result = self.walk_root().await;

        let status = match result {
            Ok(WalkOutcome::Completed) => {
                let outputs = std::mem::take(&mut self.outputs);
                let mut patch = RunPatch::status(RunStatus::Succeeded)
                    .with_finished_at(Utc::now())
                    .with_outputs(outputs.clone());
                patch.attempt = Some(self.record.attempt);
                self.writer.patch(patch);
                self.writer.event(RunEventKind::RunSucceeded {
                    outputs: if outputs.is_empty() { None } else { Some(outputs) },
                });
                RunStatus::Succeeded
            }
            Ok(WalkOutcome::Canceled) => {
                let reason = self.gate.cancel_reason();
                self.writer.patch(
                    RunPatch::status(RunStatus::Canceled).with_finished_at(Utc::now()),
                );
                self.writer
                    .event(RunEventKind::RunCanceled { reason });
                RunStatus::Canceled
            }
            Err(error) => {
                self.writer.patch(
                    RunPatch::status(RunStatus::Failed)
                        .with_finished_at(Utc::now())
                        .with_error(error.clone()),
                );
                self.writer.event(RunEventKind::RunFailed { error });
                RunStatus::Failed
            }
        };

        if let Some(writer) = self.writer_task.take() {
            writer.close().await;
        }
        status
    }

    async fn walk_root(&mut self) -> Result<WalkOutcome, ErrorInfo> {
        validate_graph(&self.root.graph).map_err(ErrorInfo::from)?;
        let entry = self
            .record
            .start_node_id
            .clone()
            .unwrap_or_else(|| self.root.graph.entry_node_id.clone());
        let root = self.root.clone();
        self.flow_stack.push(root.id.clone());
        let outcome = self.walk(root, GraphRef::Main, entry).await;
        self.flow_stack.pop();
        outcome
    }

    /// Seed `vars` from the run's initial args, then flow defaults for any
    /// keys not present.
    async fn seed_vars(&mut self) {
        let mut vars = self.vars.lock().await;
        for (key, value) in &self.record.args {
            vars.insert(key.clone(), value.clone());
        }
        for (key, value) in &self.root.var_defaults {
            if !vars.contains_key(key) {
                vars.insert(key.clone(), value.clone());
            }
        }
    }

    /// Traverse one graph of `flow` starting at `entry`. Recursion depth is
    /// bounded by the control-stack cap enforced in directive handling.
    pub(crate) fn walk(
        &mut self,
        flow: Arc<Flow>,
        graph_ref: GraphRef,
        entry: NodeId,
    ) -> Pin<Box<dyn Future<Output = Result<WalkOutcome, ErrorInfo>> + Send + '_>> {
        Box::pin(async move {
            let graph = graph_ref.resolve(&flow)?;
            let mut current = Some(entry);

            while let Some(node_id) = current.take() {
                self.writer
                    .patch(RunPatch::default().with_current_node(node_id.clone()));

                if let Suspension::Canceled = self.suspension_point().await {
                    return Ok(WalkOutcome::Canceled);
                }

                let Some(node) = graph.node(&node_id) else {
                    return Err(ErrorInfo::new(
                        ErrorCode::DagInvalid,
                        format!("node `{node_id}` does not exist in the current graph"),
                    ));
                };

                if node.disabled {
                    self.writer.event(RunEventKind::NodeSkipped {
                        node_id: node_id.clone(),
                        reason: "disabled".to_string(),
                    });
                    current = graph
                        .edge_out(&node_id, &EdgeLabel::Default)
                        .map(|e| e.target.clone());
                    continue;
                }

                if self.deps.breakpoints.is_breakpoint(&self.run_id, &node_id) {
                    self.gate.request_pause(PauseReason::Breakpoint {
                        node_id: node_id.clone(),
                    });
                } else if self.deps.breakpoints.consume_step(&self.run_id) {
                    self.gate.request_pause(PauseReason::Step {
                        node_id: node_id.clone(),
                    });
                }
                if let Suspension::Canceled = self.suspension_point().await {
                    return Ok(WalkOutcome::Canceled);
                }

                self.writer.event(RunEventKind::NodeQueued {
                    node_id: node_id.clone(),
                });

                match self.execute_node(&flow, graph, node).await? {
                    NodeExec::Advance(next) => current = next,
                    NodeExec::Canceled => return Ok(WalkOutcome::Canceled),
                }
            }

            Ok(WalkOutcome::Completed)
        })
    }

    /// Execute one node to an advancing decision: attempts, timeout, vars
    /// application, control directives, and the failure ladder.
    async fn execute_node(
        &mut self,
        flow: &Arc<Flow>,
        graph: &FlowGraph,
        node: &Node,
    ) -> Result<NodeExec, ErrorInfo> {
        let definition = self.deps.plugins.get(&node.kind);
        let policy = resolve_policy(
            flow.default_node_policy.as_ref(),
            definition.as_ref().and_then(|d| d.default_policy.as_ref()),
            node.policy.as_ref(),
        );
        let has_on_error_edge = graph.edge_out(&node.id, &EdgeLabel::OnError).is_some();
        let mut attempt: u32 = 1;

        loop {
            self.writer.event(RunEventKind::NodeStarted {
                node_id: node.id.clone(),
                attempt,
            });
            let started = Instant::now();

            let attempt_result = match &definition {
                None => Err(ErrorInfo::new(
                    ErrorCode::UnsupportedNode,
                    format!("no plugin registered for node kind `{}`", node.kind),
                )),
                Some(def) => match def.schema.validate(&node.kind, &node.config) {
                    Err(err) => Err(err),
                    Ok(()) => self.run_attempt(def.clone(), flow, graph, node, &policy).await,
                },
            };

            match attempt_result {
                Ok(outcome) => {
                    self.apply_vars_patch(&node.id, &outcome.vars_patch).await;
                    if let Some(outputs) = &outcome.outputs {
                        self.outputs.extend(outputs.clone());
                    }
                    if let Some(directive) = outcome.control.clone() {
                        match self.run_directive(flow, node, directive).await? {
                            WalkOutcome::Canceled => return Ok(NodeExec::Canceled),
                            WalkOutcome::Completed => {}
                        }
                    }
                    self.writer.event(RunEventKind::NodeSucceeded {
                        node_id: node.id.clone(),
                        took_ms: started.elapsed().as_millis() as u64,
                    });
                    return self.advance(graph, node, outcome.next.as_ref()).map(NodeExec::Advance);
                }
                Err(error) => {
                    let decision = decide_failure(&policy, has_on_error_edge, &error, attempt);
                    self.writer.event(RunEventKind::NodeFailed {
                        node_id: node.id.clone(),
                        attempt,
                        error: error.clone(),
                        decision: decision.label().to_string(),
                    });
                    match decision {
                        FailureDecision::Stop => return Err(error),
                        FailureDecision::Continue => {
                            let next = graph
                                .edge_out(&node.id, &EdgeLabel::Default)
                                .map(|e| e.target.clone());
                            return Ok(NodeExec::Advance(next));
                        }
                        FailureDecision::FollowErrorEdge => {
                            let next =
                                self.follow_edge(graph, &node.id, &EdgeLabel::OnError)?;
                            return Ok(NodeExec::Advance(Some(next)));
                        }
                        FailureDecision::Goto(GotoTarget::Node { node_id }) => {
                            return Ok(NodeExec::Advance(Some(node_id)));
                        }
                        FailureDecision::Goto(GotoTarget::EdgeLabel { label }) => {
                            let next = self.follow_edge(graph, &node.id, &label)?;
                            return Ok(NodeExec::Advance(Some(next)));
                        }
                        FailureDecision::Retry { delay_ms } => {
                            self.cancellable_sleep(delay_ms).await;
                            if let Suspension::Canceled = self.suspension_point().await {
                                return Ok(NodeExec::Canceled);
                            }
                            attempt += 1;
                        }
                    }
                }
            }
        }
    }

    /// One plugin invocation, raced against the per-attempt timeout.
    /// The retry delay runs outside this window.
    async fn run_attempt(
        &mut self,
        def: Arc<crate::plugin::NodeDefinition>,
        flow: &Arc<Flow>,
        graph: &FlowGraph,
        node: &Node,
        policy: &NodePolicy,
    ) -> Result<NodeOutcome, ErrorInfo> {
        let out_labels = graph.out_labels(&node.id);
        let mut guard = self.vars.clone().lock_owned().await;
        let mut ctx = ExecCtx::new(
            &self.run_id,
            flow,
            &node.id,
            &self.deps.config.tab_id,
            &mut guard,
            Arc::new(self.writer.clone()),
            self.deps.storage.vars.clone(),
            self.deps.artifacts.clone(),
            out_labels,
        );

        let attempt_timeout = policy
            .timeout
            .as_ref()
            .filter(|t| t.scope == TimeoutScope::Attempt && t.ms > 0)
            .map(|t| t.ms);

        match attempt_timeout {
            None => def.executor.execute(&mut ctx, node).await,
            Some(ms) => {
                match tokio::time::timeout(
                    Duration::from_millis(ms),
                    def.executor.execute(&mut ctx, node),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ErrorInfo::timeout(format!(
                        "node `{}` exceeded its {ms} ms attempt timeout",
                        node.id
                    ))),
                }
            }
        }
    }

    async fn apply_vars_patch(&mut self, node_id: &str, ops: &[VarOp]) {
        if ops.is_empty() {
            return;
        }
        {
            let mut vars = self.vars.lock().await;
            for op in ops {
                match op {
                    VarOp::Set { name, value } => {
                        vars.insert(name.clone(), value.clone());
                    }
                    VarOp::Delete { name } => {
                        vars.remove(name);
                    }
                }
            }
        }
        self.writer.event(RunEventKind::VarsPatch {
            node_id: node_id.to_string(),
            ops: ops.to_vec(),
        });
    }

    /// Pick the node to visit next from an optional routing hint.
    fn advance(
        &self,
        graph: &FlowGraph,
        node: &Node,
        next: Option<&NextHint>,
    ) -> Result<Option<NodeId>, ErrorInfo> {
        match next {
            Some(NextHint::End) => Ok(None),
            Some(NextHint::EdgeLabel { label }) => {
                self.follow_edge(graph, &node.id, label).map(Some)
            }
            None => Ok(graph
                .edge_out(&node.id, &EdgeLabel::Default)
                .map(|e| e.target.clone())),
        }
    }

    fn follow_edge(
        &self,
        graph: &FlowGraph,
        node_id: &str,
        label: &EdgeLabel,
    ) -> Result<NodeId, ErrorInfo> {
        graph
            .edge_out(node_id, label)
            .map(|e| e.target.clone())
            .ok_or_else(|| {
                ErrorInfo::new(
                    ErrorCode::DagInvalid,
                    format!("node `{node_id}` has no outgoing edge labeled `{label}`"),
                )
            })
    }

    /// The suspension point: observe cancel, honor a pending pause request,
    /// park until resumed.
    async fn suspension_point(&mut self) -> Suspension {
        if self.gate.is_canceled() {
            return Suspension::Canceled;
        }
        let Some(reason) = self.gate.take_pause_request() else {
            return Suspension::Continue;
        };

        self.gate.enter_paused();
        if let Some(park) = &self.deps.park {
            park.parked(&self.run_id);
        }
        if let Err(err) = self
            .deps
            .storage
            .queue
            .mark_paused(&self.run_id, self.fresh_lease())
            .await
        {
            tracing::warn!(run_id = %self.run_id, error = %err, "failed to mark queue item paused");
        }
        self.writer.patch(RunPatch::status(RunStatus::Paused));
        self.writer.event(RunEventKind::RunPaused { reason });

        let outcome = self.gate.wait_resumed().await;
        if let Some(park) = &self.deps.park {
            park.unparked(&self.run_id);
        }
        match outcome {
            WaitOutcome::Canceled => Suspension::Canceled,
            WaitOutcome::Resumed => {
                if let Err(err) = self
                    .deps
                    .storage
                    .queue
                    .mark_running(&self.run_id, self.fresh_lease())
                    .await
                {
                    tracing::warn!(
                        run_id = %self.run_id,
                        error = %err,
                        "failed to mark queue item running"
                    );
                }
                self.writer.patch(RunPatch::status(RunStatus::Running));
                self.writer.event(RunEventKind::RunResumed {});
                Suspension::Continue
            }
        }
    }

    /// Sleep that wakes early when the run is canceled; the cancel itself is
    /// observed at the following suspension point.
    pub(crate) async fn cancellable_sleep(&self, ms: u64) {
        if ms == 0 {
            return;
        }
        let gate = self.gate.clone();
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(ms)) => {}
            () = gate.wait_canceled() => {}
        }
    }

    pub(crate) fn fresh_lease(&self) -> Lease {
        Lease::new(
            self.deps.owner_id.clone(),
            Utc::now() + chrono::Duration::milliseconds(self.deps.config.lease_ttl_ms as i64),
        )
    }
}
