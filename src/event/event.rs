//! Run event records: the authoritative, append-only execution trace.
//!
//! Events are keyed by `(run_id, seq)` with `seq` dense from 1, allocated
//! atomically by the event store. The serialized shape is the wire envelope:
//! `type` + kind payload flattened beside `runId`, `seq`, `ts`.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorInfo;
use crate::types::{NodeId, RunId};

/// Why a run transitioned to `paused`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PauseReason {
    /// Explicit `pauseRun` command.
    Command,
    /// The walker reached a node flagged as a breakpoint.
    Breakpoint { node_id: NodeId },
    /// Step mode consumed one stop.
    Step { node_id: NodeId },
    /// Policy-driven pause (e.g. pause-on-start).
    Policy {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_id: Option<NodeId>,
        reason: String,
    },
}

/// Prior phase of a run touched by the recovery coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecoveredPhase {
    RequeuedRunning,
    AdoptedPaused,
}

/// Severity of a `log` event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A single variable operation recorded in `vars.patch` events and applied
/// in order to the run's variable map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum VarOp {
    Set { name: String, value: Value },
    Delete { name: String },
}

/// Event kind plus its payload. Serialized with the wire `type` tag
/// (`run.queued`, `node.started`, ...).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum RunEventKind {
    #[serde(rename = "run.queued")]
    RunQueued {},
    #[serde(rename = "run.started")]
    RunStarted { attempt: u32 },
    #[serde(rename = "run.paused")]
    RunPaused { reason: PauseReason },
    #[serde(rename = "run.resumed")]
    RunResumed {},
    #[serde(rename = "run.recovered")]
    RunRecovered { phase: RecoveredPhase },
    #[serde(rename = "run.succeeded")]
    RunSucceeded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outputs: Option<FxHashMap<String, Value>>,
    },
    #[serde(rename = "run.failed")]
    RunFailed { error: ErrorInfo },
    #[serde(rename = "run.canceled")]
    RunCanceled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename = "node.queued")]
    NodeQueued { node_id: NodeId },
    #[serde(rename = "node.started")]
    NodeStarted { node_id: NodeId, attempt: u32 },
    #[serde(rename = "node.skipped")]
    NodeSkipped { node_id: NodeId, reason: String },
    #[serde(rename = "node.succeeded")]
    NodeSucceeded { node_id: NodeId, took_ms: u64 },
    #[serde(rename = "node.failed")]
    NodeFailed {
        node_id: NodeId,
        attempt: u32,
        error: ErrorInfo,
        decision: String,
    },
    #[serde(rename = "vars.patch")]
    VarsPatch { node_id: NodeId, ops: Vec<VarOp> },
    #[serde(rename = "control.started")]
    ControlStarted {
        node_id: NodeId,
        kind: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subflow_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        flow_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_iterations: Option<u64>,
    },
    #[serde(rename = "control.iteration")]
    ControlIteration {
        node_id: NodeId,
        iteration: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_iterations: Option<u64>,
    },
    #[serde(rename = "control.completed")]
    ControlCompleted {
        node_id: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_iterations: Option<u64>,
        took_ms: u64,
    },
    #[serde(rename = "log")]
    Log {
        level: LogLevel,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_id: Option<NodeId>,
    },
}

impl RunEventKind {
    /// Wire name of the kind (`run.queued`, `node.failed`, ...).
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            RunEventKind::RunQueued {} => "run.queued",
            RunEventKind::RunStarted { .. } => "run.started",
            RunEventKind::RunPaused { .. } => "run.paused",
            RunEventKind::RunResumed {} => "run.resumed",
            RunEventKind::RunRecovered { .. } => "run.recovered",
            RunEventKind::RunSucceeded { .. } => "run.succeeded",
            RunEventKind::RunFailed { .. } => "run.failed",
            RunEventKind::RunCanceled { .. } => "run.canceled",
            RunEventKind::NodeQueued { .. } => "node.queued",
            RunEventKind::NodeStarted { .. } => "node.started",
            RunEventKind::NodeSkipped { .. } => "node.skipped",
            RunEventKind::NodeSucceeded { .. } => "node.succeeded",
            RunEventKind::NodeFailed { .. } => "node.failed",
            RunEventKind::VarsPatch { .. } => "vars.patch",
            RunEventKind::ControlStarted { .. } => "control.started",
            RunEventKind::ControlIteration { .. } => "control.iteration",
            RunEventKind::ControlCompleted { .. } => "control.completed",
            RunEventKind::Log { .. } => "log",
        }
    }

    /// True for the `run.*` lifecycle kinds.
    #[must_use]
    pub fn is_run_lifecycle(&self) -> bool {
        self.type_name().starts_with("run.")
    }
}

/// A persisted run event. `seq` and `ts` are allocated by the store on
/// append; readers observing a seq gap should treat it as a storage defect.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub run_id: RunId,
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: RunEventKind,
}

/// Input to an append: everything but the store-allocated fields.
#[derive(Clone, Debug, PartialEq)]
pub struct EventInput {
    pub run_id: RunId,
    pub kind: RunEventKind,
}

impl EventInput {
    #[must_use]
    pub fn new(run_id: impl Into<RunId>, kind: RunEventKind) -> Self {
        Self {
            run_id: run_id.into(),
            kind,
        }
    }
}

/// Subscription filter: a missing run id matches every run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
}

impl EventFilter {
    #[must_use]
    pub fn all() -> Self {
        Self { run_id: None }
    }

    #[must_use]
    pub fn run(run_id: impl Into<RunId>) -> Self {
        Self {
            run_id: Some(run_id.into()),
        }
    }

    #[must_use]
    pub fn matches(&self, event: &RunEvent) -> bool {
        match &self.run_id {
            Some(id) => *id == event.run_id,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_carries_type_tag() {
        let event = RunEvent {
            run_id: "r1".into(),
            seq: 3,
            ts: Utc::now(),
            kind: RunEventKind::NodeSucceeded {
                node_id: "n1".into(),
                took_ms: 12,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "node.succeeded");
        assert_eq!(json["runId"], "r1");
        assert_eq!(json["seq"], 3);
        assert_eq!(json["nodeId"], "n1");
        let back: RunEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn type_names_match_serde_tags() {
        let kinds = [
            RunEventKind::RunQueued {},
            RunEventKind::RunResumed {},
            RunEventKind::RunRecovered {
                phase: RecoveredPhase::RequeuedRunning,
            },
            RunEventKind::Log {
                level: LogLevel::Warn,
                message: "m".into(),
                node_id: None,
            },
        ];
        for kind in kinds {
            let json = serde_json::to_value(&kind).unwrap();
            assert_eq!(json["type"], kind.type_name());
        }
    }

    #[test]
    fn filter_matching() {
        let event = RunEvent {
            run_id: "r1".into(),
            seq: 1,
            ts: Utc::now(),
            kind: RunEventKind::RunQueued {},
        };
        assert!(EventFilter::all().matches(&event));
        assert!(EventFilter::run("r1").matches(&event));
        assert!(!EventFilter::run("r2").matches(&event));
    }
}
