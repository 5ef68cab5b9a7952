//! Core identifier and record types shared across the engine.
//!
//! These are the durable shapes: run records, queue items, leases, and
//! persistent variables. Flow-definition types live in [`crate::flow`];
//! run events live in [`crate::event`].

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::ErrorInfo;

/// Identifier of a flow definition.
pub type FlowId = String;
/// Identifier of a run (one execution of a flow). Queue items share this id.
pub type RunId = String;
/// Identifier of a node within a graph.
pub type NodeId = String;
/// Opaque token identifying a scheduler instance for lease ownership.
pub type OwnerId = String;

/// Schema version stamped on every persisted run record. Non-matching
/// versions require external migration before load.
pub const RUN_SCHEMA_VERSION: u32 = 1;

/// Mint a fresh run id.
#[must_use]
pub fn new_run_id() -> RunId {
    uuid::Uuid::new_v4().to_string()
}

/// Mint a fresh owner id for a scheduler instance.
#[must_use]
pub fn new_owner_id() -> OwnerId {
    format!("owner-{}", uuid::Uuid::new_v4())
}

/// Lifecycle status of a run. Terminal transitions are final.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Paused,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }

    /// Decode a persisted status string. Unknown strings are rejected rather
    /// than coerced; a bad status means a schema mismatch.
    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(RunStatus::Queued),
            "running" => Some(RunStatus::Running),
            "paused" => Some(RunStatus::Paused),
            "succeeded" => Some(RunStatus::Succeeded),
            "failed" => Some(RunStatus::Failed),
            "canceled" => Some(RunStatus::Canceled),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Debug configuration attached to a run at enqueue time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDebugOptions {
    /// Node ids flagged as breakpoints before the run starts.
    #[serde(default)]
    pub breakpoints: Vec<NodeId>,
    /// Pause at the first suspension point with a `policy` reason.
    #[serde(default)]
    pub pause_on_start: bool,
}

/// Durable record of one execution of a flow.
///
/// Mutated by exactly one owner (the scheduler instance holding the lease),
/// retained forever for audit. `next_seq` is the monotonic cursor used by
/// the event store to allocate dense per-run sequence numbers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: RunId,
    pub flow_id: FlowId,
    pub schema_version: u32,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// The node the walker is on while the run is active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node_id: Option<NodeId>,
    /// Entry-node override; the flow's declared entry is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_node_id: Option<NodeId>,
    /// Claim attempts consumed so far (mirrors the queue item counter).
    pub attempt: u32,
    pub max_attempts: u32,
    /// Initial arguments merged into `vars` before flow defaults.
    #[serde(default)]
    pub args: FxHashMap<String, Value>,
    #[serde(default)]
    pub debug: RunDebugOptions,
    /// Next event sequence number to allocate; starts at 1.
    pub next_seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<FxHashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl RunRecord {
    /// Build a fresh record in `queued` state.
    #[must_use]
    pub fn queued(
        id: RunId,
        flow_id: FlowId,
        args: FxHashMap<String, Value>,
        debug: RunDebugOptions,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            flow_id,
            schema_version: RUN_SCHEMA_VERSION,
            status: RunStatus::Queued,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            current_node_id: None,
            start_node_id: None,
            attempt: 0,
            max_attempts,
            args,
            debug,
            next_seq: 1,
            outputs: None,
            error: None,
        }
    }
}

/// Partial update applied to a run record via `RunStore::patch`.
///
/// `None` fields are left untouched. `updated_at` is always refreshed by the
/// store. There is deliberately no way to patch `next_seq`; only the event
/// append path advances it.
#[derive(Clone, Debug, Default)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub current_node_id: Option<NodeId>,
    pub attempt: Option<u32>,
    pub outputs: Option<FxHashMap<String, Value>>,
    pub error: Option<ErrorInfo>,
}

impl RunPatch {
    #[must_use]
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_current_node(mut self, node_id: impl Into<NodeId>) -> Self {
        self.current_node_id = Some(node_id.into());
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    #[must_use]
    pub fn with_finished_at(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = Some(at);
        self
    }

    #[must_use]
    pub fn with_outputs(mut self, outputs: FxHashMap<String, Value>) -> Self {
        self.outputs = Some(outputs);
        self
    }

    /// Merge this patch into `run`, refreshing `updated_at`.
    pub fn apply_to(&self, run: &mut RunRecord, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            run.status = status;
        }
        if let Some(at) = self.started_at {
            run.started_at = Some(at);
        }
        if let Some(at) = self.finished_at {
            run.finished_at = Some(at);
        }
        if let Some(node_id) = &self.current_node_id {
            run.current_node_id = Some(node_id.clone());
        }
        if let Some(attempt) = self.attempt {
            run.attempt = attempt;
        }
        if let Some(outputs) = &self.outputs {
            run.outputs = Some(outputs.clone());
        }
        if let Some(error) = &self.error {
            run.error = Some(error.clone());
        }
        run.updated_at = now;
    }
}

/// Time-bounded ownership of a queue item by a scheduler instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub owner_id: OwnerId,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    #[must_use]
    pub fn new(owner_id: impl Into<OwnerId>, expires_at: DateTime<Utc>) -> Self {
        Self {
            owner_id: owner_id.into(),
            expires_at,
        }
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Scheduling status of a queue item. Terminal runs have no queue item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Running,
    Paused,
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueStatus::Queued => f.write_str("queued"),
            QueueStatus::Running => f.write_str("running"),
            QueueStatus::Paused => f.write_str("paused"),
        }
    }
}

/// Durable scheduling record for a non-terminal run.
///
/// Invariants: an item in `running` or `paused` carries a lease; an item in
/// `queued` carries none. `claim_next` is the sole queued→running transition
/// and the sole source of attempt progression.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Same id as the run it schedules.
    pub id: RunId,
    pub flow_id: FlowId,
    /// Higher priority claims first; creation time breaks ties FIFO.
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub status: QueueStatus,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
}

impl QueueItem {
    #[must_use]
    pub fn queued(id: RunId, flow_id: FlowId, priority: i32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            flow_id,
            priority,
            created_at: now,
            status: QueueStatus::Queued,
            attempt: 0,
            lease: None,
        }
    }

    /// Stable total sort key: priority descending, then FIFO, then id.
    #[must_use]
    pub fn claim_key(&self) -> (i32, DateTime<Utc>, &str) {
        (-self.priority, self.created_at, self.id.as_str())
    }
}

/// Global key/value pair readable and writable from any node execution.
/// Lifecycle is orthogonal to runs; `version` bumps on every set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVar {
    pub key: String,
    pub value: Value,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Durable trigger registration. The engine stores these; trigger adapters
/// (URL/command/cron) live outside the core and consume them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRecord {
    pub id: String,
    pub flow_id: FlowId,
    pub kind: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub enabled: bool,
}
