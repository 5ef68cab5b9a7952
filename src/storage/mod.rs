//! Durable storage port: five asynchronous sub-stores behind trait objects.
//!
//! Every mutation is an independent atomic operation; the port exposes no
//! cross-store transactions. Nothing at this layer retries: failures are
//! surfaced to the engine, which reports them as `INTERNAL` and terminates
//! the affected operation.
//!
//! Backends: [`memory::MemoryStorage`] (default, process-local) and
//! [`sqlite::SqliteStorage`] (`sqlite` feature, durable).

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::error::ErrorInfo;
use crate::event::{EventInput, RunEvent};
use crate::flow::Flow;
use crate::types::{
    Lease, PersistentVar, QueueItem, RunPatch, RunRecord, RunStatus, TriggerRecord,
};

/// Errors surfaced by storage operations.
#[derive(Debug, Error, Diagnostic)]
pub enum StorageError {
    #[error("{entity} not found: {id}")]
    #[diagnostic(code(runloom::storage::not_found))]
    NotFound { entity: &'static str, id: String },

    #[error("storage backend error: {message}")]
    #[diagnostic(
        code(runloom::storage::backend),
        help("Check backend connectivity and permissions; backend message: {message}.")
    )]
    Backend { message: String },

    #[error("stored {entity} has schema version {found}, expected {expected}")]
    #[diagnostic(
        code(runloom::storage::schema_version),
        help("Run the external migration tooling before loading this record.")
    )]
    SchemaVersion {
        entity: &'static str,
        found: u32,
        expected: u32,
    },

    #[error("serialization failed: {source}")]
    #[diagnostic(code(runloom::storage::serde))]
    Serde {
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    pub fn backend(message: impl Into<String>) -> Self {
        StorageError::Backend {
            message: message.into(),
        }
    }
}

impl From<StorageError> for ErrorInfo {
    fn from(err: StorageError) -> Self {
        ErrorInfo::internal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Flow definitions. `save` replaces the entire record.
#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Flow>>;
    async fn save(&self, flow: Flow) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<Flow>>;
}

/// Run records. `patch` is a partial merge with write-through; patching an
/// absent id is an error.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<RunRecord>>;
    async fn save(&self, run: RunRecord) -> Result<()>;
    async fn patch(&self, id: &str, patch: RunPatch) -> Result<RunRecord>;
    async fn list(&self) -> Result<Vec<RunRecord>>;
    async fn by_status(&self, status: RunStatus) -> Result<Vec<RunRecord>>;
}

/// Append-only run events. `append` allocates `seq` and `ts` atomically
/// relative to other appends for the same run, driven by the run record's
/// `next_seq` cursor.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, input: EventInput) -> Result<RunEvent>;
    /// Events for one run in ascending seq order.
    async fn list(&self, run_id: &str) -> Result<Vec<RunEvent>>;
}

/// The durable run queue. `claim_next` is the sole queued→running transition
/// and the sole source of attempt progression.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn enqueue(&self, item: QueueItem) -> Result<()>;

    /// Claim the next `queued` item by {priority desc, created_at asc},
    /// transitioning it to `running` with a fresh lease and incrementing its
    /// attempt counter. Serialized by the backend: concurrent callers get at
    /// most one success per item.
    async fn claim_next(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<QueueItem>>;

    /// Re-establish a `running` lease with the given owner (recovery/resume).
    async fn mark_running(&self, id: &str, lease: Lease) -> Result<()>;

    /// Transition to `paused`, keeping a lease with the given owner.
    async fn mark_paused(&self, id: &str, lease: Lease) -> Result<()>;

    /// Revert to `queued`: drop the lease, keep the attempt counter.
    async fn release_to_queued(&self, id: &str) -> Result<()>;

    /// Drop the lease without changing status (stale-owner cleanup).
    async fn clear_lease(&self, id: &str) -> Result<()>;

    /// Extend the lease to `expires_at` iff it is currently held by `owner`.
    /// Returns whether a renewal happened.
    async fn renew_lease(&self, id: &str, owner: &str, expires_at: DateTime<Utc>) -> Result<bool>;

    async fn get(&self, id: &str) -> Result<Option<QueueItem>>;
    async fn list(&self) -> Result<Vec<QueueItem>>;
    async fn remove(&self, id: &str) -> Result<()>;
}

/// Global persistent variables; `set` bumps the per-key version counter.
#[async_trait]
pub trait VarStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<PersistentVar>>;
    async fn set(&self, key: &str, value: Value) -> Result<PersistentVar>;
    async fn delete(&self, key: &str) -> Result<bool>;
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<PersistentVar>>;
}

/// Trigger registrations (CRUD only; adapters live outside the core).
#[async_trait]
pub trait TriggerStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<TriggerRecord>>;
    async fn save(&self, trigger: TriggerRecord) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<TriggerRecord>>;
}

/// Bundle of the sub-stores handed to every engine component.
#[derive(Clone)]
pub struct StoragePort {
    pub flows: Arc<dyn FlowStore>,
    pub runs: Arc<dyn RunStore>,
    pub events: Arc<dyn EventStore>,
    pub queue: Arc<dyn QueueStore>,
    pub vars: Arc<dyn VarStore>,
    pub triggers: Arc<dyn TriggerStore>,
}

impl StoragePort {
    /// Process-local storage for tests and ephemeral engines.
    #[must_use]
    pub fn in_memory() -> Self {
        memory::MemoryStorage::new().into_port()
    }
}

impl std::fmt::Debug for StoragePort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoragePort").finish_non_exhaustive()
    }
}
