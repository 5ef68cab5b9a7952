//! Process-local storage backend.
//!
//! All six stores share one mutex-guarded state block, which is what makes
//! the per-run seq allocation and queue claims atomic: every operation is a
//! single critical section. Fast, non-durable; the default for tests and
//! embedded use.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;

use super::{
    EventStore, FlowStore, QueueStore, Result, RunStore, StorageError, StoragePort, TriggerStore,
    VarStore,
};
use crate::event::{EventInput, RunEvent};
use crate::flow::Flow;
use crate::types::{
    Lease, PersistentVar, QueueItem, QueueStatus, RunPatch, RunRecord, RunStatus, TriggerRecord,
};

#[derive(Default)]
struct MemoryInner {
    flows: FxHashMap<String, Flow>,
    runs: FxHashMap<String, RunRecord>,
    events: FxHashMap<String, Vec<RunEvent>>,
    queue: FxHashMap<String, QueueItem>,
    vars: FxHashMap<String, PersistentVar>,
    triggers: FxHashMap<String, TriggerRecord>,
}

/// Shared in-memory state behind the six store handles.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire this storage into a [`StoragePort`]; all handles share state.
    #[must_use]
    pub fn into_port(self) -> StoragePort {
        StoragePort {
            flows: Arc::new(self.clone()),
            runs: Arc::new(self.clone()),
            events: Arc::new(self.clone()),
            queue: Arc::new(self.clone()),
            vars: Arc::new(self.clone()),
            triggers: Arc::new(self),
        }
    }
}

#[async_trait]
impl FlowStore for MemoryStorage {
    async fn get(&self, id: &str) -> Result<Option<Flow>> {
        Ok(self.inner.lock().flows.get(id).cloned())
    }

    async fn save(&self, flow: Flow) -> Result<()> {
        self.inner.lock().flows.insert(flow.id.clone(), flow);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.inner.lock().flows.remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Flow>> {
        let mut flows: Vec<Flow> = self.inner.lock().flows.values().cloned().collect();
        flows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(flows)
    }
}

#[async_trait]
impl RunStore for MemoryStorage {
    async fn get(&self, id: &str) -> Result<Option<RunRecord>> {
        Ok(self.inner.lock().runs.get(id).cloned())
    }

    async fn save(&self, run: RunRecord) -> Result<()> {
        self.inner.lock().runs.insert(run.id.clone(), run);
        Ok(())
    }

    async fn patch(&self, id: &str, patch: RunPatch) -> Result<RunRecord> {
        let mut inner = self.inner.lock();
        let run = inner.runs.get_mut(id).ok_or_else(|| StorageError::NotFound {
            entity: "run",
            id: id.to_string(),
        })?;
        patch.apply_to(run, Utc::now());
        Ok(run.clone())
    }

    async fn list(&self) -> Result<Vec<RunRecord>> {
        let mut runs: Vec<RunRecord> = self.inner.lock().runs.values().cloned().collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(runs)
    }

    async fn by_status(&self, status: RunStatus) -> Result<Vec<RunRecord>> {
        let mut runs: Vec<RunRecord> = self
            .inner
            .lock()
            .runs
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(runs)
    }
}

#[async_trait]
impl EventStore for MemoryStorage {
    async fn append(&self, input: EventInput) -> Result<RunEvent> {
        let mut inner = self.inner.lock();
        let run = inner
            .runs
            .get_mut(&input.run_id)
            .ok_or_else(|| StorageError::NotFound {
                entity: "run",
                id: input.run_id.clone(),
            })?;
        let seq = run.next_seq;
        run.next_seq += 1;
        let event = RunEvent {
            run_id: input.run_id.clone(),
            seq,
            ts: Utc::now(),
            kind: input.kind,
        };
        inner.events.entry(input.run_id).or_default().push(event.clone());
        Ok(event)
    }

    async fn list(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        // Events are appended in seq order under the store lock; the stored
        // vector is already ascending.
        Ok(self.inner.lock().events.get(run_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl QueueStore for MemoryStorage {
    async fn enqueue(&self, item: QueueItem) -> Result<()> {
        self.inner.lock().queue.insert(item.id.clone(), item);
        Ok(())
    }

    async fn claim_next(
        &self,
        owner: &str,
        _now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<QueueItem>> {
        let mut inner = self.inner.lock();
        let next_id = inner
            .queue
            .values()
            .filter(|item| item.status == QueueStatus::Queued)
            .min_by(|a, b| a.claim_key().cmp(&b.claim_key()))
            .map(|item| item.id.clone());
        let Some(id) = next_id else {
            return Ok(None);
        };
        let item = inner
            .queue
            .get_mut(&id)
            .ok_or_else(|| StorageError::backend("claimed item vanished"))?;
        item.status = QueueStatus::Running;
        item.attempt += 1;
        item.lease = Some(Lease::new(owner, lease_until));
        Ok(Some(item.clone()))
    }

    async fn mark_running(&self, id: &str, lease: Lease) -> Result<()> {
        let mut inner = self.inner.lock();
        let item = inner.queue.get_mut(id).ok_or_else(|| StorageError::NotFound {
            entity: "queue item",
            id: id.to_string(),
        })?;
        item.status = QueueStatus::Running;
        item.lease = Some(lease);
        Ok(())
    }

    async fn mark_paused(&self, id: &str, lease: Lease) -> Result<()> {
        let mut inner = self.inner.lock();
        let item = inner.queue.get_mut(id).ok_or_else(|| StorageError::NotFound {
            entity: "queue item",
            id: id.to_string(),
        })?;
        item.status = QueueStatus::Paused;
        item.lease = Some(lease);
        Ok(())
    }

    async fn release_to_queued(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let item = inner.queue.get_mut(id).ok_or_else(|| StorageError::NotFound {
            entity: "queue item",
            id: id.to_string(),
        })?;
        item.status = QueueStatus::Queued;
        item.lease = None;
        Ok(())
    }

    async fn clear_lease(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let item = inner.queue.get_mut(id).ok_or_else(|| StorageError::NotFound {
            entity: "queue item",
            id: id.to_string(),
        })?;
        item.lease = None;
        Ok(())
    }

    async fn renew_lease(&self, id: &str, owner: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock();
        let Some(item) = inner.queue.get_mut(id) else {
            return Ok(false);
        };
        match &mut item.lease {
            Some(lease) if lease.owner_id == owner => {
                lease.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<QueueItem>> {
        Ok(self.inner.lock().queue.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<QueueItem>> {
        let mut items: Vec<QueueItem> = self.inner.lock().queue.values().cloned().collect();
        items.sort_by(|a, b| a.claim_key().cmp(&b.claim_key()));
        Ok(items)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.inner.lock().queue.remove(id);
        Ok(())
    }
}

#[async_trait]
impl VarStore for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<PersistentVar>> {
        Ok(self.inner.lock().vars.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<PersistentVar> {
        let mut inner = self.inner.lock();
        let version = inner.vars.get(key).map_or(1, |v| v.version + 1);
        let var = PersistentVar {
            key: key.to_string(),
            value,
            version,
            updated_at: Utc::now(),
        };
        inner.vars.insert(key.to_string(), var.clone());
        Ok(var)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.inner.lock().vars.remove(key).is_some())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<PersistentVar>> {
        let mut vars: Vec<PersistentVar> = self
            .inner
            .lock()
            .vars
            .values()
            .filter(|v| v.key.starts_with(prefix))
            .cloned()
            .collect();
        vars.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(vars)
    }
}

#[async_trait]
impl TriggerStore for MemoryStorage {
    async fn get(&self, id: &str) -> Result<Option<TriggerRecord>> {
        Ok(self.inner.lock().triggers.get(id).cloned())
    }

    async fn save(&self, trigger: TriggerRecord) -> Result<()> {
        self.inner.lock().triggers.insert(trigger.id.clone(), trigger);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.inner.lock().triggers.remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<TriggerRecord>> {
        let mut triggers: Vec<TriggerRecord> =
            self.inner.lock().triggers.values().cloned().collect();
        triggers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(triggers)
    }
}
