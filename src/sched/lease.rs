//! Lease maintenance: owner-scoped heartbeat renewal and expired-lease
//! reclaim.
//!
//! Renewal covers every run tracked in the active set, parked ones included
//! (a paused queue item must keep a valid lease). The reclaim sweep is how
//! ownership transfers within a process: expired `running` items go back to
//! `queued` with their attempt counter intact; expired `paused` items keep
//! their status but lose the stale owner for recovery to reassign.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::storage::StoragePort;
use crate::types::{OwnerId, QueueStatus};

use super::ActiveSet;

/// Periodic lease renewal plus expired-lease reclaim.
pub struct LeaseKeeper {
    storage: StoragePort,
    config: Arc<EngineConfig>,
    owner_id: OwnerId,
    active: Arc<ActiveSet>,
    kick: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LeaseKeeper {
    #[must_use]
    pub fn new(
        storage: StoragePort,
        config: Arc<EngineConfig>,
        owner_id: OwnerId,
        active: Arc<ActiveSet>,
        kick: Arc<Notify>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            storage,
            config,
            owner_id,
            active,
            kick,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the heartbeat and reclaim loops.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        {
            let storage = self.storage.clone();
            let config = self.config.clone();
            let owner_id = self.owner_id.clone();
            let active = self.active.clone();
            let mut shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let period = Duration::from_millis(config.heartbeat_interval_ms.max(1));
                loop {
                    tokio::select! {
                        () = tokio::time::sleep(period) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                            continue;
                        }
                    }
                    heartbeat(&storage, &config, &owner_id, &active).await;
                }
            }));
        }

        {
            let storage = self.storage.clone();
            let config = self.config.clone();
            let kick = self.kick.clone();
            let mut shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let period = Duration::from_millis(config.reclaim_interval_ms.max(1));
                loop {
                    tokio::select! {
                        () = tokio::time::sleep(period) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                            continue;
                        }
                    }
                    reclaim_expired(&storage, &kick).await;
                }
            }));
        }
    }

    /// One reclaim pass, callable directly (tests, shutdown drains).
    pub async fn sweep_once(&self) {
        reclaim_expired(&self.storage, &self.kick).await;
    }

    /// One heartbeat pass, callable directly.
    pub async fn heartbeat_once(&self) {
        heartbeat(&self.storage, &self.config, &self.owner_id, &self.active).await;
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl std::fmt::Debug for LeaseKeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseKeeper")
            .field("owner_id", &self.owner_id)
            .finish_non_exhaustive()
    }
}

async fn heartbeat(
    storage: &StoragePort,
    config: &Arc<EngineConfig>,
    owner_id: &OwnerId,
    active: &Arc<ActiveSet>,
) {
    let expires_at = Utc::now() + chrono::Duration::milliseconds(config.lease_ttl_ms as i64);
    for run_id in active.all_ids() {
        match storage.queue.renew_lease(&run_id, owner_id, expires_at).await {
            Ok(true) => {}
            Ok(false) => {
                // Item gone (run finished) or owned elsewhere; nothing to
                // renew. Expired-ownership handoff is the reclaim's job.
                tracing::debug!(run_id = %run_id, "lease not renewed");
            }
            Err(err) => {
                tracing::warn!(run_id = %run_id, error = %err, "lease renewal failed");
            }
        }
    }
}

async fn reclaim_expired(storage: &StoragePort, kick: &Arc<Notify>) {
    let items = match storage.queue.list().await {
        Ok(items) => items,
        Err(err) => {
            tracing::warn!(error = %err, "reclaim sweep could not list the queue");
            return;
        }
    };
    let now = Utc::now();
    let mut requeued = false;
    for item in items {
        let expired = item.lease.as_ref().is_none_or(|lease| lease.is_expired(now));
        if !expired {
            continue;
        }
        match item.status {
            QueueStatus::Running => {
                tracing::warn!(run_id = %item.id, attempt = item.attempt, "reclaiming expired lease");
                if let Err(err) = storage.queue.release_to_queued(&item.id).await {
                    tracing::warn!(run_id = %item.id, error = %err, "reclaim requeue failed");
                } else {
                    requeued = true;
                }
            }
            QueueStatus::Paused => {
                if item.lease.is_some() {
                    tracing::warn!(run_id = %item.id, "clearing stale lease on paused run");
                    if let Err(err) = storage.queue.clear_lease(&item.id).await {
                        tracing::warn!(run_id = %item.id, error = %err, "stale lease clear failed");
                    }
                }
            }
            QueueStatus::Queued => {}
        }
    }
    if requeued {
        kick.notify_one();
    }
}
