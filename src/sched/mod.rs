//! The run scheduler: bounded claiming of queued runs.
//!
//! The scheduler owns a single claim loop. `kick()` coalesces into at most
//! one outstanding claim pass; polling (when enabled) is a correctness
//! safety net for lost kicks, not the primary drive. Claims are handed to an
//! executor callback without blocking further claims; a paused (parked)
//! walker stops counting against the parallelism bound.

pub mod lease;
pub mod recovery;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::runner::ParkObserver;
use crate::storage::StoragePort;
use crate::types::{OwnerId, QueueItem, RunId};

pub use lease::LeaseKeeper;
pub use recovery::{RecoveryCoordinator, RecoveryReport};

/// Executor callback: runs one claimed item to completion. Supplied by the
/// engine assembler; the scheduler only does bookkeeping around it.
#[async_trait]
pub trait RunExecutor: Send + Sync {
    async fn execute(&self, item: QueueItem);
}

/// In-flight runs and their parked state. Shared between the scheduler, the
/// lease keeper (renewal targets), and walkers (park/unpark).
#[derive(Default)]
pub struct ActiveSet {
    inner: Mutex<FxHashMap<RunId, bool>>,
}

impl ActiveSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, run_id: impl Into<RunId>) {
        self.inner.lock().insert(run_id.into(), false);
    }

    pub fn remove(&self, run_id: &str) {
        self.inner.lock().remove(run_id);
    }

    pub fn set_parked(&self, run_id: &str, parked: bool) {
        if let Some(entry) = self.inner.lock().get_mut(run_id) {
            *entry = parked;
        }
    }

    /// Runs counting against the parallelism bound (not parked).
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.lock().values().filter(|parked| !**parked).count()
    }

    /// Every tracked run, parked or not; lease renewal covers both.
    #[must_use]
    pub fn all_ids(&self) -> Vec<RunId> {
        self.inner.lock().keys().cloned().collect()
    }

    #[must_use]
    pub fn contains(&self, run_id: &str) -> bool {
        self.inner.lock().contains_key(run_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl std::fmt::Debug for ActiveSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSet").field("len", &self.len()).finish()
    }
}

/// Walker-side hook that reports park/unpark into the active set and kicks
/// the scheduler so freed capacity is reused immediately.
pub struct SchedulerParkHook {
    active: Arc<ActiveSet>,
    kick: Arc<Notify>,
}

impl SchedulerParkHook {
    #[must_use]
    pub fn new(active: Arc<ActiveSet>, kick: Arc<Notify>) -> Self {
        Self { active, kick }
    }
}

impl ParkObserver for SchedulerParkHook {
    fn parked(&self, run_id: &str) {
        self.active.set_parked(run_id, true);
        self.kick.notify_one();
    }

    fn unparked(&self, run_id: &str) {
        self.active.set_parked(run_id, false);
    }
}

/// Claims queued runs under a lease and drives executor callbacks, bounded
/// by `max_parallel_runs`.
pub struct RunScheduler {
    storage: StoragePort,
    config: Arc<EngineConfig>,
    owner_id: OwnerId,
    executor: Arc<dyn RunExecutor>,
    active: Arc<ActiveSet>,
    kick: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RunScheduler {
    #[must_use]
    pub fn new(
        storage: StoragePort,
        config: Arc<EngineConfig>,
        owner_id: OwnerId,
        executor: Arc<dyn RunExecutor>,
        active: Arc<ActiveSet>,
        kick: Arc<Notify>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            storage,
            config,
            owner_id,
            executor,
            active,
            kick,
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Ask the scheduler to try claiming more work. Multiple concurrent
    /// kicks coalesce into one claim pass.
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    /// Start the claim loop. Idempotent per instance (second call replaces
    /// nothing).
    pub fn start(&self) {
        let mut slot = self.task.lock();
        if slot.is_some() {
            return;
        }
        let storage = self.storage.clone();
        let config = self.config.clone();
        let owner_id = self.owner_id.clone();
        let executor = self.executor.clone();
        let active = self.active.clone();
        let kick = self.kick.clone();
        let mut shutdown = self.shutdown.subscribe();

        *slot = Some(tokio::spawn(async move {
            loop {
                let poll = config.poll_interval_ms;
                tokio::select! {
                    () = kick.notified() => {}
                    () = tokio::time::sleep(Duration::from_millis(poll)), if poll > 0 => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
                Self::fill(&storage, &config, &owner_id, &executor, &active, &kick).await;
            }
        }));
    }

    /// Claim until the bound is reached or the queue is empty.
    async fn fill(
        storage: &StoragePort,
        config: &Arc<EngineConfig>,
        owner_id: &OwnerId,
        executor: &Arc<dyn RunExecutor>,
        active: &Arc<ActiveSet>,
        kick: &Arc<Notify>,
    ) {
        while active.active_count() < config.max_parallel_runs {
            let now = Utc::now();
            let lease_until = now + chrono::Duration::milliseconds(config.lease_ttl_ms as i64);
            let claimed = match storage.queue.claim_next(owner_id, now, lease_until).await {
                Ok(claimed) => claimed,
                Err(err) => {
                    tracing::warn!(error = %err, "claim_next failed");
                    break;
                }
            };
            let Some(item) = claimed else { break };
            tracing::debug!(run_id = %item.id, attempt = item.attempt, "claimed run");
            active.insert(item.id.clone());
            let executor = executor.clone();
            let active = active.clone();
            let kick = kick.clone();
            tokio::spawn(async move {
                let run_id = item.id.clone();
                executor.execute(item).await;
                active.remove(&run_id);
                kick.notify_one();
            });
        }
    }

    /// Stop the claim loop. In-flight executor callbacks keep running.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.kick.notify_one();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl std::fmt::Debug for RunScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunScheduler")
            .field("owner_id", &self.owner_id)
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}
