//! Startup recovery: the one-shot sweep that restores queue/run consistency
//! after a crash, before the scheduler starts claiming.

use chrono::Utc;
use std::sync::Arc;
use tracing::instrument;

use crate::config::EngineConfig;
use crate::event::{EventInput, EventsBus, RecoveredPhase, RunEventKind};
use crate::storage::{Result, StoragePort};
use crate::types::{Lease, QueueStatus, RunId, RunPatch, RunStatus};

/// Counts and ids per recovery bucket.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Orphaned `running` items reverted to `queued`.
    pub requeued_running: Vec<RunId>,
    /// Orphaned `paused` items whose lease now carries the new owner.
    pub adopted_paused: Vec<RunId>,
    /// Queue items deleted because their run is terminal (or missing).
    pub cleaned_terminal: Vec<RunId>,
}

impl RecoveryReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requeued_running.is_empty()
            && self.adopted_paused.is_empty()
            && self.cleaned_terminal.is_empty()
    }
}

/// Runs exactly once during engine startup, before the scheduler starts.
/// Any storage error aborts startup: no half-recovered state.
pub struct RecoveryCoordinator {
    storage: StoragePort,
    bus: EventsBus,
    config: Arc<EngineConfig>,
}

impl RecoveryCoordinator {
    #[must_use]
    pub fn new(storage: StoragePort, bus: EventsBus, config: Arc<EngineConfig>) -> Self {
        Self {
            storage,
            bus,
            config,
        }
    }

    /// Sweep every queue item, taking ownership for `new_owner`.
    #[instrument(skip(self), err)]
    pub async fn run(&self, new_owner: &str) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for item in self.storage.queue.list().await? {
            let run = self.storage.runs.get(&item.id).await?;
            let Some(run) = run else {
                tracing::warn!(run_id = %item.id, "queue item without run record; dropping");
                self.storage.queue.remove(&item.id).await?;
                report.cleaned_terminal.push(item.id);
                continue;
            };

            if run.status.is_terminal() {
                self.storage.queue.remove(&item.id).await?;
                report.cleaned_terminal.push(item.id);
                continue;
            }

            match item.status {
                QueueStatus::Queued => {}
                QueueStatus::Running => {
                    self.storage.queue.release_to_queued(&item.id).await?;
                    self.storage
                        .runs
                        .patch(&item.id, RunPatch::status(RunStatus::Queued))
                        .await?;
                    self.bus
                        .append(EventInput::new(
                            item.id.clone(),
                            RunEventKind::RunRecovered {
                                phase: RecoveredPhase::RequeuedRunning,
                            },
                        ))
                        .await?;
                    report.requeued_running.push(item.id);
                }
                QueueStatus::Paused => {
                    // Already carrying the new owner means a prior pass
                    // adopted it; running recovery twice must be a no-op.
                    let already_adopted = item
                        .lease
                        .as_ref()
                        .is_some_and(|lease| lease.owner_id == new_owner);
                    if already_adopted {
                        continue;
                    }
                    let lease = Lease::new(
                        new_owner,
                        Utc::now()
                            + chrono::Duration::milliseconds(self.config.lease_ttl_ms as i64),
                    );
                    self.storage.queue.mark_paused(&item.id, lease).await?;
                    report.adopted_paused.push(item.id);
                }
            }
        }

        tracing::info!(
            requeued = report.requeued_running.len(),
            adopted = report.adopted_paused.len(),
            cleaned = report.cleaned_terminal.len(),
            "recovery sweep complete"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for RecoveryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryCoordinator").finish_non_exhaustive()
    }
}
