//! Engine assembly: wires storage, bus, registries, recovery, lease
//! maintenance, and the scheduler into one running instance, and exposes
//! the operations the RPC surface dispatches to.
//!
//! Startup order is fixed: the recovery coordinator runs exactly once and
//! must succeed before the scheduler starts claiming.

use chrono::Utc;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::config::EngineConfig;
use crate::debug::{BreakpointRegistry, DebugController};
use crate::error::{ErrorCode, ErrorInfo};
use crate::event::{EventFilter, EventInput, EventStream, EventsBus, RunEvent, RunEventKind};
use crate::flow::{resolve_policy, Flow, TimeoutScope};
use crate::plugin::{ArtifactStore, MemoryArtifacts, PluginRegistry};
use crate::runner::{
    ParkObserver, RunGate, RunHandle, RunRunner, RunnerDeps, RunnerRegistry, SharedVars,
};
use crate::sched::{
    ActiveSet, LeaseKeeper, RecoveryCoordinator, RecoveryReport, RunExecutor, RunScheduler,
    SchedulerParkHook,
};
use crate::storage::{StorageError, StoragePort};
use crate::types::{
    new_owner_id, new_run_id, NodeId, OwnerId, QueueItem, QueueStatus, RunDebugOptions, RunId,
    RunPatch, RunRecord, RunStatus,
};

/// Parameters for scheduling a new run.
#[derive(Clone, Debug, Default)]
pub struct EnqueueOptions {
    pub args: FxHashMap<String, Value>,
    pub start_node_id: Option<NodeId>,
    pub debug: RunDebugOptions,
    pub priority: i32,
}

impl EnqueueOptions {
    #[must_use]
    pub fn with_arg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.args.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_pause_on_start(mut self) -> Self {
        self.debug.pause_on_start = true;
        self
    }

    #[must_use]
    pub fn with_breakpoints(mut self, breakpoints: Vec<NodeId>) -> Self {
        self.debug.breakpoints = breakpoints;
        self
    }
}

/// A running engine instance: one owner id, one scheduler, one bus.
pub struct Engine {
    config: Arc<EngineConfig>,
    storage: StoragePort,
    bus: EventsBus,
    plugins: Arc<PluginRegistry>,
    breakpoints: Arc<BreakpointRegistry>,
    runners: Arc<RunnerRegistry>,
    scheduler: Arc<RunScheduler>,
    lease_keeper: Arc<LeaseKeeper>,
    debug: Arc<DebugController>,
    owner_id: OwnerId,
    recovery: RecoveryReport,
    status_forwarder: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Boot with in-memory artifacts; see [`Engine::start_with_artifacts`].
    pub async fn start(
        config: EngineConfig,
        storage: StoragePort,
        plugins: Arc<PluginRegistry>,
    ) -> Result<Engine, StorageError> {
        Self::start_with_artifacts(config, storage, plugins, Arc::new(MemoryArtifacts::new())).await
    }

    /// Boot an engine: recovery sweep first, then lease keeper and
    /// scheduler. Fails (and starts nothing) on any recovery storage error.
    #[instrument(skip_all, err)]
    pub async fn start_with_artifacts(
        config: EngineConfig,
        storage: StoragePort,
        plugins: Arc<PluginRegistry>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Result<Engine, StorageError> {
        let config = Arc::new(config);
        let owner_id = new_owner_id();
        let bus = EventsBus::new(storage.events.clone());
        let breakpoints = Arc::new(BreakpointRegistry::new());
        let runners = Arc::new(RunnerRegistry::new());
        let active = Arc::new(ActiveSet::new());
        let kick = Arc::new(Notify::new());

        let recovery = RecoveryCoordinator::new(storage.clone(), bus.clone(), config.clone())
            .run(&owner_id)
            .await?;

        let park: Arc<dyn ParkObserver> =
            Arc::new(SchedulerParkHook::new(active.clone(), kick.clone()));
        let executor: Arc<dyn RunExecutor> = Arc::new(WalkerExecutor {
            deps: RunnerDeps {
                storage: storage.clone(),
                bus: bus.clone(),
                plugins: plugins.clone(),
                breakpoints: breakpoints.clone(),
                artifacts,
                config: config.clone(),
                owner_id: owner_id.clone(),
                park: Some(park),
            },
            runners: runners.clone(),
        });

        let scheduler = Arc::new(RunScheduler::new(
            storage.clone(),
            config.clone(),
            owner_id.clone(),
            executor,
            active.clone(),
            kick.clone(),
        ));
        let lease_keeper = Arc::new(LeaseKeeper::new(
            storage.clone(),
            config.clone(),
            owner_id.clone(),
            active,
            kick,
        ));

        let debug = Arc::new(DebugController::new(
            breakpoints.clone(),
            runners.clone(),
            storage.clone(),
        ));
        let status_forwarder = spawn_status_forwarder(&bus, debug.clone());

        lease_keeper.start();
        scheduler.start();
        scheduler.kick();

        Ok(Engine {
            config,
            storage,
            bus,
            plugins,
            breakpoints,
            runners,
            scheduler,
            lease_keeper,
            debug,
            owner_id,
            recovery,
            status_forwarder: parking_lot::Mutex::new(Some(status_forwarder)),
        })
    }

    /// What the startup recovery sweep found.
    #[must_use]
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    #[must_use]
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn storage(&self) -> &StoragePort {
        &self.storage
    }

    #[must_use]
    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    #[must_use]
    pub fn breakpoints(&self) -> &Arc<BreakpointRegistry> {
        &self.breakpoints
    }

    #[must_use]
    pub fn debug(&self) -> &Arc<DebugController> {
        &self.debug
    }

    /// Create and queue a run. Returns the run id and its position among
    /// currently queued items (0 = next to claim).
    #[instrument(skip(self, options), err)]
    pub async fn enqueue_run(
        &self,
        flow_id: &str,
        options: EnqueueOptions,
    ) -> Result<(RunId, usize), ErrorInfo> {
        self.storage
            .flows
            .get(flow_id)
            .await
            .map_err(ErrorInfo::from)?
            .ok_or_else(|| {
                ErrorInfo::new(ErrorCode::FlowNotFound, format!("flow `{flow_id}` not found"))
            })?;

        let now = Utc::now();
        let run_id = new_run_id();
        let mut record = RunRecord::queued(
            run_id.clone(),
            flow_id.to_string(),
            options.args,
            options.debug.clone(),
            self.config.max_attempts,
            now,
        );
        record.start_node_id = options.start_node_id;
        self.storage.runs.save(record).await.map_err(ErrorInfo::from)?;

        if !options.debug.breakpoints.is_empty() {
            self.breakpoints
                .set_breakpoints(&run_id, options.debug.breakpoints.clone());
        }

        self.bus
            .append(EventInput::new(run_id.clone(), RunEventKind::RunQueued {}))
            .await
            .map_err(ErrorInfo::from)?;

        let item = QueueItem::queued(run_id.clone(), flow_id.to_string(), options.priority, now);
        let key_of_new = (item.priority, item.created_at, item.id.clone());
        self.storage.queue.enqueue(item).await.map_err(ErrorInfo::from)?;

        let position = self
            .storage
            .queue
            .list()
            .await
            .map_err(ErrorInfo::from)?
            .into_iter()
            .filter(|other| {
                other.status == QueueStatus::Queued
                    && other.id != key_of_new.2
                    && (-other.priority, other.created_at, other.id.clone())
                        < (-key_of_new.0, key_of_new.1, key_of_new.2.clone())
            })
            .count();

        self.scheduler.kick();
        Ok((run_id, position))
    }

    /// Ask a live walker to pause at its next suspension point.
    pub fn pause_run(&self, run_id: &str) -> Result<(), ErrorInfo> {
        let handle = self
            .runners
            .get(run_id)
            .ok_or_else(|| ErrorInfo::validation(format!("run `{run_id}` is not active")))?;
        if handle.gate.is_paused() || handle.gate.request_pause(crate::event::PauseReason::Command)
        {
            Ok(())
        } else {
            Err(ErrorInfo::validation(format!(
                "run `{run_id}` cannot be paused in its current state"
            )))
        }
    }

    /// Resume a paused run. A live walker is signalled directly; a parked
    /// run with no walker (adopted after restart) is re-queued and will
    /// re-execute under the at-least-once contract.
    pub async fn resume_run(&self, run_id: &str) -> Result<(), ErrorInfo> {
        if let Some(handle) = self.runners.get(run_id) {
            if handle.gate.resume() {
                return Ok(());
            }
            return Err(ErrorInfo::validation(format!("run `{run_id}` is not paused")));
        }

        let item = self
            .storage
            .queue
            .get(run_id)
            .await
            .map_err(ErrorInfo::from)?
            .ok_or_else(|| ErrorInfo::validation(format!("run `{run_id}` is not active")))?;
        if item.status != QueueStatus::Paused {
            return Err(ErrorInfo::validation(format!("run `{run_id}` is not paused")));
        }
        self.storage
            .queue
            .release_to_queued(run_id)
            .await
            .map_err(ErrorInfo::from)?;
        self.storage
            .runs
            .patch(run_id, RunPatch::status(RunStatus::Queued))
            .await
            .map_err(ErrorInfo::from)?;
        self.bus
            .append(EventInput::new(run_id, RunEventKind::RunResumed {}))
            .await
            .map_err(ErrorInfo::from)?;
        self.scheduler.kick();
        Ok(())
    }

    /// Cancel a run: live walkers observe the flag at the next suspension
    /// point; pending queued runs are removed and stamped immediately.
    pub async fn cancel_run(&self, run_id: &str, reason: Option<String>) -> Result<(), ErrorInfo> {
        if let Some(handle) = self.runners.get(run_id) {
            handle.gate.cancel(reason);
            return Ok(());
        }

        let run = self
            .storage
            .runs
            .get(run_id)
            .await
            .map_err(ErrorInfo::from)?
            .ok_or_else(|| ErrorInfo::validation(format!("run `{run_id}` not found")))?;
        if run.status.is_terminal() {
            return Ok(());
        }

        self.storage.queue.remove(run_id).await.map_err(ErrorInfo::from)?;
        self.storage
            .runs
            .patch(
                run_id,
                RunPatch::status(RunStatus::Canceled).with_finished_at(Utc::now()),
            )
            .await
            .map_err(ErrorInfo::from)?;
        self.bus
            .append(EventInput::new(run_id, RunEventKind::RunCanceled { reason }))
            .await
            .map_err(ErrorInfo::from)?;
        Ok(())
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, ErrorInfo> {
        self.storage.runs.get(run_id).await.map_err(ErrorInfo::from)
    }

    pub async fn list_runs(
        &self,
        status: Option<RunStatus>,
    ) -> Result<Vec<RunRecord>, ErrorInfo> {
        match status {
            Some(status) => self
                .storage
                .runs
                .by_status(status)
                .await
                .map_err(ErrorInfo::from),
            None => self.storage.runs.list().await.map_err(ErrorInfo::from),
        }
    }

    pub async fn get_events(&self, run_id: &str) -> Result<Vec<RunEvent>, ErrorInfo> {
        self.bus.list(run_id).await.map_err(ErrorInfo::from)
    }

    pub async fn list_queue(&self) -> Result<Vec<QueueItem>, ErrorInfo> {
        self.storage.queue.list().await.map_err(ErrorInfo::from)
    }

    /// Subscribe to the live event stream.
    #[must_use]
    pub fn subscribe(&self, filter: EventFilter) -> EventStream {
        self.bus.subscribe(filter)
    }

    #[must_use]
    pub fn events_bus(&self) -> &EventsBus {
        &self.bus
    }

    /// Nudge the scheduler (tests and trigger adapters).
    pub fn kick(&self) {
        self.scheduler.kick();
    }

    /// Run one reclaim pass immediately (tests).
    pub async fn reclaim_once(&self) {
        self.lease_keeper.sweep_once().await;
    }

    /// Stop background loops. In-flight walkers finish or stay parked; a
    /// later engine start recovers them.
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        self.lease_keeper.stop().await;
        if let Some(task) = self.status_forwarder.lock().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("owner_id", &self.owner_id)
            .finish_non_exhaustive()
    }
}

fn spawn_status_forwarder(bus: &EventsBus, debug: Arc<DebugController>) -> JoinHandle<()> {
    let mut stream = bus.subscribe(EventFilter::all());
    tokio::spawn(async move {
        while let Some(event) = stream.recv().await {
            if event.kind.is_run_lifecycle() {
                debug.notify_status_change(&event.run_id);
            }
        }
    })
}

/// The executor callback wired into the scheduler: loads the run and flow,
/// walks the graph, and clears the queue item on terminal status.
struct WalkerExecutor {
    deps: RunnerDeps,
    runners: Arc<RunnerRegistry>,
}

/// Smallest run-scope timeout declared by the flow's effective node
/// policies, across the main graph and every subflow. The walker only
/// enforces `attempt` scope; `run` scope is enforced at this layer by
/// canceling the run when the deadline passes.
fn run_scope_timeout_ms(flow: &Flow, plugins: &PluginRegistry) -> Option<u64> {
    let graphs = std::iter::once(&flow.graph).chain(flow.subflows.values());
    let mut deadline: Option<u64> = None;
    for graph in graphs {
        for node in &graph.nodes {
            let definition = plugins.get(&node.kind);
            let policy = resolve_policy(
                flow.default_node_policy.as_ref(),
                definition.as_ref().and_then(|d| d.default_policy.as_ref()),
                node.policy.as_ref(),
            );
            let Some(timeout) = policy.timeout else { continue };
            if timeout.scope == TimeoutScope::Run && timeout.ms > 0 {
                deadline = Some(deadline.map_or(timeout.ms, |d| d.min(timeout.ms)));
            }
        }
    }
    deadline
}

impl WalkerExecutor {
    async fn fail_before_start(&self, run_id: &str, error: ErrorInfo) {
        let patch = RunPatch::status(RunStatus::Failed)
            .with_finished_at(Utc::now())
            .with_error(error.clone());
        if let Err(err) = self.deps.storage.runs.patch(run_id, patch).await {
            tracing::warn!(run_id, error = %err, "failed to stamp run failed");
        }
        if let Err(err) = self
            .deps
            .bus
            .append(EventInput::new(run_id, RunEventKind::RunFailed { error }))
            .await
        {
            tracing::warn!(run_id, error = %err, "failed to emit run.failed");
        }
        if let Err(err) = self.deps.storage.queue.remove(run_id).await {
            tracing::warn!(run_id, error = %err, "failed to drop queue item");
        }
    }
}

#[async_trait::async_trait]
impl RunExecutor for WalkerExecutor {
    async fn execute(&self, item: QueueItem) {
        let run_id = item.id.clone();

        let record = match self.deps.storage.runs.get(&run_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::warn!(run_id = %run_id, "claimed item without run record");
                let _ = self.deps.storage.queue.remove(&run_id).await;
                return;
            }
            Err(err) => {
                tracing::warn!(run_id = %run_id, error = %err, "run load failed; lease will expire");
                return;
            }
        };
        if record.status.is_terminal() {
            let _ = self.deps.storage.queue.remove(&run_id).await;
            return;
        }
        if item.attempt > record.max_attempts {
            self.fail_before_start(
                &run_id,
                ErrorInfo::internal(format!(
                    "run exceeded its {} claim attempts",
                    record.max_attempts
                )),
            )
            .await;
            return;
        }

        let flow = match self.deps.storage.flows.get(&record.flow_id).await {
            Ok(Some(flow)) => flow,
            Ok(None) => {
                self.fail_before_start(
                    &run_id,
                    ErrorInfo::new(
                        ErrorCode::FlowNotFound,
                        format!("flow `{}` not found", record.flow_id),
                    ),
                )
                .await;
                return;
            }
            Err(err) => {
                tracing::warn!(run_id = %run_id, error = %err, "flow load failed; lease will expire");
                return;
            }
        };

        let mut record = record;
        record.attempt = item.attempt;

        let gate = Arc::new(RunGate::new());
        let vars: SharedVars = Arc::new(tokio::sync::Mutex::new(FxHashMap::default()));
        self.runners.insert(
            run_id.clone(),
            RunHandle {
                gate: gate.clone(),
                vars: vars.clone(),
            },
        );

        let watchdog = run_scope_timeout_ms(&flow, &self.deps.plugins).map(|ms| {
            let gate = gate.clone();
            let run_id = run_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                tracing::warn!(run_id = %run_id, ms, "run-scope timeout reached; canceling run");
                gate.cancel(Some(format!("run timeout after {ms} ms")));
            })
        });

        let runner = RunRunner::new(self.deps.clone(), record, flow, gate, vars);
        let status = runner.run().await;

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
        self.runners.remove(&run_id);
        if let Err(err) = self.deps.storage.queue.remove(&run_id).await {
            tracing::warn!(run_id = %run_id, error = %err, "failed to remove queue item");
        }
        self.deps.breakpoints.clear_run(&run_id);
        tracing::info!(run_id = %run_id, status = %status, "run finished");
    }
}
