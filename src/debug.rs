//! Breakpoints and the debug command surface.
//!
//! [`BreakpointRegistry`] is engine-lifetime state: it survives walker
//! recreation for the same run id, which is what makes breakpoints and step
//! mode stick across pause/resume and crash-recovery re-claims within one
//! process. [`DebugController`] is the command surface the RPC layer
//! dispatches `debug.*` requests to.

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::ErrorInfo;
use crate::runner::gate::RunnerRegistry;
use crate::storage::StoragePort;
use crate::types::{NodeId, RunId};

/// Stepping behavior applied at the walker's next node boundary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepMode {
    #[default]
    None,
    /// Pause at the next node, then revert to `None` (one stop consumed).
    StepOver,
}

#[derive(Clone, Debug, Default)]
struct BreakpointState {
    nodes: FxHashSet<NodeId>,
    step_mode: StepMode,
    attached: bool,
}

/// Per-run breakpoint sets and step modes.
#[derive(Default)]
pub struct BreakpointRegistry {
    inner: RwLock<FxHashMap<RunId, BreakpointState>>,
}

impl BreakpointRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_breakpoints(&self, run_id: &str, nodes: impl IntoIterator<Item = NodeId>) {
        let mut inner = self.inner.write();
        let state = inner.entry(run_id.to_string()).or_default();
        state.nodes = nodes.into_iter().collect();
    }

    pub fn add_breakpoint(&self, run_id: &str, node_id: impl Into<NodeId>) {
        self.inner
            .write()
            .entry(run_id.to_string())
            .or_default()
            .nodes
            .insert(node_id.into());
    }

    pub fn remove_breakpoint(&self, run_id: &str, node_id: &str) {
        if let Some(state) = self.inner.write().get_mut(run_id) {
            state.nodes.remove(node_id);
        }
    }

    #[must_use]
    pub fn breakpoints(&self, run_id: &str) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .inner
            .read()
            .get(run_id)
            .map(|s| s.nodes.iter().cloned().collect())
            .unwrap_or_default();
        nodes.sort_unstable();
        nodes
    }

    #[must_use]
    pub fn is_breakpoint(&self, run_id: &str, node_id: &str) -> bool {
        self.inner
            .read()
            .get(run_id)
            .is_some_and(|s| s.nodes.contains(node_id))
    }

    pub fn set_step_mode(&self, run_id: &str, mode: StepMode) {
        self.inner.write().entry(run_id.to_string()).or_default().step_mode = mode;
    }

    #[must_use]
    pub fn step_mode(&self, run_id: &str) -> StepMode {
        self.inner
            .read()
            .get(run_id)
            .map(|s| s.step_mode)
            .unwrap_or_default()
    }

    /// Walker side: if step mode is armed, consume one stop.
    #[must_use]
    pub fn consume_step(&self, run_id: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(state) = inner.get_mut(run_id) else {
            return false;
        };
        if state.step_mode == StepMode::StepOver {
            state.step_mode = StepMode::None;
            true
        } else {
            false
        }
    }

    pub fn set_attached(&self, run_id: &str, attached: bool) {
        self.inner.write().entry(run_id.to_string()).or_default().attached = attached;
    }

    #[must_use]
    pub fn is_attached(&self, run_id: &str) -> bool {
        self.inner.read().get(run_id).is_some_and(|s| s.attached)
    }

    /// Forget one run's state.
    pub fn clear_run(&self, run_id: &str) {
        self.inner.write().remove(run_id);
    }

    /// Drop everything. Test hook.
    pub fn reset(&self) {
        self.inner.write().clear();
    }
}

impl std::fmt::Debug for BreakpointRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakpointRegistry")
            .field("runs", &self.inner.read().len())
            .finish()
    }
}

/// Snapshot returned by `debug.getState` and pushed to state subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugState {
    pub run_id: RunId,
    pub attached: bool,
    pub breakpoints: Vec<NodeId>,
    pub step_mode: StepMode,
    /// Whether a live walker currently exists for the run.
    pub live: bool,
    pub paused: bool,
}

/// Debug command surface over live runners and the storage port.
pub struct DebugController {
    breakpoints: Arc<BreakpointRegistry>,
    runners: Arc<RunnerRegistry>,
    storage: StoragePort,
    state_subs: Mutex<Vec<flume::Sender<DebugState>>>,
}

impl DebugController {
    #[must_use]
    pub fn new(
        breakpoints: Arc<BreakpointRegistry>,
        runners: Arc<RunnerRegistry>,
        storage: StoragePort,
    ) -> Self {
        Self {
            breakpoints,
            runners,
            storage,
            state_subs: Mutex::new(Vec::new()),
        }
    }

    pub fn attach(&self, run_id: &str) -> DebugState {
        self.breakpoints.set_attached(run_id, true);
        self.publish(run_id)
    }

    pub fn detach(&self, run_id: &str) -> DebugState {
        self.breakpoints.set_attached(run_id, false);
        self.breakpoints.set_step_mode(run_id, StepMode::None);
        self.publish(run_id)
    }

    #[must_use]
    pub fn get_state(&self, run_id: &str) -> DebugState {
        self.snapshot(run_id)
    }

    pub fn set_breakpoints(&self, run_id: &str, nodes: Vec<NodeId>) -> DebugState {
        self.breakpoints.set_breakpoints(run_id, nodes);
        self.publish(run_id)
    }

    pub fn add_breakpoint(&self, run_id: &str, node_id: NodeId) -> DebugState {
        self.breakpoints.add_breakpoint(run_id, node_id);
        self.publish(run_id)
    }

    pub fn remove_breakpoint(&self, run_id: &str, node_id: &str) -> DebugState {
        self.breakpoints.remove_breakpoint(run_id, node_id);
        self.publish(run_id)
    }

    /// Read a run-local variable from the live walker; falls back to `None`
    /// when no walker exists or the walker is mid-attempt.
    #[must_use]
    pub fn get_var(&self, run_id: &str, name: &str) -> Option<Value> {
        self.runners.get(run_id)?.try_get_var(name)
    }

    /// Write a run-local variable on a parked walker.
    pub fn set_var(&self, run_id: &str, name: &str, value: Value) -> Result<(), ErrorInfo> {
        let handle = self
            .runners
            .get(run_id)
            .ok_or_else(|| ErrorInfo::validation(format!("no live runner for run {run_id}")))?;
        if handle.try_set_var(name, value) {
            Ok(())
        } else {
            Err(ErrorInfo::validation(
                "runner is executing; variables are writable only while paused",
            ))
        }
    }

    pub async fn get_persistent_var(&self, key: &str) -> Result<Option<Value>, ErrorInfo> {
        Ok(self
            .storage
            .vars
            .get(key)
            .await
            .map_err(ErrorInfo::from)?
            .map(|v| v.value))
    }

    pub async fn set_persistent_var(&self, key: &str, value: Value) -> Result<(), ErrorInfo> {
        self.storage
            .vars
            .set(key, value)
            .await
            .map(|_| ())
            .map_err(ErrorInfo::from)
    }

    /// Arm step mode; if the run is currently parked, resume it so the step
    /// lands on the next node boundary.
    pub fn step(&self, run_id: &str) -> DebugState {
        self.breakpoints.set_step_mode(run_id, StepMode::StepOver);
        if let Some(handle) = self.runners.get(run_id) {
            if handle.gate.is_paused() {
                handle.gate.resume();
            }
        }
        self.publish(run_id)
    }

    /// Subscribe to state snapshots pushed on every mutating command.
    #[must_use]
    pub fn subscribe_state(&self) -> flume::Receiver<DebugState> {
        let (tx, rx) = flume::unbounded();
        self.state_subs.lock().push(tx);
        rx
    }

    /// Push the current snapshot for `run_id` to subscribers; also invoked
    /// by the engine when a run status event arrives.
    pub fn notify_status_change(&self, run_id: &str) {
        self.publish(run_id);
    }

    fn snapshot(&self, run_id: &str) -> DebugState {
        let live = self.runners.get(run_id);
        DebugState {
            run_id: run_id.to_string(),
            attached: self.breakpoints.is_attached(run_id),
            breakpoints: self.breakpoints.breakpoints(run_id),
            step_mode: self.breakpoints.step_mode(run_id),
            live: live.is_some(),
            paused: live.is_some_and(|h| h.gate.is_paused()),
        }
    }

    fn publish(&self, run_id: &str) -> DebugState {
        let state = self.snapshot(run_id);
        self.state_subs
            .lock()
            .retain(|tx| tx.send(state.clone()).is_ok());
        state
    }
}

impl std::fmt::Debug for DebugController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugController").finish_non_exhaustive()
    }
}
