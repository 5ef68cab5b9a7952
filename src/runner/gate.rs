//! Cooperative pause/cancel signalling between a walker and its controllers.
//!
//! The gate is the only channel through which the scheduler, RPC surface,
//! and debugger influence a live walker. The walker observes it exclusively
//! at suspension points; between them it runs uncontested.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::event::PauseReason;
use crate::types::RunId;

/// Shared, lockable view of a run's variable map. The walker holds the lock
/// across one node attempt; the debugger locks it only while the run is
/// parked at a suspension point.
pub type SharedVars = Arc<tokio::sync::Mutex<FxHashMap<String, Value>>>;

#[derive(Default)]
struct GateState {
    pause_requested: Option<PauseReason>,
    paused: bool,
    resume_requested: bool,
    canceled: bool,
    cancel_reason: Option<String>,
}

/// Pause/cancel flag cell with a single-use resume awaiter.
#[derive(Default)]
pub struct RunGate {
    state: Mutex<GateState>,
    notify: Notify,
}

impl RunGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the walker to pause at its next suspension point. Returns false
    /// if the run is already canceled, paused, or has a pending request.
    pub fn request_pause(&self, reason: PauseReason) -> bool {
        let mut st = self.state.lock();
        if st.canceled || st.paused || st.pause_requested.is_some() {
            return false;
        }
        st.pause_requested = Some(reason);
        true
    }

    /// Resume a paused run, or withdraw a not-yet-honored pause request.
    /// Returns whether there was anything to resume.
    pub fn resume(&self) -> bool {
        let mut st = self.state.lock();
        if st.canceled {
            return false;
        }
        if st.paused {
            st.resume_requested = true;
            drop(st);
            self.notify.notify_waiters();
            return true;
        }
        if st.pause_requested.take().is_some() {
            return true;
        }
        false
    }

    /// Set the cancel flag and wake any parked walker.
    pub fn cancel(&self, reason: Option<String>) {
        {
            let mut st = self.state.lock();
            st.canceled = true;
            if st.cancel_reason.is_none() {
                st.cancel_reason = reason;
            }
        }
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.state.lock().canceled
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    #[must_use]
    pub fn cancel_reason(&self) -> Option<String> {
        self.state.lock().cancel_reason.clone()
    }

    /// Walker side: consume a pending pause request.
    pub(crate) fn take_pause_request(&self) -> Option<PauseReason> {
        self.state.lock().pause_requested.take()
    }

    /// Walker side: mark the run parked before waiting.
    pub(crate) fn enter_paused(&self) {
        self.state.lock().paused = true;
    }

    /// Walker side: park until resumed or canceled.
    pub(crate) async fn wait_resumed(&self) -> WaitOutcome {
        loop {
            let notified = self.notify.notified();
            {
                let mut st = self.state.lock();
                if st.canceled {
                    return WaitOutcome::Canceled;
                }
                if st.resume_requested {
                    st.resume_requested = false;
                    st.paused = false;
                    return WaitOutcome::Resumed;
                }
            }
            notified.await;
        }
    }

    /// Resolve once the run is canceled; used to make waits cancellable.
    pub(crate) async fn wait_canceled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.state.lock().canceled {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for RunGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("RunGate")
            .field("paused", &st.paused)
            .field("canceled", &st.canceled)
            .finish_non_exhaustive()
    }
}

/// Outcome of waiting at a parked suspension point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    Resumed,
    Canceled,
}

/// Handle to a live walker: its gate plus a borrowed view of its variables.
/// Controllers must not retain variable guards past a suspension point.
#[derive(Clone)]
pub struct RunHandle {
    pub gate: Arc<RunGate>,
    pub vars: SharedVars,
}

impl RunHandle {
    /// Snapshot one variable. Fails with `None` while the walker holds the
    /// map (i.e. mid-attempt) rather than blocking.
    #[must_use]
    pub fn try_get_var(&self, name: &str) -> Option<Value> {
        self.vars.try_lock().ok()?.get(name).cloned()
    }

    /// Write one variable while the walker is parked. Returns false if the
    /// map is currently held by the walker.
    pub fn try_set_var(&self, name: &str, value: Value) -> bool {
        match self.vars.try_lock() {
            Ok(mut vars) => {
                vars.insert(name.to_string(), value);
                true
            }
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle").finish_non_exhaustive()
    }
}

/// Live walkers by run id. Inserted when the executor callback starts a
/// walker, removed when it returns.
#[derive(Default)]
pub struct RunnerRegistry {
    inner: parking_lot::RwLock<FxHashMap<RunId, RunHandle>>,
}

impl RunnerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, run_id: impl Into<RunId>, handle: RunHandle) {
        self.inner.write().insert(run_id.into(), handle);
    }

    pub fn remove(&self, run_id: &str) {
        self.inner.write().remove(run_id);
    }

    #[must_use]
    pub fn get(&self, run_id: &str) -> Option<RunHandle> {
        self.inner.read().get(run_id).cloned()
    }

    #[must_use]
    pub fn contains(&self, run_id: &str) -> bool {
        self.inner.read().contains_key(run_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
