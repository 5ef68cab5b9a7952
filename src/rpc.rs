//! Method-dispatched request/response surface plus per-connection event
//! streaming.
//!
//! The transport framing (unix socket, websocket, in-process) lives outside
//! this crate; here are the wire shapes and the dispatcher. Storage errors
//! are relayed verbatim as [`ErrorInfo`]; nothing at this layer retries.

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::debug::DebugState;
use crate::engine::{Engine, EnqueueOptions};
use crate::error::ErrorInfo;
use crate::event::{EventFilter, RunEvent};
use crate::types::{NodeId, QueueItem, RunDebugOptions, RunId, RunRecord, RunStatus};

/// One RPC request. `method` selects the variant; debug commands are
/// namespaced `debug.*`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    EnqueueRun {
        flow_id: String,
        #[serde(default)]
        args: Option<FxHashMap<String, Value>>,
        #[serde(default)]
        start_node_id: Option<NodeId>,
        #[serde(default)]
        debug: Option<RunDebugOptions>,
        #[serde(default)]
        priority: Option<i32>,
    },
    PauseRun {
        run_id: RunId,
    },
    ResumeRun {
        run_id: RunId,
    },
    CancelRun {
        run_id: RunId,
        #[serde(default)]
        reason: Option<String>,
    },
    GetRun {
        run_id: RunId,
    },
    ListRuns {
        #[serde(default)]
        status: Option<RunStatus>,
    },
    GetEvents {
        run_id: RunId,
    },
    ListQueue,
    /// Add a per-connection subscription; `runId` absent subscribes to all.
    Subscribe {
        #[serde(default)]
        run_id: Option<RunId>,
    },
    Unsubscribe {
        #[serde(default)]
        run_id: Option<RunId>,
    },
    #[serde(rename = "debug.attach")]
    DebugAttach { run_id: RunId },
    #[serde(rename = "debug.detach")]
    DebugDetach { run_id: RunId },
    #[serde(rename = "debug.getState")]
    DebugGetState { run_id: RunId },
    #[serde(rename = "debug.setBreakpoints")]
    DebugSetBreakpoints {
        run_id: RunId,
        node_ids: Vec<NodeId>,
    },
    #[serde(rename = "debug.addBreakpoint")]
    DebugAddBreakpoint { run_id: RunId, node_id: NodeId },
    #[serde(rename = "debug.removeBreakpoint")]
    DebugRemoveBreakpoint { run_id: RunId, node_id: NodeId },
    #[serde(rename = "debug.getVar")]
    DebugGetVar { run_id: RunId, name: String },
    #[serde(rename = "debug.setVar")]
    DebugSetVar {
        run_id: RunId,
        name: String,
        value: Value,
    },
    #[serde(rename = "debug.step")]
    DebugStep { run_id: RunId },
}

/// One RPC response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Response {
    Ok,
    Enqueued { run_id: RunId, position: u64 },
    Run { run: Option<RunRecord> },
    Runs { runs: Vec<RunRecord> },
    Events { events: Vec<RunEvent> },
    Queue { items: Vec<QueueItem> },
    Var { value: Option<Value> },
    DebugState { state: DebugState },
    Error { error: ErrorInfo },
}

impl Response {
    fn from_result<T>(result: Result<T, ErrorInfo>, map: impl FnOnce(T) -> Response) -> Response {
        match result {
            Ok(value) => map(value),
            Err(error) => Response::Error { error },
        }
    }
}

/// Push message on the per-connection event stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamMessage {
    Event { event: RunEvent },
}

#[derive(Default)]
struct SubscriptionSet {
    /// `None` entry = all runs.
    filters: FxHashSet<Option<RunId>>,
}

impl SubscriptionSet {
    fn matches(&self, run_id: &str) -> bool {
        self.filters.contains(&None) || self.filters.contains(&Some(run_id.to_string()))
    }
}

/// One connection: a subscription filter set plus the pushed event stream.
pub struct RpcConnection {
    id: u64,
    subscriptions: Arc<Mutex<SubscriptionSet>>,
    rx: flume::Receiver<StreamMessage>,
    forwarder: JoinHandle<()>,
}

impl RpcConnection {
    /// Next pushed message, if any is pending.
    #[must_use]
    pub fn try_next(&self) -> Option<StreamMessage> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `duration` for the next pushed message.
    pub async fn next_timeout(&self, duration: Duration) -> Option<StreamMessage> {
        tokio::time::timeout(duration, self.rx.recv_async())
            .await
            .ok()
            .and_then(Result::ok)
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

impl std::fmt::Debug for RpcConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcConnection").field("id", &self.id).finish()
    }
}

/// Dispatches requests against an engine and manages connections.
pub struct RpcService {
    engine: Arc<Engine>,
    next_conn_id: AtomicU64,
}

impl RpcService {
    #[must_use]
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Open a connection: its stream receives `{type:"event", event}` for
    /// every bus event matching the connection's subscriptions.
    #[must_use]
    pub fn open_connection(&self) -> RpcConnection {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let subscriptions = Arc::new(Mutex::new(SubscriptionSet::default()));
        let (tx, rx) = flume::unbounded();
        let mut stream = self.engine.subscribe(EventFilter::all());
        let subs = subscriptions.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                if !subs.lock().matches(&event.run_id) {
                    continue;
                }
                if tx.send(StreamMessage::Event { event }).is_err() {
                    break;
                }
            }
        });
        RpcConnection {
            id,
            subscriptions,
            rx,
            forwarder,
        }
    }

    /// Dispatch one request on behalf of `conn`.
    pub async fn handle(&self, conn: &RpcConnection, request: Request) -> Response {
        match request {
            Request::EnqueueRun {
                flow_id,
                args,
                start_node_id,
                debug,
                priority,
            } => {
                let options = EnqueueOptions {
                    args: args.unwrap_or_default(),
                    start_node_id,
                    debug: debug.unwrap_or_default(),
                    priority: priority.unwrap_or(0),
                };
                Response::from_result(
                    self.engine.enqueue_run(&flow_id, options).await,
                    |(run_id, position)| Response::Enqueued {
                        run_id,
                        position: position as u64,
                    },
                )
            }
            Request::PauseRun { run_id } => {
                Response::from_result(self.engine.pause_run(&run_id), |()| Response::Ok)
            }
            Request::ResumeRun { run_id } => {
                Response::from_result(self.engine.resume_run(&run_id).await, |()| Response::Ok)
            }
            Request::CancelRun { run_id, reason } => Response::from_result(
                self.engine.cancel_run(&run_id, reason).await,
                |()| Response::Ok,
            ),
            Request::GetRun { run_id } => {
                Response::from_result(self.engine.get_run(&run_id).await, |run| Response::Run {
                    run,
                })
            }
            Request::ListRuns { status } => {
                Response::from_result(self.engine.list_runs(status).await, |runs| Response::Runs {
                    runs,
                })
            }
            Request::GetEvents { run_id } => {
                Response::from_result(self.engine.get_events(&run_id).await, |events| {
                    Response::Events { events }
                })
            }
            Request::ListQueue => {
                Response::from_result(self.engine.list_queue().await, |items| Response::Queue {
                    items,
                })
            }
            Request::Subscribe { run_id } => {
                conn.subscriptions.lock().filters.insert(run_id);
                Response::Ok
            }
            Request::Unsubscribe { run_id } => {
                conn.subscriptions.lock().filters.remove(&run_id);
                Response::Ok
            }
            Request::DebugAttach { run_id } => Response::DebugState {
                state: self.engine.debug().attach(&run_id),
            },
            Request::DebugDetach { run_id } => Response::DebugState {
                state: self.engine.debug().detach(&run_id),
            },
            Request::DebugGetState { run_id } => Response::DebugState {
                state: self.engine.debug().get_state(&run_id),
            },
            Request::DebugSetBreakpoints { run_id, node_ids } => Response::DebugState {
                state: self.engine.debug().set_breakpoints(&run_id, node_ids),
            },
            Request::DebugAddBreakpoint { run_id, node_id } => Response::DebugState {
                state: self.engine.debug().add_breakpoint(&run_id, node_id),
            },
            Request::DebugRemoveBreakpoint { run_id, node_id } => Response::DebugState {
                state: self.engine.debug().remove_breakpoint(&run_id, &node_id),
            },
            Request::DebugGetVar { run_id, name } => {
                // Run-local variables come from the live walker; fall back
                // to the persistent namespace when there is none.
                match self.engine.debug().get_var(&run_id, &name) {
                    Some(value) => Response::Var { value: Some(value) },
                    None => Response::from_result(
                        self.engine.debug().get_persistent_var(&name).await,
                        |value| Response::Var { value },
                    ),
                }
            }
            Request::DebugSetVar {
                run_id,
                name,
                value,
            } => Response::from_result(
                self.engine.debug().set_var(&run_id, &name, value),
                |()| Response::Ok,
            ),
            Request::DebugStep { run_id } => Response::DebugState {
                state: self.engine.debug().step(&run_id),
            },
        }
    }
}

impl std::fmt::Debug for RpcService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcService").finish_non_exhaustive()
    }
}
