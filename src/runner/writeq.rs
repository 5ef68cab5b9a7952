//! Per-run serial write queue.
//!
//! Every event append and run patch a walker issues goes through this
//! mailbox: one flume channel, one consumer task, strict submission order.
//! That is what guarantees persisted events appear in emission order without
//! the walker blocking on storage. A failed write is logged and skipped; the
//! queue keeps draining.

use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::event::{EventInput, EventsBus, LogLevel, RunEventKind};
use crate::plugin::RunLog;
use crate::storage::RunStore;
use crate::types::{RunId, RunPatch};

enum WriteOp {
    Event(RunEventKind),
    Patch(RunPatch),
    Flush(oneshot::Sender<()>),
}

/// Cloneable submission side of the mailbox.
#[derive(Clone)]
pub struct WriterHandle {
    run_id: RunId,
    tx: flume::Sender<WriteOp>,
}

impl WriterHandle {
    /// Queue an event append. Non-blocking; order is submission order.
    pub fn event(&self, kind: RunEventKind) {
        if self.tx.send(WriteOp::Event(kind)).is_err() {
            tracing::warn!(run_id = %self.run_id, "write queue closed; event dropped");
        }
    }

    /// Queue a run-record patch.
    pub fn patch(&self, patch: RunPatch) {
        if self.tx.send(WriteOp::Patch(patch)).is_err() {
            tracing::warn!(run_id = %self.run_id, "write queue closed; patch dropped");
        }
    }

    /// Wait until every previously queued op has been attempted.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(WriteOp::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

impl RunLog for WriterHandle {
    fn log(&self, level: LogLevel, node_id: Option<&str>, message: &str) {
        match level {
            LogLevel::Error => tracing::error!(run_id = %self.run_id, node_id, "{message}"),
            LogLevel::Warn => tracing::warn!(run_id = %self.run_id, node_id, "{message}"),
            _ => tracing::debug!(run_id = %self.run_id, node_id, "{message}"),
        }
        self.event(RunEventKind::Log {
            level,
            message: message.to_string(),
            node_id: node_id.map(String::from),
        });
    }
}

impl std::fmt::Debug for WriterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterHandle")
            .field("run_id", &self.run_id)
            .finish()
    }
}

/// Owner of the consumer task. Dropping the last [`WriterHandle`] and calling
/// [`RunWriter::close`] drains the queue and ends the task.
pub struct RunWriter {
    handle: WriterHandle,
    task: JoinHandle<()>,
}

impl RunWriter {
    /// Spawn the consumer for one run.
    #[must_use]
    pub fn spawn(run_id: RunId, runs: Arc<dyn RunStore>, bus: EventsBus) -> Self {
        let (tx, rx) = flume::unbounded::<WriteOp>();
        let task_run_id = run_id.clone();
        let task = tokio::spawn(async move {
            while let Ok(op) = rx.recv_async().await {
                match op {
                    WriteOp::Event(kind) => {
                        let input = EventInput::new(task_run_id.clone(), kind);
                        if let Err(err) = bus.append(input).await {
                            tracing::warn!(
                                run_id = %task_run_id,
                                error = %err,
                                "event append failed; trace may be incomplete"
                            );
                        }
                    }
                    WriteOp::Patch(patch) => {
                        if let Err(err) = runs.patch(&task_run_id, patch).await {
                            tracing::warn!(
                                run_id = %task_run_id,
                                error = %err,
                                "run patch failed"
                            );
                        }
                    }
                    WriteOp::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });
        Self {
            handle: WriterHandle { run_id, tx },
            task,
        }
    }

    #[must_use]
    pub fn handle(&self) -> WriterHandle {
        self.handle.clone()
    }

    /// Drain the queue and stop the consumer.
    pub async fn close(self) {
        self.handle.flush().await;
        drop(self.handle);
        let _ = self.task.await;
    }
}
