//! The events bus: persist-then-fan-out over the event store.
//!
//! `append` persists through the [`EventStore`] (which allocates `seq`
//! atomically per run) and only then notifies subscribers and sinks, so a
//! subscriber can never observe an event that is not durable. Within one run
//! subscribers see events in persisted seq order; across runs no ordering is
//! guaranteed. A closed subscriber or failing sink never affects the append
//! caller or the other consumers.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::storage::{EventStore, Result};

use super::event::{EventFilter, EventInput, RunEvent};
use super::sink::EventSink;

struct Subscriber {
    filter: EventFilter,
    tx: flume::Sender<RunEvent>,
}

/// Append-only run-event log with fan-out subscriptions.
#[derive(Clone)]
pub struct EventsBus {
    events: Arc<dyn EventStore>,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    sinks: Arc<Mutex<Vec<Box<dyn EventSink>>>>,
}

impl EventsBus {
    #[must_use]
    pub fn new(events: Arc<dyn EventStore>) -> Self {
        Self {
            events,
            subscribers: Arc::new(Mutex::new(Vec::new())),
            sinks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Persist an event and fan it out to every matching live subscriber.
    /// The returned record carries the allocated `seq` and `ts`.
    pub async fn append(&self, input: EventInput) -> Result<RunEvent> {
        let event = self.events.append(input).await?;
        self.fan_out(&event);
        Ok(event)
    }

    /// Subscribe with a filter; a missing run id matches all runs.
    /// Unsubscription is dropping the stream.
    #[must_use]
    pub fn subscribe(&self, filter: EventFilter) -> EventStream {
        let (tx, rx) = flume::unbounded();
        self.subscribers.lock().push(Subscriber { filter, tx });
        EventStream { rx }
    }

    /// Attach a sink that observes every persisted event.
    pub fn add_sink(&self, sink: Box<dyn EventSink>) {
        self.sinks.lock().push(sink);
    }

    /// Pass-through query of the persisted trace for one run.
    pub async fn list(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        self.events.list(run_id).await
    }

    /// Number of live subscribers (disconnected ones are pruned on the next
    /// fan-out).
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn fan_out(&self, event: &RunEvent) {
        self.subscribers.lock().retain(|sub| {
            if !sub.filter.matches(event) {
                return true;
            }
            // A send failure means the stream was dropped; prune it.
            sub.tx.send(event.clone()).is_ok()
        });
        for sink in self.sinks.lock().iter() {
            if let Err(err) = sink.handle(event) {
                tracing::warn!(sink = %sink.name(), error = %err, "event sink failed");
            }
        }
    }
}

impl std::fmt::Debug for EventsBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventsBus")
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

/// Handle yielding events as they are appended, in per-run seq order.
pub struct EventStream {
    rx: flume::Receiver<RunEvent>,
}

impl EventStream {
    /// Wait for the next matching event; `None` when the bus is gone.
    pub async fn recv(&mut self) -> Option<RunEvent> {
        self.rx.recv_async().await.ok()
    }

    /// Non-blocking poll.
    pub fn try_recv(&mut self) -> Option<RunEvent> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `duration` for the next event.
    pub async fn next_timeout(&mut self, duration: Duration) -> Option<RunEvent> {
        tokio::time::timeout(duration, self.recv()).await.ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::event::RunEventKind;
    use crate::event::sink::MemorySink;
    use crate::storage::memory::MemoryStorage;
    use crate::types::{RunDebugOptions, RunRecord};
    use chrono::Utc;
    use rustc_hash::FxHashMap;

    async fn bus_with_runs(run_ids: &[&str]) -> (EventsBus, crate::storage::StoragePort) {
        let port = MemoryStorage::new().into_port();
        for id in run_ids {
            port.runs
                .save(RunRecord::queued(
                    (*id).into(),
                    "flow".into(),
                    FxHashMap::default(),
                    RunDebugOptions::default(),
                    3,
                    Utc::now(),
                ))
                .await
                .unwrap();
        }
        (EventsBus::new(port.events.clone()), port)
    }

    #[tokio::test]
    async fn append_persists_before_fan_out() {
        let (bus, port) = bus_with_runs(&["r1"]).await;
        let mut stream = bus.subscribe(EventFilter::all());
        let appended = bus
            .append(EventInput::new("r1", RunEventKind::RunQueued {}))
            .await
            .unwrap();
        assert_eq!(appended.seq, 1);
        let seen = stream.recv().await.unwrap();
        assert_eq!(seen, appended);
        assert_eq!(port.events.list("r1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn filter_scopes_to_one_run() {
        let (bus, _port) = bus_with_runs(&["r1", "r2"]).await;
        let mut only_r2 = bus.subscribe(EventFilter::run("r2"));
        bus.append(EventInput::new("r1", RunEventKind::RunQueued {}))
            .await
            .unwrap();
        bus.append(EventInput::new("r2", RunEventKind::RunQueued {}))
            .await
            .unwrap();
        let seen = only_r2.recv().await.unwrap();
        assert_eq!(seen.run_id, "r2");
        assert!(only_r2.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned_and_harmless() {
        let (bus, _port) = bus_with_runs(&["r1"]).await;
        let stream = bus.subscribe(EventFilter::all());
        assert_eq!(bus.subscriber_count(), 1);
        drop(stream);
        bus.append(EventInput::new("r1", RunEventKind::RunQueued {}))
            .await
            .unwrap();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn sinks_observe_every_event() {
        let (bus, _port) = bus_with_runs(&["r1"]).await;
        let sink = MemorySink::new();
        bus.add_sink(Box::new(sink.clone()));
        bus.append(EventInput::new("r1", RunEventKind::RunQueued {}))
            .await
            .unwrap();
        bus.append(EventInput::new("r1", RunEventKind::RunResumed {}))
            .await
            .unwrap();
        let captured = sink.snapshot();
        assert_eq!(captured.len(), 2);
        assert_eq!(captured[0].seq, 1);
        assert_eq!(captured[1].seq, 2);
    }
}
