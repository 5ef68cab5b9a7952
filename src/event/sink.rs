//! Sinks: secondary consumers of the persisted event stream.
//!
//! Sinks run inside the bus fan-out, after the append has been persisted.
//! A failing sink is logged and skipped; it can never affect the append or
//! other consumers.

use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Result as IoResult, Write};
use std::path::Path;
use std::sync::Arc;

use super::event::RunEvent;

/// Abstraction over an output target that consumes persisted events.
pub trait EventSink: Send + Sync {
    /// Handle one event. The sink decides how to serialize it.
    fn handle(&self, event: &RunEvent) -> IoResult<()>;

    /// Stable, human-friendly identifier used in failure logs.
    fn name(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

/// In-memory sink for tests and snapshots.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<RunEvent>>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone out the captured events without holding the lock.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RunEvent> {
        self.entries.lock().clone()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn handle(&self, event: &RunEvent) -> IoResult<()> {
        self.entries.lock().push(event.clone());
        Ok(())
    }

    fn name(&self) -> String {
        "MemorySink".to_string()
    }
}

/// JSON Lines sink: one event per line, for trace export and log shipping.
pub struct JsonLinesSink {
    handle: Mutex<Box<dyn Write + Send>>,
}

impl JsonLinesSink {
    #[must_use]
    pub fn new(handle: Box<dyn Write + Send>) -> Self {
        Self {
            handle: Mutex::new(handle),
        }
    }

    pub fn to_file(path: impl AsRef<Path>) -> IoResult<Self> {
        Ok(Self::new(Box::new(File::create(path)?)))
    }
}

impl EventSink for JsonLinesSink {
    fn handle(&self, event: &RunEvent) -> IoResult<()> {
        let json = serde_json::to_string(event)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut handle = self.handle.lock();
        writeln!(handle, "{json}")?;
        handle.flush()
    }

    fn name(&self) -> String {
        "JsonLinesSink".to_string()
    }
}
