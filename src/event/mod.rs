//! Run events: the append-only trace model, the bus that persists and fans
//! them out, and pluggable sinks for export.

pub mod bus;
#[allow(clippy::module_inception)]
pub mod event;
pub mod sink;

pub use bus::{EventStream, EventsBus};
pub use event::{
    EventFilter, EventInput, LogLevel, PauseReason, RecoveredPhase, RunEvent, RunEventKind, VarOp,
};
pub use sink::{EventSink, JsonLinesSink, MemorySink};
