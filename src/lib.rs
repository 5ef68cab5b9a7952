//! # Runloom: durable flow execution engine
//!
//! Runloom runs user-defined automation flows (directed acyclic graphs of
//! typed action nodes) as durable, concurrent "runs". A run is claimed from
//! a persistent queue under a lease, walked node by node through pluggable
//! executors, and every transition is persisted as an append-only event
//! stream with dense per-run sequence numbers. Crashed instances recover on
//! the next startup: orphaned running runs are re-queued, orphaned paused
//! runs are adopted, and terminal stragglers are cleaned.
//!
//! ## Core concepts
//!
//! - **Flow**: an immutable graph definition with nodes, labeled edges, and
//!   named subflows ([`flow`])
//! - **Run**: one execution of a flow, with a durable record and event trace
//! - **Plugin**: the node-kind extension point ([`plugin`])
//! - **Walker**: the per-run state machine with retry, timeout, control
//!   flow, and pause/cancel ([`runner`])
//! - **Scheduler**: lease-based claiming bounded by `max_parallel_runs`
//!   ([`sched`])
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use runloom::config::EngineConfig;
//! use runloom::engine::{Engine, EnqueueOptions};
//! use runloom::flow::{Edge, Flow, FlowGraph, Node};
//! use runloom::plugin::PluginRegistry;
//! use runloom::storage::StoragePort;
//!
//! # async fn example(plugins: Arc<PluginRegistry>) -> Result<(), Box<dyn std::error::Error>> {
//! let storage = StoragePort::in_memory();
//! let flow = Flow::new(
//!     "greet",
//!     "Greet",
//!     FlowGraph::new("hello")
//!         .with_node(Node::new("hello", "log"))
//!         .with_node(Node::new("done", "log"))
//!         .with_edge(Edge::new("hello", "done")),
//! );
//! storage.flows.save(flow).await?;
//!
//! let engine = Engine::start(EngineConfig::default(), storage, plugins).await?;
//! let (run_id, position) = engine
//!     .enqueue_run("greet", EnqueueOptions::default())
//!     .await?;
//! println!("run {run_id} queued at position {position}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Module guide
//!
//! - [`flow`] - Flow model, validation, policies, and conditions
//! - [`plugin`] - Node-kind registry and the execution contract
//! - [`storage`] - The durable storage port and its backends
//! - [`event`] - Run events, the bus, and sinks
//! - [`runner`] - The graph walker
//! - [`sched`] - Scheduler, lease keeper, recovery coordinator
//! - [`debug`] - Breakpoints and the debug controller
//! - [`rpc`] - Request/response wire surface and event streaming
//! - [`engine`] - Assembly and the operation API

pub mod config;
pub mod debug;
pub mod engine;
pub mod error;
pub mod event;
pub mod flow;
pub mod plugin;
pub mod rpc;
pub mod runner;
pub mod sched;
pub mod storage;
pub mod telemetry;
pub mod types;
