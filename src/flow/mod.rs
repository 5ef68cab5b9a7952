//! Flow definitions: the graph model, structural validation, node policies,
//! and the condition evaluator used by `while` directives.

pub mod condition;
pub mod model;
pub mod policy;
pub mod validate;

pub use condition::{CompareOp, Condition, Operand, VarRef};
pub use model::{Edge, EdgeLabel, Flow, FlowGraph, Node, FLOW_SCHEMA_VERSION};
pub use policy::{
    compute_retry_delay_ms, decide_failure, resolve_policy, Backoff, ErrorPolicy, FailureDecision,
    GotoTarget, Jitter, NodePolicy, RetryOverride, RetryPolicy, TimeoutPolicy, TimeoutScope,
};
pub use validate::{validate_graph, GraphError};
