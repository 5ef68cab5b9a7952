//! Engine error taxonomy and the wire-facing error payload.
//!
//! Module-level errors elsewhere in the crate are `thiserror` enums with
//! [`miette::Diagnostic`] metadata; everything that crosses the RPC boundary
//! or lands on a run record is first converted into [`ErrorInfo`], the single
//! serialized error shape shared by run records, `node.failed` / `run.failed`
//! events, and RPC error responses.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Stable error codes carried by [`ErrorInfo`].
///
/// The taxonomy groups into validation (rejected before execution),
/// environmental (storage/transport/plugin runtime), engine invariants
/// (always terminal), and timing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
    #[serde(rename = "DAG_INVALID")]
    DagInvalid,
    #[serde(rename = "DAG_CYCLE")]
    DagCycle,
    #[serde(rename = "UNSUPPORTED_NODE")]
    UnsupportedNode,
    #[serde(rename = "FLOW_NOT_FOUND")]
    FlowNotFound,
    #[serde(rename = "FLOW_CYCLE")]
    FlowCycle,
    #[serde(rename = "CONTROL_STACK_OVERFLOW")]
    ControlStackOverflow,
    #[serde(rename = "INVARIANT_VIOLATION")]
    InvariantViolation,
    #[serde(rename = "TOOL_ERROR")]
    ToolError,
    #[serde(rename = "NETWORK_REQUEST_FAILED")]
    NetworkRequestFailed,
    #[serde(rename = "INTERNAL")]
    Internal,
}

impl ErrorCode {
    /// Codes that abort before execution and never pass through retry policy.
    #[must_use]
    pub fn is_validation(self) -> bool {
        matches!(
            self,
            ErrorCode::ValidationError | ErrorCode::UnsupportedNode | ErrorCode::FlowNotFound
        )
    }

    /// Codes that indicate a broken engine invariant; these always terminate
    /// the run regardless of policy.
    #[must_use]
    pub fn is_invariant(self) -> bool {
        matches!(
            self,
            ErrorCode::DagInvalid
                | ErrorCode::DagCycle
                | ErrorCode::FlowCycle
                | ErrorCode::ControlStackOverflow
                | ErrorCode::InvariantViolation
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::DagInvalid => "DAG_INVALID",
            ErrorCode::DagCycle => "DAG_CYCLE",
            ErrorCode::UnsupportedNode => "UNSUPPORTED_NODE",
            ErrorCode::FlowNotFound => "FLOW_NOT_FOUND",
            ErrorCode::FlowCycle => "FLOW_CYCLE",
            ErrorCode::ControlStackOverflow => "CONTROL_STACK_OVERFLOW",
            ErrorCode::InvariantViolation => "INVARIANT_VIOLATION",
            ErrorCode::ToolError => "TOOL_ERROR",
            ErrorCode::NetworkRequestFailed => "NETWORK_REQUEST_FAILED",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialized error payload: persisted on failed run records, embedded in
/// failure events, and relayed verbatim over RPC.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorInfo>>,
}

impl ErrorInfo {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
            retryable: None,
            cause: None,
        }
    }

    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    #[must_use]
    pub fn tool(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ToolError, message)
    }

    #[must_use]
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvariantViolation, message)
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    #[must_use]
    pub fn with_cause(mut self, cause: ErrorInfo) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorInfo {}
