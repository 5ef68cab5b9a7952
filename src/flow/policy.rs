//! Node execution policies: timeout, retry, and error routing.
//!
//! The effective policy for a node is a shallow merge of the flow default,
//! the plugin default, and the node's own policy, in that order of
//! precedence (later wins). Sections (`timeout`, `retry`, `on_error`) are
//! replaced whole, never deep-merged.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, ErrorInfo};
use crate::flow::model::EdgeLabel;
use crate::types::NodeId;

/// Scope of a timeout. `Attempt` is enforced by the walker around each
/// execute call; `Run` is enforced by the scheduler's executor, which arms
/// a watchdog with the flow's smallest run-scope deadline and cancels the
/// run when it fires.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutScope {
    #[default]
    Attempt,
    Run,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutPolicy {
    pub ms: u64,
    #[serde(default)]
    pub scope: TimeoutScope,
}

/// Delay growth strategy across retry attempts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    None,
    Linear,
    Exp,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Jitter {
    #[default]
    None,
    Full,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Additional attempts beyond the first; `max_attempts = 1 + retries`.
    #[serde(default)]
    pub retries: u32,
    /// Base delay between attempts.
    #[serde(default)]
    pub interval_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_interval_ms: Option<u64>,
    #[serde(default)]
    pub jitter: Jitter,
    /// Error codes that qualify for retry; absent means all codes qualify.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_on: Option<Vec<ErrorCode>>,
}

impl RetryPolicy {
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        1 + self.retries
    }

    /// Merge an override from a `retry` error decision onto this policy.
    /// Field-wise: the override's non-default fields win.
    #[must_use]
    pub fn merged_with(&self, over: &RetryOverride) -> RetryPolicy {
        RetryPolicy {
            retries: over.retries.unwrap_or(self.retries),
            interval_ms: over.interval_ms.unwrap_or(self.interval_ms),
            backoff: over.backoff.unwrap_or(self.backoff),
            max_interval_ms: over.max_interval_ms.or(self.max_interval_ms),
            jitter: over.jitter.unwrap_or(self.jitter),
            retry_on: over.retry_on.clone().or_else(|| self.retry_on.clone()),
        }
    }

    /// Whether `code` qualifies for retry under this policy.
    #[must_use]
    pub fn qualifies(&self, code: ErrorCode) -> bool {
        match &self.retry_on {
            Some(codes) => codes.contains(&code),
            None => true,
        }
    }
}

/// Partial retry policy carried by an `onError: retry` decision.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<Jitter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_on: Option<Vec<ErrorCode>>,
}

/// Jump target for an `onError: goto` decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum GotoTarget {
    Node { node_id: NodeId },
    EdgeLabel { label: EdgeLabel },
}

/// Error routing declared in policy. Absent policy falls back to the node's
/// `onError` edge when it has one, otherwise the run fails.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ErrorPolicy {
    Stop,
    Continue,
    Goto {
        target: GotoTarget,
    },
    Retry {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        r#override: Option<RetryOverride>,
    },
}

/// Per-node policy bundle. Any section may be absent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<ErrorPolicy>,
}

impl NodePolicy {
    #[must_use]
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout = Some(TimeoutPolicy {
            ms,
            scope: TimeoutScope::Attempt,
        });
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn with_on_error(mut self, on_error: ErrorPolicy) -> Self {
        self.on_error = Some(on_error);
        self
    }
}

/// Shallow merge: `flow` < `plugin` < `node`, section-wise replacement.
#[must_use]
pub fn resolve_policy(
    flow: Option<&NodePolicy>,
    plugin: Option<&NodePolicy>,
    node: Option<&NodePolicy>,
) -> NodePolicy {
    let mut merged = NodePolicy::default();
    for layer in [flow, plugin, node].into_iter().flatten() {
        if layer.timeout.is_some() {
            merged.timeout = layer.timeout.clone();
        }
        if layer.retry.is_some() {
            merged.retry = layer.retry.clone();
        }
        if layer.on_error.is_some() {
            merged.on_error = layer.on_error.clone();
        }
    }
    merged
}

/// Delay before re-executing after failed attempt number `attempt` (1-based).
///
/// `linear` scales the base by the attempt number, `exp` doubles per attempt,
/// both clamped to `max_interval_ms` when set; full jitter then replaces the
/// delay with a uniform draw from `[0, delay]`. Never negative, floored to
/// integer milliseconds by construction.
#[must_use]
pub fn compute_retry_delay_ms(policy: &RetryPolicy, attempt: u32) -> u64 {
    let base = policy.interval_ms;
    let attempt = attempt.max(1);
    let mut delay = match policy.backoff {
        Backoff::None => base,
        Backoff::Linear => base.saturating_mul(u64::from(attempt)),
        Backoff::Exp => base.saturating_mul(1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX)),
    };
    if let Some(cap) = policy.max_interval_ms {
        delay = delay.min(cap);
    }
    if policy.jitter == Jitter::Full && delay > 0 {
        delay = rand::rng().random_range(0..=delay);
    }
    delay
}

/// Outcome of the failure-decision ladder for one failed attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum FailureDecision {
    /// Terminate the run as failed.
    Stop,
    /// Emit `node.failed` and advance along the default edge.
    Continue,
    /// Jump to a node or follow a labeled edge.
    Goto(GotoTarget),
    /// Follow the node's `onError` edge (no policy, edge present).
    FollowErrorEdge,
    /// Wait `delay_ms`, then re-execute the node.
    Retry { delay_ms: u64 },
}

impl FailureDecision {
    /// Label recorded in `node.failed` events.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            FailureDecision::Stop => "stop",
            FailureDecision::Continue => "continue",
            FailureDecision::Goto(_) => "goto",
            FailureDecision::FollowErrorEdge => "onErrorEdge",
            FailureDecision::Retry { .. } => "retry",
        }
    }
}

/// Apply the failure-decision ladder for one failed attempt: validation and
/// invariant errors terminate unconditionally; otherwise the `on_error`
/// policy routes, with retry budgets checked against `attempt`.
#[must_use]
pub fn decide_failure(
    policy: &NodePolicy,
    has_on_error_edge: bool,
    error: &ErrorInfo,
    attempt: u32,
) -> FailureDecision {
    if error.code.is_validation() || error.code.is_invariant() {
        return FailureDecision::Stop;
    }

    match &policy.on_error {
        None => {
            if has_on_error_edge {
                FailureDecision::FollowErrorEdge
            } else {
                FailureDecision::Stop
            }
        }
        Some(ErrorPolicy::Stop) => FailureDecision::Stop,
        Some(ErrorPolicy::Continue) => FailureDecision::Continue,
        Some(ErrorPolicy::Goto { target }) => FailureDecision::Goto(target.clone()),
        Some(ErrorPolicy::Retry { r#override }) => {
            let base = policy.retry.clone().unwrap_or_default();
            let effective = match r#override {
                Some(over) => base.merged_with(over),
                None => base,
            };
            let qualifies =
                effective.qualifies(error.code) && error.retryable != Some(false);
            if attempt < effective.max_attempts() && qualifies {
                FailureDecision::Retry {
                    delay_ms: compute_retry_delay_ms(&effective, attempt),
                }
            } else {
                FailureDecision::Stop
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry(retries: u32, interval_ms: u64, backoff: Backoff) -> RetryPolicy {
        RetryPolicy {
            retries,
            interval_ms,
            backoff,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn merge_precedence_is_flow_plugin_node() {
        let flow = NodePolicy::default().with_timeout_ms(1000).with_on_error(ErrorPolicy::Stop);
        let plugin = NodePolicy::default().with_timeout_ms(2000);
        let node = NodePolicy::default().with_on_error(ErrorPolicy::Continue);
        let merged = resolve_policy(Some(&flow), Some(&plugin), Some(&node));
        assert_eq!(merged.timeout.unwrap().ms, 2000);
        assert_eq!(merged.on_error, Some(ErrorPolicy::Continue));
        assert!(merged.retry.is_none());
    }

    #[test]
    fn sections_replace_not_deep_merge() {
        let flow = NodePolicy::default().with_retry(RetryPolicy {
            retries: 5,
            interval_ms: 100,
            max_interval_ms: Some(10_000),
            ..RetryPolicy::default()
        });
        let node = NodePolicy::default().with_retry(retry(1, 50, Backoff::None));
        let merged = resolve_policy(Some(&flow), None, Some(&node));
        let r = merged.retry.unwrap();
        assert_eq!(r.retries, 1);
        // The flow's max_interval_ms must not leak into the node's section.
        assert_eq!(r.max_interval_ms, None);
    }

    #[test]
    fn delay_backoff_curves() {
        assert_eq!(compute_retry_delay_ms(&retry(3, 100, Backoff::None), 2), 100);
        assert_eq!(compute_retry_delay_ms(&retry(3, 100, Backoff::Linear), 3), 300);
        assert_eq!(compute_retry_delay_ms(&retry(3, 100, Backoff::Exp), 1), 100);
        assert_eq!(compute_retry_delay_ms(&retry(3, 100, Backoff::Exp), 3), 400);
    }

    #[test]
    fn delay_clamps_then_jitters_within_bound() {
        let mut policy = retry(5, 1000, Backoff::Exp);
        policy.max_interval_ms = Some(1500);
        assert_eq!(compute_retry_delay_ms(&policy, 4), 1500);
        policy.jitter = Jitter::Full;
        for _ in 0..50 {
            assert!(compute_retry_delay_ms(&policy, 4) <= 1500);
        }
    }

    #[test]
    fn decision_defaults_to_error_edge_then_stop() {
        let err = ErrorInfo::tool("boom");
        let policy = NodePolicy::default();
        assert_eq!(
            decide_failure(&policy, true, &err, 1),
            FailureDecision::FollowErrorEdge
        );
        assert_eq!(decide_failure(&policy, false, &err, 1), FailureDecision::Stop);
    }

    #[test]
    fn validation_errors_never_retry() {
        let policy = NodePolicy::default()
            .with_retry(retry(5, 0, Backoff::None))
            .with_on_error(ErrorPolicy::Retry { r#override: None });
        let err = ErrorInfo::validation("bad config");
        assert_eq!(decide_failure(&policy, true, &err, 1), FailureDecision::Stop);
    }

    #[test]
    fn retry_budget_and_retry_on_gate() {
        let mut r = retry(2, 0, Backoff::None);
        r.retry_on = Some(vec![ErrorCode::ToolError]);
        let policy = NodePolicy::default()
            .with_retry(r)
            .with_on_error(ErrorPolicy::Retry { r#override: None });

        let tool_err = ErrorInfo::tool("boom");
        assert!(matches!(
            decide_failure(&policy, false, &tool_err, 1),
            FailureDecision::Retry { .. }
        ));
        assert!(matches!(
            decide_failure(&policy, false, &tool_err, 2),
            FailureDecision::Retry { .. }
        ));
        // Budget exhausted: attempts = 1 + retries = 3.
        assert_eq!(decide_failure(&policy, false, &tool_err, 3), FailureDecision::Stop);

        let net_err = ErrorInfo::new(ErrorCode::NetworkRequestFailed, "down");
        assert_eq!(decide_failure(&policy, false, &net_err, 1), FailureDecision::Stop);

        let non_retryable = ErrorInfo::tool("fatal").with_retryable(false);
        assert_eq!(
            decide_failure(&policy, false, &non_retryable, 1),
            FailureDecision::Stop
        );
    }

    #[test]
    fn retry_override_extends_budget() {
        let policy = NodePolicy::default().with_on_error(ErrorPolicy::Retry {
            r#override: Some(RetryOverride {
                retries: Some(2),
                interval_ms: Some(7),
                ..RetryOverride::default()
            }),
        });
        // No base retry section; the override supplies the whole budget.
        let err = ErrorInfo::tool("boom");
        assert_eq!(
            decide_failure(&policy, false, &err, 1),
            FailureDecision::Retry { delay_ms: 7 }
        );
        assert_eq!(decide_failure(&policy, false, &err, 3), FailureDecision::Stop);
    }
}
