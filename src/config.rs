//! Engine configuration knobs and defaults.

/// Tunable parameters for the scheduler, lease manager, and walker.
///
/// Defaults are production-leaning; tests typically shrink the intervals and
/// set `poll_interval_ms` to 0 to make the scheduler purely kick-driven.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Upper bound on concurrently executing runs.
    pub max_parallel_runs: usize,
    /// Wall-clock lifetime of a lease granted on claim or renewal.
    pub lease_ttl_ms: u64,
    /// Period of the owner-scoped lease renewal loop. Kept well under the
    /// TTL so a healthy owner never loses its lease.
    pub heartbeat_interval_ms: u64,
    /// Period of the expired-lease reclaim sweep.
    pub reclaim_interval_ms: u64,
    /// Claim-poll safety net for lost kicks; 0 disables polling entirely.
    pub poll_interval_ms: u64,
    /// Iteration cap applied to `while` directives that do not set one.
    pub default_while_max_iterations: u64,
    /// Maximum nesting depth of control directives before
    /// `CONTROL_STACK_OVERFLOW`.
    pub max_control_stack_depth: u32,
    /// Claim attempts granted to a run before the engine gives up on it.
    pub max_attempts: u32,
    /// Tab identifier handed to plugin executions.
    pub tab_id: String,
    /// Database name for the sqlite backend when no explicit URL is given.
    pub sqlite_db_name: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_runs: 4,
            lease_ttl_ms: 30_000,
            heartbeat_interval_ms: 9_000,
            reclaim_interval_ms: 10_000,
            poll_interval_ms: 1_000,
            default_while_max_iterations: 1_000,
            max_control_stack_depth: 64,
            max_attempts: 3,
            tab_id: "main".to_string(),
            sqlite_db_name: Self::resolve_sqlite_db_name(None),
        }
    }
}

impl EngineConfig {
    fn resolve_sqlite_db_name(provided: Option<String>) -> Option<String> {
        if provided.is_some() {
            return provided;
        }
        dotenvy::dotenv().ok();
        Some(std::env::var("RUNLOOM_SQLITE_DB").unwrap_or_else(|_| "runloom.db".to_string()))
    }

    #[must_use]
    pub fn with_max_parallel_runs(mut self, n: usize) -> Self {
        self.max_parallel_runs = n.max(1);
        self
    }

    #[must_use]
    pub fn with_lease_ttl_ms(mut self, ttl: u64) -> Self {
        self.lease_ttl_ms = ttl;
        // Heartbeat tracks the TTL unless explicitly overridden afterwards.
        self.heartbeat_interval_ms = (ttl * 3 / 10).max(1);
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval_ms(mut self, interval: u64) -> Self {
        self.heartbeat_interval_ms = interval.max(1);
        self
    }

    #[must_use]
    pub fn with_reclaim_interval_ms(mut self, interval: u64) -> Self {
        self.reclaim_interval_ms = interval.max(1);
        self
    }

    /// 0 makes the scheduler kick-driven only (used in tests).
    #[must_use]
    pub fn with_poll_interval_ms(mut self, interval: u64) -> Self {
        self.poll_interval_ms = interval;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_sqlite_db_name(mut self, name: impl Into<String>) -> Self {
        self.sqlite_db_name = Self::resolve_sqlite_db_name(Some(name.into()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_ttl_adjusts_heartbeat() {
        let cfg = EngineConfig::default().with_lease_ttl_ms(10_000);
        assert_eq!(cfg.heartbeat_interval_ms, 3_000);
        assert!(cfg.heartbeat_interval_ms < cfg.lease_ttl_ms);
    }

    #[test]
    fn parallelism_floor_is_one() {
        let cfg = EngineConfig::default().with_max_parallel_runs(0);
        assert_eq!(cfg.max_parallel_runs, 1);
    }
}
