//! Tracing bootstrap for binaries and tests.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a fmt subscriber honoring `RUST_LOG`, defaulting to `info` for
/// this crate. Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("runloom=info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// Like [`init_tracing`], but with a caller-supplied default filter, e.g.
/// `"runloom=debug,sqlx=warn"`.
pub fn init_tracing_with(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = fmt().with_env_filter(filter).try_init();
}
