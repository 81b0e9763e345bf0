//! Logging bootstrap.
//!
//! Structured logging via the tracing ecosystem. The default filter keeps
//! trustplane and tonic at info; override with `RUST_LOG`. Set
//! `TRUSTPLANE_LOG_FORMAT=json` for machine-readable output.

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. Call once per process, before any
/// other work.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "trustplane=info,tonic=info".into());

    let json = std::env::var("TRUSTPLANE_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
