//! One-shot tracing subscriber setup for host binaries and test harnesses.

use tracing_subscriber::EnvFilter;

/// Install a JSON-formatted tracing subscriber honoring `RUST_LOG`, falling
/// back to `info` for the orchestrator's own targets. Safe to call more than
/// once; subsequent calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_target(true)
        .try_init();
}
