//! Logging initialization helpers.
//!
//! Thin wrappers over `tracing-subscriber`: `RUST_LOG` wins when set,
//! otherwise the provided default level applies.

use tracing_subscriber::EnvFilter;

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Installs a human-readable subscriber. Safe to call more than once;
/// later calls are no-ops.
pub fn init_logging(default_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .try_init();
}

/// Installs a JSON subscriber for machine-ingested logs.
pub fn init_json_logging(default_level: &str) {
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter(default_level))
        .try_init();
}
