// src/observability.rs
//! Logging setup for binaries and host integrations

use crate::utils::errors::{DiscoveryError, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Set to any value to emit JSON log lines instead of plain text
pub const LOG_JSON_ENV: &str = "DISCOVERY_LOG_JSON";

/// Install the global `tracing` subscriber.
///
/// Honors `RUST_LOG`, defaulting to `info`. Logs go to stderr so they never
/// interleave with data written to stdout.
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = if std::env::var_os(LOG_JSON_ENV).is_some() {
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .try_init()
    } else {
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_thread_names(true)
            .try_init()
    };

    installed.map_err(|e| DiscoveryError::ConfigError(format!("Failed to init tracing: {}", e)))
}
