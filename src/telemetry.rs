// src/telemetry.rs

//! Logging bootstrap for embedding applications and tests.

use anyhow::{Result, anyhow};
use tracing_subscriber::filter::EnvFilter;

/// Installs a compact `tracing` subscriber with the given filter. The
/// `RUST_LOG` environment variable takes precedence when set. Calling this
/// more than once returns an error from the subscriber registry.
pub fn init_logging(filter: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .map_err(|e| anyhow!("invalid log filter '{filter}': {e}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .compact()
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}
