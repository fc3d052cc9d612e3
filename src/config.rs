// src/config.rs

//! Manages stack configuration: loading, defaults, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime tuning knobs for the PubSub stack. Loaded from a TOML file or
/// assembled in code; every field has a sensible default.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PubSubConfig {
    /// Subscribe cadence applied when a reader group is created with a zero
    /// interval.
    #[serde(with = "humantime_serde", default = "default_subscribing_interval")]
    pub default_subscribing_interval: Duration,

    /// Publish cadence applied when a writer group is created with a zero
    /// interval.
    #[serde(with = "humantime_serde", default = "default_publishing_interval")]
    pub default_publishing_interval: Duration,

    /// Transport read timeout applied to non-blocking reader groups created
    /// with a zero timeout.
    #[serde(with = "humantime_serde", default = "default_receive_timeout")]
    pub default_receive_timeout: Duration,

    /// Default tracing filter, e.g. "info" or "ferrobus=debug".
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_subscribing_interval() -> Duration {
    Duration::from_millis(5)
}

fn default_publishing_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_receive_timeout() -> Duration {
    Duration::from_millis(1000)
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            default_subscribing_interval: default_subscribing_interval(),
            default_publishing_interval: default_publishing_interval(),
            default_receive_timeout: default_receive_timeout(),
            log_filter: default_log_filter(),
        }
    }
}

impl PubSubConfig {
    /// Loads and validates the configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()
            .with_context(|| format!("Failed to read configuration file '{path}'"))?;

        let cfg: PubSubConfig = settings
            .try_deserialize()
            .context("Failed to parse configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects values that would make the schedulers spin.
    pub fn validate(&self) -> Result<()> {
        if self.default_subscribing_interval.is_zero() {
            return Err(anyhow!("default_subscribing_interval must be non-zero"));
        }
        if self.default_publishing_interval.is_zero() {
            return Err(anyhow!("default_publishing_interval must be non-zero"));
        }
        Ok(())
    }
}
