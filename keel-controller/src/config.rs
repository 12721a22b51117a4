//! Runtime configuration.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

/// The default number of attempts made for every store operation.
pub const DEFAULT_STORE_RETRY_ATTEMPTS: u32 = 3;
/// The default interval of the periodic rebalance, in seconds.
pub const DEFAULT_REBALANCE_INTERVAL_SECONDS: u64 = 300;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The controller's logging config, which uses Rust's `env_logger` directives.
    #[serde(default = "Config::default_rust_log")]
    pub rust_log: String,
    /// The name of the cluster managed by this controller.
    pub cluster_name: String,
    /// The identity of this controller, compared against the cluster's leader marker.
    pub controller_id: String,

    /// The number of attempts made for every store read and write before a run is aborted.
    #[serde(default = "Config::default_store_retry_attempts")]
    pub store_retry_attempts: u32,
    /// The interval at which a rebalance is triggered regardless of change notifications.
    ///
    /// A value of `0` disables the periodic rebalance.
    #[serde(default = "Config::default_rebalance_interval_seconds")]
    pub rebalance_interval_seconds: u64,

    /// The execution timeout stamped on every generated message, if any.
    #[serde(default)]
    pub message_timeout_ms: Option<u64>,
    /// The retry count stamped on every generated message.
    #[serde(default)]
    pub message_retry_count: u32,
}

impl Config {
    /// Build the config from the runtime environment.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the semantic constraints of the config.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.cluster_name.is_empty(), "CLUSTER_NAME must not be empty");
        ensure!(!self.controller_id.is_empty(), "CONTROLLER_ID must not be empty");
        ensure!(self.store_retry_attempts >= 1, "STORE_RETRY_ATTEMPTS must be at least 1");
        Ok(())
    }

    /// The interval of the periodic rebalance, if enabled.
    pub fn rebalance_interval(&self) -> Option<Duration> {
        match self.rebalance_interval_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    fn default_rust_log() -> String {
        "info".into()
    }

    fn default_store_retry_attempts() -> u32 {
        DEFAULT_STORE_RETRY_ATTEMPTS
    }

    fn default_rebalance_interval_seconds() -> u64 {
        DEFAULT_REBALANCE_INTERVAL_SECONDS
    }

    /// A config for tests, leading the cluster `test-cluster` as controller `controller-0`.
    #[cfg(test)]
    pub fn new_test() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            rust_log: "error".into(),
            cluster_name: "test-cluster".into(),
            controller_id: "controller-0".into(),
            store_retry_attempts: DEFAULT_STORE_RETRY_ATTEMPTS,
            rebalance_interval_seconds: 0,
            message_timeout_ms: None,
            message_retry_count: 0,
        })
    }
}
