//! Centralized server configuration.
//!
//! This module provides strongly-typed configuration for the server,
//! loaded via the `config` crate from environment variables. Nested
//! sections use a double underscore, e.g. `GATEWAY__BASE_URL`.

use chrono::TimeDelta;
use replyflow_engine::{DeliveryDedup, EngineConfig, RetryPolicy};
use replyflow_scheduler::RunnerConfig;
use serde::Deserialize;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// PostgreSQL database connection URL.
    pub database_url: String,

    /// NATS server URL for conversation state and timers.
    pub nats_url: String,

    /// Address the HTTP server listens on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Messaging gateway configuration.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Engine configuration.
    #[serde(default)]
    pub engine: EngineSettings,

    /// Scheduler configuration.
    #[serde(default)]
    pub scheduler: SchedulerSettings,

    /// Delivery dedup configuration.
    #[serde(default)]
    pub dedup: DedupSettings,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

/// Outbound messaging gateway configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Base URL of the platform messaging API.
    #[serde(default)]
    pub base_url: String,

    /// Bearer token sent with every request.
    #[serde(default)]
    pub access_token: String,

    /// Per-request timeout, in seconds.
    #[serde(default = "default_gateway_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Log sends instead of calling the platform.
    #[serde(default)]
    pub dry_run: bool,
}

fn default_gateway_timeout_seconds() -> u64 {
    10
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            access_token: String::new(),
            timeout_seconds: default_gateway_timeout_seconds(),
            dry_run: false,
        }
    }
}

impl GatewayConfig {
    /// The request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    /// Steps after which a conversation is aborted.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Gateway attempts per action, including the first.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Backoff before the first retry, in milliseconds.
    #[serde(default = "default_retry_initial_backoff_ms")]
    pub retry_initial_backoff_ms: u64,

    /// Upper bound on retry backoff, in milliseconds.
    #[serde(default = "default_retry_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,
}

fn default_max_steps() -> u32 {
    replyflow_engine::engine::DEFAULT_MAX_STEPS
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_initial_backoff_ms() -> u64 {
    250
}

fn default_retry_max_backoff_ms() -> u64 {
    5_000
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            retry_attempts: default_retry_attempts(),
            retry_initial_backoff_ms: default_retry_initial_backoff_ms(),
            retry_max_backoff_ms: default_retry_max_backoff_ms(),
        }
    }
}

impl EngineSettings {
    /// Builds the engine configuration.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_steps: self.max_steps,
            retry: RetryPolicy {
                max_attempts: self.retry_attempts.max(1),
                initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
                max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
            },
        }
    }
}

/// Timer and sweep configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSettings {
    /// Interval between due-timer polls, in seconds.
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,

    /// Interval between conversation sweeps, in seconds.
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,

    /// Idle hours after which a waiting conversation is abandoned.
    #[serde(default = "default_inactivity_timeout_hours")]
    pub inactivity_timeout_hours: i64,

    /// Idle seconds after which a running conversation is re-driven.
    #[serde(default = "default_stall_timeout_seconds")]
    pub stall_timeout_seconds: i64,

    /// Maximum timers fired per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_poll_interval_seconds() -> u64 {
    1
}

fn default_sweep_interval_seconds() -> u64 {
    60
}

fn default_inactivity_timeout_hours() -> i64 {
    24
}

fn default_stall_timeout_seconds() -> i64 {
    300
}

fn default_batch_size() -> usize {
    100
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
            inactivity_timeout_hours: default_inactivity_timeout_hours(),
            stall_timeout_seconds: default_stall_timeout_seconds(),
            batch_size: default_batch_size(),
        }
    }
}

impl SchedulerSettings {
    /// Builds the runner configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a timeout is not positive or is out of range.
    pub fn runner_config(&self) -> Result<RunnerConfig, config::ConfigError> {
        Ok(RunnerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_seconds.max(1)),
            sweep_interval: Duration::from_secs(self.sweep_interval_seconds.max(1)),
            inactivity_timeout: positive(
                "scheduler.inactivity_timeout_hours",
                TimeDelta::try_hours(self.inactivity_timeout_hours),
            )?,
            stall_timeout: positive(
                "scheduler.stall_timeout_seconds",
                TimeDelta::try_seconds(self.stall_timeout_seconds),
            )?,
            batch_size: self.batch_size,
            ..RunnerConfig::default()
        })
    }
}

fn positive(key: &str, delta: Option<TimeDelta>) -> Result<TimeDelta, config::ConfigError> {
    delta
        .filter(|delta| *delta > TimeDelta::zero())
        .ok_or_else(|| {
            config::ConfigError::Message(format!("{key} must be positive and in range"))
        })
}

/// Delivery dedup configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DedupSettings {
    /// How long a delivery ID is remembered, in seconds.
    #[serde(default = "default_dedup_ttl_seconds")]
    pub ttl_seconds: u64,

    /// Maximum remembered delivery IDs.
    #[serde(default = "default_dedup_capacity")]
    pub capacity: usize,
}

fn default_dedup_ttl_seconds() -> u64 {
    replyflow_engine::dedup::DEFAULT_TTL.as_secs()
}

fn default_dedup_capacity() -> usize {
    replyflow_engine::dedup::DEFAULT_CAPACITY
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            ttl_seconds: default_dedup_ttl_seconds(),
            capacity: default_dedup_capacity(),
        }
    }
}

impl DedupSettings {
    /// Builds the dedup cache.
    #[must_use]
    pub fn build(&self) -> DeliveryDedup {
        DeliveryDedup::new(Duration::from_secs(self.ttl_seconds), self.capacity)
    }
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_settings_have_correct_defaults() {
        let config = EngineSettings::default().engine_config();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn scheduler_settings_have_correct_defaults() {
        let config = SchedulerSettings::default().runner_config().expect("valid");
        assert_eq!(config, RunnerConfig::default());
    }

    #[test]
    fn out_of_range_timeouts_are_rejected() {
        let huge = SchedulerSettings {
            inactivity_timeout_hours: i64::MAX,
            ..SchedulerSettings::default()
        };
        let err = huge.runner_config().unwrap_err();
        assert!(err.to_string().contains("inactivity_timeout_hours"), "{err}");

        let negative = SchedulerSettings {
            stall_timeout_seconds: -5,
            ..SchedulerSettings::default()
        };
        let err = negative.runner_config().unwrap_err();
        assert!(err.to_string().contains("stall_timeout_seconds"), "{err}");
    }

    #[test]
    fn dedup_settings_have_correct_defaults() {
        let settings = DedupSettings::default();
        assert_eq!(settings.ttl_seconds, 600);
        assert_eq!(settings.capacity, 100_000);
    }

    #[test]
    fn retry_attempts_never_zero() {
        let settings = EngineSettings {
            retry_attempts: 0,
            ..EngineSettings::default()
        };
        assert_eq!(settings.engine_config().retry.max_attempts, 1);
    }

    #[test]
    fn loads_nested_sections() {
        let config: ServerConfig = config::Config::builder()
            .set_override("database_url", "postgres://localhost/replyflow")
            .and_then(|b| b.set_override("nats_url", "nats://localhost:4222"))
            .and_then(|b| b.set_override("gateway.dry_run", true))
            .and_then(|b| b.set_override("scheduler.batch_size", 10))
            .expect("overrides")
            .build()
            .expect("build")
            .try_deserialize()
            .expect("deserialize");

        assert!(config.gateway.dry_run);
        assert_eq!(config.scheduler.batch_size, 10);
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.engine.max_steps, 50);
    }
}
