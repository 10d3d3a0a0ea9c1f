//! Configuration management.
//!
//! The whole configuration surface is supplied at process start (environment
//! and/or file) and never re-read at runtime.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::dlq::{DeadLetterChannel, InMemoryDeadLetter, RedisDeadLetter};
use crate::error::{ErrorCode, ManovaleError};
use crate::retry::RetryPolicy;
use crate::store::StoreConfig;
use crate::telemetry::TelemetryConfig;
use crate::watcher::WatcherConfig;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Job store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Expiry watcher configuration
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Execution configuration
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Dead-letter channel configuration
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,

    /// Telemetry configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            watcher: WatcherConfig::default(),
            execution: ExecutionConfig::default(),
            dead_letter: DeadLetterConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

/// Configuration for the execution path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Delivery attempts for the immediate-execution path
    #[serde(default = "default_execution_attempts")]
    pub attempts: u32,

    /// Per-invocation timeout; a stalled invocation is a failure
    #[serde(with = "humantime_serde", default = "default_execution_timeout")]
    pub timeout: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            attempts: default_execution_attempts(),
            timeout: default_execution_timeout(),
        }
    }
}

impl ExecutionConfig {
    /// Retry policy for the immediate-execution path.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_retries(self.attempts)
    }
}

/// Which dead-letter backend to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterBackend {
    /// In-process bounded buffer (development and tests)
    Memory,
    /// Redis list (production)
    Redis,
}

impl Default for DeadLetterBackend {
    fn default() -> Self {
        Self::Memory
    }
}

/// Configuration for the dead-letter channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    /// Backend selection
    #[serde(default)]
    pub backend: DeadLetterBackend,

    /// Queue name (the Redis list key)
    #[serde(default = "default_dead_letter_queue")]
    pub queue: String,

    /// Redis connection URL (redis backend only)
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Maximum parked records (memory backend only)
    #[serde(default = "default_dead_letter_max_size")]
    pub max_size: usize,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            backend: DeadLetterBackend::default(),
            queue: default_dead_letter_queue(),
            redis_url: default_redis_url(),
            max_size: default_dead_letter_max_size(),
        }
    }
}

impl DeadLetterConfig {
    /// Build the configured dead-letter channel.
    pub fn build_channel(&self) -> crate::error::Result<std::sync::Arc<dyn DeadLetterChannel>> {
        match self.backend {
            DeadLetterBackend::Memory => {
                Ok(std::sync::Arc::new(InMemoryDeadLetter::new(self.max_size)))
            }
            DeadLetterBackend::Redis => {
                let client = redis::Client::open(self.redis_url.as_str()).map_err(|e| {
                    ManovaleError::with_internal(
                        ErrorCode::InvalidConfiguration,
                        "Invalid Redis URL for the dead-letter channel",
                        e.to_string(),
                    )
                })?;
                Ok(std::sync::Arc::new(RedisDeadLetter::new(
                    client,
                    self.queue.clone(),
                )))
            }
        }
    }
}

// Default value functions
fn default_execution_attempts() -> u32 {
    3
}
fn default_execution_timeout() -> Duration {
    Duration::from_secs(300)
}
fn default_dead_letter_queue() -> String {
    "ManovaleDlq".to_string()
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_dead_letter_max_size() -> usize {
    1000
}

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("MANOVALE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with the environment layered on top.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("MANOVALE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}
