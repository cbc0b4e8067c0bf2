//! Pool configuration.
//!
//! Durations are carried as `*_ms` integers so hosts can ship the whole
//! configuration as JSON next to their other settings.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Configuration for an [`ActionPool`](crate::ActionPool).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Retry schedule for transient commit failures.
    pub retry: RetryPolicy,
    /// Longest a flush waits for a concurrent flush to finish.
    pub barrier_timeout_ms: u64,
    /// Longest `finalize_pool` blocks.
    pub finalize_timeout_ms: u64,
    /// Name of the background flush thread.
    pub flush_worker_name: String,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            barrier_timeout_ms: 30_000,
            finalize_timeout_ms: 5_000,
            flush_worker_name: "outbox-flush".to_string(),
        }
    }
}

impl OutboxConfig {
    /// Parses and validates a JSON document. Missing fields take their defaults.
    ///
    /// # Errors
    /// `ConfigError::Parse` for malformed JSON, otherwise whatever `validate` reports.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()
    }

    /// Checks the configuration.
    ///
    /// # Errors
    /// `ConfigError` naming the first offending field.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.barrier_timeout_ms == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "barrier_timeout_ms",
                min: 1,
                actual: 0,
            });
        }
        if self.finalize_timeout_ms == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "finalize_timeout_ms",
                min: 1,
                actual: 0,
            });
        }
        if self.flush_worker_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "flush_worker_name",
                reason: "must not be empty".to_string(),
            });
        }
        let retry = self.retry.validate()?;
        Ok(Self { retry, ..self })
    }

    /// Bound on waiting for the commit barrier.
    #[must_use]
    pub const fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.barrier_timeout_ms)
    }

    /// Bound on the finalize flush.
    #[must_use]
    pub const fn finalize_timeout(&self) -> Duration {
        Duration::from_millis(self.finalize_timeout_ms)
    }
}
