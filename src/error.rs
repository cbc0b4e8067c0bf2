//! Error types for the action outbox.
//!
//! All errors are strongly typed using thiserror so callers can match on the
//! failure class: a storage failure is fatal for the caller of `put`, an auth
//! failure asks for re-login, transient network failures are retried, and
//! rejected payloads are surfaced immediately.

use thiserror::Error;

use crate::storage::StorageError;

/// Configuration errors reported by `validate()`.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A numeric field is below its allowed minimum.
    #[error("Field '{field}' must be at least {min} (got {actual})")]
    BelowMinimum {
        field: &'static str,
        min: u64,
        actual: u64,
    },

    /// A field has an unusable value.
    #[error("Field '{field}' is invalid: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },

    /// A required builder field was not set.
    #[error("Missing required field: {field}")]
    MissingField { field: &'static str },

    /// The configuration document could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Top-level error type for the outbox.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// Local persistence failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The access token could not be obtained or was rejected.
    #[error("Authentication error: {message}")]
    Auth {
        message: String,
    },

    /// Timeout, connectivity loss or a 5xx answer, after all retries.
    #[error("Transient network error after {attempts} attempt(s): {message}")]
    TransientNetwork {
        attempts: u32,
        message: String,
    },

    /// The remote service rejected the batch.
    #[error("Remote rejected commit (status {status}): {message}")]
    FatalApi {
        status: u16,
        message: String,
    },

    /// The flush was cancelled by shutdown.
    #[error("Commit cancelled")]
    Cancelled,

    /// The commit barrier could not be acquired in time.
    #[error("Commit barrier not acquired after {waited_ms}ms")]
    BarrierTimeout {
        waited_ms: u64,
    },

    /// Configuration was rejected.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The background flush worker is no longer running.
    #[error("Flush worker stopped")]
    WorkerStopped,
}

impl OutboxError {
    /// Creates an auth error.
    #[must_use]
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Returns true if this is a storage error.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if this is an auth error.
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }

    /// Returns true if a later flush may succeed without outside intervention.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork { .. } | Self::BarrierTimeout { .. } | Self::Cancelled
        )
    }

    /// Returns true if the error needs caller action (re-login, payload fix, disk).
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::Auth { .. } | Self::FatalApi { .. } | Self::Config(_)
        )
    }
}

/// Result type alias for outbox operations.
pub type OutboxResult<T> = Result<T, OutboxError>;
