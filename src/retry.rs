//! Retry policy and cooperative cancellation for remote commits.
//!
//! Transient failures are retried within one flush with exponential backoff.
//! Every backoff sleep waits on a [`CancellationToken`], so shutting the pool
//! down wakes a sleeping flush immediately instead of after the full delay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{ConfigError, OutboxError, OutboxResult};
use crate::remote::CommitError;

/// Exponential backoff schedule for transient commit failures.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff_ms: u64,
    /// Upper bound for any single delay.
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays.
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Checks the policy.
    ///
    /// # Errors
    /// `ConfigError` if the multiplier is zero or the cap is below the initial delay.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.multiplier == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "retry.multiplier",
                min: 1,
                actual: 0,
            });
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::Invalid {
                field: "retry.max_backoff_ms",
                reason: format!(
                    "must not be below initial_backoff_ms ({} < {})",
                    self.max_backoff_ms, self.initial_backoff_ms
                ),
            });
        }
        Ok(self)
    }

    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32);
        let factor = u64::from(self.multiplier).saturating_pow(exponent);
        let ms = self.initial_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug)]
struct CancelInner {
    cancelled: AtomicBool,
    // Dropping the sender disconnects every receiver, waking all waiters at once.
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

/// Shared, cloneable cancellation flag that sleepers can block on.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: Arc<CancelInner>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = bounded::<()>(1);
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(tx)),
                signal: rx,
            }),
        }
    }

    /// Cancels the token. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let sender = self
            .inner
            .trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);
    }

    /// True once `cancel` was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Sleeps for `timeout` unless cancelled first. Returns true if cancelled.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        match self.inner.signal.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => self.is_cancelled(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }
}

/// Runs `attempt` until it succeeds, fails permanently, or the retries run out.
///
/// `attempt` receives the 1-based attempt number.
pub(crate) fn run_with_retry<T>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut attempt: impl FnMut(u32) -> Result<T, CommitError>,
) -> OutboxResult<T> {
    let mut attempts = 0_u32;
    loop {
        if cancel.is_cancelled() {
            return Err(OutboxError::Cancelled);
        }
        attempts += 1;
        let started = Instant::now();

        let err = match attempt(attempts) {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if !err.is_transient() || attempts > policy.max_retries {
            return Err(err.into_outbox_error(attempts));
        }
        let delay = policy.backoff(attempts);
        warn!(
            attempt = attempts,
            elapsed_ms,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient commit failure, retrying"
        );
        if cancel.wait_timeout(delay) {
            debug!(attempt = attempts, "retry sleep cancelled");
            return Err(OutboxError::Cancelled);
        }
    }
}
