//! The flush protocol.
//!
//! One flush moves every Pending event to InFlight, sends them as a single
//! batch and resolves the batch exactly once: deleted on success, restored to
//! Pending on any failure. Resolution on failure is owned by [`InFlightBatch`],
//! so a panic or an early `?` between marking and resolving cannot strand
//! events in InFlight.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error, info, trace, warn};

use crate::barrier::CommitBarrier;
use crate::config::OutboxConfig;
use crate::error::{OutboxError, OutboxResult};
use crate::event::ActionObject;
use crate::remote::{AccessTokenProvider, CommitClient, CommitRequest};
use crate::retry::{run_with_retry, CancellationToken};
use crate::storage::{BatchToken, QueueStore, Snapshot, StorageError};
use crate::strategy::TriggerState;

/// Snapshot that has been marked InFlight and not yet resolved.
///
/// Dropping an unresolved batch calls `commit_failure`. If that fails too, the
/// token is parked in `stranded` for the next flush to restore.
pub(crate) struct InFlightBatch<'a> {
    store: &'a dyn QueueStore,
    stranded: &'a Mutex<Vec<BatchToken>>,
    snapshot: Snapshot,
    resolved: bool,
}

impl<'a> InFlightBatch<'a> {
    pub(crate) fn new(
        store: &'a dyn QueueStore,
        stranded: &'a Mutex<Vec<BatchToken>>,
        snapshot: Snapshot,
    ) -> Self {
        Self {
            store,
            stranded,
            snapshot,
            resolved: false,
        }
    }

    pub(crate) fn token(&self) -> BatchToken {
        self.snapshot.token
    }

    pub(crate) fn len(&self) -> usize {
        self.snapshot.len()
    }

    pub(crate) fn actions(&self) -> Vec<ActionObject> {
        self.snapshot.actions()
    }

    /// Deletes the batch. On error the batch stays unresolved and is restored on drop.
    pub(crate) fn succeed(mut self) -> Result<(), StorageError> {
        self.store.commit_success(self.snapshot.token)?;
        self.resolved = true;
        Ok(())
    }

    /// Returns the batch to Pending. On error the restore is retried on drop.
    pub(crate) fn fail(mut self) -> Result<(), StorageError> {
        self.store.commit_failure(self.snapshot.token)?;
        self.resolved = true;
        Ok(())
    }
}

impl Drop for InFlightBatch<'_> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        let token = self.snapshot.token;
        warn!(batch = %token, events = self.snapshot.len(), "unresolved batch dropped, restoring to pending");
        if let Err(err) = self.store.commit_failure(token) {
            error!(batch = %token, error = %err, "failed to restore batch, retrying on next flush");
            self.stranded
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(token);
        }
    }
}

/// State shared by the pool handle, the flush worker and finalize helpers.
pub(crate) struct PoolCore {
    pub(crate) store: Arc<dyn QueueStore>,
    pub(crate) client: Arc<dyn CommitClient>,
    pub(crate) tokens: Arc<dyn AccessTokenProvider>,
    pub(crate) barrier: CommitBarrier,
    pub(crate) triggers: Mutex<TriggerState>,
    pub(crate) last_action_time: AtomicI64,
    /// Bumped by every `clear`; a commit started in an older generation must
    /// not publish its checkpoint.
    pub(crate) generation: Mutex<u64>,
    /// Batches whose restore to Pending failed.
    pub(crate) stranded: Mutex<Vec<BatchToken>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) config: OutboxConfig,
}

impl PoolCore {
    // Counters hold no invariants across fields, so a poisoned lock is still usable.
    pub(crate) fn triggers(&self) -> MutexGuard<'_, TriggerState> {
        self.triggers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn generation(&self) -> MutexGuard<'_, u64> {
        self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stranded(&self) -> MutexGuard<'_, Vec<BatchToken>> {
        self.stranded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn last_action_time(&self) -> i64 {
        self.last_action_time.load(Ordering::Acquire)
    }

    pub(crate) fn set_last_action_time(&self, value: i64) {
        self.last_action_time.store(value, Ordering::Release);
    }

    /// Retries `commit_failure` for batches an earlier flush could not restore.
    fn restore_stranded(&self) -> Result<(), StorageError> {
        let tokens = std::mem::take(&mut *self.stranded());
        let mut first_err = None;
        for token in tokens {
            match self.store.commit_failure(token) {
                Ok(()) => info!(batch = %token, "stranded batch restored to pending"),
                Err(err) => {
                    warn!(batch = %token, error = %err, "stranded batch still not restored");
                    self.stranded().push(token);
                    first_err.get_or_insert(err);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Flushes every Pending event as one batch and returns the checkpoint.
    pub(crate) fn trigger_source(&self) -> OutboxResult<i64> {
        if self.store.pending_count()? == 0 && self.stranded().is_empty() {
            trace!("nothing pending, skipping flush");
            return Ok(self.last_action_time());
        }
        if self.cancel.is_cancelled() {
            return Err(OutboxError::Cancelled);
        }

        let _gate = self.barrier.acquire(self.config.barrier_timeout())?;
        self.restore_stranded()?;

        // A flush that held the barrier before us may have drained the queue.
        if self.store.pending_count()? == 0 {
            debug!("queue drained by a concurrent flush");
            return Ok(self.last_action_time());
        }

        // Fetched before marking so an auth failure leaves every event Pending.
        let access_token = self.tokens.current_access_token()?;

        let (started_generation, snapshot) = {
            let generation = self.generation();
            (*generation, self.store.snapshot_and_mark()?)
        };
        if snapshot.is_empty() {
            return Ok(self.last_action_time());
        }
        let batch = InFlightBatch::new(self.store.as_ref(), &self.stranded, snapshot);
        let request = CommitRequest::new(access_token, batch.actions());

        let started = Instant::now();
        info!(batch = %batch.token(), actions = batch.len(), "committing actions");

        let outcome = run_with_retry(&self.config.retry, &self.cancel, |attempt| {
            trace!(batch = %batch.token(), attempt, "commit attempt");
            self.client.commit_batch(&request, &self.cancel)
        });
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(response) => {
                let token = batch.token();
                // Held across publish so `clear` cannot interleave with it.
                let generation = self.generation();
                batch.succeed()?;
                if *generation != started_generation {
                    info!(batch = %token, elapsed_ms, "queue cleared during commit, checkpoint discarded");
                    return Ok(self.last_action_time());
                }
                self.store.set_checkpoint(response.last_action_time)?;
                self.set_last_action_time(response.last_action_time);
                self.triggers().reset(Utc::now());
                info!(
                    batch = %token,
                    elapsed_ms,
                    last_action_time = response.last_action_time,
                    "commit succeeded"
                );
                Ok(response.last_action_time)
            }
            Err(err) => {
                let token = batch.token();
                match batch.fail() {
                    Ok(()) => warn!(batch = %token, elapsed_ms, error = %err, "commit failed, batch restored"),
                    Err(restore) => error!(
                        batch = %token,
                        elapsed_ms,
                        error = %err,
                        restore_error = %restore,
                        "commit failed and restoring the batch returned an error"
                    ),
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::event::ActionTarget;
    use crate::storage::InMemoryQueueStore;

    #[test]
    fn test_dropped_batch_is_restored() {
        let store = InMemoryQueueStore::new();
        let stranded = Mutex::new(Vec::new());
        store
            .append(ActionObject::unlike(ActionTarget::new("f", "i", "u")))
            .unwrap();
        let snapshot = store.snapshot_and_mark().unwrap();
        {
            let batch = InFlightBatch::new(&store, &stranded, snapshot);
            assert_eq!(batch.len(), 1);
        }
        assert_eq!(store.pending_count().unwrap(), 1);
        assert_eq!(store.in_flight_count().unwrap(), 0);
    }

    #[test]
    fn test_succeeded_batch_is_deleted() {
        let store = InMemoryQueueStore::new();
        let stranded = Mutex::new(Vec::new());
        store
            .append(ActionObject::unlike(ActionTarget::new("f", "i", "u")))
            .unwrap();
        let snapshot = store.snapshot_and_mark().unwrap();
        InFlightBatch::new(&store, &stranded, snapshot).succeed().unwrap();
        assert_eq!(store.pending_count().unwrap(), 0);
        assert_eq!(store.in_flight_count().unwrap(), 0);
    }

    #[test]
    fn test_batch_restored_on_panic() {
        let store = InMemoryQueueStore::new();
        let stranded = Mutex::new(Vec::new());
        store
            .append(ActionObject::unlike(ActionTarget::new("f", "i", "u")))
            .unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let snapshot = store.snapshot_and_mark().unwrap();
            let _batch = InFlightBatch::new(&store, &stranded, snapshot);
            panic!("remote client panicked");
        }));
        assert!(result.is_err());
        assert_eq!(store.pending_count().unwrap(), 1);
    }

    /// Delegates to an in-memory queue but fails the first `failures` restores.
    struct FlakyRestore {
        inner: InMemoryQueueStore,
        failures: AtomicUsize,
    }

    impl QueueStore for FlakyRestore {
        fn append(&self, action: ActionObject) -> Result<crate::event::EventId, StorageError> {
            self.inner.append(action)
        }
        fn pending_count(&self) -> Result<usize, StorageError> {
            self.inner.pending_count()
        }
        fn in_flight_count(&self) -> Result<usize, StorageError> {
            self.inner.in_flight_count()
        }
        fn snapshot_and_mark(&self) -> Result<Snapshot, StorageError> {
            self.inner.snapshot_and_mark()
        }
        fn commit_success(&self, token: BatchToken) -> Result<(), StorageError> {
            self.inner.commit_success(token)
        }
        fn commit_failure(&self, token: BatchToken) -> Result<(), StorageError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StorageError::Backend("disk briefly full".to_string()));
            }
            self.inner.commit_failure(token)
        }
        fn clear(&self) -> Result<(), StorageError> {
            self.inner.clear()
        }
        fn checkpoint(&self) -> Result<i64, StorageError> {
            self.inner.checkpoint()
        }
        fn set_checkpoint(&self, last_action_time: i64) -> Result<(), StorageError> {
            self.inner.set_checkpoint(last_action_time)
        }
    }

    #[test]
    fn test_failed_restore_is_retried_on_drop() {
        let store = FlakyRestore {
            inner: InMemoryQueueStore::new(),
            failures: AtomicUsize::new(1),
        };
        let stranded = Mutex::new(Vec::new());
        store
            .append(ActionObject::unlike(ActionTarget::new("f", "i", "u")))
            .unwrap();
        let snapshot = store.snapshot_and_mark().unwrap();

        assert!(InFlightBatch::new(&store, &stranded, snapshot).fail().is_err());
        assert_eq!(store.pending_count().unwrap(), 1);
        assert_eq!(store.in_flight_count().unwrap(), 0);
        assert!(stranded.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unrestorable_batch_is_parked() {
        let store = FlakyRestore {
            inner: InMemoryQueueStore::new(),
            failures: AtomicUsize::new(2),
        };
        let stranded = Mutex::new(Vec::new());
        store
            .append(ActionObject::unlike(ActionTarget::new("f", "i", "u")))
            .unwrap();
        let snapshot = store.snapshot_and_mark().unwrap();
        let token = snapshot.token;

        assert!(InFlightBatch::new(&store, &stranded, snapshot).fail().is_err());
        assert_eq!(store.in_flight_count().unwrap(), 1);
        assert_eq!(*stranded.lock().unwrap(), vec![token]);
    }
}
