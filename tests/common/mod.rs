//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use action_outbox::{
    ActionObject, ActionPool, ActionTarget, BatchToken, CancellationToken, CommitClient,
    CommitError, CommitRequest, CommitResponse, EventId, InMemoryQueueStore, OutboxConfig,
    QueueStore, RetryPolicy, Snapshot, StaticTokenProvider, StorageError,
};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing_subscriber::EnvFilter;

/// Installs a test-writer subscriber once; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Hold {
    started: Sender<()>,
    release: Receiver<()>,
}

/// Remote double that records every batch and fails on demand.
#[derive(Default)]
pub struct ScriptedClient {
    attempts: Mutex<Vec<Vec<ActionObject>>>,
    delivered: Mutex<Vec<Vec<ActionObject>>>,
    failures: Mutex<VecDeque<CommitError>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    delay: Duration,
    hold: Option<Hold>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each call fails with the next scripted error until the script runs out.
    pub fn failing_with(errors: impl IntoIterator<Item = CommitError>) -> Self {
        Self {
            failures: Mutex::new(errors.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every call signals `started` and then blocks until one `release` message
    /// arrives or the cancellation token fires.
    pub fn held() -> (Self, Receiver<()>, Sender<()>) {
        let (started_tx, started_rx) = unbounded();
        let (release_tx, release_rx) = unbounded();
        let client = Self {
            hold: Some(Hold {
                started: started_tx,
                release: release_rx,
            }),
            ..Self::default()
        };
        (client, started_rx, release_tx)
    }

    pub fn script(&self, errors: impl IntoIterator<Item = CommitError>) {
        self.failures.lock().unwrap().extend(errors);
    }

    pub fn attempts(&self) -> Vec<Vec<ActionObject>> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn delivered(&self) -> Vec<Vec<ActionObject>> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn max_concurrent_calls(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn call(
        &self,
        request: &CommitRequest,
        cancel: &CancellationToken,
    ) -> Result<CommitResponse, CommitError> {
        self.attempts.lock().unwrap().push(request.actions().to_vec());

        if let Some(hold) = &self.hold {
            let _ = hold.started.send(());
            loop {
                match hold.release.recv_timeout(Duration::from_millis(5)) {
                    Ok(()) => break,
                    Err(RecvTimeoutError::Timeout) if cancel.is_cancelled() => {
                        return Err(CommitError::Cancelled)
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        }
        if !self.delay.is_zero() && cancel.wait_timeout(self.delay) {
            return Err(CommitError::Cancelled);
        }

        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.delivered.lock().unwrap().push(request.actions().to_vec());
        Ok(CommitResponse {
            last_action_time: request.actions().iter().map(|a| a.action_time).max().unwrap_or(0),
        })
    }
}

impl CommitClient for ScriptedClient {
    fn commit_batch(
        &self,
        request: &CommitRequest,
        cancel: &CancellationToken,
    ) -> Result<CommitResponse, CommitError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let result = self.call(request, cancel);
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// In-memory queue whose next `failures` restores to Pending report a disk error.
pub struct FlakyRestoreStore {
    inner: InMemoryQueueStore,
    failures: AtomicUsize,
}

impl FlakyRestoreStore {
    pub fn failing_restores(failures: usize) -> Self {
        Self {
            inner: InMemoryQueueStore::new(),
            failures: AtomicUsize::new(failures),
        }
    }
}

impl QueueStore for FlakyRestoreStore {
    fn append(&self, action: ActionObject) -> Result<EventId, StorageError> {
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
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
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

/// Retries quickly so failure tests stay fast.
pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_backoff_ms: 1,
        max_backoff_ms: 4,
        multiplier: 2,
    }
}

pub fn pool(store: Arc<dyn QueueStore>, client: Arc<ScriptedClient>, retry: RetryPolicy) -> ActionPool {
    init_tracing();
    ActionPool::builder()
        .store(store)
        .client(client)
        .token_provider(Arc::new(StaticTokenProvider::new("test-token")))
        .config(OutboxConfig {
            retry,
            ..OutboxConfig::default()
        })
        .build()
        .unwrap()
}

/// An action that never schedules a flush on its own.
pub fn quiet(user: &str, action_time: i64) -> ActionObject {
    ActionObject::block(ActionTarget::new("feed", "img", user), 1)
        .with_action_time(action_time)
        .with_strategies(Vec::new())
}

pub fn users(batch: &[ActionObject]) -> Vec<String> {
    batch.iter().map(|a| a.target.target_user_id.clone()).collect()
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}
