//! The action pool.
//!
//! [`ActionPool`] is the entry point application code talks to. Actions are
//! persisted by `put`, counted against their flush strategies, and delivered
//! in batches by `trigger_source`, either directly or through the background
//! flush worker that `trigger` feeds.
//!
//! # Example
//! ```rust,ignore
//! use std::sync::Arc;
//! use action_outbox::{ActionObject, ActionPool, ActionTarget, InMemoryQueueStore, StaticTokenProvider};
//!
//! let pool = ActionPool::builder()
//!     .store(Arc::new(InMemoryQueueStore::new()))
//!     .client(Arc::new(my_http_client))
//!     .token_provider(Arc::new(StaticTokenProvider::new("token")))
//!     .build()?;
//!
//! pool.put(ActionObject::like(ActionTarget::new("new_faces", "img-1", "user-1"), 1))?;
//! pool.finalize_pool();
//! ```

mod flush;
mod worker;

pub use worker::FlushRequest;

use std::sync::atomic::AtomicI64;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use crossbeam_channel::{bounded, RecvTimeoutError};
use tracing::{debug, error, info, trace, warn};

use crate::barrier::CommitBarrier;
use crate::config::OutboxConfig;
use crate::error::{ConfigError, OutboxError, OutboxResult};
use crate::event::{ActionObject, EventId};
use crate::remote::{AccessTokenProvider, CommitClient};
use crate::retry::CancellationToken;
use crate::storage::QueueStore;
use crate::strategy::{any_fires, TriggerState};

use flush::PoolCore;
use worker::FlushWorker;

/// Outcome of [`ActionPool::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutReceipt {
    /// Id assigned by the queue store.
    pub id: EventId,
    /// True if one of the action's strategies fired and a flush was requested.
    pub flush_scheduled: bool,
}

/// Outcome of [`ActionPool::finalize_pool`]. Whatever it is, nothing was lost.
#[derive(Debug)]
pub enum FinalizeOutcome {
    /// The queue was flushed (or already empty); carries the checkpoint.
    Drained(i64),
    /// The flush did not finish in time and keeps running in the background.
    TimedOut,
    /// The flush failed; events stay queued for the next session.
    Failed(OutboxError),
}

impl FinalizeOutcome {
    /// True if the queue was left empty.
    #[must_use]
    pub const fn is_drained(&self) -> bool {
        matches!(self, Self::Drained(_))
    }
}

/// Durable outbox of user actions.
pub struct ActionPool {
    core: Arc<PoolCore>,
    worker: Mutex<Option<FlushWorker>>,
}

impl std::fmt::Debug for ActionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionPool")
            .field("last_action_time", &self.core.last_action_time())
            .field("flushing", &self.core.barrier.is_held())
            .finish_non_exhaustive()
    }
}

impl ActionPool {
    /// Returns a builder for wiring the pool's collaborators.
    #[must_use]
    pub fn builder() -> ActionPoolBuilder {
        ActionPoolBuilder::new()
    }

    /// Persists an action and requests a flush if one of its strategies fires.
    ///
    /// # Errors
    /// `OutboxError::Storage` if the action could not be persisted. Nothing is
    /// counted or scheduled in that case.
    pub fn put(&self, action: ActionObject) -> OutboxResult<PutReceipt> {
        let action_type = action.action_type();
        let strategies = action.trigger_strategies.clone();
        let id = self.core.store.append(action)?;

        let fire = {
            let mut triggers = self.core.triggers();
            let count = triggers.record(action_type);
            let fire = any_fires(&strategies, &triggers.context(action_type, Utc::now()));
            debug!(%id, action_type = %action_type, count, fire, "action queued");
            fire
        };

        if fire {
            self.trigger();
        }
        Ok(PutReceipt {
            id,
            flush_scheduled: fire,
        })
    }

    /// Requests a background flush without waiting for it.
    pub fn trigger(&self) -> FlushRequest {
        let request = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(FlushRequest::Stopped, FlushWorker::request);
        match request {
            FlushRequest::Queued => trace!("flush requested"),
            FlushRequest::Collapsed => trace!("flush already queued"),
            FlushRequest::Stopped => warn!("flush worker stopped, request dropped"),
        }
        request
    }

    /// Flushes every Pending action now and returns the new checkpoint.
    ///
    /// Returns the current checkpoint without contacting the remote when
    /// nothing is pending.
    ///
    /// # Errors
    /// - `Storage` if the queue could not be read or updated
    /// - `Auth` if no access token is available or the remote refused it
    /// - `TransientNetwork` once the retries are exhausted
    /// - `FatalApi` if the remote rejected the batch
    /// - `BarrierTimeout` if another flush held the barrier too long
    /// - `Cancelled` after `shutdown`
    pub fn trigger_source(&self) -> OutboxResult<i64> {
        self.core.trigger_source()
    }

    /// Last checkpoint acknowledged by the remote (0 if none yet).
    #[must_use]
    pub fn last_action_time(&self) -> i64 {
        self.core.last_action_time()
    }

    /// Number of actions waiting for the next flush.
    ///
    /// # Errors
    /// `OutboxError::Storage` if the queue could not be read.
    pub fn pending_count(&self) -> OutboxResult<usize> {
        Ok(self.core.store.pending_count()?)
    }

    /// Best-effort drain for session teardown, bounded by `finalize_timeout`.
    ///
    /// Never loses data: whatever is not delivered stays queued.
    pub fn finalize_pool(&self) -> FinalizeOutcome {
        match self.core.store.pending_count() {
            Ok(0) => {
                debug!("finalize: nothing pending");
                return FinalizeOutcome::Drained(self.core.last_action_time());
            }
            Ok(pending) => info!(pending, "finalize: flushing"),
            Err(err) => return FinalizeOutcome::Failed(err.into()),
        }

        let timeout = self.core.config.finalize_timeout();
        let (tx, rx) = bounded::<OutboxResult<i64>>(1);
        let core = Arc::clone(&self.core);
        let name = format!("{}-finalize", self.core.config.flush_worker_name);
        let spawned = std::thread::Builder::new().name(name).spawn(move || {
            let _ = tx.send(core.trigger_source());
        });
        if let Err(err) = spawned {
            error!(error = %err, "finalize: could not spawn flush thread");
            return FinalizeOutcome::Failed(OutboxError::WorkerStopped);
        }

        match rx.recv_timeout(timeout) {
            Ok(Ok(checkpoint)) => FinalizeOutcome::Drained(checkpoint),
            Ok(Err(err)) => {
                warn!(error = %err, "finalize: flush failed, events stay queued");
                FinalizeOutcome::Failed(err)
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "finalize: flush timed out");
                FinalizeOutcome::TimedOut
            }
            Err(RecvTimeoutError::Disconnected) => {
                error!("finalize: flush thread panicked");
                FinalizeOutcome::Failed(OutboxError::WorkerStopped)
            }
        }
    }

    /// Drops every queued action and resets the checkpoint (logout, data reset).
    ///
    /// A flush already in progress resolves against the emptied queue as a
    /// no-op and does not publish its checkpoint.
    ///
    /// # Errors
    /// `OutboxError::Storage` if the queue could not be cleared.
    pub fn clear(&self) -> OutboxResult<()> {
        let mut generation = self.core.generation();
        *generation += 1;
        self.core.store.clear()?;
        self.core.store.set_checkpoint(0)?;
        self.core.set_last_action_time(0);
        self.core.triggers().reset(Utc::now());
        info!(generation = *generation, "action pool cleared");
        Ok(())
    }

    /// Cancels any in-flight commit, stops the flush worker and joins it.
    ///
    /// After shutdown every flush returns `Cancelled`; `put` keeps persisting.
    pub fn shutdown(&self) {
        self.core.cancel.cancel();
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            worker.shutdown();
            debug!("action pool shut down");
        }
    }
}

impl Drop for ActionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Builder for [`ActionPool`].
#[derive(Default)]
pub struct ActionPoolBuilder {
    store: Option<Arc<dyn QueueStore>>,
    client: Option<Arc<dyn CommitClient>>,
    tokens: Option<Arc<dyn AccessTokenProvider>>,
    config: Option<OutboxConfig>,
}

impl ActionPoolBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the queue store.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the remote commit client.
    #[must_use]
    pub fn client(mut self, client: Arc<dyn CommitClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Sets the access token provider.
    #[must_use]
    pub fn token_provider(mut self, tokens: Arc<dyn AccessTokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Sets the configuration (defaults apply otherwise).
    #[must_use]
    pub fn config(mut self, config: OutboxConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Builds the pool and starts its flush worker.
    ///
    /// The cached checkpoint is loaded from the store.
    ///
    /// # Errors
    /// - `Config` if a collaborator is missing or the configuration is invalid
    /// - `Storage` if the checkpoint could not be read
    /// - `WorkerStopped` if the flush thread could not be spawned
    pub fn build(self) -> OutboxResult<ActionPool> {
        let store = self.store.ok_or(ConfigError::MissingField { field: "store" })?;
        let client = self.client.ok_or(ConfigError::MissingField { field: "client" })?;
        let tokens = self
            .tokens
            .ok_or(ConfigError::MissingField { field: "token_provider" })?;
        let config = self.config.unwrap_or_default().validate()?;

        let checkpoint = store.checkpoint()?;
        let worker_name = config.flush_worker_name.clone();
        let core = Arc::new(PoolCore {
            store,
            client,
            tokens,
            barrier: CommitBarrier::new(),
            triggers: Mutex::new(TriggerState::new(Utc::now())),
            last_action_time: AtomicI64::new(checkpoint),
            generation: Mutex::new(0),
            stranded: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            config,
        });

        let worker = FlushWorker::start(&worker_name, Arc::clone(&core)).map_err(|err| {
            error!(error = %err, "could not spawn flush worker");
            OutboxError::WorkerStopped
        })?;
        info!(last_action_time = checkpoint, worker = %worker_name, "action pool started");

        Ok(ActionPool {
            core,
            worker: Mutex::new(Some(worker)),
        })
    }
}
