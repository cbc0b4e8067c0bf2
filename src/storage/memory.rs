//! In-memory queue backend.
//!
//! Thread-safe reference implementation of [`QueueStore`]. Nothing survives the
//! process; intended for tests and hosts that bring their own persistence.

use std::sync::Mutex;

use tracing::debug;

use crate::event::{ActionObject, EventId};

use super::index::QueueIndex;
use super::traits::{lock_err, BatchToken, QueueStore, Snapshot, StorageError};

/// Queue store kept entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    index: Mutex<QueueIndex>,
}

impl InMemoryQueueStore {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueStore for InMemoryQueueStore {
    fn append(&self, action: ActionObject) -> Result<EventId, StorageError> {
        let mut index = self.index.lock().map_err(|_| lock_err("memory queue"))?;
        Ok(index.push(action))
    }

    fn pending_count(&self) -> Result<usize, StorageError> {
        let index = self.index.lock().map_err(|_| lock_err("memory queue"))?;
        Ok(index.pending_count())
    }

    fn in_flight_count(&self) -> Result<usize, StorageError> {
        let index = self.index.lock().map_err(|_| lock_err("memory queue"))?;
        Ok(index.in_flight_count())
    }

    fn snapshot_and_mark(&self) -> Result<Snapshot, StorageError> {
        let mut index = self.index.lock().map_err(|_| lock_err("memory queue"))?;
        let token = BatchToken::new();
        let ids = index.pending_ids();
        if ids.is_empty() {
            return Ok(Snapshot {
                token,
                events: Vec::new(),
            });
        }
        let events = index.mark(token, &ids);
        Ok(Snapshot { token, events })
    }

    fn commit_success(&self, token: BatchToken) -> Result<(), StorageError> {
        let mut index = self.index.lock().map_err(|_| lock_err("memory queue"))?;
        if index.delete_batch(token).is_none() {
            debug!(%token, "commit_success for unknown batch ignored");
        }
        Ok(())
    }

    fn commit_failure(&self, token: BatchToken) -> Result<(), StorageError> {
        let mut index = self.index.lock().map_err(|_| lock_err("memory queue"))?;
        if index.restore_batch(token).is_none() {
            debug!(%token, "commit_failure for unknown batch ignored");
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        let mut index = self.index.lock().map_err(|_| lock_err("memory queue"))?;
        index.clear();
        Ok(())
    }

    fn checkpoint(&self) -> Result<i64, StorageError> {
        let index = self.index.lock().map_err(|_| lock_err("memory queue"))?;
        Ok(index.checkpoint())
    }

    fn set_checkpoint(&self, last_action_time: i64) -> Result<(), StorageError> {
        let mut index = self.index.lock().map_err(|_| lock_err("memory queue"))?;
        index.set_checkpoint(last_action_time);
        Ok(())
    }
}
