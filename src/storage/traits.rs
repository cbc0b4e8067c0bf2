//! Abstract queue store contract.
//!
//! The outbox only needs an ordered, durable queue with atomic mark/delete
//! operations. Backends implement [`QueueStore`]; the in-memory backend backs
//! tests and embedded use, the persistent backend survives restarts.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::event::{ActionObject, EventId, StoredEvent};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying file operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data failed validation (checksum, framing, magic).
    #[error("Data corrupted: {0}")]
    Corrupted(String),

    /// Another process owns the queue directory.
    #[error("Queue directory is locked: {0}")]
    Locked(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

pub(crate) fn lock_err(context: &'static str) -> StorageError {
    StorageError::Backend(format!("poisoned lock: {context}"))
}

/// Opaque identifier of one snapshot handed out by `snapshot_and_mark`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchToken(Uuid);

impl BatchToken {
    /// Creates a new random token.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pending events captured atomically for one flush attempt, in insertion order.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Token resolving this snapshot.
    pub token: BatchToken,
    /// The marked events, in insertion order.
    pub events: Vec<StoredEvent>,
}

impl Snapshot {
    /// Number of captured events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True if nothing was pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Ids of the captured events.
    #[must_use]
    pub fn ids(&self) -> Vec<EventId> {
        self.events.iter().map(|e| e.id).collect()
    }

    /// The captured actions, in order.
    #[must_use]
    pub fn actions(&self) -> Vec<ActionObject> {
        self.events.iter().map(|e| e.action.clone()).collect()
    }
}

/// Storage contract for the outbox queue.
///
/// # Concurrency
/// `append` and `snapshot_and_mark` must be serialized against each other so
/// an event is never skipped or captured twice.
pub trait QueueStore: Send + Sync {
    /// Persist a Pending action. Durable before returning.
    fn append(&self, action: ActionObject) -> Result<EventId, StorageError>;

    /// Number of Pending events.
    fn pending_count(&self) -> Result<usize, StorageError>;

    /// Number of InFlight events.
    fn in_flight_count(&self) -> Result<usize, StorageError>;

    /// Move every Pending event to InFlight and return them in insertion order.
    fn snapshot_and_mark(&self) -> Result<Snapshot, StorageError>;

    /// Delete the InFlight events of `token`. Unknown tokens are a no-op.
    fn commit_success(&self, token: BatchToken) -> Result<(), StorageError>;

    /// Return the InFlight events of `token` to Pending. Unknown tokens are a no-op.
    fn commit_failure(&self, token: BatchToken) -> Result<(), StorageError>;

    /// Delete every event and outstanding batch. The checkpoint is kept.
    fn clear(&self) -> Result<(), StorageError>;

    /// Last server-acknowledged action time (0 if never committed).
    fn checkpoint(&self) -> Result<i64, StorageError>;

    /// Persist a new checkpoint.
    fn set_checkpoint(&self, last_action_time: i64) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_queue_store_object_safe(_: &dyn QueueStore) {}

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::Corrupted("CRC mismatch".to_string());
        assert!(err.to_string().contains("CRC mismatch"));

        let err = lock_err("queue index");
        assert!(err.to_string().contains("poisoned lock: queue index"));
    }

    #[test]
    fn test_batch_tokens_are_unique() {
        assert_ne!(BatchToken::new(), BatchToken::new());
    }
}
