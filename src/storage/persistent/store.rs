//! WAL-backed queue store.
//!
//! Reads are served from an in-memory [`QueueIndex`]; every mutation is logged
//! first and applied second, under one mutex, so the log order is the apply
//! order and `append` never interleaves with `snapshot_and_mark`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::event::{ActionObject, EventId, StoredEvent};
use crate::storage::index::QueueIndex;
use crate::storage::traits::{lock_err, BatchToken, QueueStore, Snapshot, StorageError};

use super::file_lock::FileLock;
use super::wal::{WalEntryKind, WriteAheadLog};
use super::PersistentConfig;

const WAL_FILE: &str = "queue.wal";

fn io_err(context: &str, e: &std::io::Error) -> StorageError {
    match e.kind() {
        ErrorKind::InvalidData => StorageError::Corrupted(format!("{context}: {e}")),
        ErrorKind::InvalidInput => StorageError::Serialization(format!("{context}: {e}")),
        ErrorKind::WouldBlock => StorageError::Locked(format!("{context}: {e}")),
        kind => StorageError::Io(std::io::Error::new(kind, format!("{context}: {e}"))),
    }
}

fn apply(index: &mut QueueIndex, kind: &WalEntryKind) {
    match kind {
        WalEntryKind::Append { event } => index.insert(event.clone()),
        WalEntryKind::Mark { token, ids } => {
            index.mark(*token, ids);
        }
        WalEntryKind::Delete { token } => {
            index.delete_batch(*token);
        }
        WalEntryKind::Restore { token } => {
            index.restore_batch(*token);
        }
        WalEntryKind::Clear => index.clear(),
        WalEntryKind::Checkpoint { last_action_time } => index.set_checkpoint(*last_action_time),
        WalEntryKind::Compacted {
            next_id,
            last_action_time,
        } => {
            index.set_next_id(*next_id);
            index.set_checkpoint(*last_action_time);
        }
    }
}

/// Durable queue living in one directory.
#[derive(Debug)]
pub struct PersistentQueueStore {
    dir: PathBuf,
    _lock: FileLock,
    wal: WriteAheadLog,
    index: Mutex<QueueIndex>,
    config: PersistentConfig,
}

impl PersistentQueueStore {
    /// Open or create the queue in `dir`, replaying its log.
    ///
    /// Batches that were marked in flight but never resolved (the process died
    /// mid-flush) are returned to Pending, and the restore is logged.
    pub fn open(dir: &Path, config: PersistentConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(dir).map_err(|e| io_err("failed to create queue directory", &e))?;
        let lock = FileLock::acquire(dir).map_err(|e| io_err("failed to acquire lock", &e))?;

        let (wal, scan) = WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write)
            .map_err(|e| io_err("failed to open WAL", &e))?;

        let mut index = QueueIndex::default();
        for entry in &scan.entries {
            apply(&mut index, &entry.kind);
        }

        let orphaned = index.outstanding_batches();
        for token in &orphaned {
            wal.append(WalEntryKind::Restore { token: *token })
                .map_err(|e| io_err("failed to log batch recovery", &e))?;
            if let Some(restored) = index.restore_batch(*token) {
                warn!(%token, restored, "returned unresolved in-flight batch to pending");
            }
        }

        info!(
            dir = %dir.display(),
            replayed = scan.entries.len(),
            pending = index.pending_count(),
            recovered_batches = orphaned.len(),
            checkpoint = index.checkpoint(),
            "opened outbox queue"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            wal,
            index: Mutex::new(index),
            config,
        })
    }

    /// The queue directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current log size in bytes.
    pub fn wal_size(&self) -> Result<u64, StorageError> {
        self.wal.size_bytes().map_err(|e| io_err("failed to stat WAL", &e))
    }

    fn index(&self) -> Result<MutexGuard<'_, QueueIndex>, StorageError> {
        self.index.lock().map_err(|_| lock_err("persistent queue"))
    }

    fn log(&self, kind: WalEntryKind) -> Result<(), StorageError> {
        self.wal
            .append(kind)
            .map(|_| ())
            .map_err(|e| io_err("failed to append WAL record", &e))
    }

    /// Rewrites the log to contain only the live state.
    pub fn compact(&self) -> Result<(), StorageError> {
        let index = self.index()?;
        self.compact_locked(&index)
    }

    fn compact_locked(&self, index: &QueueIndex) -> Result<(), StorageError> {
        let before = self.wal_size()?;
        let mut kinds = vec![WalEntryKind::Compacted {
            next_id: index.next_id(),
            last_action_time: index.checkpoint(),
        }];
        kinds.extend(index.events().map(|event| WalEntryKind::Append {
            event: event.clone(),
        }));
        kinds.extend(index.batches().map(|(token, ids)| WalEntryKind::Mark {
            token: *token,
            ids: ids.clone(),
        }));

        self.wal
            .rewrite(kinds)
            .map_err(|e| io_err("failed to compact WAL", &e))?;
        debug!(before, after = self.wal_size()?, "compacted outbox WAL");
        Ok(())
    }

    fn maybe_compact(&self, index: &QueueIndex) -> Result<(), StorageError> {
        if self.wal_size()? > self.config.max_wal_size {
            self.compact_locked(index)?;
        }
        Ok(())
    }
}

impl QueueStore for PersistentQueueStore {
    fn append(&self, action: ActionObject) -> Result<EventId, StorageError> {
        let mut index = self.index()?;
        let event = StoredEvent::pending(index.next_id(), action);
        let id = event.id;
        self.log(WalEntryKind::Append {
            event: event.clone(),
        })?;
        index.insert(event);
        Ok(id)
    }

    fn pending_count(&self) -> Result<usize, StorageError> {
        Ok(self.index()?.pending_count())
    }

    fn in_flight_count(&self) -> Result<usize, StorageError> {
        Ok(self.index()?.in_flight_count())
    }

    fn snapshot_and_mark(&self) -> Result<Snapshot, StorageError> {
        let mut index = self.index()?;
        let token = BatchToken::new();
        let ids = index.pending_ids();
        if ids.is_empty() {
            return Ok(Snapshot {
                token,
                events: Vec::new(),
            });
        }

        self.log(WalEntryKind::Mark {
            token,
            ids: ids.clone(),
        })?;
        let events = index.mark(token, &ids);
        Ok(Snapshot { token, events })
    }

    fn commit_success(&self, token: BatchToken) -> Result<(), StorageError> {
        let mut index = self.index()?;
        if !index.has_batch(token) {
            debug!(%token, "commit_success for unknown batch ignored");
            return Ok(());
        }
        self.log(WalEntryKind::Delete { token })?;
        index.delete_batch(token);
        self.maybe_compact(&index)
    }

    fn commit_failure(&self, token: BatchToken) -> Result<(), StorageError> {
        let mut index = self.index()?;
        if !index.has_batch(token) {
            debug!(%token, "commit_failure for unknown batch ignored");
            return Ok(());
        }
        self.log(WalEntryKind::Restore { token })?;
        index.restore_batch(token);
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        let mut index = self.index()?;
        self.log(WalEntryKind::Clear)?;
        index.clear();
        self.maybe_compact(&index)
    }

    fn checkpoint(&self) -> Result<i64, StorageError> {
        Ok(self.index()?.checkpoint())
    }

    fn set_checkpoint(&self, last_action_time: i64) -> Result<(), StorageError> {
        let mut index = self.index()?;
        self.log(WalEntryKind::Checkpoint { last_action_time })?;
        index.set_checkpoint(last_action_time);
        Ok(())
    }
}
