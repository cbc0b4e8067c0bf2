//! Durable queue backend.
//!
//! This module provides a crash-safe [`QueueStore`](crate::storage::QueueStore) with:
//! - Write-Ahead Logging of every queue mutation
//! - File locking for single-process ownership
//! - CRC32 checksums for corruption detection
//! - Atomic log compaction once the log outgrows its budget
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │           PersistentQueueStore            │
//! ├───────────────────────────────────────────┤
//! │  ┌────────────────┐  ┌─────────────────┐  │
//! │  │ WriteAheadLog  │  │ QueueIndex      │  │
//! │  │ (append-only)  │→ │ (in-memory)     │  │
//! │  └───────┬────────┘  └─────────────────┘  │
//! │          ↓                                │
//! │  ┌────────────────┐                       │
//! │  │ FileLock       │                       │
//! │  └────────────────┘                       │
//! └───────────────────────────────────────────┘
//! ```

mod codec;
mod file_lock;
mod store;
mod wal;

pub use file_lock::FileLock;
pub use store::PersistentQueueStore;
pub use wal::{WalEntry, WalEntryKind, WalScan, WriteAheadLog};

use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::storage::StorageError;

/// Configuration for the durable queue.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistentConfig {
    /// Log size (bytes) above which the log is compacted.
    pub max_wal_size: u64,
    /// Whether to fsync after every record (slower but survives power loss).
    pub sync_on_write: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_wal_size: 4 * 1024 * 1024, // 4 MB
            sync_on_write: true,
        }
    }
}

impl PersistentConfig {
    const MIN_WAL_SIZE: u64 = 4 * 1024; // below this every commit would compact

    /// Checks the configuration.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(ConfigError::BelowMinimum {
                field: "max_wal_size",
                min: Self::MIN_WAL_SIZE,
                actual: self.max_wal_size,
            });
        }
        Ok(self)
    }
}

/// Open or create a durable queue in `dir`.
///
/// # Errors
/// - `StorageError::Locked` if another process owns the directory
/// - `StorageError::Corrupted` if the log fails validation before its tail
/// - `StorageError::Io` if the directory or log cannot be created or written
/// - `StorageError::Backend` if the configuration is invalid
///
/// # Example
/// ```rust,ignore
/// use action_outbox::storage::open_queue;
///
/// let store = open_queue("./outbox", None)?;
/// ```
pub fn open_queue(
    dir: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> Result<PersistentQueueStore, StorageError> {
    let cfg = config
        .unwrap_or_default()
        .validate()
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    PersistentQueueStore::open(dir.as_ref(), cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_tiny_wal() {
        let cfg = PersistentConfig {
            max_wal_size: 10,
            ..PersistentConfig::default()
        };
        assert!(cfg.validate().is_err());
        assert!(PersistentConfig::default().validate().is_ok());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let cfg: PersistentConfig = serde_json::from_str(r#"{"sync_on_write": false}"#).unwrap();
        assert!(!cfg.sync_on_write);
        assert_eq!(cfg.max_wal_size, PersistentConfig::default().max_wal_size);
    }
}
