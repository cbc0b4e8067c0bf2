//! Write-ahead log of queue mutations.
//!
//! Every state change of the queue is appended here, flushed and (optionally)
//! fsynced before it is applied in memory. Opening the log scans it once:
//! a record torn by a crash at the tail is cut off, a checksum failure before
//! the tail is reported as corruption.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [RECORD 1: codec-framed WalEntry]
//! [RECORD 2: codec-framed WalEntry]
//! ...
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::event::{EventId, StoredEvent};
use crate::storage::BatchToken;

use super::codec;

/// A single record in the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing within one log generation.
    pub sequence: u64,
    /// Wall-clock time the record was written.
    pub timestamp: DateTime<Utc>,
    /// The mutation.
    pub kind: WalEntryKind,
}

/// Queue mutation carried by a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WalEntryKind {
    /// A new event (Pending) or, in a compacted log, a live event in its current state.
    Append { event: StoredEvent },
    /// Events moved to InFlight under a batch token.
    Mark { token: BatchToken, ids: Vec<EventId> },
    /// The batch was committed and its events deleted.
    Delete { token: BatchToken },
    /// The batch failed and its events went back to Pending.
    Restore { token: BatchToken },
    /// Every event and batch was dropped.
    Clear,
    /// New server checkpoint.
    Checkpoint { last_action_time: i64 },
    /// First record of a compacted log.
    Compacted { next_id: EventId, last_action_time: i64 },
}

/// Result of scanning an existing log.
#[derive(Debug, Default)]
pub struct WalScan {
    /// Valid records in log order.
    pub entries: Vec<WalEntry>,
    /// Bytes dropped from a torn tail.
    pub truncated_bytes: u64,
}

fn poisoned() -> IoError {
    IoError::new(ErrorKind::Other, "poisoned lock: wal writer")
}

/// Append-only log with a mutex-guarded writer.
#[derive(Debug)]
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<WalWriter>,
    sync_on_write: bool,
}

#[derive(Debug)]
struct WalWriter {
    file: BufWriter<File>,
    sequence: u64,
}

impl WriteAheadLog {
    /// Opens or creates the log and returns it together with its valid records.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<(Self, WalScan)> {
        let fresh = !path.exists() || fs::metadata(path)?.len() == 0;
        if fresh {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            codec::write_header(&mut file)?;
            file.sync_all()?;
        }

        let scan = if fresh { WalScan::default() } else { Self::scan(path)? };
        let sequence = scan.entries.last().map_or(0, |e| e.sequence);

        let file = OpenOptions::new().append(true).open(path)?;
        let wal = Self {
            path: path.to_path_buf(),
            writer: Mutex::new(WalWriter {
                file: BufWriter::new(file),
                sequence,
            }),
            sync_on_write,
        };
        Ok((wal, scan))
    }

    /// Reads every valid record, cutting off a torn tail in place.
    fn scan(path: &Path) -> IoResult<WalScan> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader)?;

        let mut entries = Vec::new();
        let mut valid_len = codec::HEADER_LEN;
        while valid_len < file_len {
            match codec::decode::<WalEntry>(&mut reader) {
                Ok(entry) => {
                    valid_len = reader.stream_position()?;
                    entries.push(entry);
                }
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    return Err(IoError::new(
                        ErrorKind::InvalidData,
                        format!("corrupt WAL record after sequence {}: {e}", entries.last().map_or(0, |x: &WalEntry| x.sequence)),
                    ))
                }
            }
        }
        drop(reader);

        let truncated_bytes = file_len.saturating_sub(valid_len);
        if truncated_bytes > 0 {
            warn!(path = %path.display(), truncated_bytes, "dropping torn WAL tail");
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        Ok(WalScan {
            entries,
            truncated_bytes,
        })
    }

    /// Appends one record and returns its sequence number.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        let mut writer = self.writer.lock().map_err(|_| poisoned())?;
        let sequence = writer.sequence + 1;
        let encoded = codec::encode(&WalEntry {
            sequence,
            timestamp: Utc::now(),
            kind,
        })?;

        writer.file.write_all(&encoded)?;
        writer.file.flush()?;
        if self.sync_on_write {
            writer.file.get_ref().sync_all()?;
        }
        writer.sequence = sequence;
        Ok(sequence)
    }

    /// Replaces the whole log with `kinds`.
    ///
    /// The new generation is written to a sibling file, synced, and renamed over
    /// the old one, so a crash leaves either the old or the new log intact.
    pub fn rewrite(&self, kinds: Vec<WalEntryKind>) -> IoResult<()> {
        let mut writer = self.writer.lock().map_err(|_| poisoned())?;
        writer.file.flush()?;

        let tmp_path = self.path.with_extension("wal.compact");
        let mut count = 0u64;
        {
            let mut tmp = BufWriter::new(
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&tmp_path)?,
            );
            codec::write_header(&mut tmp)?;
            let now = Utc::now();
            for kind in kinds {
                count += 1;
                tmp.write_all(&codec::encode(&WalEntry {
                    sequence: count,
                    timestamp: now,
                    kind,
                })?)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }

        // Opened before the rename so the handle already names the new inode.
        let file = OpenOptions::new().append(true).open(&tmp_path)?;
        fs::rename(&tmp_path, &self.path)?;
        if let Some(dir) = self.path.parent() {
            sync_dir(dir);
        }

        writer.file = BufWriter::new(file);
        writer.sequence = count;
        Ok(())
    }

    /// Sequence number of the last record.
    pub fn current_sequence(&self) -> IoResult<u64> {
        Ok(self.writer.lock().map_err(|_| poisoned())?.sequence)
    }

    /// Log size in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
