//! Write-ahead log: append-only durable record of all mutations
//!
//! Every accepted mutation batch is one `WalEntry`, framed on disk as a
//! little-endian length prefix, a CRC32 of the payload, and the
//! bincode-serialized entry. An entry is flushed to durable storage before
//! the batch becomes visible to any reader; replaying the log in order
//! reconstructs every table exactly.
//!
//! The log is trusted: any framing, checksum or decode failure during replay
//! fails store startup rather than silently dropping entries.

use crate::config::DurabilityLevel;
use crate::error::{Result, StoreError};
use crate::types::{Revision, SchemaDesc, Value};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

const WAL_FILE: &str = "wal.log";

/// One record inside a mutation batch, already validated and typed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalRecord {
    /// Merge these columns over the row's prior state.
    Put {
        key: Value,
        columns: Vec<(String, Value)>,
    },
    /// Tombstone: the row is deleted as of the entry's revision.
    Delete { key: Value },
}

/// One durable mutation batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub table: String,
    pub revision: Revision,
    /// Schema established or extended by this batch, if any.
    pub schema: Option<SchemaDesc>,
    pub records: Vec<WalRecord>,
}

/// Held by a writer across WAL append and in-memory apply. While any guard
/// is alive a checkpoint cannot run, so the snapshot+truncate pair never
/// loses a batch that was appended but not yet applied.
pub struct AppendGuard<'a> {
    _gate: RwLockReadGuard<'a, ()>,
}

/// Exclusive access for checkpointing; blocks new appends and waits out
/// in-flight ones.
pub struct CheckpointGuard<'a> {
    _gate: RwLockWriteGuard<'a, ()>,
}

/// Append-only WAL over a single log file.
#[derive(Debug)]
pub struct WalManager {
    path: PathBuf,
    file: Mutex<File>,
    gate: RwLock<()>,
    durability: DurabilityLevel,
    entries: AtomicU64,
}

impl WalManager {
    /// Open (or create) the log under `dir` and replay any existing entries
    /// in log order.
    pub fn open(dir: &Path, durability: DurabilityLevel) -> Result<(Self, Vec<WalEntry>)> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(WAL_FILE);

        let replayed = if path.exists() {
            Self::read_log(&path)?
        } else {
            Vec::new()
        };
        info!(path = %path.display(), entries = replayed.len(), "WAL opened");

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        let manager = Self {
            path,
            file: Mutex::new(file),
            gate: RwLock::new(()),
            durability,
            entries: AtomicU64::new(replayed.len() as u64),
        };
        Ok((manager, replayed))
    }

    /// Parse the whole log strictly. A truncated or corrupt frame is an
    /// error, not a skip.
    fn read_log(path: &Path) -> Result<Vec<WalEntry>> {
        let data = std::fs::read(path)?;
        let mut entries = Vec::new();
        let mut at = 0usize;
        while at < data.len() {
            if data.len() - at < 8 {
                return Err(StoreError::Corruption(format!(
                    "truncated WAL frame header at offset {}",
                    at
                )));
            }
            let len = u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
                as usize;
            let crc = u32::from_le_bytes([data[at + 4], data[at + 5], data[at + 6], data[at + 7]]);
            at += 8;
            if data.len() - at < len {
                return Err(StoreError::Corruption(format!(
                    "truncated WAL payload at offset {} (want {} bytes, have {})",
                    at,
                    len,
                    data.len() - at
                )));
            }
            let payload = &data[at..at + len];
            if crc32fast::hash(payload) != crc {
                return Err(StoreError::Corruption(format!(
                    "WAL checksum mismatch at offset {}",
                    at
                )));
            }
            let entry: WalEntry = bincode::deserialize(payload).map_err(|e| {
                StoreError::Corruption(format!("undecodable WAL entry at offset {}: {}", at, e))
            })?;
            entries.push(entry);
            at += len;
        }
        Ok(entries)
    }

    /// Append one entry and make it durable. The returned guard must be held
    /// until the batch's in-memory effects are applied.
    pub fn append(&self, entry: &WalEntry) -> Result<AppendGuard<'_>> {
        let gate = self.gate.read();

        let payload = bincode::serialize(entry)?;
        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);

        {
            let mut file = self.file.lock();
            file.write_all(&frame)?;
            if self.durability.requires_sync() {
                file.sync_data()?;
            }
        }
        self.entries.fetch_add(1, Ordering::Relaxed);
        debug!(
            table = %entry.table,
            revision = %entry.revision,
            records = entry.records.len(),
            "WAL append"
        );
        Ok(AppendGuard { _gate: gate })
    }

    /// Block appends (and wait out in-flight batches) for a checkpoint.
    pub fn exclusive(&self) -> CheckpointGuard<'_> {
        CheckpointGuard {
            _gate: self.gate.write(),
        }
    }

    /// Drop all entries. Only callable under the checkpoint guard, after the
    /// state they produced has been snapshotted elsewhere.
    pub fn truncate(&self, _guard: &CheckpointGuard<'_>) -> Result<()> {
        let file = self.file.lock();
        file.set_len(0)?;
        file.sync_all()?;
        self.entries.store(0, Ordering::Relaxed);
        info!(path = %self.path.display(), "WAL truncated after checkpoint");
        Ok(())
    }

    /// Force pending bytes to durable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    /// Entries currently in the log (replayed + appended since open).
    pub fn entry_count(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Seek;

    fn entry(table: &str, revision: u64, key: i64) -> WalEntry {
        WalEntry {
            table: table.to_string(),
            revision: Revision(revision),
            schema: None,
            records: vec![WalRecord::Put {
                key: Value::Int(key),
                columns: vec![("k".to_string(), Value::Int(key))],
            }],
        }
    }

    #[test]
    fn test_append_then_replay() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let (wal, replayed) = WalManager::open(dir.path(), DurabilityLevel::Synchronous)?;
            assert!(replayed.is_empty());
            wal.append(&entry("t1", 10, 1))?;
            wal.append(&entry("t2", 11, 2))?;
            wal.append(&entry("t1", 12, 3))?;
            assert_eq!(wal.entry_count(), 3);
        }
        let (wal, replayed) = WalManager::open(dir.path(), DurabilityLevel::Synchronous)?;
        assert_eq!(replayed.len(), 3);
        assert_eq!(replayed[0].table, "t1");
        assert_eq!(replayed[1].table, "t2");
        assert_eq!(replayed[2].revision, Revision(12));
        assert_eq!(wal.entry_count(), 3);
        Ok(())
    }

    #[test]
    fn test_truncated_tail_fails_replay() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let (wal, _) = WalManager::open(dir.path(), DurabilityLevel::Synchronous)?;
            wal.append(&entry("t1", 10, 1))?;
        }
        // Chop the last byte off the log.
        let path = dir.path().join(WAL_FILE);
        let file = OpenOptions::new().write(true).open(&path)?;
        let len = file.metadata()?.len();
        file.set_len(len - 1)?;

        let err = WalManager::open(dir.path(), DurabilityLevel::Synchronous).unwrap_err();
        assert!(matches!(err, StoreError::Corruption(_)));
        Ok(())
    }

    #[test]
    fn test_corrupt_payload_fails_replay() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let (wal, _) = WalManager::open(dir.path(), DurabilityLevel::Synchronous)?;
            wal.append(&entry("t1", 10, 1))?;
        }
        // Flip a payload byte past the frame header.
        let path = dir.path().join(WAL_FILE);
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.seek(std::io::SeekFrom::Start(12))?;
        file.write_all(&[0xFF])?;

        let err = WalManager::open(dir.path(), DurabilityLevel::Synchronous).unwrap_err();
        assert!(matches!(err, StoreError::Corruption(_)));
        Ok(())
    }

    #[test]
    fn test_truncate_resets_log() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let (wal, _) = WalManager::open(dir.path(), DurabilityLevel::Synchronous)?;
            wal.append(&entry("t1", 10, 1))?;
            let guard = wal.exclusive();
            wal.truncate(&guard)?;
            drop(guard);
            assert_eq!(wal.entry_count(), 0);
            wal.append(&entry("t1", 11, 2))?;
        }
        let (_, replayed) = WalManager::open(dir.path(), DurabilityLevel::Synchronous)?;
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].revision, Revision(11));
        Ok(())
    }
}
