//! Store configuration and durability levels
//!
//! Balances write durability against throughput the same way the WAL does:
//! every accepted batch is either fsync'd before it becomes visible, or the
//! store is running in a test-only mode that skips the sync.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Hard cap on rows returned by a single query or scan page. Callers that
/// need more page through results via offsets or the scan cursor.
pub const QUERY_LIMIT: usize = 1000;

/// Durability level for WAL appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurabilityLevel {
    /// fsync on every append. A batch is durable before it is visible.
    Synchronous,
    /// No fsync; data stays in the OS buffer. Only for tests and benchmarks.
    NoSync,
}

impl Default for DurabilityLevel {
    fn default() -> Self {
        DurabilityLevel::Synchronous
    }
}

impl DurabilityLevel {
    pub fn requires_sync(&self) -> bool {
        matches!(self, Self::Synchronous)
    }
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the WAL and snapshot files.
    pub data_dir: PathBuf,

    /// Durability level for WAL appends.
    pub durability: DurabilityLevel,
}

impl StoreConfig {
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
            durability: DurabilityLevel::default(),
        }
    }

    /// Test-only configuration that skips fsync.
    pub fn no_sync<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
            durability: DurabilityLevel::NoSync,
        }
    }
}
