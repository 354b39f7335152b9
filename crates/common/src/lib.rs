
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Position of a block in the heap file, counted in `BLOCK_SIZE` units.
/// Examples:
/// - `let first: BlockPos = 0;`
/// - `let next: BlockPos = record.pos + record.block_count;`
pub type BlockPos = u32;

/// Logical identifier for a page in the heap file.
/// Examples:
/// - `let header = PageId(0);`
/// - `let system_root = PageId(1);`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

/// Identifier shared by all records of one logical object (table or index).
/// Examples:
/// - `let users = StorageId(7);`
/// - `let users_pk = StorageId(8);`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StorageId(pub u32);

/// A persistent item spanning one or more contiguous blocks of a single page.
///
/// The core treats the payload as opaque bytes; only the per-storage reader
/// strategy knows its shape. `changed` marks the record as needing a
/// write-back before it may leave the cache.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub storage_id: StorageId,
    pub pos: BlockPos,
    pub block_count: u32,
    pub deleted: bool,
    pub changed: bool,
    pub payload: Bytes,
}

impl Record {
    pub fn new(storage_id: StorageId, payload: Bytes) -> Self {
        Self {
            storage_id,
            pos: 0,
            block_count: 0,
            deleted: false,
            changed: true,
            payload,
        }
    }
}

/// Canonical error type shared across the store subsystems.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("file corrupted: {0}")]
    Corrupted(String),
    #[error("unsupported file version: {0}")]
    FileVersion(String),
    #[error("{op} failed on {file}: {source}")]
    Io {
        file: String,
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("internal error: {0}")]
    Internal(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("store is read-only")]
    ReadOnly,
}

/// Result alias that carries a `StoreError`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Eviction policy for the record cache, picked at configuration time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachePolicy {
    #[default]
    Lru,
    TwoQueue,
}

/// Runtime configuration for opening a page store.
///
/// # Example
/// ```
/// use common::{CachePolicy, Config};
///
/// let config = Config::builder()
///     .page_size(8192)
///     .cache_capacity(512)
///     .cache_policy(CachePolicy::TwoQueue)
///     .build();
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, bon::Builder)]
pub struct Config {
    /// Page size in bytes for newly created files; a power of two in
    /// 512..=32768. Existing files keep the size recorded in their header.
    #[builder(default = 4096)]
    pub page_size: usize,
    /// Number of records the cache keeps resident.
    #[builder(default = 256)]
    pub cache_capacity: usize,
    /// Eviction policy for the record cache.
    #[builder(default)]
    pub cache_policy: CachePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: 4096,
            cache_capacity: 256,
            cache_policy: CachePolicy::Lru,
        }
    }
}
