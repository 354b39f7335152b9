//! Paged, block-allocating, write-back-cached record store.
//!
//! One heap file holds fixed-size pages; records are allocated in
//! `BLOCK_SIZE` units and never cross a page boundary. [`PageStore`] owns
//! the file, the block-used bitmap, the page-owner table, the record cache
//! and the undo log; [`Storage`] is the per-table/per-index facade for
//! record add/update/remove/scan. Durability is checkpoint-based: dirty
//! records are written back lazily (with page pre-images captured in the
//! undo log first), and a checkpoint flushes everything, persists the
//! allocation metadata and rotates the log. Reopening after a crash replays
//! the log, returning the file to its state at the last checkpoint.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use common::{Config, StorageId};
//! use pagestore::{LenPrefixReader, PageStore, Storage};
//!
//! let config = Config::default();
//! let mut store = PageStore::open("data/heap.db", &config).unwrap();
//! let users = Storage::open(&mut store, StorageId(7), Arc::new(LenPrefixReader));
//!
//! let pos = users
//!     .add_record(&mut store, LenPrefixReader::wrap(b"alice"), None)
//!     .unwrap();
//! let rec = users.get_record(&mut store, pos).unwrap();
//! assert_eq!(LenPrefixReader::unwrap(&rec.payload).unwrap().as_ref(), b"alice");
//!
//! store.checkpoint().unwrap();
//! ```

mod bitfield;
mod disk;
mod freelist;
mod intarray;
mod record;
mod storage;


pub use bitfield::BitField;
pub use disk::PageStore;
pub use intarray::IntArray;
pub use record::{LenPrefixReader, RECORD_OVERHEAD, RecordReader};
pub use storage::Storage;

/// Smallest allocation unit for records, in bytes.
pub const BLOCK_SIZE: usize = 128;

/// Bounds for the configurable page size; a page is a fixed number of
/// blocks and the unit of file I/O and undo logging.
pub const PAGE_SIZE_MIN: usize = 512;
pub const PAGE_SIZE_MAX: usize = 32768;

/// Pages added per file growth step.
pub const INCREMENT_PAGES: u32 = 16;
