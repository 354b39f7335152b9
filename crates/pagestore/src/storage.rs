//! Per-table/per-index facade over the shared page store.

use std::sync::Arc;

use bytes::Bytes;
use common::{BlockPos, PageId, Record, StorageId, StoreError, StoreResult};

use crate::disk::PageStore;
use crate::record::{RecordReader, blocks_for, parse_record};

/// Collection of records sharing one storage id and one reader.
///
/// All shared state (owned pages, free list, record count, the global
/// block bitmap) lives in the [`PageStore`], so every operation borrows
/// it: exclusively for mutation, shared for the scan.
pub struct Storage {
    id: StorageId,
    reader: Arc<dyn RecordReader>,
}

impl Storage {
    /// Attach to (or register) the storage `id` in the store.
    pub fn open(store: &mut PageStore, id: StorageId, reader: Arc<dyn RecordReader>) -> Self {
        store.register_storage(id);
        Self { id, reader }
    }

    pub fn id(&self) -> StorageId {
        self.id
    }

    pub fn set_reader(&mut self, reader: Arc<dyn RecordReader>) {
        self.reader = reader;
    }

    pub fn record_count(&self, store: &PageStore) -> u64 {
        store.state(self.id).map(|s| s.record_count).unwrap_or(0)
    }

    /// Owned page ids, ascending.
    pub fn pages(&self, store: &PageStore) -> Vec<u32> {
        store
            .state(self.id)
            .map(|s| s.pages.iter().collect())
            .unwrap_or_default()
    }

    /// Store a record and return its position.
    ///
    /// With `pos = None` the blocks are allocated (free-list-first); a
    /// caller-supplied position claims that exact range. The payload must
    /// fit a single page.
    pub fn add_record(
        &self,
        store: &mut PageStore,
        payload: Bytes,
        pos: Option<BlockPos>,
    ) -> StoreResult<BlockPos> {
        store.ensure_writable()?;
        let blocks = blocks_for(payload.len());
        if blocks > store.blocks_per_page() {
            return Err(StoreError::InvalidParameter(format!(
                "payload of {} bytes does not fit one page",
                payload.len()
            )));
        }
        let pos = match pos {
            Some(pos) => {
                store.claim_region(self.id, pos, blocks)?;
                pos
            }
            None => store.allocate_blocks(self.id, blocks)?,
        };
        let record = Record {
            storage_id: self.id,
            pos,
            block_count: blocks,
            deleted: false,
            changed: true,
            payload,
        };
        store.state_mut(self.id)?.record_count += 1;
        store.cache_insert(pos, record)?;
        Ok(pos)
    }

    /// Replace a stored record in place. The new payload must keep the
    /// block count; remove and re-add to change size.
    pub fn update_record(&self, store: &mut PageStore, record: Record) -> StoreResult<()> {
        store.ensure_writable()?;
        store.check_position(self.id, record.pos)?;
        if record.deleted {
            return Err(StoreError::InvalidParameter(
                "cannot update a deleted record".into(),
            ));
        }
        if blocks_for(record.payload.len()) != record.block_count {
            return Err(StoreError::InvalidParameter(format!(
                "update at block {} changes the block count; remove and re-add instead",
                record.pos
            )));
        }
        let mut record = record;
        record.storage_id = self.id;
        record.changed = true;
        store.cache_insert(record.pos, record)
    }

    /// Delete the record at `pos`. Deleting a position that holds no
    /// record is a caller bug and fails with `Internal`.
    pub fn remove_record(&self, store: &mut PageStore, pos: BlockPos) -> StoreResult<()> {
        store.ensure_writable()?;
        store.check_one_page(self.id)?;
        let record = self.get_record(store, pos)?;
        store.ensure_logged(PageId(pos / store.blocks_per_page()))?;
        store.cache_remove(pos);
        store.free_blocks(self.id, pos, record.block_count)?;
        store.state_mut(self.id)?.record_count -= 1;
        Ok(())
    }

    /// Fetch the record at `pos`, from the cache or from disk through the
    /// reader.
    pub fn get_record(&self, store: &mut PageStore, pos: BlockPos) -> StoreResult<Record> {
        if let Some(record) = store.cache_find(pos) {
            if record.storage_id != self.id {
                return Err(StoreError::Internal(format!(
                    "block {pos} belongs to storage {}",
                    record.storage_id.0
                )));
            }
            return Ok(record);
        }
        store.check_position(self.id, pos)?;
        let mut page = store.read_blocks(pos)?;
        let record = parse_record(&mut page, self.reader.as_ref(), self.id, pos)?;
        store.cache_insert(pos, record.clone())?;
        Ok(record)
    }

    /// Like [`Self::get_record`], but `None` when no live record of this
    /// storage starts at `pos`.
    pub fn get_record_if_stored(
        &self,
        store: &mut PageStore,
        pos: BlockPos,
    ) -> StoreResult<Option<Record>> {
        if !store.is_stored(self.id, pos) {
            return Ok(None);
        }
        self.get_record(store, pos).map(Some)
    }

    /// Write the cached record at `pos` to disk now, if dirty.
    pub fn flush_record(&self, store: &mut PageStore, pos: BlockPos) -> StoreResult<()> {
        store.flush_record_at(pos)
    }

    /// Position of the next live record after `prev` (or the first one
    /// when `prev` is `None`), in ascending block order.
    ///
    /// Free space is skipped 64 blocks at a time when the surrounding
    /// bitmap window is clear; pages owned by other storages are jumped
    /// over entirely.
    pub fn get_next(&self, store: &PageStore, prev: Option<&Record>) -> Option<BlockPos> {
        let state = store.state(self.id).ok()?;
        let pages = &state.pages;
        if pages.is_empty() {
            return None;
        }
        let bpp = store.blocks_per_page();
        let mut next = match prev {
            None => pages.get(0) * bpp,
            Some(record) => record.pos + record.block_count,
        };
        let mut page_index = pages.first_index_at_least(next / bpp)?;
        loop {
            let page = next / bpp;
            while pages.get(page_index) < page {
                page_index += 1;
                if page_index == pages.len() {
                    return None;
                }
            }
            let owned = pages.get(page_index);
            if owned > page {
                next = owned * bpp;
                continue;
            }
            if store.is_block_used(next) {
                return Some(next);
            }
            if store.used_word(next) == 0 {
                next = (next | 63) + 1;
            } else {
                next += 1;
            }
        }
    }

    /// Drop all records and return every owned page to the global pool.
    /// The storage keeps its id and stays usable.
    pub fn truncate(&self, store: &mut PageStore) -> StoreResult<()> {
        store.ensure_writable()?;
        store.truncate_storage(self.id)
    }

    /// Hand an existing unowned page to this storage.
    pub fn add_page(&self, store: &mut PageStore, page: PageId) -> StoreResult<()> {
        store.ensure_writable()?;
        store.adopt_page(self.id, page)
    }

    /// Detach a fully-free owned page and return it to the global pool.
    pub fn remove_page(&self, store: &mut PageStore, page: PageId) -> StoreResult<()> {
        store.ensure_writable()?;
        store.release_page(self.id, page)
    }
}
