//! Central file coordinator: header, page allocator, block bitmap, page
//! ownership, record cache write-back, undo logging and checkpoints.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use bincode::config::{self, Config as BincodeConfig};
use bincode::serde::{decode_from_slice, encode_to_vec};
use cache::{CacheWriter, RecordCache};
use common::{BlockPos, Config, PageId, Record, StorageId, StoreError, StoreResult};
use hashbrown::HashMap;
use pagefile::{DataPage, FileStore};
use pagelog::PageLog;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::bitfield::BitField;
use crate::freelist::PageFreeList;
use crate::intarray::IntArray;
use crate::record::record_image;
use crate::{BLOCK_SIZE, INCREMENT_PAGES, PAGE_SIZE_MAX, PAGE_SIZE_MIN};

const BANNER: &[u8; 16] = b"-- H2 0.5/B -- \n";
const HEADER_LEN: usize = 66;

const PAGE_ID_SYSTEM_ROOT: u32 = 1;
const PAGE_ID_FREE_LIST_ROOT: u32 = 2;
const PAGE_ID_LOG_ROOT: u32 = 3;

/// Chain pointer plus chunk length.
const SYSTEM_PAGE_HEADER: usize = 8;

/// Per-storage bookkeeping held by the store so a checkpoint can persist
/// all of it in one place.
#[derive(Debug)]
pub(crate) struct StorageState {
    /// Owned pages, ascending.
    pub pages: IntArray,
    /// Recently freed positions eligible for same-storage reuse. Entries
    /// may be stale; they are filtered when consumed.
    pub free_list: VecDeque<BlockPos>,
    pub record_count: u64,
    /// Round-robin cursor for opportunistic page reclamation.
    pub page_check_index: usize,
}

impl StorageState {
    fn new() -> Self {
        Self {
            pages: IntArray::new(),
            free_list: VecDeque::new(),
            record_count: 0,
            page_check_index: 0,
        }
    }
}

/// Allocation metadata persisted in the system page chain at checkpoint.
#[derive(Debug, Serialize, Deserialize)]
struct Summary {
    last_used_page: u32,
    page_owners: Vec<(u32, u32)>,
    record_counts: Vec<(u32, u64)>,
    used_words: Vec<u64>,
}

/// Shared manager of one heap file.
///
/// All structural mutation goes through `&mut self`; wrapping the store in
/// a `Mutex` reproduces the single coarse monitor the on-disk format was
/// designed for.
pub struct PageStore {
    file: FileStore,
    log: PageLog,
    cache: Box<dyn RecordCache>,
    page_size: usize,
    blocks_per_page: u32,
    page_count: u32,
    last_used_page: u32,
    system_root: u32,
    free_list_root: u32,
    log_root: u32,
    read_only: bool,
    /// One bit per block; set iff the block is part of a live record.
    used: BitField,
    /// Page → owning storage; absent for empty pages.
    page_owners: HashMap<PageId, StorageId>,
    storages: HashMap<StorageId, StorageState>,
    free_list: PageFreeList,
    /// Pages whose pre-image is already in the current log session.
    logged: BitField,
    /// System page chain holding the checkpoint summary.
    system_pages: Vec<PageId>,
    free_list_cap: usize,
}

impl std::fmt::Debug for PageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageStore")
            .field("page_size", &self.page_size)
            .field("page_count", &self.page_count)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl PageStore {
    /// Open or create the heap file at `path`.
    ///
    /// `config.page_size` applies to newly created files; an existing file
    /// keeps the page size recorded in its header. If the file carries a
    /// non-zero write version the store opens read-only; a non-zero read
    /// version fails with `FileVersion`.
    pub fn open(path: impl AsRef<Path>, config: &Config) -> StoreResult<Self> {
        let path = path.as_ref();
        let exists = std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
        if exists {
            Self::open_existing(path, config)
        } else {
            Self::create(path, config)
        }
    }

    fn create(path: &Path, config: &Config) -> StoreResult<Self> {
        validate_page_size(config.page_size)?;
        let file = FileStore::open(path, false)?;
        let mut log = PageLog::open(undo_path(path))?;
        if !log.is_empty()? {
            // stale log left behind by a deleted heap file
            log.reopen()?;
        }
        let page_size = config.page_size;
        let blocks_per_page = (page_size / BLOCK_SIZE) as u32;
        let mut store = Self {
            file,
            log,
            cache: cache::new_cache(config.cache_policy, config.cache_capacity),
            page_size,
            blocks_per_page,
            page_count: INCREMENT_PAGES,
            last_used_page: PAGE_ID_LOG_ROOT,
            system_root: PAGE_ID_SYSTEM_ROOT,
            free_list_root: PAGE_ID_FREE_LIST_ROOT,
            log_root: PAGE_ID_LOG_ROOT,
            read_only: false,
            used: BitField::new(),
            page_owners: HashMap::new(),
            storages: HashMap::new(),
            free_list: PageFreeList::new(),
            logged: BitField::new(),
            system_pages: vec![PageId(PAGE_ID_SYSTEM_ROOT)],
            free_list_cap: free_list_capacity(blocks_per_page),
        };
        store
            .file
            .set_length(store.page_count as u64 * page_size as u64)?;
        store.write_header()?;
        debug!(file = store.file.name(), page_size, "created page store");
        store.checkpoint()?;
        Ok(store)
    }

    fn open_existing(path: &Path, config: &Config) -> StoreResult<Self> {
        let mut file = FileStore::open(path, false)?;
        let len = file.length()?;
        if (len as usize) < PAGE_SIZE_MIN {
            return Err(StoreError::Corrupted(format!(
                "file {} is too short: {len} bytes",
                file.name()
            )));
        }

        let mut header = vec![0u8; HEADER_LEN];
        file.read_fully(0, &mut header)?;
        let mut header = DataPage::from_bytes(header);
        for _ in 0..3 {
            if header.read_bytes(BANNER.len())? != BANNER.as_slice() {
                return Err(StoreError::Corrupted(format!(
                    "file {} has no store banner",
                    file.name()
                )));
            }
        }
        let page_size = header.read_u32()? as usize;
        validate_page_size(page_size)
            .map_err(|_| StoreError::Corrupted(format!("bad page size {page_size} in header")))?;
        let write_version = header.read_u8()?;
        let read_version = header.read_u8()?;
        if read_version != 0 {
            return Err(StoreError::FileVersion(format!(
                "file {} requires read version {read_version}",
                file.name()
            )));
        }
        let read_only = write_version != 0;
        let system_root = header.read_u32()?;
        let free_list_root = header.read_u32()?;
        let log_root = header.read_u32()?;
        if read_only {
            // downgrade the handle itself, not just the store flag
            drop(file);
            file = FileStore::open(path, true)?;
        }

        let blocks_per_page = (page_size / BLOCK_SIZE) as u32;
        let page_count = (len / page_size as u64) as u32;
        if page_count <= log_root {
            return Err(StoreError::Corrupted(format!(
                "file {} holds only {page_count} pages",
                file.name()
            )));
        }

        let log = PageLog::open(undo_path(path))?;
        let mut store = Self {
            file,
            log,
            cache: cache::new_cache(config.cache_policy, config.cache_capacity),
            page_size,
            blocks_per_page,
            page_count,
            last_used_page: log_root,
            system_root,
            free_list_root,
            log_root,
            read_only,
            used: BitField::new(),
            page_owners: HashMap::new(),
            storages: HashMap::new(),
            free_list: PageFreeList::new(),
            logged: BitField::new(),
            system_pages: vec![PageId(system_root)],
            free_list_cap: free_list_capacity(blocks_per_page),
        };
        store.recover()?;
        store.load_free_list()?;
        store.load_summary()?;
        debug!(
            file = store.file.name(),
            pages = store.page_count,
            last_used = store.last_used_page,
            read_only = store.read_only,
            "opened page store"
        );
        Ok(store)
    }

    /// Replay undo images, returning the file to its last checkpoint state.
    fn recover(&mut self) -> StoreResult<()> {
        if self.log.is_empty()? {
            return Ok(());
        }
        if self.read_only {
            return Err(StoreError::Corrupted(format!(
                "file {} needs recovery but is write-protected",
                self.file.name()
            )));
        }
        let frames = PageLog::replay(self.log.path())?;
        debug!(frames = frames.len(), "replaying undo log");
        for frame in &frames {
            if frame.image.len() != self.page_size {
                return Err(StoreError::Corrupted(format!(
                    "undo image for page {} has {} bytes",
                    frame.page_id,
                    frame.image.len()
                )));
            }
            if frame.page_id >= self.page_count {
                return Err(StoreError::Corrupted(format!(
                    "undo image for page {} is beyond the end of the file",
                    frame.page_id
                )));
            }
            self.file
                .write(frame.page_id as u64 * self.page_size as u64, &frame.image)?;
        }
        self.file.sync()?;
        self.log.reopen()
    }

    fn load_free_list(&mut self) -> StoreResult<()> {
        let per = PageFreeList::bits_per_list(self.page_size);
        for k in 0.. {
            let id = self.free_list_root + k * per;
            if id >= self.page_count {
                break;
            }
            let image = self.read_page(PageId(id))?;
            self.free_list.load_list(k, &image, self.page_size)?;
        }
        Ok(())
    }

    fn load_summary(&mut self) -> StoreResult<()> {
        let cap = self.page_size - SYSTEM_PAGE_HEADER;
        let mut chain = Vec::new();
        let mut bytes = Vec::new();
        let mut next = self.system_root;
        loop {
            if chain.len() as u32 > self.page_count {
                return Err(StoreError::Corrupted(
                    "system page chain does not terminate".into(),
                ));
            }
            chain.push(PageId(next));
            let image = self.read_page(PageId(next))?;
            let mut page = DataPage::from_bytes(image);
            let next_id = page.read_u32()?;
            let chunk_len = page.read_u32()? as usize;
            if chunk_len > cap {
                return Err(StoreError::Corrupted(format!(
                    "system page {next} carries a {chunk_len}-byte chunk"
                )));
            }
            bytes.extend_from_slice(page.read_bytes(chunk_len)?);
            if next_id == 0 {
                break;
            }
            if next_id >= self.page_count {
                return Err(StoreError::Corrupted(format!(
                    "system page chain points past the file: {next_id}"
                )));
            }
            next = next_id;
        }
        self.system_pages = chain;

        let (summary, _): (Summary, usize) = decode_from_slice(&bytes, bincode_config())
            .map_err(|e| StoreError::Corrupted(format!("checkpoint summary: {e}")))?;
        if summary.last_used_page >= self.page_count {
            return Err(StoreError::Corrupted(format!(
                "summary names page {} as last used of {}",
                summary.last_used_page, self.page_count
            )));
        }
        self.last_used_page = summary.last_used_page;
        self.used = BitField::from_words(summary.used_words);
        for (page, owner) in summary.page_owners {
            self.page_owners.insert(PageId(page), StorageId(owner));
            self.storages
                .entry(StorageId(owner))
                .or_insert_with(StorageState::new)
                .pages
                .add(page);
        }
        for (id, count) in summary.record_counts {
            self.storages
                .entry(StorageId(id))
                .or_insert_with(StorageState::new)
                .record_count = count;
        }
        Ok(())
    }

    fn write_header(&mut self) -> StoreResult<()> {
        let mut header = DataPage::new(HEADER_LEN);
        for _ in 0..3 {
            header.write_bytes(BANNER)?;
        }
        header.write_u32(self.page_size as u32)?;
        header.write_u8(0)?;
        header.write_u8(0)?;
        header.write_u32(self.system_root)?;
        header.write_u32(self.free_list_root)?;
        header.write_u32(self.log_root)?;
        self.file.write(0, header.data())
    }

    /// Flush all dirty state, rotate the undo log and trim preallocated
    /// pages. After this returns, everything written before it is durable.
    pub fn checkpoint(&mut self) -> StoreResult<()> {
        if self.read_only {
            return Ok(());
        }
        let mut dirty = self.cache.get_all_changed();
        dirty.sort_by_key(|r| r.pos);
        let flushed = dirty.len();
        for record in dirty {
            let pos = record.pos;
            {
                let (_, mut writer) = self.cache_and_writer();
                writer.write_back(record)?;
            }
            self.cache.mark_clean(pos);
        }
        self.write_metadata()?;
        self.file.sync()?;
        self.log.reopen()?;
        self.logged.clear_all();
        self.page_count = self.last_used_page + 1;
        self.file
            .set_length(self.page_count as u64 * self.page_size as u64)?;
        self.file.sync()?;
        debug!(records = flushed, pages = self.page_count, "checkpoint");
        Ok(())
    }

    /// Checkpoint and release the file handles.
    pub fn close(mut self) -> StoreResult<()> {
        self.checkpoint()
    }

    fn write_metadata(&mut self) -> StoreResult<()> {
        let cap = self.page_size - SYSTEM_PAGE_HEADER;
        // Sizing the summary can allocate or free chain pages, which in
        // turn changes the summary; iterate until the chain fits.
        let bytes = loop {
            let bytes = self.encode_summary()?;
            let needed = bytes.len().div_ceil(cap).max(1);
            if self.system_pages.len() < needed {
                let page = self.allocate_page()?;
                self.system_pages.push(page);
            } else if self.system_pages.len() > needed {
                if let Some(page) = self.system_pages.pop() {
                    self.free_page(page)?;
                }
            } else {
                break bytes;
            }
        };
        for (i, chunk) in bytes.chunks(cap).enumerate() {
            let mut page = DataPage::new(self.page_size);
            let next = self.system_pages.get(i + 1).map_or(0, |p| p.0);
            page.write_u32(next)?;
            page.write_u32(chunk.len() as u32)?;
            page.write_bytes(chunk)?;
            let image = page.into_data();
            self.write_page(self.system_pages[i], &image)?;
        }

        let per = PageFreeList::bits_per_list(self.page_size);
        for k in 0.. {
            let id = self.free_list_root + k * per;
            if id > self.last_used_page {
                break;
            }
            let image = self.free_list.serialize_list(k, self.page_size);
            self.write_page(PageId(id), &image)?;
        }
        Ok(())
    }

    fn encode_summary(&self) -> StoreResult<Vec<u8>> {
        let mut page_owners: Vec<(u32, u32)> = self
            .page_owners
            .iter()
            .map(|(page, owner)| (page.0, owner.0))
            .collect();
        page_owners.sort_unstable();
        let mut record_counts: Vec<(u32, u64)> = self
            .storages
            .iter()
            .map(|(id, state)| (id.0, state.record_count))
            .collect();
        record_counts.sort_unstable();
        let blocks = (self.last_used_page + 1) * self.blocks_per_page;
        let summary = Summary {
            last_used_page: self.last_used_page,
            page_owners,
            record_counts,
            used_words: self.used.words_prefix(blocks),
        };
        encode_to_vec(&summary, bincode_config())
            .map_err(|e| StoreError::Internal(format!("serialize checkpoint summary: {e}")))
    }

    // ---- page allocation ----

    /// Smallest page id available: the preallocated grow region first, then
    /// the free-page bitmap, growing the file as a last resort.
    pub(crate) fn allocate_page(&mut self) -> StoreResult<PageId> {
        loop {
            if self.last_used_page + 1 < self.page_count {
                self.last_used_page += 1;
                let page = PageId(self.last_used_page);
                if self.is_reserved_page(page) {
                    continue;
                }
                trace!(page = page.0, "page allocated from grow region");
                return Ok(page);
            }
            if let Some(page) = self.free_list.allocate() {
                trace!(page = page.0, "page allocated from free list");
                return Ok(page);
            }
            self.increase_file_size()?;
        }
    }

    /// Return a fully-empty page to the global pool.
    pub(crate) fn free_page(&mut self, page: PageId) -> StoreResult<()> {
        let start = page.0 * self.blocks_per_page;
        for pos in self.cache.positions() {
            if pos >= start && pos < start + self.blocks_per_page {
                self.cache.remove(pos);
            }
        }
        self.page_owners.remove(&page);
        self.used.clear_range(start, self.blocks_per_page);
        self.free_list.set_free(page);
        debug!(page = page.0, "page reclaimed");
        Ok(())
    }

    pub(crate) fn claim_page(&mut self, id: StorageId) -> StoreResult<PageId> {
        let page = self.allocate_page()?;
        self.page_owners.insert(page, id);
        self.state_mut(id)?.pages.add(page.0);
        trace!(page = page.0, storage = id.0, "page claimed");
        Ok(page)
    }

    /// Hand an existing unowned page to `id`.
    pub(crate) fn adopt_page(&mut self, id: StorageId, page: PageId) -> StoreResult<()> {
        if let Some(owner) = self.page_owners.get(&page) {
            if *owner == id {
                return Ok(());
            }
            return Err(StoreError::Internal(format!(
                "page {} belongs to storage {}",
                page.0, owner.0
            )));
        }
        if page.0 > self.last_used_page || self.is_reserved_page(page) {
            return Err(StoreError::Internal(format!(
                "page {} is not allocatable",
                page.0
            )));
        }
        self.free_list.take(page);
        self.page_owners.insert(page, id);
        self.state_mut(id)?.pages.add(page.0);
        Ok(())
    }

    /// Detach a fully-free page from `id` and return it to the pool.
    pub(crate) fn release_page(&mut self, id: StorageId, page: PageId) -> StoreResult<()> {
        match self.page_owners.get(&page) {
            Some(owner) if *owner == id => {}
            _ => {
                return Err(StoreError::Internal(format!(
                    "page {} is not owned by storage {}",
                    page.0, id.0
                )));
            }
        }
        let start = page.0 * self.blocks_per_page;
        if !self.used.is_clear_range(start, self.blocks_per_page) {
            return Err(StoreError::Internal(format!(
                "page {} still holds records",
                page.0
            )));
        }
        self.state_mut(id)?.pages.remove_value(page.0);
        self.free_page(page)
    }

    fn is_reserved_page(&self, page: PageId) -> bool {
        page.0 <= self.log_root
            || self.system_pages.contains(&page)
            || PageFreeList::is_free_list_page(page, PageId(self.free_list_root), self.page_size)
    }

    fn increase_file_size(&mut self) -> StoreResult<()> {
        self.page_count += INCREMENT_PAGES;
        debug!(pages = self.page_count, "growing heap file");
        self.file
            .set_length(self.page_count as u64 * self.page_size as u64)
    }

    // ---- block allocation ----

    /// Allocate `blocks` contiguous blocks for `id`: the storage's free
    /// list first, then a clear run on an owned page, then a fresh page.
    pub(crate) fn allocate_blocks(&mut self, id: StorageId, blocks: u32) -> StoreResult<BlockPos> {
        if let Some(pos) = self.allocate_from_free_list(id, blocks)? {
            return Ok(pos);
        }
        if let Some(pos) = self.allocate_in_owned_pages(id, blocks)? {
            return Ok(pos);
        }
        let page = self.claim_page(id)?;
        let pos = page.0 * self.blocks_per_page;
        self.used.set_range(pos, blocks);
        Ok(pos)
    }

    fn allocate_from_free_list(
        &mut self,
        id: StorageId,
        blocks: u32,
    ) -> StoreResult<Option<BlockPos>> {
        let bpp = self.blocks_per_page;
        let used = &mut self.used;
        let owners = &self.page_owners;
        let state = self
            .storages
            .get_mut(&id)
            .ok_or_else(|| StoreError::Internal(format!("storage {} is not open", id.0)))?;
        let mut i = 0;
        while i < state.free_list.len() {
            let pos = state.free_list[i];
            if used.get(pos) {
                // reused since it was freed
                state.free_list.remove(i);
                continue;
            }
            if region_free_and_mine(used, owners, id, bpp, pos, blocks) {
                state.free_list.remove(i);
                used.set_range(pos, blocks);
                return Ok(Some(pos));
            }
            i += 1;
        }
        Ok(None)
    }

    fn allocate_in_owned_pages(
        &mut self,
        id: StorageId,
        blocks: u32,
    ) -> StoreResult<Option<BlockPos>> {
        let bpp = self.blocks_per_page;
        let used = &mut self.used;
        let state = self
            .storages
            .get(&id)
            .ok_or_else(|| StoreError::Internal(format!("storage {} is not open", id.0)))?;
        for page in state.pages.iter() {
            let start = page * bpp;
            if let Some(pos) = used.find_clear_run(start, start + bpp, blocks) {
                used.set_range(pos, blocks);
                return Ok(Some(pos));
            }
        }
        Ok(None)
    }

    /// Mark a caller-chosen block range used, claiming its page if needed.
    pub(crate) fn claim_region(
        &mut self,
        id: StorageId,
        pos: BlockPos,
        blocks: u32,
    ) -> StoreResult<()> {
        let bpp = self.blocks_per_page;
        let page = pos / bpp;
        if blocks == 0 || (pos + blocks - 1) / bpp != page {
            return Err(StoreError::InvalidParameter(format!(
                "block range {pos}+{blocks} crosses a page boundary"
            )));
        }
        if !self.used.is_clear_range(pos, blocks) {
            return Err(StoreError::Internal(format!(
                "blocks at {pos} are already in use"
            )));
        }
        self.adopt_page(id, PageId(page))?;
        self.used.set_range(pos, blocks);
        Ok(())
    }

    /// Clear the used bits and remember the position for same-storage
    /// reuse; past the free-list bound the position is silently dropped.
    pub(crate) fn free_blocks(
        &mut self,
        id: StorageId,
        pos: BlockPos,
        blocks: u32,
    ) -> StoreResult<()> {
        self.used.clear_range(pos, blocks);
        let cap = self.free_list_cap;
        let state = self.state_mut(id)?;
        if state.free_list.len() < cap {
            state.free_list.push_back(pos);
        }
        Ok(())
    }

    /// Advance `id`'s round-robin page cursor one step and reclaim the
    /// page under it if it is fully free.
    pub(crate) fn check_one_page(&mut self, id: StorageId) -> StoreResult<()> {
        let bpp = self.blocks_per_page;
        let page = {
            let state = self.state_mut(id)?;
            if state.pages.is_empty() {
                return Ok(());
            }
            state.page_check_index = (state.page_check_index + 1) % state.pages.len();
            state.pages.get(state.page_check_index)
        };
        if self.used.is_clear_range(page * bpp, bpp) {
            self.state_mut(id)?.pages.remove_value(page);
            self.free_page(PageId(page))?;
        }
        Ok(())
    }

    pub(crate) fn truncate_storage(&mut self, id: StorageId) -> StoreResult<()> {
        let pages: Vec<u32> = self.state(id)?.pages.iter().collect();
        for page in pages {
            self.free_page(PageId(page))?;
        }
        let state = self.state_mut(id)?;
        state.pages = IntArray::new();
        state.free_list.clear();
        state.record_count = 0;
        state.page_check_index = 0;
        debug!(storage = id.0, "storage truncated");
        Ok(())
    }

    // ---- record I/O ----

    /// A live record of `id` must start at `pos`.
    pub(crate) fn check_position(&self, id: StorageId, pos: BlockPos) -> StoreResult<()> {
        let page = pos / self.blocks_per_page;
        if page > self.last_used_page {
            return Err(StoreError::Internal(format!(
                "block {pos} is beyond the used region"
            )));
        }
        if !self.used.get(pos) {
            return Err(StoreError::Internal(format!(
                "no record stored at block {pos}"
            )));
        }
        if self.page_owners.get(&PageId(page)) != Some(&id) {
            return Err(StoreError::Internal(format!(
                "block {pos} does not belong to storage {}",
                id.0
            )));
        }
        Ok(())
    }

    pub(crate) fn is_stored(&self, id: StorageId, pos: BlockPos) -> bool {
        self.check_position(id, pos).is_ok()
    }

    /// Read from `pos` to the end of its page; the block count is only
    /// known once the record prefix is parsed.
    pub(crate) fn read_blocks(&mut self, pos: BlockPos) -> StoreResult<DataPage> {
        let bpp = self.blocks_per_page;
        let end = (pos / bpp + 1) * bpp;
        let mut buf = vec![0u8; (end - pos) as usize * BLOCK_SIZE];
        self.file.read_fully(pos as u64 * BLOCK_SIZE as u64, &mut buf)?;
        Ok(DataPage::from_bytes(buf))
    }

    fn read_page(&mut self, page: PageId) -> StoreResult<Vec<u8>> {
        let mut buf = vec![0u8; self.page_size];
        self.file
            .read_fully(page.0 as u64 * self.page_size as u64, &mut buf)?;
        Ok(buf)
    }

    /// Write a full page image, capturing the pre-image first.
    fn write_page(&mut self, page: PageId, image: &[u8]) -> StoreResult<()> {
        debug_assert_eq!(image.len(), self.page_size);
        self.ensure_logged(page)?;
        self.file
            .write(page.0 as u64 * self.page_size as u64, image)
    }

    /// Capture the page's pre-image into the undo log, once per session.
    pub(crate) fn ensure_logged(&mut self, page: PageId) -> StoreResult<()> {
        capture_undo(
            &mut self.file,
            &mut self.log,
            &mut self.logged,
            self.page_size,
            page.0,
        )
    }

    // ---- cache ----

    pub(crate) fn cache_find(&mut self, pos: BlockPos) -> Option<Record> {
        self.cache.find(pos).cloned()
    }

    pub(crate) fn cache_insert(&mut self, pos: BlockPos, record: Record) -> StoreResult<()> {
        let (cache, mut writer) = self.cache_and_writer();
        cache.update(pos, record, &mut writer)
    }

    pub(crate) fn cache_remove(&mut self, pos: BlockPos) -> Option<Record> {
        self.cache.remove(pos)
    }

    /// Write the cached record at `pos` to disk now, if dirty.
    pub(crate) fn flush_record_at(&mut self, pos: BlockPos) -> StoreResult<()> {
        if let Some(record) = self.cache.find(pos).cloned()
            && record.changed
        {
            {
                let (_, mut writer) = self.cache_and_writer();
                writer.write_back(record)?;
            }
            self.cache.mark_clean(pos);
        }
        Ok(())
    }

    fn cache_and_writer(&mut self) -> (&mut dyn RecordCache, PageWriter<'_>) {
        (
            self.cache.as_mut(),
            PageWriter {
                file: &mut self.file,
                log: &mut self.log,
                logged: &mut self.logged,
                page_size: self.page_size,
                blocks_per_page: self.blocks_per_page,
            },
        )
    }

    // ---- state and accessors ----

    pub(crate) fn register_storage(&mut self, id: StorageId) {
        self.storages.entry(id).or_insert_with(StorageState::new);
    }

    pub(crate) fn state(&self, id: StorageId) -> StoreResult<&StorageState> {
        self.storages
            .get(&id)
            .ok_or_else(|| StoreError::Internal(format!("storage {} is not open", id.0)))
    }

    pub(crate) fn state_mut(&mut self, id: StorageId) -> StoreResult<&mut StorageState> {
        self.storages
            .get_mut(&id)
            .ok_or_else(|| StoreError::Internal(format!("storage {} is not open", id.0)))
    }

    pub(crate) fn ensure_writable(&self) -> StoreResult<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }

    pub fn file_name(&self) -> &str {
        self.file.name()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn blocks_per_page(&self) -> u32 {
        self.blocks_per_page
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn last_used_page(&self) -> u32 {
        self.last_used_page
    }

    pub fn free_page_count(&self) -> u32 {
        self.free_list.free_page_count()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_block_used(&self, pos: BlockPos) -> bool {
        self.used.get(pos)
    }

    /// The aligned 64-bit window of the used bitmap containing `pos`.
    pub fn used_word(&self, pos: BlockPos) -> u64 {
        self.used.word(pos)
    }

    pub fn allocated_block_count(&self) -> u32 {
        self.used.count_set()
    }

    pub fn page_owner(&self, page: PageId) -> Option<StorageId> {
        self.page_owners.get(&page).copied()
    }
}

/// Write-back capability handed to the cache on insert; borrows exactly
/// the store fields eviction needs.
struct PageWriter<'a> {
    file: &'a mut FileStore,
    log: &'a mut PageLog,
    logged: &'a mut BitField,
    page_size: usize,
    blocks_per_page: u32,
}

impl CacheWriter for PageWriter<'_> {
    fn write_back(&mut self, record: Record) -> StoreResult<()> {
        if record.deleted {
            return Ok(());
        }
        let page = record.pos / self.blocks_per_page;
        capture_undo(self.file, self.log, self.logged, self.page_size, page)?;
        let image = record_image(&record)?;
        trace!(pos = record.pos, blocks = record.block_count, "record write-back");
        self.file
            .write(record.pos as u64 * BLOCK_SIZE as u64, &image)
    }
}

fn capture_undo(
    file: &mut FileStore,
    log: &mut PageLog,
    logged: &mut BitField,
    page_size: usize,
    page: u32,
) -> StoreResult<()> {
    if logged.get(page) {
        return Ok(());
    }
    let mut image = vec![0u8; page_size];
    file.read_fully(page as u64 * page_size as u64, &mut image)?;
    log.add_undo(page, &image)?;
    log.sync()?;
    logged.set(page);
    trace!(page, "undo image captured");
    Ok(())
}

fn region_free_and_mine(
    used: &BitField,
    owners: &HashMap<PageId, StorageId>,
    id: StorageId,
    blocks_per_page: u32,
    pos: BlockPos,
    blocks: u32,
) -> bool {
    let page = pos / blocks_per_page;
    if (pos + blocks - 1) / blocks_per_page != page {
        return false;
    }
    if owners.get(&PageId(page)) != Some(&id) {
        return false;
    }
    used.is_clear_range(pos, blocks)
}

fn validate_page_size(page_size: usize) -> StoreResult<()> {
    if !(PAGE_SIZE_MIN..=PAGE_SIZE_MAX).contains(&page_size) || !page_size.is_power_of_two() {
        return Err(StoreError::InvalidParameter(format!(
            "page size {page_size} is not a power of two in {PAGE_SIZE_MIN}..={PAGE_SIZE_MAX}"
        )));
    }
    Ok(())
}

fn free_list_capacity(blocks_per_page: u32) -> usize {
    1024usize.max(4 * blocks_per_page as usize)
}

fn undo_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".undo");
    PathBuf::from(name)
}

fn bincode_config() -> impl BincodeConfig {
    config::legacy()
}
