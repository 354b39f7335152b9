//! Record cache with write-back eviction.
//!
//! The cache maps block positions to [`Record`]s. When an insert would
//! exceed capacity, a dirty evicted entry is flushed through the
//! [`CacheWriter`] capability before it is discarded; clean records leave
//! without I/O. The writer is passed per call rather than stored, so the
//! cache never holds a reference back into its owner.
//!
//! Two policies are available, selected at configuration time:
//! - [`LruRecordCache`]: plain least-recently-used.
//! - [`TwoQueueCache`]: 2Q. First-time entries pass through a FIFO
//!   probation queue and are only promoted to the main LRU when re-read
//!   after eviction, tracked by a ghost queue of positions, so a single
//!   sequential scan does not wash out the hot set.
//!
//! The cache is not internally synchronized; the owning store serializes
//! access.

#[cfg(test)]
mod tests;

use common::{BlockPos, CachePolicy, Record, StoreResult};
use lru::LruCache;
use std::num::NonZeroUsize;

/// Capability to flush a dirty record before the cache discards it.
pub trait CacheWriter {
    fn write_back(&mut self, record: Record) -> StoreResult<()>;
}

/// Position-keyed record cache contract shared by the eviction policies.
pub trait RecordCache: Send {
    /// Look up a record, touching it for the eviction policy.
    fn find(&mut self, pos: BlockPos) -> Option<&Record>;

    /// Install or overwrite the record at `pos`. A dirty entry evicted to
    /// make room is handed to `writer` first.
    fn update(
        &mut self,
        pos: BlockPos,
        record: Record,
        writer: &mut dyn CacheWriter,
    ) -> StoreResult<()>;

    /// Drop the entry at `pos` without writing it back.
    fn remove(&mut self, pos: BlockPos) -> Option<Record>;

    /// Snapshot of all dirty records currently resident.
    fn get_all_changed(&self) -> Vec<Record>;

    /// Clear the changed flag of the entry at `pos`, if resident.
    fn mark_clean(&mut self, pos: BlockPos);

    /// Positions of all resident records.
    fn positions(&self) -> Vec<BlockPos>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build a cache for the configured policy.
///
/// # Panics
///
/// Panics if `capacity` is 0.
pub fn new_cache(policy: CachePolicy, capacity: usize) -> Box<dyn RecordCache> {
    assert!(capacity > 0, "cache capacity must be > 0");
    match policy {
        CachePolicy::Lru => Box::new(LruRecordCache::new(capacity)),
        CachePolicy::TwoQueue => Box::new(TwoQueueCache::new(capacity)),
    }
}

fn nonzero(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n.max(1)).unwrap()
}

fn flush_victim(victim: Record, writer: &mut dyn CacheWriter) -> StoreResult<()> {
    if victim.changed && !victim.deleted {
        writer.write_back(victim)?;
    }
    Ok(())
}

/// Least-recently-used record cache.
#[derive(Debug)]
pub struct LruRecordCache {
    entries: LruCache<BlockPos, Record>,
}

impl LruRecordCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::new(nonzero(capacity)),
        }
    }
}

impl RecordCache for LruRecordCache {
    fn find(&mut self, pos: BlockPos) -> Option<&Record> {
        self.entries.get(&pos)
    }

    fn update(
        &mut self,
        pos: BlockPos,
        record: Record,
        writer: &mut dyn CacheWriter,
    ) -> StoreResult<()> {
        if let Some((evicted_pos, victim)) = self.entries.push(pos, record) {
            // push returns either the replaced value for the same key or
            // the LRU victim that made room.
            if evicted_pos != pos {
                flush_victim(victim, writer)?;
            }
        }
        Ok(())
    }

    fn remove(&mut self, pos: BlockPos) -> Option<Record> {
        self.entries.pop(&pos)
    }

    fn get_all_changed(&self) -> Vec<Record> {
        self.entries
            .iter()
            .filter(|(_, r)| r.changed)
            .map(|(_, r)| r.clone())
            .collect()
    }

    fn mark_clean(&mut self, pos: BlockPos) {
        if let Some(rec) = self.entries.peek_mut(&pos) {
            rec.changed = false;
        }
    }

    fn positions(&self) -> Vec<BlockPos> {
        self.entries.iter().map(|(pos, _)| *pos).collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// 2Q record cache: probation FIFO + ghost queue + main LRU.
#[derive(Debug)]
pub struct TwoQueueCache {
    /// Hot entries, LRU order.
    main: LruCache<BlockPos, Record>,
    /// First-time entries; never refreshed on access, so it drains FIFO.
    queue_in: LruCache<BlockPos, Record>,
    /// Positions recently evicted from `queue_in`; a re-insert from here
    /// goes straight to `main`.
    queue_out: LruCache<BlockPos, ()>,
}

impl TwoQueueCache {
    pub fn new(capacity: usize) -> Self {
        let in_cap = (capacity / 4).max(1);
        let main_cap = capacity.saturating_sub(in_cap).max(1);
        let out_cap = (capacity / 2).max(1);
        Self {
            main: LruCache::new(nonzero(main_cap)),
            queue_in: LruCache::new(nonzero(in_cap)),
            queue_out: LruCache::new(nonzero(out_cap)),
        }
    }
}

impl RecordCache for TwoQueueCache {
    fn find(&mut self, pos: BlockPos) -> Option<&Record> {
        if self.main.contains(&pos) {
            return self.main.get(&pos);
        }
        // Probation hits do not promote and do not refresh.
        self.queue_in.peek(&pos)
    }

    fn update(
        &mut self,
        pos: BlockPos,
        record: Record,
        writer: &mut dyn CacheWriter,
    ) -> StoreResult<()> {
        if self.main.contains(&pos) {
            self.main.put(pos, record);
            return Ok(());
        }
        if self.queue_in.contains(&pos) {
            self.queue_in.put(pos, record);
            return Ok(());
        }
        if self.queue_out.pop(&pos).is_some() {
            // Seen before: hot. Make room in main first.
            if self.main.len() == self.main.cap().get()
                && let Some((_, victim)) = self.main.pop_lru()
            {
                flush_victim(victim, writer)?;
            }
            self.main.put(pos, record);
            return Ok(());
        }
        // First sighting: probation queue.
        if self.queue_in.len() == self.queue_in.cap().get()
            && let Some((out_pos, victim)) = self.queue_in.pop_lru()
        {
            flush_victim(victim, writer)?;
            self.queue_out.put(out_pos, ());
        }
        self.queue_in.put(pos, record);
        Ok(())
    }

    fn remove(&mut self, pos: BlockPos) -> Option<Record> {
        self.queue_out.pop(&pos);
        self.main.pop(&pos).or_else(|| self.queue_in.pop(&pos))
    }

    fn get_all_changed(&self) -> Vec<Record> {
        self.main
            .iter()
            .chain(self.queue_in.iter())
            .filter(|(_, r)| r.changed)
            .map(|(_, r)| r.clone())
            .collect()
    }

    fn mark_clean(&mut self, pos: BlockPos) {
        if let Some(rec) = self.main.peek_mut(&pos) {
            rec.changed = false;
        } else if let Some(rec) = self.queue_in.peek_mut(&pos) {
            rec.changed = false;
        }
    }

    fn positions(&self) -> Vec<BlockPos> {
        self.main
            .iter()
            .chain(self.queue_in.iter())
            .map(|(pos, _)| *pos)
            .collect()
    }

    fn len(&self) -> usize {
        self.main.len() + self.queue_in.len()
    }
}
