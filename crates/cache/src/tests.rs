use super::*;
use bytes::Bytes;
use common::StorageId;

#[derive(Default)]
struct CollectingWriter {
    written: Vec<Record>,
}

impl CacheWriter for CollectingWriter {
    fn write_back(&mut self, record: Record) -> StoreResult<()> {
        self.written.push(record);
        Ok(())
    }
}

fn record(pos: BlockPos, changed: bool) -> Record {
    Record {
        storage_id: StorageId(1),
        pos,
        block_count: 1,
        deleted: false,
        changed,
        payload: Bytes::from(vec![pos as u8; 8]),
    }
}

#[test]
fn lru_evicts_dirty_through_writer() {
    let mut cache = LruRecordCache::new(2);
    let mut writer = CollectingWriter::default();

    cache.update(0, record(0, true), &mut writer).unwrap();
    cache.update(8, record(8, true), &mut writer).unwrap();
    cache.update(16, record(16, true), &mut writer).unwrap();

    assert_eq!(writer.written.len(), 1);
    assert_eq!(writer.written[0].pos, 0);
    assert_eq!(cache.len(), 2);
    assert!(cache.find(0).is_none());
    assert!(cache.find(8).is_some());
}

#[test]
fn lru_discards_clean_without_writeback() {
    let mut cache = LruRecordCache::new(1);
    let mut writer = CollectingWriter::default();

    cache.update(0, record(0, false), &mut writer).unwrap();
    cache.update(8, record(8, false), &mut writer).unwrap();

    assert!(writer.written.is_empty());
    assert_eq!(cache.len(), 1);
}

#[test]
fn lru_same_key_replacement_does_not_write_back() {
    let mut cache = LruRecordCache::new(2);
    let mut writer = CollectingWriter::default();

    cache.update(0, record(0, true), &mut writer).unwrap();
    let mut newer = record(0, true);
    newer.payload = Bytes::from_static(b"newer");
    cache.update(0, newer.clone(), &mut writer).unwrap();

    assert!(writer.written.is_empty());
    assert_eq!(cache.find(0).unwrap().payload, newer.payload);
}

#[test]
fn lru_find_refreshes_order() {
    let mut cache = LruRecordCache::new(2);
    let mut writer = CollectingWriter::default();

    cache.update(0, record(0, false), &mut writer).unwrap();
    cache.update(8, record(8, false), &mut writer).unwrap();
    cache.find(0);
    cache.update(16, record(16, false), &mut writer).unwrap();

    // 8 was least recently used after the touch of 0.
    assert!(cache.find(8).is_none());
    assert!(cache.find(0).is_some());
}

#[test]
fn get_all_changed_reports_only_dirty() {
    let mut cache = LruRecordCache::new(4);
    let mut writer = CollectingWriter::default();

    cache.update(0, record(0, true), &mut writer).unwrap();
    cache.update(8, record(8, false), &mut writer).unwrap();
    cache.update(16, record(16, true), &mut writer).unwrap();

    let mut dirty: Vec<_> = cache.get_all_changed().iter().map(|r| r.pos).collect();
    dirty.sort_unstable();
    assert_eq!(dirty, vec![0, 16]);

    cache.mark_clean(16);
    assert_eq!(cache.get_all_changed().len(), 1);
}

#[test]
fn remove_skips_writeback() {
    let mut cache = LruRecordCache::new(2);
    let mut writer = CollectingWriter::default();

    cache.update(0, record(0, true), &mut writer).unwrap();
    let removed = cache.remove(0).unwrap();
    assert_eq!(removed.pos, 0);
    assert!(writer.written.is_empty());
    assert!(cache.is_empty());
}

#[test]
fn two_queue_first_touch_stays_on_probation() {
    let mut cache = TwoQueueCache::new(8);
    let mut writer = CollectingWriter::default();

    cache.update(0, record(0, false), &mut writer).unwrap();
    assert!(cache.find(0).is_some());
    assert_eq!(cache.len(), 1);
}

#[test]
fn two_queue_promotes_after_ghost_hit() {
    // capacity 8: probation 2, main 6, ghost 4.
    let mut cache = TwoQueueCache::new(8);
    let mut writer = CollectingWriter::default();

    cache.update(0, record(0, true), &mut writer).unwrap();
    cache.update(8, record(8, false), &mut writer).unwrap();
    // Overflows probation, evicting 0 into the ghost queue.
    cache.update(16, record(16, false), &mut writer).unwrap();

    assert_eq!(writer.written.len(), 1);
    assert_eq!(writer.written[0].pos, 0);
    assert!(cache.find(0).is_none());

    // Re-insert of a ghosted position lands in the main queue.
    cache.update(0, record(0, false), &mut writer).unwrap();
    assert!(cache.find(0).is_some());

    // Filling probation again must not push 0 out.
    cache.update(24, record(24, false), &mut writer).unwrap();
    cache.update(32, record(32, false), &mut writer).unwrap();
    assert!(cache.find(0).is_some());
}

#[test]
fn two_queue_dirty_probation_eviction_writes_back() {
    let mut cache = TwoQueueCache::new(4);
    let mut writer = CollectingWriter::default();

    cache.update(0, record(0, true), &mut writer).unwrap();
    cache.update(8, record(8, true), &mut writer).unwrap();

    assert_eq!(writer.written.len(), 1);
    assert_eq!(writer.written[0].pos, 0);
}

#[test]
fn two_queue_tracks_dirty_in_both_queues() {
    let mut cache = TwoQueueCache::new(8);
    let mut writer = CollectingWriter::default();

    cache.update(0, record(0, true), &mut writer).unwrap();
    cache.update(8, record(8, false), &mut writer).unwrap();
    cache.update(16, record(16, false), &mut writer).unwrap();
    cache.update(0, record(0, true), &mut writer).unwrap();

    let dirty: Vec<_> = cache.get_all_changed().iter().map(|r| r.pos).collect();
    assert_eq!(dirty, vec![0]);

    let mut all = cache.positions();
    all.sort_unstable();
    assert_eq!(all, vec![0, 8, 16]);
}

#[test]
#[should_panic(expected = "cache capacity must be > 0")]
fn zero_capacity_panics() {
    let _ = new_cache(CachePolicy::Lru, 0);
}
