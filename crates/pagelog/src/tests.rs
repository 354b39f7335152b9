use super::*;
use std::io::Write as _;
use tempfile::tempdir;

#[test]
fn append_and_replay_frames() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("heap.undo");

    let mut log = PageLog::open(&path).unwrap();
    assert!(log.is_empty().unwrap());

    log.add_undo(4, &[1u8; 512]).unwrap();
    log.add_undo(9, &[2u8; 512]).unwrap();
    log.sync().unwrap();
    assert!(!log.is_empty().unwrap());

    let replayed = PageLog::replay(&path).unwrap();
    assert_eq!(replayed.len(), 2);
    assert_eq!(replayed[0].page_id, 4);
    assert_eq!(replayed[0].image, vec![1u8; 512]);
    assert_eq!(replayed[1].page_id, 9);
}

#[test]
fn reopen_discards_frames() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("heap.undo");

    let mut log = PageLog::open(&path).unwrap();
    log.add_undo(1, &[0u8; 64]).unwrap();
    log.reopen().unwrap();

    assert!(log.is_empty().unwrap());
    assert!(PageLog::replay(&path).unwrap().is_empty());

    // The rotated log accepts new frames.
    log.add_undo(2, &[3u8; 64]).unwrap();
    let replayed = PageLog::replay(&path).unwrap();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].page_id, 2);
}

#[test]
fn torn_tail_frame_is_ignored() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("heap.undo");

    let mut log = PageLog::open(&path).unwrap();
    log.add_undo(7, &[5u8; 128]).unwrap();
    log.sync().unwrap();
    drop(log);

    // Simulate a crash mid-append: a length prefix promising more bytes
    // than were written.
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .unwrap();
    file.write_all(&1000u32.to_le_bytes()).unwrap();
    file.write_all(&[9u8; 10]).unwrap();
    drop(file);

    let replayed = PageLog::replay(&path).unwrap();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].page_id, 7);
}

#[test]
fn truncated_length_prefix_is_ignored() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("heap.undo");

    let mut log = PageLog::open(&path).unwrap();
    log.add_undo(3, &[8u8; 32]).unwrap();
    drop(log);

    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .unwrap();
    file.write_all(&[1u8, 2]).unwrap();
    drop(file);

    let replayed = PageLog::replay(&path).unwrap();
    assert_eq!(replayed.len(), 1);
}
