//! Write/read correctness: snapshots, tombstones, rollbacks, scans.

use crate::engine::tests::helpers::*;
use crate::engine::{ScanOptions, WriteOptions, WriteRecord};

#[test]
fn put_get_roundtrip() {
    let fx = EngineFixture::new();
    let engine = fx.open("t/tablet1/lg0", memtable_only_options());

    put(&engine, b"row1", b"v1");
    assert_eq!(engine.get(b"row1", None).unwrap(), Some(b"v1".to_vec()));
    assert_eq!(engine.get(b"row2", None).unwrap(), None);
    engine.close().unwrap();
}

#[test]
fn snapshot_reads_pick_highest_sequence_at_or_below() {
    let fx = EngineFixture::new();
    let engine = fx.open("t/tablet1/lg0", memtable_only_options());

    // The written sequence pair from the spec's first scenario.
    put_at(&engine, b"row1", b"v1", 10);
    put_at(&engine, b"row1", b"v2", 20);

    assert_eq!(engine.get(b"row1", Some(15)).unwrap(), Some(b"v1".to_vec()));
    assert_eq!(engine.get(b"row1", Some(25)).unwrap(), Some(b"v2".to_vec()));
    assert_eq!(engine.get(b"row1", Some(5)).unwrap(), None);
    assert_eq!(engine.get(b"row1", None).unwrap(), Some(b"v2".to_vec()));
}

#[test]
fn deletion_shadows_at_and_after_its_sequence() {
    let fx = EngineFixture::new();
    let engine = fx.open("t/tablet1/lg0", memtable_only_options());

    put_at(&engine, b"k", b"v", 5);
    delete_at(&engine, b"k", 7);

    assert_eq!(engine.get(b"k", Some(6)).unwrap(), Some(b"v".to_vec()));
    assert_eq!(engine.get(b"k", Some(7)).unwrap(), None);
    assert_eq!(engine.get(b"k", None).unwrap(), None);
}

#[test]
fn snapshot_reads_survive_flush() {
    let fx = EngineFixture::new();
    let engine = fx.open("t/tablet1/lg0", memtable_only_options());

    put_at(&engine, b"row1", b"v1", 10);
    put_at(&engine, b"row1", b"v2", 20);
    engine.flush().unwrap();

    assert_eq!(engine.get(b"row1", Some(15)).unwrap(), Some(b"v1".to_vec()));
    assert_eq!(engine.get(b"row1", Some(25)).unwrap(), Some(b"v2".to_vec()));
}

#[test]
fn server_assigned_sequences_are_monotonic() {
    let fx = EngineFixture::new();
    let engine = fx.open("t/tablet1/lg0", memtable_only_options());

    let first = engine
        .write(&[WriteRecord::put(b"a", b"1")], &WriteOptions::default())
        .unwrap();
    let second = engine
        .write(&[WriteRecord::put(b"b", b"2")], &WriteOptions::default())
        .unwrap();
    assert!(second > first);
    assert_eq!(engine.last_sequence(), second);
}

#[test]
fn batch_is_atomic_in_sequence_order() {
    let fx = EngineFixture::new();
    let engine = fx.open("t/tablet1/lg0", memtable_only_options());

    let last = engine
        .write(
            &[
                WriteRecord::put(b"a", b"1"),
                WriteRecord::put(b"b", b"2"),
                WriteRecord::delete(b"a"),
            ],
            &WriteOptions::default(),
        )
        .unwrap();

    // The delete carries the highest sequence in the batch.
    assert_eq!(engine.get(b"a", None).unwrap(), None);
    assert_eq!(engine.get(b"b", None).unwrap(), Some(b"2".to_vec()));
    assert_eq!(engine.get(b"a", Some(last - 1)).unwrap(), Some(b"1".to_vec()));
}

#[test]
fn rollback_window_hides_writes() {
    let fx = EngineFixture::new();
    let engine = fx.open("t/tablet1/lg0", memtable_only_options());

    put_at(&engine, b"k", b"keep", 10);
    put_at(&engine, b"k", b"rolled", 15);
    engine.rollback(10, 15).unwrap();

    assert_eq!(engine.get(b"k", None).unwrap(), Some(b"keep".to_vec()));
}

#[test]
fn pinned_snapshot_stays_stable() {
    let fx = EngineFixture::new();
    let engine = fx.open("t/tablet1/lg0", memtable_only_options());

    put(&engine, b"k", b"old");
    let snapshot = engine.get_snapshot().unwrap();
    put(&engine, b"k", b"new");

    assert_eq!(engine.get(b"k", Some(snapshot)).unwrap(), Some(b"old".to_vec()));
    assert_eq!(engine.get(b"k", None).unwrap(), Some(b"new".to_vec()));
    engine.release_snapshot(snapshot).unwrap();
}

#[test]
fn scan_merges_layers_in_key_order() {
    let fx = EngineFixture::new();
    let engine = fx.open("t/tablet1/lg0", small_buffer_options());

    fill_keys(&engine, 100, "key");
    engine.flush().unwrap();
    // Overwrite a few keys so the memtable shadows the tables.
    put(&engine, b"key_00010", b"fresh");

    let page = engine.scan(&ScanOptions::default()).unwrap();
    assert_eq!(page.cells.len(), 100);
    assert!(!page.more);

    let keys: Vec<&[u8]> = page.cells.iter().map(|(k, _)| k.as_slice()).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);

    let overwritten = page
        .cells
        .iter()
        .find(|(k, _)| k == b"key_00010")
        .unwrap();
    assert_eq!(overwritten.1, b"fresh");
}

#[test]
fn scan_respects_range_and_budgets() {
    let fx = EngineFixture::new();
    let engine = fx.open("t/tablet1/lg0", memtable_only_options());
    fill_keys(&engine, 50, "key");

    let page = engine
        .scan(&ScanOptions {
            start: b"key_00010".to_vec(),
            end: b"key_00020".to_vec(),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(page.cells.len(), 10);

    let page = engine
        .scan(&ScanOptions {
            row_budget: 7,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(page.cells.len(), 7);
    assert!(page.more);
    let resume = page.next_start.unwrap();

    let rest = engine
        .scan(&ScanOptions {
            start: resume,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(rest.cells.len(), 43);
}

#[test]
fn scan_skips_deleted_keys() {
    let fx = EngineFixture::new();
    let engine = fx.open("t/tablet1/lg0", memtable_only_options());

    fill_keys(&engine, 10, "key");
    engine
        .write(&[WriteRecord::delete(b"key_00004")], &WriteOptions::default())
        .unwrap();

    let page = engine.scan(&ScanOptions::default()).unwrap();
    assert_eq!(page.cells.len(), 9);
    assert!(!page.cells.iter().any(|(k, _)| k == b"key_00004"));
}

#[test]
fn scan_at_snapshot_is_stable() {
    let fx = EngineFixture::new();
    let engine = fx.open("t/tablet1/lg0", memtable_only_options());

    fill_keys(&engine, 10, "key");
    let snapshot = engine.get_snapshot().unwrap();
    put(&engine, b"key_00003", b"changed");
    fill_keys(&engine, 5, "zzz");

    let page = engine
        .scan(&ScanOptions {
            snapshot: Some(snapshot),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(page.cells.len(), 10);
    let cell = page.cells.iter().find(|(k, _)| k == b"key_00003").unwrap();
    assert_eq!(cell.1, b"value_with_some_padding_00003");
    engine.release_snapshot(snapshot).unwrap();
}
