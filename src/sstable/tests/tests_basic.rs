//! Build → open → point-lookup round trips.

use crate::engine::key::{LookupKey, Rollbacks, ValueKind};
use crate::sstable::TableGet;
use crate::sstable::tests::helpers::*;

#[test]
fn build_and_get_every_key() {
    let (_tmp, dfs) = mount();
    let cells = hundred_cells();
    let refs: Vec<(&[u8], u64, ValueKind, &[u8])> = cells
        .iter()
        .map(|(k, s, kind, v)| (k.as_slice(), *s, *kind, v.as_slice()))
        .collect();
    let result = build_table(&dfs, "t.sst", 512, &refs);
    assert_eq!(result.entries, 100);

    let table = open_table(&dfs, "t.sst", 1, result.file_size, cache());
    assert!(table.block_count() > 1, "512-byte blocks must split 100 cells");

    for (key, _, _, value) in &cells {
        let got = table.get(&LookupKey::latest(key.clone()), &Rollbacks::new()).unwrap();
        assert_eq!(got, TableGet::Found(value.clone()), "key {:?}", String::from_utf8_lossy(key));
    }
}

#[test]
fn absent_key_is_not_found() {
    let (_tmp, dfs) = mount();
    let result = build_table(
        &dfs,
        "t.sst",
        512,
        &[(b"b", 1, ValueKind::Value, b"v")],
    );
    let table = open_table(&dfs, "t.sst", 1, result.file_size, cache());

    for probe in [b"a".as_slice(), b"bb".as_slice(), b"z".as_slice()] {
        assert_eq!(
            table.get(&LookupKey::latest(probe), &Rollbacks::new()).unwrap(),
            TableGet::NotFound
        );
    }
}

#[test]
fn tombstone_reports_deleted() {
    let (_tmp, dfs) = mount();
    let result = build_table(
        &dfs,
        "t.sst",
        512,
        &[
            (b"k", 7, ValueKind::Deletion, b""),
            (b"k", 3, ValueKind::Value, b"old"),
        ],
    );
    let table = open_table(&dfs, "t.sst", 1, result.file_size, cache());

    assert_eq!(
        table.get(&LookupKey::latest(b"k"), &Rollbacks::new()).unwrap(),
        TableGet::Deleted
    );
    // Below the tombstone's sequence the old value is visible.
    assert_eq!(
        table.get(&LookupKey::at(b"k", 5), &Rollbacks::new()).unwrap(),
        TableGet::Found(b"old".to_vec())
    );
}

#[test]
fn snapshot_filters_versions() {
    let (_tmp, dfs) = mount();
    let result = build_table(
        &dfs,
        "t.sst",
        512,
        &[
            (b"row1", 20, ValueKind::Value, b"v2"),
            (b"row1", 10, ValueKind::Value, b"v1"),
        ],
    );
    let table = open_table(&dfs, "t.sst", 1, result.file_size, cache());

    assert_eq!(
        table.get(&LookupKey::at(b"row1", 15), &Rollbacks::new()).unwrap(),
        TableGet::Found(b"v1".to_vec())
    );
    assert_eq!(
        table.get(&LookupKey::at(b"row1", 25), &Rollbacks::new()).unwrap(),
        TableGet::Found(b"v2".to_vec())
    );
    assert_eq!(
        table.get(&LookupKey::at(b"row1", 5), &Rollbacks::new()).unwrap(),
        TableGet::NotFound
    );
}

#[test]
fn rollback_window_applies_inside_table() {
    let (_tmp, dfs) = mount();
    let result = build_table(
        &dfs,
        "t.sst",
        512,
        &[
            (b"k", 20, ValueKind::Value, b"new"),
            (b"k", 10, ValueKind::Value, b"old"),
        ],
    );
    let table = open_table(&dfs, "t.sst", 1, result.file_size, cache());

    let mut rollbacks = Rollbacks::new();
    rollbacks.insert(10, 20);
    assert_eq!(
        table.get(&LookupKey::latest(b"k"), &rollbacks).unwrap(),
        TableGet::Found(b"old".to_vec())
    );
}

#[test]
fn build_result_statistics() {
    let (_tmp, dfs) = mount();
    let result = build_table(
        &dfs,
        "t.sst",
        512,
        &[
            (b"a", 1, ValueKind::Value, b"v"),
            (b"b", 2, ValueKind::Deletion, b""),
            (b"c", 3, ValueKind::Deletion, b""),
            (b"d", 4, ValueKind::Value, b"v"),
        ],
    );

    assert_eq!(result.entries, 4);
    assert_eq!(result.delete_tag_percent, 50);
    assert_eq!(result.smallest.as_ref().unwrap().user_key, b"a");
    assert_eq!(result.largest.as_ref().unwrap().user_key, b"d");
}

#[test]
fn bloom_excludes_absent_keys() {
    let (_tmp, dfs) = mount();
    let cells = hundred_cells();
    let refs: Vec<(&[u8], u64, ValueKind, &[u8])> = cells
        .iter()
        .map(|(k, s, kind, v)| (k.as_slice(), *s, *kind, v.as_slice()))
        .collect();
    let result = build_table(&dfs, "t.sst", 4096, &refs);
    let table = open_table(&dfs, "t.sst", 1, result.file_size, cache());

    for (key, ..) in &cells {
        assert!(table.may_contain(key));
    }
    // With a 1% target rate, 100 foreign probes should mostly miss.
    let false_positives = (0..100)
        .filter(|i| table.may_contain(format!("foreign_{i:04}").as_bytes()))
        .count();
    assert!(false_positives < 10, "{false_positives} bloom false positives");
}
