//! Iterator order and seek positioning across block boundaries.

use crate::engine::key::{InternalKey, ValueKind};
use crate::sstable::tests::helpers::*;

#[test]
fn full_iteration_preserves_order() {
    let (_tmp, dfs) = mount();
    let cells = hundred_cells();
    let refs: Vec<(&[u8], u64, ValueKind, &[u8])> = cells
        .iter()
        .map(|(k, s, kind, v)| (k.as_slice(), *s, *kind, v.as_slice()))
        .collect();
    let result = build_table(&dfs, "t.sst", 256, &refs);
    let table = open_table(&dfs, "t.sst", 1, result.file_size, cache());

    let yielded: Vec<(InternalKey, Vec<u8>)> =
        table.iter().collect::<Result<_, _>>().unwrap();
    assert_eq!(yielded.len(), 100);
    for (i, (key, value)) in yielded.iter().enumerate() {
        assert_eq!(key.user_key, format!("key_{i:04}").into_bytes());
        assert_eq!(*value, format!("value_{i:04}").into_bytes());
    }
    // Strictly ascending internal keys.
    for pair in yielded.windows(2) {
        assert!(pair[0].0 < pair[1].0);
    }
}

#[test]
fn seek_lands_on_first_key_at_or_after_target() {
    let (_tmp, dfs) = mount();
    let cells = hundred_cells();
    let refs: Vec<(&[u8], u64, ValueKind, &[u8])> = cells
        .iter()
        .map(|(k, s, kind, v)| (k.as_slice(), *s, *kind, v.as_slice()))
        .collect();
    let result = build_table(&dfs, "t.sst", 256, &refs);
    let table = open_table(&dfs, "t.sst", 1, result.file_size, cache());

    let mut iter = table.iter();
    iter.seek(&InternalKey::seek_to(b"key_0042".to_vec(), u64::MAX >> 8))
        .unwrap();
    let (key, _) = iter.next().unwrap().unwrap();
    assert_eq!(key.user_key, b"key_0042");

    // A target between stored keys lands on the next one.
    let mut iter = table.iter();
    iter.seek(&InternalKey::seek_to(b"key_0042x".to_vec(), u64::MAX >> 8))
        .unwrap();
    let (key, _) = iter.next().unwrap().unwrap();
    assert_eq!(key.user_key, b"key_0043");
}

#[test]
fn seek_past_end_exhausts() {
    let (_tmp, dfs) = mount();
    let result = build_table(&dfs, "t.sst", 256, &[(b"a", 1, ValueKind::Value, b"v")]);
    let table = open_table(&dfs, "t.sst", 1, result.file_size, cache());

    let mut iter = table.iter();
    iter.seek(&InternalKey::seek_to(b"zzz".to_vec(), u64::MAX >> 8))
        .unwrap();
    assert!(iter.next().is_none());
}

#[test]
fn versions_of_one_key_iterate_newest_first() {
    let (_tmp, dfs) = mount();
    let result = build_table(
        &dfs,
        "t.sst",
        256,
        &[
            (b"k", 9, ValueKind::Value, b"v9"),
            (b"k", 5, ValueKind::Deletion, b""),
            (b"k", 2, ValueKind::Value, b"v2"),
        ],
    );
    let table = open_table(&dfs, "t.sst", 1, result.file_size, cache());

    let sequences: Vec<u64> = table
        .iter()
        .map(|cell| cell.unwrap().0.sequence)
        .collect();
    assert_eq!(sequences, vec![9, 5, 2]);
}
