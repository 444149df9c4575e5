//! Cell-key packing: framing, ordering, bounds.

use crate::tablet::cellkey::*;

#[test]
fn pack_unpack_roundtrip() {
    let key = pack(b"row1", 3, b"qualifier", 123_456_789);
    let cell = unpack(&key).unwrap();
    assert_eq!(cell.row, b"row1");
    assert_eq!(cell.family_id, 3);
    assert_eq!(cell.qualifier, b"qualifier");
    assert_eq!(cell.timestamp, 123_456_789);
}

#[test]
fn qualifier_may_contain_zero_bytes() {
    let key = pack(b"row", 0, b"qu\x00al", 42);
    let cell = unpack(&key).unwrap();
    assert_eq!(cell.qualifier, b"qu\x00al");
    assert_eq!(cell.timestamp, 42);
}

#[test]
fn newer_timestamp_sorts_first_within_a_qualifier() {
    let newer = pack(b"row", 0, b"q", 200);
    let older = pack(b"row", 0, b"q", 100);
    assert!(newer < older);
}

#[test]
fn rows_sort_before_columns() {
    let a = pack(b"rowA", 9, b"zzz", 0);
    let b = pack(b"rowB", 0, b"aaa", u64::MAX);
    assert!(a < b, "row order must dominate family/qualifier order");
}

#[test]
fn row_bounds_cover_exactly_the_row() {
    let lower = row_lower_bound(b"row");
    let upper = row_upper_bound(b"row");
    let inside = pack(b"row", 0, b"q", 5);
    let next_row = pack(b"row1", 0, b"q", 5);

    assert!(lower <= inside);
    assert!(inside < upper);
    assert!(upper <= next_row);
}

#[test]
fn row_of_extracts_prefix() {
    let key = pack(b"the-row", 7, b"q", 1);
    assert_eq!(row_of(&key), b"the-row");
}

#[test]
fn packability_rules() {
    assert!(row_is_packable(b"plain"));
    assert!(!row_is_packable(b""));
    assert!(!row_is_packable(b"has\x00zero"));
}

#[test]
fn row_successor_is_tight() {
    let successor = row_successor(b"row");
    assert!(successor.as_slice() > b"row".as_ref());
    // Any packable extension of "row" is at or after the successor.
    assert!(b"row\x01".as_ref() >= successor.as_slice());
    assert!(b"rowx".as_ref() > successor.as_slice());
}
