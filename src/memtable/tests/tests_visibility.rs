//! Snapshot and rollback visibility rules.

use crate::engine::key::{LookupKey, Rollbacks, ValueKind};
use crate::memtable::{MemTable, MemTableGet, MemTableKind};

fn table_with_versions() -> MemTable {
    let mem = MemTable::new(MemTableKind::Single);
    mem.add(10, ValueKind::Value, b"row1", b"v1").unwrap();
    mem.add(20, ValueKind::Value, b"row1", b"v2").unwrap();
    mem
}

#[test]
fn snapshot_between_versions_sees_older() {
    let mem = table_with_versions();

    let got = mem.get(&LookupKey::at(b"row1", 15), &Rollbacks::new()).unwrap();
    assert_eq!(got, MemTableGet::Found(b"v1".to_vec()));
}

#[test]
fn snapshot_after_both_sees_newer() {
    let mem = table_with_versions();

    let got = mem.get(&LookupKey::at(b"row1", 25), &Rollbacks::new()).unwrap();
    assert_eq!(got, MemTableGet::Found(b"v2".to_vec()));
}

#[test]
fn snapshot_before_all_sees_nothing() {
    let mem = table_with_versions();

    let got = mem.get(&LookupKey::at(b"row1", 5), &Rollbacks::new()).unwrap();
    assert_eq!(got, MemTableGet::NotFound);
}

#[test]
fn snapshot_exactly_at_version_includes_it() {
    let mem = table_with_versions();

    let got = mem.get(&LookupKey::at(b"row1", 20), &Rollbacks::new()).unwrap();
    assert_eq!(got, MemTableGet::Found(b"v2".to_vec()));
}

#[test]
fn rollback_window_hides_entries() {
    let mem = table_with_versions();

    // Roll back everything in (10, 20]: v2 becomes invisible.
    let mut rollbacks = Rollbacks::new();
    rollbacks.insert(10, 20);

    let got = mem.get(&LookupKey::latest(b"row1"), &rollbacks).unwrap();
    assert_eq!(got, MemTableGet::Found(b"v1".to_vec()));
}

#[test]
fn rollback_window_boundaries_are_half_open() {
    let mem = MemTable::new(MemTableKind::Single);
    mem.add(10, ValueKind::Value, b"k", b"at-snapshot").unwrap();
    mem.add(15, ValueKind::Value, b"k", b"inside").unwrap();
    mem.add(20, ValueKind::Value, b"k", b"at-point").unwrap();
    mem.add(21, ValueKind::Value, b"k", b"past-point").unwrap();

    let mut rollbacks = Rollbacks::new();
    rollbacks.insert(10, 20);

    // 21 is outside the window (sequence > point), so it stays visible.
    let got = mem.get(&LookupKey::latest(b"k"), &rollbacks).unwrap();
    assert_eq!(got, MemTableGet::Found(b"past-point".to_vec()));

    // At snapshot 19 the window hides 15 but not 10.
    let got = mem.get(&LookupKey::at(b"k", 19), &rollbacks).unwrap();
    assert_eq!(got, MemTableGet::Found(b"at-snapshot".to_vec()));
}

#[test]
fn rollback_hiding_a_tombstone_resurrects_value() {
    let mem = MemTable::new(MemTableKind::Single);
    mem.add(10, ValueKind::Value, b"k", b"v").unwrap();
    mem.add(15, ValueKind::Deletion, b"k", b"").unwrap();

    let mut rollbacks = Rollbacks::new();
    rollbacks.insert(10, 15);

    let got = mem.get(&LookupKey::latest(b"k"), &rollbacks).unwrap();
    assert_eq!(got, MemTableGet::Found(b"v".to_vec()));
}
