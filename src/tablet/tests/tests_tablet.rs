//! Tablet data path, lifecycle, and split keys.

use crate::tablet::tests::helpers::*;
use crate::tablet::{CellMutation, MutationOp, TabletError, TabletState};

fn put(family: &str, qualifier: &[u8], value: &[u8]) -> CellMutation {
    CellMutation {
        family: family.into(),
        qualifier: qualifier.to_vec(),
        timestamp: None,
        op: MutationOp::Put(value.to_vec()),
    }
}

#[test]
fn write_then_read_row_across_groups() {
    let fx = TabletFixture::new();
    let tablet = fx.load(meta("users", b"", b"", "users/t1"), two_group_schema());

    tablet
        .write_row(
            b"alice",
            &[
                put("name", b"full", b"Alice"),
                put("mail", b"primary", b"alice@example.com"),
                put("blob", b"avatar", b"\x89PNG"),
            ],
            false,
        )
        .unwrap();

    let cells = tablet.read_row(b"alice", &[], 0, None).unwrap();
    assert_eq!(cells.len(), 3);
    let families: Vec<&str> = cells.iter().map(|c| c.family.as_str()).collect();
    assert!(families.contains(&"name"));
    assert!(families.contains(&"mail"));
    assert!(families.contains(&"blob"));

    // Family selection narrows the read.
    let cells = tablet
        .read_row(b"alice", &["blob".to_string()], 0, None)
        .unwrap();
    assert_eq!(cells.len(), 1);
    assert_eq!(cells[0].value, b"\x89PNG");
}

#[test]
fn versions_are_newest_first_with_explicit_timestamps() {
    let fx = TabletFixture::new();
    let tablet = fx.load(meta("users", b"", b"", "users/t1"), two_group_schema());

    for (ts, value) in [(10u64, b"v10".as_ref()), (30, b"v30"), (20, b"v20")] {
        tablet
            .write_row(
                b"bob",
                &[CellMutation {
                    family: "name".into(),
                    qualifier: b"full".to_vec(),
                    timestamp: Some(ts),
                    op: MutationOp::Put(value.to_vec()),
                }],
                false,
            )
            .unwrap();
    }

    let cells = tablet.read_row(b"bob", &[], 0, None).unwrap();
    let timestamps: Vec<u64> = cells.iter().map(|c| c.timestamp).collect();
    assert_eq!(timestamps, vec![30, 20, 10]);
}

#[test]
fn cell_delete_removes_one_version_path() {
    let fx = TabletFixture::new();
    let tablet = fx.load(meta("users", b"", b"", "users/t1"), two_group_schema());

    tablet
        .write_row(
            b"carol",
            &[CellMutation {
                family: "name".into(),
                qualifier: b"full".to_vec(),
                timestamp: Some(5),
                op: MutationOp::Put(b"Carol".to_vec()),
            }],
            false,
        )
        .unwrap();
    tablet
        .write_row(
            b"carol",
            &[CellMutation {
                family: "name".into(),
                qualifier: b"full".to_vec(),
                timestamp: Some(5),
                op: MutationOp::Delete,
            }],
            false,
        )
        .unwrap();

    let cells = tablet.read_row(b"carol", &[], 0, None).unwrap();
    assert!(cells.is_empty(), "tombstone must shadow the value: {cells:?}");
}

#[test]
fn out_of_range_rows_are_rejected() {
    let fx = TabletFixture::new();
    let tablet = fx.load(meta("users", b"m", b"x", "users/t1"), two_group_schema());

    let err = tablet
        .write_row(b"alpha", &[put("name", b"q", b"v")], false)
        .unwrap_err();
    assert!(matches!(err, TabletError::KeyNotInRange));
    assert!(matches!(
        tablet.read_row(b"zeta", &[], 0, None),
        Err(TabletError::KeyNotInRange)
    ));
}

#[test]
fn unknown_family_and_bad_row_are_rejected() {
    let fx = TabletFixture::new();
    let tablet = fx.load(meta("users", b"", b"", "users/t1"), two_group_schema());

    assert!(matches!(
        tablet.write_row(b"row", &[put("nope", b"q", b"v")], false),
        Err(TabletError::UnknownFamily(_))
    ));
    assert!(matches!(
        tablet.write_row(b"bad\x00row", &[put("name", b"q", b"v")], false),
        Err(TabletError::BadRowKey)
    ));
}

#[test]
fn scan_pages_at_row_boundaries() {
    let fx = TabletFixture::new();
    let tablet = fx.load(meta("users", b"", b"", "users/t1"), two_group_schema());

    for i in 0..30 {
        let row = format!("row_{i:03}").into_bytes();
        tablet
            .write_row(
                &row,
                &[put("name", b"a", b"1"), put("name", b"b", b"2")],
                false,
            )
            .unwrap();
    }

    let (cells, resume) = tablet.scan_rows(b"", b"", &[], 10, None).unwrap();
    assert!(!cells.is_empty());
    let resume = resume.expect("30 rows × 2 cells must exceed a 10-cell page");
    // No row is split across the boundary.
    let last_row = cells.last().unwrap().row.clone();
    let in_page = cells.iter().filter(|c| c.row == last_row).count();
    assert_eq!(in_page, 2, "both cells of the last row stay in the page");
    assert!(resume > last_row);

    // Following pages cover the remainder with no overlap or gap.
    let mut seen: Vec<Vec<u8>> = cells.iter().map(|c| c.row.clone()).collect();
    let mut cursor = resume;
    loop {
        let (page, next) = tablet.scan_rows(&cursor, b"", &[], 10, None).unwrap();
        seen.extend(page.iter().map(|c| c.row.clone()));
        match next {
            Some(next) => cursor = next,
            None => break,
        }
    }
    seen.dedup();
    assert_eq!(seen.len(), 30);
}

#[test]
fn lifecycle_transitions_are_enforced() {
    let fx = TabletFixture::new();
    let tablet = fx.load(meta("users", b"", b"", "users/t1"), two_group_schema());
    assert_eq!(tablet.state(), TabletState::Ready);

    // Ready → OnSplit → back to Ready is legal.
    tablet.set_state(TabletState::OnSplit).unwrap();
    tablet.set_state(TabletState::Ready).unwrap();

    // Unloading2 before Unloading is not.
    let err = tablet.set_state(TabletState::Unloading2).unwrap_err();
    assert!(matches!(err, TabletError::IllegalState { .. }));

    tablet.set_state(TabletState::Unloading).unwrap();
    // No new operations once unloading.
    assert!(matches!(
        tablet.read_row(b"row", &[], 0, None),
        Err(TabletError::Unavailable(TabletState::Unloading))
    ));
    tablet.set_state(TabletState::Unloading2).unwrap();
    tablet.close_engines().unwrap();
}

#[test]
fn split_key_respects_range_interior() {
    let fx = TabletFixture::new();
    let tablet = fx.load(meta("users", b"", b"", "users/t1"), two_group_schema());

    for i in 0..200 {
        let row = format!("row_{i:05}").into_bytes();
        tablet
            .write_row(&row, &[put("name", b"q", &vec![b'x'; 50])], false)
            .unwrap();
    }
    for (_, engine) in tablet.engines() {
        engine.flush().unwrap();
    }

    let split = tablet.compute_split_key().unwrap().expect("split key");
    assert!(split > b"row_00000".to_vec());
    assert!(split < b"row_00199x".to_vec());
}

#[test]
fn empty_tablet_has_no_split_key() {
    let fx = TabletFixture::new();
    let tablet = fx.load(meta("users", b"", b"", "users/t1"), two_group_schema());
    assert_eq!(tablet.compute_split_key().unwrap(), None);
}
