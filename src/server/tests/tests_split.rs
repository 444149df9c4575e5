//! Split lifecycle: split key, unload parent, load inheriting children.

use crate::server::tests::helpers::*;
use crate::server::{RowRead, ScanRequest, TabletStatus};

#[test]
fn split_key_unload_load_children_preserves_keyspace() {
    let fx = ServerFixture::new();
    fx.server
        .load_tablet(fx.load_request("users", b"", b"", "users/parent"))
        .unwrap();

    for i in 0..200 {
        let row = format!("row{i:05}").into_bytes();
        let statuses = fx.server.write_tablet(
            "users",
            &[put_row(&row, b"q", format!("v{i}").as_bytes())],
            false,
        );
        assert_eq!(statuses, vec![TabletStatus::Ok]);
    }
    // Flush so the split key has table files to weigh.
    fx.server.compact_tablet("users", b"", None).unwrap();

    let split = fx.server.compute_split_key("users", b"").unwrap();
    assert!(split > b"row00000".to_vec());
    assert!(split < b"row00199".to_vec());

    fx.server
        .unload_tablet("users", b"", &fx.session())
        .unwrap();

    // Children inherit the parent's engines in place.
    let mut left = fx.load_request("users", b"", &split, "users/child0");
    left.parents = vec!["users/parent".to_string()];
    fx.server.load_tablet(left).unwrap();

    let mut right = fx.load_request("users", &split, b"", "users/child1");
    right.parents = vec!["users/parent".to_string()];
    fx.server.load_tablet(right).unwrap();

    // Union of children equals the parent keyspace.
    let mut collected = Vec::new();
    let mut scan_id = None;
    loop {
        let response = fx.server.scan_tablet(&ScanRequest {
            table: "users".into(),
            start: Vec::new(),
            end: Vec::new(),
            families: vec![],
            filters: vec![],
            buffer_limit: 500,
            scan_id,
            close: false,
        });
        assert_eq!(response.status, TabletStatus::Ok);
        collected.extend(response.cells);
        if response.complete {
            break;
        }
        scan_id = response.scan_id;
    }
    assert_eq!(collected.len(), 200);
    for (i, cell) in collected.iter().enumerate() {
        assert_eq!(cell.row, format!("row{i:05}").into_bytes());
        assert_eq!(cell.value, format!("v{i}").into_bytes());
    }

    // Point reads route to the correct child.
    let (results, _) = fx.server.read_tablet(
        "users",
        &[
            RowRead {
                row: b"row00000".to_vec(),
                families: vec![],
                max_versions: 0,
            },
            RowRead {
                row: b"row00199".to_vec(),
                families: vec![],
                max_versions: 0,
            },
        ],
        5_000,
        None,
    );
    assert_eq!(results[0].status, TabletStatus::Ok);
    assert_eq!(results[1].status, TabletStatus::Ok);
}

#[test]
fn split_key_on_empty_tablet_is_table_not_support() {
    let fx = ServerFixture::new();
    fx.server
        .load_tablet(fx.load_request("users", b"", b"", "users/t1"))
        .unwrap();
    assert_eq!(
        fx.server.compute_split_key("users", b"").unwrap_err(),
        TabletStatus::TableNotSupport
    );
}
