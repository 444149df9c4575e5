//! Control path: sessions, load/unload, schema, query, cmd_ctrl.

use crate::schema::Schema;
use crate::server::{ServerStatus, TabletStatus};
use crate::server::tests::helpers::*;

#[test]
fn server_comes_up_running_with_a_session() {
    let fx = ServerFixture::new();
    assert_eq!(fx.server.status(), ServerStatus::IsRunning);
    assert!(!fx.session().is_empty());
}

#[test]
fn stale_session_is_rejected_without_side_effects() {
    let fx = ServerFixture::new();

    // A master that knew a previous incarnation.
    let mut request = fx.load_request("users", b"", b"", "users/t1");
    request.session_id = "deadbeef-old".into();

    let err = fx.server.load_tablet(request).unwrap_err();
    assert_eq!(err, TabletStatus::IllegalAccess);
    assert!(fx.server.query().tablets.is_empty(), "no tablet may appear");

    // Unload and cmd_ctrl enforce the same check.
    assert_eq!(
        fx.server.unload_tablet("users", b"", "wrong").unwrap_err(),
        TabletStatus::IllegalAccess
    );
    assert_eq!(
        fx.server.cmd_ctrl("reload config", "wrong").unwrap_err(),
        TabletStatus::IllegalAccess
    );
}

#[test]
fn load_then_unload_roundtrip() {
    let fx = ServerFixture::new();
    fx.server
        .load_tablet(fx.load_request("users", b"", b"", "users/t1"))
        .unwrap();

    // Loading the same range again is idempotent.
    fx.server
        .load_tablet(fx.load_request("users", b"", b"", "users/t1"))
        .unwrap();

    let statuses = fx
        .server
        .write_tablet("users", &[put_row(b"alice", b"q", b"v")], false);
    assert_eq!(statuses, vec![TabletStatus::Ok]);

    fx.server
        .unload_tablet("users", b"", &fx.session())
        .unwrap();

    // Gone: data ops route nowhere.
    let statuses = fx
        .server
        .write_tablet("users", &[put_row(b"alice", b"q", b"v")], false);
    assert_eq!(statuses, vec![TabletStatus::KeyNotInRange]);
}

#[test]
fn load_rejects_schema_without_groups() {
    let fx = ServerFixture::new();
    let mut request = fx.load_request("users", b"", b"", "users/t1");
    request.schema = Schema::default();
    assert_eq!(
        fx.server.load_tablet(request).unwrap_err(),
        TabletStatus::IllegalAccess
    );
}

#[test]
fn query_reports_tablets_and_metrics() {
    let fx = ServerFixture::new();
    fx.server
        .load_tablet(fx.load_request("users", b"", b"m", "users/t1"))
        .unwrap();
    fx.server
        .load_tablet(fx.load_request("users", b"m", b"", "users/t2"))
        .unwrap();

    // The maintenance timer refreshes infos periodically.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(3);
    loop {
        let response = fx.server.query();
        if response.tablets.len() == 2 {
            assert_eq!(response.session_id, fx.session());
            assert!(response.tablets.iter().all(|t| t.state == "Ready"));
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "query never saw the loaded tablets"
        );
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
}

#[test]
fn update_schema_applies_in_place() {
    let fx = ServerFixture::new();
    fx.server
        .load_tablet(fx.load_request("users", b"", b"", "users/t1"))
        .unwrap();

    let mut new_schema = users_schema();
    new_schema.groups[0].families[0].max_versions = 2;
    fx.server
        .update_schema(new_schema, &fx.session())
        .unwrap();

    // Invalid schema is rejected as a bad argument.
    assert_eq!(
        fx.server
            .update_schema(Schema::default(), &fx.session())
            .unwrap_err(),
        TabletStatus::InvalidArgument
    );
}

#[test]
fn cmd_ctrl_reload_and_unknown_command() {
    let fx = ServerFixture::new();
    // Default config has no flag file: reload is a no-op success.
    fx.server.cmd_ctrl("reload config", &fx.session()).unwrap();
    assert_eq!(
        fx.server.cmd_ctrl("do something", &fx.session()).unwrap_err(),
        TabletStatus::InvalidArgument
    );
}

#[test]
fn compact_tablet_reports_post_size() {
    let fx = ServerFixture::new();
    fx.server
        .load_tablet(fx.load_request("users", b"", b"", "users/t1"))
        .unwrap();
    for i in 0..50 {
        let row = format!("row{i:03}").into_bytes();
        fx.server
            .write_tablet("users", &[put_row(&row, b"q", &vec![b'x'; 100])], false);
    }

    let size = fx.server.compact_tablet("users", b"", None).unwrap();
    // Everything still readable after the compaction pass.
    let (results, success) = fx
        .server
        .read_tablet("users", &[crate::server::RowRead {
            row: b"row001".to_vec(),
            families: vec![],
            max_versions: 0,
        }], 5_000, None);
    assert_eq!(success, 1);
    assert_eq!(results[0].status, TabletStatus::Ok);
    let _ = size;
}
