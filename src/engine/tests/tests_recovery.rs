//! Crash recovery: WAL replay, manifest reconstruction, corruption modes.

use crate::engine::tests::helpers::*;
use crate::engine::{EngineOptions, ScanOptions, WriteOptions, WriteRecord};

#[test]
fn reopen_recovers_memtable_writes_from_wal() {
    let fx = EngineFixture::new();
    {
        let engine = fx.open("t/tablet1/lg0", memtable_only_options());
        fill_keys(&engine, 100, "key");
        // Dropped without close(): everything lives only in the WAL.
    }

    let engine = fx.open("t/tablet1/lg0", memtable_only_options());
    for i in 0..100 {
        let key = format!("key_{i:05}").into_bytes();
        assert!(
            engine.get(&key, None).unwrap().is_some(),
            "key {i} lost in recovery"
        );
    }
}

#[test]
fn last_sequence_covers_every_acknowledged_write() {
    let fx = EngineFixture::new();
    let acknowledged;
    {
        let engine = fx.open("t/tablet1/lg0", memtable_only_options());
        // Sync each write so the WAL provably holds it, as in a crash
        // right after the last acknowledgement.
        let mut last = 0;
        for i in 0..700 {
            let record = WriteRecord::put(
                format!("key_{i:05}").into_bytes(),
                format!("v{i}").into_bytes(),
            );
            last = engine.write(&[record], &WriteOptions { sync: true }).unwrap();
        }
        acknowledged = last;
    }

    let engine = fx.open("t/tablet1/lg0", memtable_only_options());
    assert!(
        engine.last_sequence() >= acknowledged,
        "recovered sequence {} below acknowledged {acknowledged}",
        engine.last_sequence()
    );
    for i in 0..700 {
        let key = format!("key_{i:05}").into_bytes();
        assert_eq!(
            engine.get(&key, None).unwrap(),
            Some(format!("v{i}").into_bytes())
        );
    }
}

#[test]
fn recovery_spans_wal_and_tables() {
    let fx = EngineFixture::new();
    {
        let engine = fx.open("t/tablet1/lg0", small_buffer_options());
        fill_keys(&engine, 60, "flushed");
        engine.flush().unwrap();
        fill_keys(&engine, 20, "walonly");
    }

    let engine = fx.open("t/tablet1/lg0", small_buffer_options());
    let page = engine.scan(&ScanOptions::default()).unwrap();
    assert_eq!(page.cells.len(), 80);
}

#[test]
fn sequences_continue_after_recovery() {
    let fx = EngineFixture::new();
    let before;
    {
        let engine = fx.open("t/tablet1/lg0", memtable_only_options());
        fill_keys(&engine, 10, "key");
        before = engine.last_sequence();
    }

    let engine = fx.open("t/tablet1/lg0", memtable_only_options());
    let after = engine
        .write(&[WriteRecord::put(b"new", b"v")], &WriteOptions::default())
        .unwrap();
    assert!(after > before, "sequence went backwards: {after} <= {before}");
}

#[test]
fn repeated_crash_reopen_cycles_lose_nothing() {
    let fx = EngineFixture::new();
    for round in 0..4 {
        let engine = fx.open("t/tablet1/lg0", small_buffer_options());
        fill_keys(&engine, 25, &format!("r{round}"));
        // No close: each cycle recovers the previous ones from disk.
    }

    let engine = fx.open("t/tablet1/lg0", small_buffer_options());
    let page = engine.scan(&ScanOptions::default()).unwrap();
    assert_eq!(page.cells.len(), 100);
}

#[test]
fn missing_current_without_create_fails() {
    let fx = EngineFixture::new();
    let result = crate::engine::LsmEngine::open(
        std::sync::Arc::clone(&fx.dfs),
        "t/absent/lg0",
        EngineOptions {
            create_if_missing: false,
            ..Default::default()
        },
        std::sync::Arc::clone(&fx.table_cache),
        None,
        &[],
        &[],
        crate::engine::key::Rollbacks::new(),
    );
    assert!(result.is_err());
}

#[test]
fn missing_table_file_is_fatal_unless_tolerated() {
    use crate::dfs::Dfs;
    use crate::engine::version::{EngineFile, parse_engine_file};

    let fx = EngineFixture::new();
    {
        let engine = fx.open("t/tablet1/lg0", small_buffer_options());
        fill_keys(&engine, 60, "key");
        engine.flush().unwrap();
        engine.close().unwrap();
    }

    // Remove one referenced table file behind the engine's back.
    let victim = fx
        .dfs
        .list("t/tablet1/lg0")
        .unwrap()
        .into_iter()
        .find(|name| matches!(parse_engine_file(name), EngineFile::Table(_)))
        .expect("a table file must exist");
    fx.dfs.delete(&format!("t/tablet1/lg0/{victim}")).unwrap();

    let strict = crate::engine::LsmEngine::open(
        std::sync::Arc::clone(&fx.dfs),
        "t/tablet1/lg0",
        small_buffer_options(),
        std::sync::Arc::clone(&fx.table_cache),
        None,
        &[],
        &[],
        crate::engine::key::Rollbacks::new(),
    );
    assert!(strict.is_err(), "missing file must fail a strict open");

    let tolerant = crate::engine::LsmEngine::open(
        std::sync::Arc::clone(&fx.dfs),
        "t/tablet1/lg0",
        EngineOptions {
            ignore_corruption_in_open: true,
            ..small_buffer_options()
        },
        std::sync::Arc::clone(&fx.table_cache),
        None,
        &[],
        &[],
        crate::engine::key::Rollbacks::new(),
    )
    .expect("tolerant open edits the missing file out");
    // The engine serves what survived.
    let _ = tolerant.scan(&ScanOptions::default()).unwrap();
}
