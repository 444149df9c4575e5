//! Concurrent writers and readers against one engine.

use std::sync::Arc;
use std::thread;

use crate::engine::tests::helpers::*;
use crate::engine::{ScanOptions, WriteOptions, WriteRecord};

#[test]
fn concurrent_writers_serialize_through_the_queue() {
    let fx = EngineFixture::new();
    let engine = Arc::new(fx.open("t/tablet1/lg0", memtable_only_options()));

    let mut handles = Vec::new();
    for writer in 0u64..4 {
        let engine = Arc::clone(&engine);
        handles.push(thread::spawn(move || {
            let mut sequences = Vec::new();
            for i in 0..100 {
                let record =
                    WriteRecord::put(format!("w{writer}_k{i:04}").into_bytes(), b"v".to_vec());
                sequences.push(engine.write(&[record], &WriteOptions::default()).unwrap());
            }
            sequences
        }));
    }

    let mut all_sequences = Vec::new();
    for handle in handles {
        let sequences = handle.join().unwrap();
        // Each writer's own acknowledgements are strictly increasing.
        for pair in sequences.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        all_sequences.extend(sequences);
    }

    // Sequences are globally unique: the queue admits one head at a time.
    all_sequences.sort_unstable();
    all_sequences.dedup();
    assert_eq!(all_sequences.len(), 400);
    assert_eq!(engine.last_sequence(), *all_sequences.last().unwrap());

    let page = engine.scan(&ScanOptions::default()).unwrap();
    assert_eq!(page.cells.len(), 400);
}

#[test]
fn readers_run_against_concurrent_writes() {
    let fx = EngineFixture::new();
    let engine = Arc::new(fx.open("t/tablet1/lg0", small_buffer_options()));

    put(&engine, b"stable", b"anchor");

    let writer = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            for i in 0..500 {
                put(&engine, format!("churn_{i:05}").as_bytes(), &vec![b'x'; 100]);
            }
        })
    };

    // The anchor stays readable through flushes the churn causes.
    for _ in 0..200 {
        assert_eq!(
            engine.get(b"stable", None).unwrap(),
            Some(b"anchor".to_vec())
        );
    }
    writer.join().unwrap();

    assert_eq!(
        engine.get(b"churn_00499", None).unwrap(),
        Some(vec![b'x'; 100])
    );
}

#[test]
fn snapshot_isolation_under_concurrent_writes() {
    let fx = EngineFixture::new();
    let engine = Arc::new(fx.open("t/tablet1/lg0", memtable_only_options()));

    fill_keys(&engine, 20, "base");
    let snapshot = engine.get_snapshot().unwrap();

    let writer = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            for i in 0..20 {
                put(&engine, format!("base_{i:05}").as_bytes(), b"overwritten");
            }
        })
    };

    for _ in 0..50 {
        let page = engine
            .scan(&ScanOptions {
                snapshot: Some(snapshot),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.cells.len(), 20);
        for (_, value) in &page.cells {
            assert_ne!(value, b"overwritten", "snapshot read leaked a newer write");
        }
    }
    writer.join().unwrap();
    engine.release_snapshot(snapshot).unwrap();
}
