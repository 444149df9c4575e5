//! Remote-read limiting: permit accounting and transparent delegation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use crate::dfs::{Dfs, LocalDfs, ReadLimiter, ThrottledDfs};

#[test]
fn permits_are_counted_and_returned() {
    let limiter = ReadLimiter::new(2);
    assert_eq!(limiter.available(), 2);

    let first = limiter.acquire();
    let second = limiter.acquire();
    assert_eq!(limiter.available(), 0);

    drop(first);
    assert_eq!(limiter.available(), 1);
    drop(second);
    assert_eq!(limiter.available(), 2);
}

#[test]
fn exhausted_limiter_blocks_until_a_permit_returns() {
    let limiter = Arc::new(ReadLimiter::new(1));
    let held = limiter.acquire();

    let acquired = Arc::new(AtomicBool::new(false));
    let waiter = {
        let limiter = Arc::clone(&limiter);
        let acquired = Arc::clone(&acquired);
        std::thread::spawn(move || {
            let _permit = limiter.acquire();
            acquired.store(true, Ordering::SeqCst);
        })
    };

    // The waiter cannot proceed while the permit is held.
    std::thread::sleep(Duration::from_millis(50));
    assert!(!acquired.load(Ordering::SeqCst));

    drop(held);
    let deadline = Instant::now() + Duration::from_secs(5);
    while !acquired.load(Ordering::SeqCst) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(acquired.load(Ordering::SeqCst));
    waiter.join().unwrap();
}

#[test]
fn zero_permits_clamps_to_one() {
    let limiter = ReadLimiter::new(0);
    // One permit exists, so a single reader always proceeds.
    drop(limiter.acquire());
}

#[test]
fn throttled_reads_return_the_same_bytes() {
    let tmp = TempDir::new().unwrap();
    let inner: Arc<dyn Dfs> = Arc::new(LocalDfs::new(tmp.path()).unwrap());
    let data: Vec<u8> = (0..5_000).map(|i| (i % 251) as u8).collect();
    let mut file = inner.create("remote.sst").unwrap();
    file.append(&data).unwrap();
    file.sync().unwrap();
    drop(file);

    let throttled = ThrottledDfs::new(Arc::clone(&inner), 2);
    let file = throttled.open_random("remote.sst", Some(5_000)).unwrap();

    let mut buf = vec![0u8; 1_000];
    let n = file.read_at(1_234, &mut buf).unwrap();
    assert_eq!(n, 1_000);
    assert_eq!(&buf[..], &data[1_234..2_234]);

    // Permits are released after every read.
    assert_eq!(throttled.limiter().available(), 2);

    // Non-read operations delegate untouched.
    assert!(throttled.exists("remote.sst"));
    assert_eq!(throttled.file_size("remote.sst").unwrap(), 5_000);
}
