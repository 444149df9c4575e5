//! Dispatch, delays, priorities, and shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::threadpool::ThreadPool;

#[test]
fn executes_submitted_tasks() {
    let pool = ThreadPool::new("test", 2);
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..50 {
        let counter = Arc::clone(&counter);
        pool.execute(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while counter.load(Ordering::SeqCst) < 50 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(counter.load(Ordering::SeqCst), 50);
}

#[test]
fn delayed_task_waits_for_deadline() {
    let pool = ThreadPool::new("test", 1);
    let fired = Arc::new(Mutex::new(None::<Instant>));

    let start = Instant::now();
    let fired_clone = Arc::clone(&fired);
    pool.execute_after(Duration::from_millis(80), move || {
        *fired_clone.lock().unwrap() = Some(Instant::now());
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while fired.lock().unwrap().is_none() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    let fired_at = fired.lock().unwrap().expect("delayed task never ran");
    assert!(fired_at - start >= Duration::from_millis(80));
}

#[test]
fn priority_orders_ready_tasks() {
    let pool = ThreadPool::new("test", 1);
    let order = Arc::new(Mutex::new(Vec::new()));

    // Block the single worker so later submissions queue up.
    let gate = Arc::new(Mutex::new(()));
    let held = gate.lock().unwrap();
    {
        let gate = Arc::clone(&gate);
        pool.execute(move || {
            drop(gate.lock().unwrap());
        });
    }
    std::thread::sleep(Duration::from_millis(30));

    for (priority, label) in [(0, "low"), (10, "high"), (5, "mid")] {
        let order = Arc::clone(&order);
        pool.execute_with_priority(priority, Duration::ZERO, move || {
            order.lock().unwrap().push(label);
        });
    }
    drop(held);

    let deadline = Instant::now() + Duration::from_secs(5);
    while order.lock().unwrap().len() < 3 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);
}

#[test]
fn shutdown_drops_queued_tasks_and_joins() {
    let pool = ThreadPool::new("test", 1);
    let counter = Arc::new(AtomicUsize::new(0));

    // Far-future tasks never run once shutdown lands first.
    for _ in 0..10 {
        let counter = Arc::clone(&counter);
        pool.execute_after(Duration::from_secs(60), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert_eq!(pool.queued_len(), 10);
    pool.shutdown();
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    // Submissions after shutdown are ignored.
    pool.execute(|| {});
}
