//! Fixed-worker thread pools with priorities and delays.
//!
//! Each workload class on the server (control, read, write, scan,
//! compaction) gets its own pool with a fixed worker count. Tasks carry an
//! optional priority (higher runs first among ready tasks) and an optional
//! delay; a delayed task becomes eligible when its deadline passes, which
//! is all re-scheduling needs — submit again with a new delay.
//!
//! ## Shutdown
//!
//! [`ThreadPool::shutdown`] stops dispatch, wakes every worker, and joins
//! them. Tasks still queued are dropped; tasks already running finish.

#[cfg(test)]
mod tests;

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct ReadyTask {
    /// Higher runs first.
    priority: i32,

    /// Submission order; ties run FIFO.
    sequence: u64,

    task: Task,
}

impl PartialEq for ReadyTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for ReadyTask {}

impl PartialOrd for ReadyTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then FIFO.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct DelayedTask {
    ready_at: Instant,
    priority: i32,
    sequence: u64,
    task: Task,
}

struct Queues {
    ready: BinaryHeap<ReadyTask>,
    /// Min-heap on the deadline.
    delayed: BinaryHeap<Reverse<(Instant, u64)>>,
    /// Payloads of `delayed`, keyed by sequence.
    delayed_tasks: std::collections::HashMap<u64, DelayedTask>,
}

struct PoolShared {
    name: String,
    queues: Mutex<Queues>,
    cv: Condvar,
    shutdown: AtomicBool,
    next_sequence: AtomicU64,
}

/// A fixed-size worker pool.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Spawn `workers` named worker threads.
    pub fn new(name: impl Into<String>, workers: usize) -> Self {
        let shared = Arc::new(PoolShared {
            name: name.into(),
            queues: Mutex::new(Queues {
                ready: BinaryHeap::new(),
                delayed: BinaryHeap::new(),
                delayed_tasks: std::collections::HashMap::new(),
            }),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            next_sequence: AtomicU64::new(0),
        });

        let mut handles = Vec::with_capacity(workers.max(1));
        for worker_idx in 0..workers.max(1) {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("{}-{worker_idx}", shared.name))
                .spawn(move || worker_loop(&shared))
                .expect("spawning pool worker");
            handles.push(handle);
        }
        debug!(pool = %shared.name, workers = handles.len(), "thread pool started");
        Self {
            shared,
            workers: Mutex::new(handles),
        }
    }

    /// Submit a task at default priority.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        self.submit(0, Duration::ZERO, Box::new(task));
    }

    /// Submit a task that becomes eligible after `delay`.
    pub fn execute_after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        self.submit(0, delay, Box::new(task));
    }

    /// Submit with explicit priority (higher runs first) and delay.
    pub fn execute_with_priority(
        &self,
        priority: i32,
        delay: Duration,
        task: impl FnOnce() + Send + 'static,
    ) {
        self.submit(priority, delay, Box::new(task));
    }

    fn submit(&self, priority: i32, delay: Duration, task: Task) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        let sequence = self.shared.next_sequence.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut queues) = self.shared.queues.lock() {
            if delay.is_zero() {
                queues.ready.push(ReadyTask {
                    priority,
                    sequence,
                    task,
                });
            } else {
                let ready_at = Instant::now() + delay;
                queues.delayed.push(Reverse((ready_at, sequence)));
                queues.delayed_tasks.insert(
                    sequence,
                    DelayedTask {
                        ready_at,
                        priority,
                        sequence,
                        task,
                    },
                );
            }
        }
        self.shared.cv.notify_one();
    }

    /// Tasks waiting (ready or delayed).
    pub fn queued_len(&self) -> usize {
        self.shared
            .queues
            .lock()
            .map(|q| q.ready.len() + q.delayed_tasks.len())
            .unwrap_or(0)
    }

    /// Stop dispatch and join the workers. Queued tasks are dropped.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.cv.notify_all();
        if let Ok(mut workers) = self.workers.lock() {
            for handle in workers.drain(..) {
                let _ = handle.join();
            }
        }
        debug!(pool = %self.shared.name, "thread pool stopped");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Move due delayed tasks into the ready heap; returns the next pending
/// deadline, if any.
fn promote_due(queues: &mut Queues, now: Instant) -> Option<Instant> {
    while let Some(Reverse((ready_at, sequence))) = queues.delayed.peek().copied() {
        if ready_at > now {
            return Some(ready_at);
        }
        queues.delayed.pop();
        if let Some(delayed) = queues.delayed_tasks.remove(&sequence) {
            queues.ready.push(ReadyTask {
                priority: delayed.priority,
                sequence: delayed.sequence,
                task: delayed.task,
            });
        }
    }
    None
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let task = {
            let mut queues = match shared.queues.lock() {
                Ok(queues) => queues,
                Err(_) => return,
            };
            loop {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                let next_deadline = promote_due(&mut queues, Instant::now());
                if let Some(ready) = queues.ready.pop() {
                    break ready.task;
                }
                queues = match next_deadline {
                    Some(deadline) => {
                        let wait = deadline.saturating_duration_since(Instant::now());
                        match shared.cv.wait_timeout(queues, wait) {
                            Ok((guard, _)) => guard,
                            Err(_) => return,
                        }
                    }
                    None => match shared.cv.wait(queues) {
                        Ok(guard) => guard,
                        Err(_) => return,
                    },
                };
            }
        };

        trace!(pool = %shared.name, "task dispatched");
        task();
    }
}
