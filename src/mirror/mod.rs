//! Flash Mirror Cache (FMC)
//!
//! The simple alternative to the persistent block cache: mirror whole
//! SSTable files onto local SSD. On table open a background copy of the
//! remote file is scheduled; reads serve from the mirror **only when its
//! size matches the remote exactly**, otherwise they fall through to the
//! DFS while the copy (re)runs. Failed copies are rescheduled with
//! exponentially decaying priority; deleting the source file deletes the
//! mirror.
//!
//! ## Copy protocol
//!
//! A copy writes to `<path>.cp`, fsyncs, then renames to the final mirror
//! path. [`FlashMirrorCache::recover_interrupted_copies`] runs at startup:
//! a leftover `.cp` whose size already matches the remote is renamed into
//! place (the rename was the only thing interrupted), any other leftover
//! is removed.


use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dfs::{Dfs, DfsError, LocalDfs, RandomAccessFile, SequentialFile, WritableFile};
use crate::threadpool::ThreadPool;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors from mirror maintenance.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// Local or remote I/O failure.
    #[error("dfs error: {0}")]
    Dfs(#[from] DfsError),
}

// ------------------------------------------------------------------------------------------------
// The cache
// ------------------------------------------------------------------------------------------------

/// Copy attempts after which a file is left uncached.
const MAX_COPY_ATTEMPTS: u32 = 6;

/// Whole-file mirror of remote tables on local SSD.
pub struct FlashMirrorCache {
    remote: Arc<dyn Dfs>,

    /// Local mirror tree, same relative paths as the remote.
    local: Arc<LocalDfs>,

    /// Copy workers.
    pool: Arc<ThreadPool>,

    /// Copy attempts per path, for priority decay.
    attempts: Mutex<HashMap<String, u32>>,

    /// Reads served from the mirror.
    pub mirror_hits: AtomicU64,

    /// Reads that fell through to the remote.
    pub remote_reads: AtomicU64,

    /// Completed copies.
    pub copies_done: AtomicU64,
}

impl FlashMirrorCache {
    /// Open a mirror rooted at `mirror_root`, copying with `workers`
    /// background threads.
    pub fn open(
        mirror_root: impl AsRef<std::path::Path>,
        remote: Arc<dyn Dfs>,
        workers: usize,
    ) -> Result<Arc<Self>, MirrorError> {
        let local = Arc::new(LocalDfs::new(mirror_root)?);
        let cache = Arc::new(Self {
            remote,
            local,
            pool: Arc::new(ThreadPool::new("mirror-copy", workers.max(1))),
            attempts: Mutex::new(HashMap::new()),
            mirror_hits: AtomicU64::new(0),
            remote_reads: AtomicU64::new(0),
            copies_done: AtomicU64::new(0),
        });
        cache.recover_interrupted_copies("")?;
        info!("flash mirror cache opened");
        Ok(cache)
    }

    /// Finish or discard copies a crash interrupted, recursively under
    /// `dir` of the mirror tree.
    pub fn recover_interrupted_copies(&self, dir: &str) -> Result<(), MirrorError> {
        let names = match self.local.list(dir) {
            Ok(names) => names,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for name in names {
            let path = if dir.is_empty() {
                name.clone()
            } else {
                format!("{dir}/{name}")
            };
            if self.local.list(&path).is_ok() {
                self.recover_interrupted_copies(&path)?;
                continue;
            }
            let Some(final_path) = path.strip_suffix(".cp").map(str::to_string) else {
                continue;
            };

            let local_size = self.local.file_size(&path).unwrap_or(0);
            let remote_size = self.remote.file_size(&final_path).unwrap_or(u64::MAX);
            if local_size == remote_size {
                // Only the rename was lost; complete it.
                self.local.rename(&path, &final_path)?;
                info!(path = %final_path, "interrupted mirror rename completed");
            } else {
                self.local.delete(&path)?;
                debug!(path, "stale partial mirror removed");
            }
        }
        Ok(())
    }

    /// True when the mirror holds an exact-size copy of `path`.
    fn mirror_ready(&self, path: &str, remote_size: u64) -> bool {
        self.local
            .file_size(path)
            .map(|size| size == remote_size)
            .unwrap_or(false)
    }

    /// Schedule a background copy of `path` unless one already succeeded
    /// or the attempt budget ran out.
    pub fn schedule_copy(self: &Arc<Self>, path: &str, remote_size: u64) {
        if self.mirror_ready(path, remote_size) {
            return;
        }
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
            let attempt = attempts.entry(path.to_string()).or_insert(0);
            if *attempt >= MAX_COPY_ATTEMPTS {
                return;
            }
            *attempt += 1;
            *attempt
        };

        // Retries decay in priority and back off in time.
        let priority = -(attempt as i32);
        let delay = if attempt == 1 {
            Duration::ZERO
        } else {
            Duration::from_millis(100) * (1u32 << attempt.min(6))
        };

        let cache = Arc::clone(self);
        let path = path.to_string();
        self.pool.execute_with_priority(priority, delay, move || {
            match cache.copy_once(&path, remote_size) {
                Ok(()) => {
                    cache.copies_done.fetch_add(1, Ordering::Relaxed);
                    cache
                        .attempts
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&path);
                    debug!(path, "mirror copy finished");
                }
                Err(e) => {
                    warn!(path, attempt, error = %e, "mirror copy failed");
                    cache.schedule_copy(&path, remote_size);
                }
            }
        });
    }

    fn copy_once(&self, path: &str, remote_size: u64) -> Result<(), MirrorError> {
        if self.mirror_ready(path, remote_size) {
            return Ok(());
        }
        let tmp_path = format!("{path}.cp");
        let mut reader = self.remote.open_sequential(path)?;
        let mut writer = self.local.create(&tmp_path)?;

        let mut buf = vec![0u8; 256 * 1024];
        loop {
            let n = reader.read(&mut buf).map_err(|e| DfsError::from_io(path, e))?;
            if n == 0 {
                break;
            }
            writer.append(&buf[..n])?;
        }
        writer.sync()?;
        drop(writer);

        // A remote file that changed size mid-copy is not a valid mirror.
        if self.local.file_size(&tmp_path)? != remote_size {
            self.local.delete(&tmp_path)?;
            return Err(MirrorError::Dfs(DfsError::Io {
                path: path.to_string(),
                source: std::io::Error::other("remote size changed during mirror copy"),
            }));
        }
        self.local.rename(&tmp_path, path)?;
        Ok(())
    }

    /// Drop the mirror of a deleted source file.
    pub fn delete_mirror(&self, path: &str) {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
        if self.local.exists(path) {
            if let Err(e) = self.local.delete(path) {
                warn!(path, error = %e, "mirror delete failed");
            }
        }
        let tmp_path = format!("{path}.cp");
        if self.local.exists(&tmp_path) {
            let _ = self.local.delete(&tmp_path);
        }
    }
}

// ------------------------------------------------------------------------------------------------
// MirrorDfs
// ------------------------------------------------------------------------------------------------

/// A [`Dfs`] serving `.sst` random reads from the mirror when ready.
pub struct MirrorDfs {
    remote: Arc<dyn Dfs>,
    cache: Arc<FlashMirrorCache>,
}

impl MirrorDfs {
    /// Stack the mirror over `remote`.
    pub fn new(remote: Arc<dyn Dfs>, cache: Arc<FlashMirrorCache>) -> Arc<Self> {
        Arc::new(Self { remote, cache })
    }

    fn is_mirrored(path: &str) -> bool {
        path.ends_with(".sst")
    }
}

impl Dfs for MirrorDfs {
    fn open_sequential(&self, path: &str) -> Result<Box<dyn SequentialFile>, DfsError> {
        self.remote.open_sequential(path)
    }

    fn open_random(
        &self,
        path: &str,
        size: Option<u64>,
    ) -> Result<Arc<dyn RandomAccessFile>, DfsError> {
        if !Self::is_mirrored(path) {
            return self.remote.open_random(path, size);
        }
        let remote_size = match size {
            Some(size) => size,
            None => self.remote.file_size(path)?,
        };

        if self.cache.mirror_ready(path, remote_size) {
            self.cache.mirror_hits.fetch_add(1, Ordering::Relaxed);
            return self.cache.local.open_random(path, Some(remote_size));
        }

        // Not mirrored yet: kick the copy and serve remote.
        self.cache.schedule_copy(path, remote_size);
        self.cache.remote_reads.fetch_add(1, Ordering::Relaxed);
        self.remote.open_random(path, Some(remote_size))
    }

    fn create(&self, path: &str) -> Result<Box<dyn WritableFile>, DfsError> {
        self.remote.create(path)
    }

    fn open_append(&self, path: &str) -> Result<Box<dyn WritableFile>, DfsError> {
        self.remote.open_append(path)
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), DfsError> {
        if Self::is_mirrored(from) {
            self.cache.delete_mirror(from);
        }
        self.remote.rename(from, to)
    }

    fn delete(&self, path: &str) -> Result<(), DfsError> {
        if Self::is_mirrored(path) {
            self.cache.delete_mirror(path);
        }
        self.remote.delete(path)
    }

    fn exists(&self, path: &str) -> bool {
        self.remote.exists(path)
    }

    fn list(&self, dir: &str) -> Result<Vec<String>, DfsError> {
        self.remote.list(dir)
    }

    fn file_size(&self, path: &str) -> Result<u64, DfsError> {
        self.remote.file_size(path)
    }

    fn create_dir_all(&self, dir: &str) -> Result<(), DfsError> {
        self.remote.create_dir_all(dir)
    }

    fn delete_dir(&self, dir: &str) -> Result<(), DfsError> {
        self.remote.delete_dir(dir)
    }

    fn sync_dir(&self, dir: &str) -> Result<(), DfsError> {
        self.remote.sync_dir(dir)
    }
}
