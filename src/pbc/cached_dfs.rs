//! [`Dfs`] layering for the persistent block cache.
//!
//! `CachedDfs` wraps any inner [`Dfs`] implementation:
//!
//! - random-access reads of `.sst` files route through the cache,
//! - newly written `.sst` files are cached **through**: the writer appends
//!   to the inner DFS synchronously while full blocks are queued to a fill
//!   worker that writes them into SSD slots asynchronously,
//! - deletes force-evict the file's cached blocks (subject to the
//!   delayed-GC grace) before reaching the inner DFS.
//!
//! Everything else passes straight through, so engine directories on a
//! cached mount behave exactly as on a bare one.

use std::sync::Arc;

use crossbeam::channel::{Sender, unbounded};
use tracing::{debug, warn};

use crate::dfs::{Dfs, DfsError, RandomAccessFile, SequentialFile, WritableFile};

use super::PersistentBlockCache;

enum FillTask {
    Block {
        path: String,
        block_idx: u64,
        data: Vec<u8>,
    },
    /// Barrier: acknowledge once every earlier task is done.
    Flush(Sender<()>),
    Stop,
}

/// A [`Dfs`] that serves `.sst` random reads from the persistent cache.
pub struct CachedDfs {
    inner: Arc<dyn Dfs>,
    cache: Arc<PersistentBlockCache>,
    fill_tx: Sender<FillTask>,
    fill_worker: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl CachedDfs {
    /// Stack the cache over `inner`.
    pub fn new(inner: Arc<dyn Dfs>, cache: Arc<PersistentBlockCache>) -> Arc<Self> {
        let (fill_tx, fill_rx) = unbounded::<FillTask>();
        let worker_cache = Arc::clone(&cache);
        let fill_worker = std::thread::Builder::new()
            .name("pbc-fill".into())
            .spawn(move || {
                while let Ok(task) = fill_rx.recv() {
                    match task {
                        FillTask::Stop => break,
                        FillTask::Flush(ack) => {
                            let _ = ack.send(());
                        }
                        FillTask::Block {
                            path,
                            block_idx,
                            data,
                        } => worker_cache.fill_from_write(&path, block_idx, &data),
                    }
                }
            })
            .ok();

        Arc::new(Self {
            inner,
            cache,
            fill_tx,
            fill_worker: std::sync::Mutex::new(fill_worker),
        })
    }

    /// The cache behind this mount.
    pub fn cache(&self) -> &Arc<PersistentBlockCache> {
        &self.cache
    }

    /// Block until every queued write-through fill has landed.
    pub fn flush_fills(&self) {
        let (ack_tx, ack_rx) = unbounded();
        if self.fill_tx.send(FillTask::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    fn is_cacheable(path: &str) -> bool {
        path.ends_with(".sst")
    }
}

impl Drop for CachedDfs {
    fn drop(&mut self) {
        let _ = self.fill_tx.send(FillTask::Stop);
        if let Ok(mut worker) = self.fill_worker.lock() {
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Dfs for CachedDfs {
    fn open_sequential(&self, path: &str) -> Result<Box<dyn SequentialFile>, DfsError> {
        self.inner.open_sequential(path)
    }

    fn open_random(
        &self,
        path: &str,
        size: Option<u64>,
    ) -> Result<Arc<dyn RandomAccessFile>, DfsError> {
        if !Self::is_cacheable(path) {
            return self.inner.open_random(path, size);
        }
        let file_size = match size {
            Some(size) => size,
            None => self.inner.file_size(path)?,
        };
        Ok(Arc::new(CachedRandomFile {
            cache: Arc::clone(&self.cache),
            path: path.to_string(),
            size: file_size,
        }))
    }

    fn create(&self, path: &str) -> Result<Box<dyn WritableFile>, DfsError> {
        let inner = self.inner.create(path)?;
        if !Self::is_cacheable(path) {
            return Ok(inner);
        }
        Ok(Box::new(CachedWritableFile {
            inner,
            path: path.to_string(),
            fill_tx: self.fill_tx.clone(),
            block_size: self.cache.block_size(),
            buffered: Vec::new(),
            next_block: 0,
        }))
    }

    fn open_append(&self, path: &str) -> Result<Box<dyn WritableFile>, DfsError> {
        // Appending to an existing cached file would desynchronise block
        // indexes; only fresh writes cache through.
        self.inner.open_append(path)
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), DfsError> {
        if Self::is_cacheable(from) {
            if let Err(e) = self.cache.evict_file(from) {
                warn!(from, error = %e, "cache evict on rename failed");
            }
        }
        self.inner.rename(from, to)
    }

    fn delete(&self, path: &str) -> Result<(), DfsError> {
        if Self::is_cacheable(path) {
            if let Err(e) = self.cache.evict_file(path) {
                warn!(path, error = %e, "cache evict on delete failed");
            } else {
                debug!(path, "cache entries evicted with file");
            }
        }
        self.inner.delete(path)
    }

    fn exists(&self, path: &str) -> bool {
        self.inner.exists(path)
    }

    fn list(&self, dir: &str) -> Result<Vec<String>, DfsError> {
        self.inner.list(dir)
    }

    fn file_size(&self, path: &str) -> Result<u64, DfsError> {
        self.inner.file_size(path)
    }

    fn create_dir_all(&self, dir: &str) -> Result<(), DfsError> {
        self.inner.create_dir_all(dir)
    }

    fn delete_dir(&self, dir: &str) -> Result<(), DfsError> {
        self.inner.delete_dir(dir)
    }

    fn sync_dir(&self, dir: &str) -> Result<(), DfsError> {
        self.inner.sync_dir(dir)
    }
}

// ------------------------------------------------------------------------------------------------
// Cached file handles
// ------------------------------------------------------------------------------------------------

struct CachedRandomFile {
    cache: Arc<PersistentBlockCache>,
    path: String,
    size: u64,
}

impl RandomAccessFile for CachedRandomFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, DfsError> {
        self.cache
            .read(&self.path, self.size, offset, buf)
            .map_err(|e| DfsError::Io {
                path: self.path.clone(),
                source: std::io::Error::other(e.to_string()),
            })
    }

    fn len(&self) -> u64 {
        self.size
    }
}

/// Write-through writer: inner appends are synchronous, SSD fills are
/// queued block by block as they complete.
struct CachedWritableFile {
    inner: Box<dyn WritableFile>,
    path: String,
    fill_tx: Sender<FillTask>,
    block_size: usize,
    buffered: Vec<u8>,
    next_block: u64,
}

impl CachedWritableFile {
    fn queue_full_blocks(&mut self, finish: bool) {
        while self.buffered.len() >= self.block_size {
            let rest = self.buffered.split_off(self.block_size);
            let block = std::mem::replace(&mut self.buffered, rest);
            let _ = self.fill_tx.send(FillTask::Block {
                path: self.path.clone(),
                block_idx: self.next_block,
                data: block,
            });
            self.next_block += 1;
        }
        if finish && !self.buffered.is_empty() {
            let block = std::mem::take(&mut self.buffered);
            let _ = self.fill_tx.send(FillTask::Block {
                path: self.path.clone(),
                block_idx: self.next_block,
                data: block,
            });
            self.next_block += 1;
        }
    }
}

impl WritableFile for CachedWritableFile {
    fn append(&mut self, data: &[u8]) -> Result<(), DfsError> {
        self.inner.append(data)?;
        self.buffered.extend_from_slice(data);
        self.queue_full_blocks(false);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DfsError> {
        self.inner.flush()
    }

    fn sync(&mut self) -> Result<(), DfsError> {
        self.inner.sync()?;
        // The tail block is final once the file is synced.
        self.queue_full_blocks(true);
        Ok(())
    }
}
