//! Persistent Block Cache (PBC)
//!
//! A content-addressed SSD cache of fixed-size blocks from remote
//! SSTables. Unlike the in-memory block cache, this one **survives process
//! restart**: block placement is logged to a small embedded LSM engine and
//! rebuilt at startup.
//!
//! ## Architecture
//!
//! - **Data sets.** Disk space is split into `N` data sets, each one
//!   preallocated file of `dataset_size` bytes divided into
//!   `block_size` slots. A key's data set is chosen by hashing
//!   `(file_id, block_idx)`; each set has its own in-memory index and LRU.
//! - **Metadata store.** An embedded [`LsmEngine`] persists three key
//!   families, all little-endian fixed-width values:
//!   - `FID#` → the granted file-id ceiling (ids are granted in batches of
//!     [`FID_BATCH`], so a crash skips at most one batch),
//!   - `FNAME#<path>` → 64-bit file id,
//!   - `DS#<sid><slot>` → `(fid, block_idx, len)`, the slot's occupant.
//! - **Cache blocks.** Every tracked block is a [`CacheBlock`] with a
//!   state bitmask (`VALID`, `LOCKED`, `DFS_READ`, `CACHE_READ`,
//!   `CACHE_FILL`) guarded by the block's mutex + condvar; readers of an
//!   in-flight block wait on the condvar instead of issuing a second
//!   remote read.
//!
//! ## Read algorithm
//!
//! A range read is split into block-aligned pieces, each classified as
//! **valid** (serve from SSD), **miss** (fetch from DFS, then fill the
//! SSD slot), or **locked** (wait for the in-flight owner). With
//! [`CachePools`] configured, the valid list is dispatched to the read
//! pool and the miss list to the DFS pool; the caller joins both before
//! assembling the user buffer, so SSD reads overlap remote round trips.
//! Misses log the `DS#` record before the data write so a crash between
//! the two merely re-fetches. Any block-level failure degrades the whole
//! request to a direct DFS read.
//!
//! ## Eviction
//!
//! Per-data-set LRU; a `LOCKED` block is never evicted. Deleting a source
//! file erases every key under its file id — unless the path sits on the
//! delayed-GC list, in which case the erase is deferred one full GC cycle.

pub mod cached_dfs;

#[cfg(test)]
mod tests;

pub use cached_dfs::CachedDfs;

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dfs::{Dfs, DfsError};
use crate::engine::key::Rollbacks;
use crate::engine::{EngineError, EngineOptions, LsmEngine, ScanOptions, WriteOptions, WriteRecord};
use crate::sstable::{BlockCache, TableCache};
use crate::threadpool::ThreadPool;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// File ids are granted in batches this large; the `FID#` counter stores
/// the ceiling, so a crash wastes at most one batch.
pub const FID_BATCH: u64 = 1_000;

/// `CacheBlock` state bits.
pub mod state {
    /// The SSD slot holds the block's bytes.
    pub const VALID: u8 = 1;
    /// An owner is mutating the block; wait, never evict.
    pub const LOCKED: u8 = 1 << 1;
    /// The owner is fetching from the DFS.
    pub const DFS_READ: u8 = 1 << 2;
    /// The owner is reading the SSD slot.
    pub const CACHE_READ: u8 = 1 << 3;
    /// The owner is writing the SSD slot.
    pub const CACHE_FILL: u8 = 1 << 4;
}

const FID_KEY: &[u8] = b"FID#";
const FNAME_PREFIX: &[u8] = b"FNAME#";
const DS_PREFIX: &[u8] = b"DS#";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors from the persistent cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Local SSD I/O failure.
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Remote read failure while filling.
    #[error("dfs error: {0}")]
    Dfs(#[from] DfsError),

    /// Metadata engine failure.
    #[error("cache metadata error: {0}")]
    Meta(#[from] EngineError),

    /// Internal invariant violation.
    #[error("internal cache error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Options and metrics
// ------------------------------------------------------------------------------------------------

/// Persistent-cache sizing.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Total capacity in bytes, split evenly into data sets.
    pub capacity: u64,

    /// One data set's capacity in bytes.
    pub dataset_size: u64,

    /// Logical block size in bytes.
    pub block_size: usize,

    /// Wipe all cache state at startup.
    pub clean_on_start: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            capacity: 4 * 1024 * 1024 * 1024,
            dataset_size: 1024 * 1024 * 1024,
            block_size: 4 * 1024,
            clean_on_start: false,
        }
    }
}

/// Worker pools for the parallel read path.
///
/// The `valid` list of a range read is served on the read pool (SSD slot
/// reads) while the `miss` list runs on the DFS pool (remote fetches);
/// the caller joins both. The server sizes the DFS pool at its configured
/// DFS read limit — below the read pool — so remote fetches can never
/// occupy every worker SSD reads need.
pub struct CachePools {
    /// Serves SSD slot reads of the `valid` list.
    pub read_pool: Arc<ThreadPool>,

    /// Serves remote fetches of the `miss` list.
    pub dfs_pool: Arc<ThreadPool>,
}

/// Monotonic operation counters, for health reporting and tests.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Block reads served from the SSD.
    pub ssd_reads: AtomicU64,

    /// Block fetches that went to the DFS.
    pub dfs_reads: AtomicU64,

    /// Blocks written into SSD slots.
    pub ssd_fills: AtomicU64,

    /// Whole requests degraded to direct DFS reads.
    pub degraded_reads: AtomicU64,

    /// Blocks evicted by LRU pressure.
    pub evictions: AtomicU64,
}

impl CacheMetrics {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot as plain numbers `(ssd_reads, dfs_reads, ssd_fills,
    /// degraded, evictions)`.
    pub fn snapshot(&self) -> (u64, u64, u64, u64, u64) {
        (
            self.ssd_reads.load(Ordering::Relaxed),
            self.dfs_reads.load(Ordering::Relaxed),
            self.ssd_fills.load(Ordering::Relaxed),
            self.degraded_reads.load(Ordering::Relaxed),
            self.evictions.load(Ordering::Relaxed),
        )
    }
}

// ------------------------------------------------------------------------------------------------
// LockKeyMap
// ------------------------------------------------------------------------------------------------

struct KeyWaiter {
    busy: Mutex<bool>,
    cv: Condvar,
}

/// Serialises concurrent first-time creation of one metadata key: the
/// first caller proceeds, late arrivals block until it publishes, then see
/// the value it wrote.
pub struct LockKeyMap {
    inner: Mutex<HashMap<Vec<u8>, Arc<KeyWaiter>>>,
}

impl LockKeyMap {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the creation lock for `key`, blocking behind the current
    /// owner if any.
    fn lock_key(&self, key: &[u8]) -> KeyGuard<'_> {
        let waiter = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(map.entry(key.to_vec()).or_insert_with(|| {
                Arc::new(KeyWaiter {
                    busy: Mutex::new(false),
                    cv: Condvar::new(),
                })
            }))
        };

        let mut busy = waiter.busy.lock().unwrap_or_else(|e| e.into_inner());
        while *busy {
            busy = waiter.cv.wait(busy).unwrap_or_else(|e| e.into_inner());
        }
        *busy = true;
        drop(busy);

        KeyGuard {
            map: self,
            key: key.to_vec(),
            waiter,
        }
    }
}

struct KeyGuard<'a> {
    map: &'a LockKeyMap,
    key: Vec<u8>,
    waiter: Arc<KeyWaiter>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        {
            let mut busy = self.waiter.busy.lock().unwrap_or_else(|e| e.into_inner());
            *busy = false;
        }
        self.waiter.cv.notify_all();
        let mut map = self.map.inner.lock().unwrap_or_else(|e| e.into_inner());
        // Drop the entry once nobody else holds the waiter.
        if Arc::strong_count(map.get(&self.key).unwrap_or(&self.waiter)) <= 2 {
            map.remove(&self.key);
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Cache blocks and data sets
// ------------------------------------------------------------------------------------------------

/// One tracked block: identity, placement, and an owner-guarded state.
pub struct CacheBlock {
    /// Owning file's id.
    pub fid: u64,

    /// Block index within the source file.
    pub block_idx: u64,

    /// Data set holding the slot.
    pub sid: u32,

    /// Slot within the data set.
    pub slot: u32,

    /// Bytes actually stored (short for a file's tail block).
    len: Mutex<u32>,

    /// State bitmask, guarded with `cv`.
    state: Mutex<u8>,
    cv: Condvar,
}

impl CacheBlock {
    fn state_bits(&self) -> u8 {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, set: u8, clear: u8) {
        let mut bits = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *bits = (*bits | set) & !clear;
        drop(bits);
        self.cv.notify_all();
    }

    /// Wait until the block is no longer locked; returns the settled bits.
    fn wait_unlocked(&self) -> u8 {
        let mut bits = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while *bits & state::LOCKED != 0 {
            bits = self.cv.wait(bits).unwrap_or_else(|e| e.into_inner());
        }
        *bits
    }

    fn stored_len(&self) -> u32 {
        *self.len.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_stored_len(&self, len: u32) {
        *self.len.lock().unwrap_or_else(|e| e.into_inner()) = len;
    }
}

struct DataSetIndex {
    /// `(fid, block_idx)` → block.
    map: HashMap<(u64, u64), Arc<CacheBlock>>,

    /// Unused slots.
    free: Vec<u32>,

    /// LRU order: access stamp → key. Rebuilt stamps on touch.
    lru: std::collections::BTreeMap<u64, (u64, u64)>,

    /// Access stamp per key, to erase old LRU entries on touch.
    stamps: HashMap<(u64, u64), u64>,

    next_stamp: u64,
}

/// One preallocated backing file with its own index and LRU.
struct DataSet {
    sid: u32,
    file: std::fs::File,
    block_size: usize,
    index: Mutex<DataSetIndex>,
}

/// One block of a range read: placement in the file and in the caller's
/// buffer.
#[derive(Debug, Clone, Copy)]
struct WantedBlock {
    block_idx: u64,
    block_start: u64,
    block_len: usize,
    dst_start: usize,
    dst_end: usize,
    in_block: usize,
}

/// Outcome of an index lookup for one wanted block.
enum Classified {
    /// Present and settled; serve from SSD.
    Valid(Arc<CacheBlock>),
    /// Newly allocated and locked by us; fetch and fill.
    Miss(Arc<CacheBlock>),
    /// Someone else is filling it; wait on the block.
    Locked(Arc<CacheBlock>),
    /// No slot available (everything locked).
    Unplaceable,
}

impl DataSet {
    fn open(
        sid: u32,
        path: &std::path::Path,
        dataset_size: u64,
        block_size: usize,
    ) -> Result<Self, CacheError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() < dataset_size {
            file.set_len(dataset_size)?;
        }
        let slots = (dataset_size / block_size as u64) as u32;
        Ok(Self {
            sid,
            file,
            block_size,
            index: Mutex::new(DataSetIndex {
                map: HashMap::new(),
                free: (0..slots).rev().collect(),
                lru: std::collections::BTreeMap::new(),
                stamps: HashMap::new(),
                next_stamp: 0,
            }),
        })
    }

    fn touch(index: &mut DataSetIndex, key: (u64, u64)) {
        if let Some(old) = index.stamps.remove(&key) {
            index.lru.remove(&old);
        }
        let stamp = index.next_stamp;
        index.next_stamp += 1;
        index.lru.insert(stamp, key);
        index.stamps.insert(key, stamp);
    }

    fn forget(index: &mut DataSetIndex, key: (u64, u64)) {
        if let Some(stamp) = index.stamps.remove(&key) {
            index.lru.remove(&stamp);
        }
        if let Some(block) = index.map.remove(&key) {
            index.free.push(block.slot);
        }
    }

    /// Look up `(fid, block_idx)`, allocating (and locking) a slot on
    /// miss. Eviction of the coldest settled block funds the allocation.
    fn classify(
        &self,
        fid: u64,
        block_idx: u64,
        metrics: &CacheMetrics,
    ) -> (Classified, Option<Arc<CacheBlock>>) {
        let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        let key = (fid, block_idx);

        if let Some(block) = index.map.get(&key).cloned() {
            Self::touch(&mut index, key);
            let bits = block.state_bits();
            return if bits & state::LOCKED != 0 {
                (Classified::Locked(block), None)
            } else if bits & state::VALID != 0 {
                (Classified::Valid(block), None)
            } else {
                // Allocated but never filled (fill failed); retake it.
                block.set_state(state::LOCKED | state::DFS_READ, 0);
                (Classified::Miss(block), None)
            };
        }

        // Need a slot: free list first, then LRU eviction.
        let mut evicted = None;
        let slot = match index.free.pop() {
            Some(slot) => slot,
            None => {
                let victim_key = index
                    .lru
                    .iter()
                    .map(|(_, &key)| key)
                    .find(|victim| {
                        index
                            .map
                            .get(victim)
                            .is_some_and(|b| b.state_bits() & state::LOCKED == 0)
                    });
                match victim_key {
                    None => return (Classified::Unplaceable, None),
                    Some(victim_key) => {
                        let victim = index.map.get(&victim_key).cloned();
                        Self::forget(&mut index, victim_key);
                        CacheMetrics::bump(&metrics.evictions);
                        evicted = victim;
                        match index.free.pop() {
                            Some(slot) => slot,
                            None => return (Classified::Unplaceable, None),
                        }
                    }
                }
            }
        };

        let block = Arc::new(CacheBlock {
            fid,
            block_idx,
            sid: self.sid,
            slot,
            len: Mutex::new(0),
            state: Mutex::new(state::LOCKED | state::DFS_READ),
            cv: Condvar::new(),
        });
        index.map.insert(key, Arc::clone(&block));
        Self::touch(&mut index, key);
        (Classified::Miss(block), evicted)
    }

    fn read_slot(&self, block: &CacheBlock, out: &mut [u8]) -> Result<usize, CacheError> {
        let len = block.stored_len() as usize;
        let wanted = out.len().min(len);
        let offset = block.slot as u64 * self.block_size as u64;
        self.file.read_exact_at(&mut out[..wanted], offset)?;
        Ok(wanted)
    }

    fn write_slot(&self, block: &CacheBlock, data: &[u8]) -> Result<(), CacheError> {
        let offset = block.slot as u64 * self.block_size as u64;
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    /// Keys of every resident block belonging to `fid`.
    fn keys_of_fid(&self, fid: u64) -> Vec<(u64, u64)> {
        let index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        index
            .map
            .keys()
            .filter(|(block_fid, _)| *block_fid == fid)
            .copied()
            .collect()
    }

    fn drop_key(&self, key: (u64, u64)) -> Option<Arc<CacheBlock>> {
        let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        let block = index.map.get(&key).cloned();
        if let Some(block) = &block {
            if block.state_bits() & state::LOCKED != 0 {
                // Never evict a locked block; the owner re-checks on
                // completion.
                return None;
            }
        }
        Self::forget(&mut index, key);
        block
    }

    /// Restore one slot from a recovered `DS#` record.
    fn restore(&self, fid: u64, block_idx: u64, slot: u32, len: u32) {
        let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        index.free.retain(|&s| s != slot);
        let block = Arc::new(CacheBlock {
            fid,
            block_idx,
            sid: self.sid,
            slot,
            len: Mutex::new(len),
            state: Mutex::new(state::VALID),
            cv: Condvar::new(),
        });
        index.map.insert((fid, block_idx), block);
        Self::touch(&mut index, (fid, block_idx));
    }
}

// ------------------------------------------------------------------------------------------------
// The cache
// ------------------------------------------------------------------------------------------------

struct FidAllocator {
    next: u64,
    ceiling: u64,
}

/// The persistent SSD block cache.
pub struct PersistentBlockCache {
    /// Source of truth for remote bytes.
    inner_dfs: Arc<dyn Dfs>,

    /// Metadata engine (file ids and slot records).
    meta: LsmEngine,

    datasets: Vec<DataSet>,
    block_size: usize,

    fid_alloc: Mutex<FidAllocator>,

    /// In-memory mirror of `FNAME#` lookups.
    fids: Mutex<HashMap<String, u64>>,

    /// Serialises first-time creation of metadata keys.
    lock_keys: LockKeyMap,

    /// Paths under delayed GC: evictions deferred one cycle.
    delayed_gc: Mutex<HashSet<String>>,

    /// Evictions deferred by the grace list.
    deferred_evictions: Mutex<Vec<String>>,

    /// Read/DFS pools for the parallel read path; `None` runs inline.
    pools: Option<CachePools>,

    /// Operation counters.
    pub metrics: CacheMetrics,
}

impl PersistentBlockCache {
    /// Open (or create) the cache under `cache_root`, fronting
    /// `inner_dfs`. With `pools`, range reads fan their valid and miss
    /// lists out to the read and DFS pools; without, they run inline.
    pub fn open(
        cache_root: impl AsRef<std::path::Path>,
        inner_dfs: Arc<dyn Dfs>,
        options: CacheOptions,
        pools: Option<CachePools>,
    ) -> Result<Arc<Self>, CacheError> {
        let root = cache_root.as_ref().to_path_buf();
        if options.clean_on_start && root.exists() {
            std::fs::remove_dir_all(&root)?;
            info!(root = %root.display(), "cache paths cleaned at startup");
        }
        std::fs::create_dir_all(&root)?;

        // The metadata store is a small engine of its own, on local disk.
        let meta_dfs: Arc<dyn Dfs> = Arc::new(crate::dfs::LocalDfs::new(&root)?);
        let meta_block_cache = Arc::new(BlockCache::new(8 * 1024 * 1024));
        let meta_table_cache = Arc::new(TableCache::new(
            Arc::clone(&meta_dfs),
            64,
            meta_block_cache,
        ));
        let meta = LsmEngine::open(
            meta_dfs,
            "meta",
            EngineOptions {
                write_buffer_size: 1024 * 1024,
                ..Default::default()
            },
            meta_table_cache,
            None,
            &[],
            &[],
            Rollbacks::new(),
        )?;

        let dataset_count = (options.capacity / options.dataset_size).max(1) as u32;
        let mut datasets = Vec::with_capacity(dataset_count as usize);
        for sid in 0..dataset_count {
            let path = root.join(format!("dataset_{sid:04}.data"));
            datasets.push(DataSet::open(
                sid,
                &path,
                options.dataset_size,
                options.block_size,
            )?);
        }

        // Restore the fid ceiling; ids in the unfinished batch are skipped.
        let ceiling = match meta.get(FID_KEY, None)? {
            Some(value) => decode_u64(&value)?,
            None => 0,
        };

        let cache = Arc::new(Self {
            inner_dfs,
            meta,
            datasets,
            block_size: options.block_size,
            fid_alloc: Mutex::new(FidAllocator {
                next: ceiling,
                ceiling,
            }),
            fids: Mutex::new(HashMap::new()),
            lock_keys: LockKeyMap::new(),
            delayed_gc: Mutex::new(HashSet::new()),
            deferred_evictions: Mutex::new(Vec::new()),
            pools,
            metrics: CacheMetrics::default(),
        });
        cache.recover_dataset_indexes()?;
        info!(
            datasets = cache.datasets.len(),
            block_size = cache.block_size,
            "persistent block cache opened"
        );
        Ok(cache)
    }

    /// Rebuild every data-set index from recovered `DS#` records.
    fn recover_dataset_indexes(&self) -> Result<(), CacheError> {
        let mut start = DS_PREFIX.to_vec();
        let mut end = DS_PREFIX.to_vec();
        end.push(0xFF);

        let mut restored = 0usize;
        loop {
            let page = self.meta.scan(&ScanOptions {
                start: start.clone(),
                end: end.clone(),
                row_budget: 1_000,
                ..Default::default()
            })?;
            for (key, value) in &page.cells {
                let Some((sid, slot)) = decode_ds_key(key) else {
                    continue;
                };
                let Ok((fid, block_idx, len)) = decode_ds_value(value) else {
                    continue;
                };
                if let Some(dataset) = self.datasets.get(sid as usize) {
                    dataset.restore(fid, block_idx, slot, len);
                    restored += 1;
                }
            }
            match (page.more, page.next_start) {
                (true, Some(next)) => start = next,
                _ => break,
            }
        }
        if restored > 0 {
            info!(blocks = restored, "data-set indexes recovered");
        }
        Ok(())
    }

    fn dataset_for(&self, fid: u64, block_idx: u64) -> &DataSet {
        let mut hash = fid.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ block_idx;
        hash ^= hash >> 33;
        &self.datasets[(hash % self.datasets.len() as u64) as usize]
    }

    // --------------------------------------------------------------------------------------------
    // File ids
    // --------------------------------------------------------------------------------------------

    /// The file id of `path`, allocating one on first sight.
    pub fn fid_of(&self, path: &str) -> Result<u64, CacheError> {
        if let Some(&fid) = self.fids.lock().unwrap_or_else(|e| e.into_inner()).get(path) {
            return Ok(fid);
        }

        let mut fname_key = FNAME_PREFIX.to_vec();
        fname_key.extend_from_slice(path.as_bytes());

        // One creator per key; late arrivals see the published id.
        let _guard = self.lock_keys.lock_key(&fname_key);
        if let Some(value) = self.meta.get(&fname_key, None)? {
            let fid = decode_u64(&value)?;
            self.fids
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(path.to_string(), fid);
            return Ok(fid);
        }

        let fid = {
            let mut alloc = self.fid_alloc.lock().unwrap_or_else(|e| e.into_inner());
            if alloc.next >= alloc.ceiling {
                let new_ceiling = alloc.ceiling + FID_BATCH;
                self.meta.write(
                    &[WriteRecord::put(FID_KEY.to_vec(), new_ceiling.to_le_bytes().to_vec())],
                    &WriteOptions { sync: true },
                )?;
                alloc.ceiling = new_ceiling;
            }
            let fid = alloc.next;
            alloc.next += 1;
            fid
        };

        self.meta.write(
            &[WriteRecord::put(fname_key, fid.to_le_bytes().to_vec())],
            &WriteOptions::default(),
        )?;
        self.fids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), fid);
        debug!(path, fid, "file id assigned");
        Ok(fid)
    }

    fn lookup_fid(&self, path: &str) -> Result<Option<u64>, CacheError> {
        if let Some(&fid) = self.fids.lock().unwrap_or_else(|e| e.into_inner()).get(path) {
            return Ok(Some(fid));
        }
        let mut fname_key = FNAME_PREFIX.to_vec();
        fname_key.extend_from_slice(path.as_bytes());
        match self.meta.get(&fname_key, None)? {
            Some(value) => Ok(Some(decode_u64(&value)?)),
            None => Ok(None),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Read `[offset, offset + buf.len())` of `path`, serving blocks from
    /// the SSD where resident and filling them from the DFS where not.
    ///
    /// `file_size` bounds the read (the caller knows it from table
    /// metadata). On any block-level failure the whole request degrades to
    /// one direct DFS read.
    pub fn read(
        self: &Arc<Self>,
        path: &str,
        file_size: u64,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, CacheError> {
        if offset >= file_size {
            return Ok(0);
        }
        let wanted = (buf.len() as u64).min(file_size - offset) as usize;

        match self.read_blocks(path, file_size, offset, &mut buf[..wanted]) {
            Ok(()) => Ok(wanted),
            Err(e) => {
                warn!(path, offset, error = %e, "cache read degraded to direct DFS");
                CacheMetrics::bump(&self.metrics.degraded_reads);
                let file = self.inner_dfs.open_random(path, Some(file_size))?;
                let n = file.read_at(offset, &mut buf[..wanted])?;
                Ok(n)
            }
        }
    }

    fn read_blocks(
        self: &Arc<Self>,
        path: &str,
        file_size: u64,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), CacheError> {
        let fid = self.fid_of(path)?;
        let block_size = self.block_size as u64;

        let first_block = offset / block_size;
        let last_block = (offset + buf.len() as u64 - 1) / block_size;

        // Pass one: classify every wanted block into the three lists.
        let mut valid: Vec<(WantedBlock, Arc<CacheBlock>)> = Vec::new();
        let mut miss: Vec<(WantedBlock, Arc<CacheBlock>)> = Vec::new();
        let mut locked: Vec<WantedBlock> = Vec::new();

        for block_idx in first_block..=last_block {
            let block_start = block_idx * block_size;
            let block_len = block_size.min(file_size - block_start) as usize;

            // Intersection of the wanted range with this block.
            let copy_from = offset.max(block_start);
            let copy_to = (offset + buf.len() as u64).min(block_start + block_len as u64);
            let wanted = WantedBlock {
                block_idx,
                block_start,
                block_len,
                dst_start: (copy_from - offset) as usize,
                dst_end: (copy_to - offset) as usize,
                in_block: (copy_from - block_start) as usize,
            };

            let dataset = self.dataset_for(fid, block_idx);
            let (classified, _evicted) = dataset.classify(fid, block_idx, &self.metrics);
            match classified {
                Classified::Valid(block) => valid.push((wanted, block)),
                Classified::Miss(block) => miss.push((wanted, block)),
                Classified::Locked(_) => locked.push(wanted),
                Classified::Unplaceable => {
                    self.unwind_misses(fid, &miss);
                    return Err(CacheError::Internal(
                        "no evictable slot in data set".into(),
                    ));
                }
            }
        }

        // Passes two and three: SSD reads for the valid list, DFS fetches
        // for the miss list. With pools configured the two lists run
        // concurrently (valid on the read pool, miss on the DFS pool) and
        // the caller joins both before assembling the user buffer.
        if self.pools.is_some() && valid.len() + miss.len() > 1 {
            self.serve_lists_pooled(path, file_size, fid, valid, miss, buf)?;
        } else {
            for (wanted, block) in &valid {
                match self.read_valid_span(fid, wanted, block) {
                    Ok(span) => {
                        buf[wanted.dst_start..wanted.dst_end].copy_from_slice(&span);
                    }
                    Err(e) => {
                        self.unwind_misses(fid, &miss);
                        return Err(e);
                    }
                }
            }
            for (idx, (wanted, block)) in miss.iter().enumerate() {
                match self.fetch_miss_span(path, file_size, fid, wanted, block) {
                    Ok(span) => {
                        buf[wanted.dst_start..wanted.dst_end].copy_from_slice(&span);
                    }
                    Err(e) => {
                        self.unwind_misses(fid, &miss[idx + 1..]);
                        return Err(e);
                    }
                }
            }
        }

        // Pass four: wait out in-flight owners and settle their blocks.
        for wanted in locked {
            self.serve_after_wait(path, file_size, fid, wanted, buf)?;
        }
        Ok(())
    }

    /// Fan the valid and miss lists out to the read and DFS pools, join,
    /// and assemble the user buffer from the returned spans.
    fn serve_lists_pooled(
        self: &Arc<Self>,
        path: &str,
        file_size: u64,
        fid: u64,
        valid: Vec<(WantedBlock, Arc<CacheBlock>)>,
        miss: Vec<(WantedBlock, Arc<CacheBlock>)>,
        buf: &mut [u8],
    ) -> Result<(), CacheError> {
        let Some(pools) = &self.pools else {
            return Err(CacheError::Internal("pooled serve without pools".into()));
        };
        let expected = valid.len() + miss.len();
        let (tx, rx) = crossbeam::channel::unbounded::<(WantedBlock, Result<Vec<u8>, CacheError>)>();

        for (wanted, block) in valid {
            let cache = Arc::clone(self);
            let tx = tx.clone();
            pools.read_pool.execute(move || {
                let result = cache.read_valid_span(fid, &wanted, &block);
                let _ = tx.send((wanted, result));
            });
        }
        for (wanted, block) in miss {
            let cache = Arc::clone(self);
            let tx = tx.clone();
            let path = path.to_string();
            pools.dfs_pool.execute(move || {
                let result = cache.fetch_miss_span(&path, file_size, fid, &wanted, &block);
                let _ = tx.send((wanted, result));
            });
        }
        drop(tx);

        // Wait all; the first failure degrades the request, but every
        // task is drained so in-flight state always settles.
        let mut first_error: Option<CacheError> = None;
        for _ in 0..expected {
            let Ok((wanted, result)) = rx.recv() else {
                first_error =
                    first_error.or_else(|| Some(CacheError::Internal("read worker lost".into())));
                break;
            };
            match result {
                Ok(span) => buf[wanted.dst_start..wanted.dst_end].copy_from_slice(&span),
                Err(e) => first_error = first_error.or(Some(e)),
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Release miss allocations that will never be filled, so waiters and
    /// later reads retry cleanly.
    fn unwind_misses(&self, fid: u64, misses: &[(WantedBlock, Arc<CacheBlock>)]) {
        for (wanted, block) in misses {
            block.set_state(0, state::LOCKED | state::DFS_READ);
            self.dataset_for(fid, wanted.block_idx)
                .drop_key((fid, wanted.block_idx));
        }
    }

    /// SSD read of one resident block; returns the wanted span.
    fn read_valid_span(
        &self,
        fid: u64,
        wanted: &WantedBlock,
        block: &Arc<CacheBlock>,
    ) -> Result<Vec<u8>, CacheError> {
        let dataset = self.dataset_for(fid, wanted.block_idx);
        block.set_state(state::CACHE_READ, 0);
        let mut slot_buf = vec![0u8; wanted.block_len];
        let result = dataset.read_slot(block, &mut slot_buf);
        block.set_state(0, state::CACHE_READ);
        result?;
        CacheMetrics::bump(&self.metrics.ssd_reads);
        let span = wanted.dst_end - wanted.dst_start;
        Ok(slot_buf[wanted.in_block..wanted.in_block + span].to_vec())
    }

    /// DFS fetch + SSD fill of one missing block; returns the wanted
    /// span. On failure the allocation is unwound so a later read retries
    /// cleanly.
    fn fetch_miss_span(
        &self,
        path: &str,
        file_size: u64,
        fid: u64,
        wanted: &WantedBlock,
        block: &Arc<CacheBlock>,
    ) -> Result<Vec<u8>, CacheError> {
        let dataset = self.dataset_for(fid, wanted.block_idx);
        match self.fill_block(
            path,
            file_size,
            dataset,
            block,
            wanted.block_start,
            wanted.block_len,
        ) {
            Ok(data) => {
                let span = wanted.dst_end - wanted.dst_start;
                Ok(data[wanted.in_block..wanted.in_block + span].to_vec())
            }
            Err(e) => {
                block.set_state(0, state::LOCKED | state::DFS_READ);
                dataset.drop_key((fid, wanted.block_idx));
                Err(e)
            }
        }
    }

    /// Serve one block that was in flight at classification time: wait for
    /// its owner, then re-classify until it settles.
    fn serve_after_wait(
        &self,
        path: &str,
        file_size: u64,
        fid: u64,
        wanted: WantedBlock,
        buf: &mut [u8],
    ) -> Result<(), CacheError> {
        let dataset = self.dataset_for(fid, wanted.block_idx);
        for _ in 0..8 {
            let (classified, _evicted) = dataset.classify(fid, wanted.block_idx, &self.metrics);
            match classified {
                Classified::Valid(block) => {
                    let span = self.read_valid_span(fid, &wanted, &block)?;
                    buf[wanted.dst_start..wanted.dst_end].copy_from_slice(&span);
                    return Ok(());
                }
                Classified::Miss(block) => {
                    // The owner abandoned the block; fetch it ourselves.
                    let span = self.fetch_miss_span(path, file_size, fid, &wanted, &block)?;
                    buf[wanted.dst_start..wanted.dst_end].copy_from_slice(&span);
                    return Ok(());
                }
                Classified::Locked(block) => {
                    block.wait_unlocked();
                }
                Classified::Unplaceable => {
                    return Err(CacheError::Internal(
                        "no evictable slot in data set".into(),
                    ));
                }
            }
        }
        Err(CacheError::Internal(format!(
            "block ({fid}, {}) never settled",
            wanted.block_idx
        )))
    }

    /// Fetch one block from the DFS and fill its SSD slot: log the `DS#`
    /// record, then write the data, then publish `VALID`.
    fn fill_block(
        &self,
        path: &str,
        file_size: u64,
        dataset: &DataSet,
        block: &Arc<CacheBlock>,
        block_start: u64,
        block_len: usize,
    ) -> Result<Vec<u8>, CacheError> {
        let file = self.inner_dfs.open_random(path, Some(file_size))?;
        let mut data = vec![0u8; block_len];
        let mut filled = 0;
        while filled < block_len {
            let n = file.read_at(block_start + filled as u64, &mut data[filled..])?;
            if n == 0 {
                return Err(CacheError::Internal(format!(
                    "short DFS read at {block_start} of {path}"
                )));
            }
            filled += n;
        }
        CacheMetrics::bump(&self.metrics.dfs_reads);

        block.set_state(state::CACHE_FILL, state::DFS_READ);
        self.log_slot_record(block, block_len as u32)?;
        dataset.write_slot(block, &data)?;
        block.set_stored_len(block_len as u32);
        block.set_state(state::VALID, state::LOCKED | state::CACHE_FILL);
        CacheMetrics::bump(&self.metrics.ssd_fills);
        Ok(data)
    }

    /// Fill a block from bytes the writer already has (cache-through for
    /// newly written tables). Drops the block silently on allocation
    /// pressure; the cache is advisory for writers.
    pub fn fill_from_write(&self, path: &str, block_idx: u64, data: &[u8]) {
        let Ok(fid) = self.fid_of(path) else { return };
        let dataset = self.dataset_for(fid, block_idx);
        let (classified, _evicted) = dataset.classify(fid, block_idx, &self.metrics);
        let block = match classified {
            Classified::Miss(block) => block,
            // Already resident or in flight: nothing to do.
            Classified::Valid(_) | Classified::Locked(_) | Classified::Unplaceable => return,
        };

        let result = self
            .log_slot_record(&block, data.len() as u32)
            .and_then(|()| dataset.write_slot(&block, data));
        match result {
            Ok(()) => {
                block.set_stored_len(data.len() as u32);
                block.set_state(state::VALID, state::LOCKED | state::DFS_READ);
                CacheMetrics::bump(&self.metrics.ssd_fills);
            }
            Err(e) => {
                warn!(path, block_idx, error = %e, "write-through fill failed");
                block.set_state(0, state::LOCKED | state::DFS_READ);
                dataset.drop_key((fid, block_idx));
            }
        }
    }

    fn log_slot_record(&self, block: &CacheBlock, len: u32) -> Result<(), CacheError> {
        self.meta.write(
            &[WriteRecord::put(
                encode_ds_key(block.sid, block.slot),
                encode_ds_value(block.fid, block.block_idx, len),
            )],
            &WriteOptions::default(),
        )?;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Eviction and GC
    // --------------------------------------------------------------------------------------------

    /// Put `path` on the delayed-GC grace list: a force-evict arriving
    /// while it is listed is deferred one full GC cycle.
    pub fn mark_delayed_gc(&self, path: &str) {
        self.delayed_gc
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string());
    }

    /// Remove `path` from the grace list.
    pub fn unmark_delayed_gc(&self, path: &str) {
        self.delayed_gc
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
    }

    /// Force-evict every cached block of `path`. Deferred when the path is
    /// under delayed GC.
    pub fn evict_file(&self, path: &str) -> Result<(), CacheError> {
        {
            let delayed = self.delayed_gc.lock().unwrap_or_else(|e| e.into_inner());
            if delayed.contains(path) {
                self.deferred_evictions
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(path.to_string());
                debug!(path, "eviction deferred by delayed-GC grace");
                return Ok(());
            }
        }
        self.evict_file_now(path)
    }

    fn evict_file_now(&self, path: &str) -> Result<(), CacheError> {
        let Some(fid) = self.lookup_fid(path)? else {
            return Ok(());
        };

        let mut records = Vec::new();
        for dataset in &self.datasets {
            for key in dataset.keys_of_fid(fid) {
                if let Some(block) = dataset.drop_key(key) {
                    records.push(WriteRecord::delete(encode_ds_key(block.sid, block.slot)));
                }
            }
        }
        let mut fname_key = FNAME_PREFIX.to_vec();
        fname_key.extend_from_slice(path.as_bytes());
        records.push(WriteRecord::delete(fname_key));
        self.meta.write(&records, &WriteOptions::default())?;

        self.fids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
        debug!(path, fid, evicted = records.len() - 1, "file evicted from cache");
        Ok(())
    }

    /// Run one GC cycle: evictions deferred by the grace list are now
    /// executed.
    pub fn run_gc_cycle(&self) -> Result<(), CacheError> {
        let deferred: Vec<String> = {
            let mut list = self
                .deferred_evictions
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *list)
        };
        for path in deferred {
            self.evict_file_now(&path)?;
        }
        Ok(())
    }

    /// Total resident blocks, for health reporting.
    pub fn resident_blocks(&self) -> usize {
        self.datasets
            .iter()
            .map(|ds| ds.index.lock().map(|i| i.map.len()).unwrap_or(0))
            .sum()
    }

    /// Logical block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Flush the metadata engine (tests and shutdown).
    pub fn sync_meta(&self) -> Result<(), CacheError> {
        self.meta.flush()?;
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Metadata encodings (little-endian fixed width)
// ------------------------------------------------------------------------------------------------

fn decode_u64(value: &[u8]) -> Result<u64, CacheError> {
    if value.len() < 8 {
        return Err(CacheError::Internal("truncated u64 metadata value".into()));
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&value[..8]);
    Ok(u64::from_le_bytes(raw))
}

/// `DS#` keys embed `(sid, slot)` big-endian so a prefix scan walks data
/// sets in order.
fn encode_ds_key(sid: u32, slot: u32) -> Vec<u8> {
    let mut key = DS_PREFIX.to_vec();
    key.extend_from_slice(&sid.to_be_bytes());
    key.extend_from_slice(&slot.to_be_bytes());
    key
}

fn decode_ds_key(key: &[u8]) -> Option<(u32, u32)> {
    let rest = key.strip_prefix(DS_PREFIX)?;
    if rest.len() != 8 {
        return None;
    }
    let sid = u32::from_be_bytes(rest[..4].try_into().ok()?);
    let slot = u32::from_be_bytes(rest[4..].try_into().ok()?);
    Some((sid, slot))
}

fn encode_ds_value(fid: u64, block_idx: u64, len: u32) -> Vec<u8> {
    let mut value = Vec::with_capacity(20);
    value.extend_from_slice(&fid.to_le_bytes());
    value.extend_from_slice(&block_idx.to_le_bytes());
    value.extend_from_slice(&len.to_le_bytes());
    value
}

fn decode_ds_value(value: &[u8]) -> Result<(u64, u64, u32), CacheError> {
    if value.len() < 20 {
        return Err(CacheError::Internal("truncated DS# value".into()));
    }
    let fid = u64::from_le_bytes(value[..8].try_into().unwrap_or_default());
    let block_idx = u64::from_le_bytes(value[8..16].try_into().unwrap_or_default());
    let len = u32::from_le_bytes(value[16..20].try_into().unwrap_or_default());
    Ok((fid, block_idx, len))
}
