//! Sorted String Table (SSTable) Module
//!
//! Immutable, sorted, on-disk tables — the unit of flush and compaction.
//!
//! ## Design Overview
//!
//! A table is a run of **data blocks** holding [`InternalKey`]/value cells in
//! internal-key order, followed by a **filter block** (one bloom filter over
//! the table's user keys), an **index block** mapping each data block's last
//! key to its [`BlockHandle`], and a fixed-size footer. Blocks are the unit
//! of caching and of checksum verification.
//!
//! # On-disk layout
//!
//! ```text
//! [DATA_BLOCK_BYTES][CRC32_LE]      × N
//! [FILTER_BLOCK_BYTES][CRC32_LE]
//! [INDEX_BLOCK_BYTES][CRC32_LE]
//! [FOOTER: filter handle (16) | index handle (16) | magic (8)]
//! ```
//!
//! # Caching
//!
//! Reads go through a server-wide [`BlockCache`] (bytes-weighted LRU keyed by
//! `(file_number, offset)`) so hot blocks are decoded once per residency.
//! Opened tables — index and filter resident — are pooled in a [`TableCache`]
//! keyed by file number and evicted when the file is deleted.
//!
//! # Concurrency model
//!
//! Tables are immutable; readers share a `Arc<Table>` handle freely.
//! Both caches are internally synchronised.
//!
//! # Sub-modules
//!
//! - [`builder`] — [`TableBuilder`] streams sorted cells into a new table.
//! - [`iterator`] — [`TableIter`] for scans and compaction merges.

pub mod builder;
pub mod iterator;

#[cfg(test)]
mod tests;

pub use builder::{TableBuildResult, TableBuilder};
pub use iterator::TableIter;

use std::sync::Arc;

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use quick_cache::{Weighter, sync::Cache};
use thiserror::Error;
use tracing::{debug, trace};

use crate::dfs::{Dfs, DfsError, RandomAccessFile};
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::engine::key::{InternalKey, LookupKey, Rollbacks, ValueKind, is_rolled_back};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Trailing magic identifying a table file.
pub const TABLE_MAGIC: u64 = 0x7462_6c74_5f73_7374; // "tblt_sst"

/// Fixed footer size: two handles + magic.
pub const FOOTER_SIZE: usize = 16 + 16 + 8;

/// CRC suffix on every block.
pub const BLOCK_TRAILER_SIZE: usize = 4;

/// Default target payload size of a data block.
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024;

/// Bloom filter false-positive target.
const BLOOM_FP_RATE: f64 = 0.01;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by table build and read operations.
#[derive(Debug, Error)]
pub enum SstableError {
    /// Underlying filesystem failure.
    #[error("dfs error: {0}")]
    Dfs(#[from] DfsError),

    /// Encoding / decoding failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A block or footer failed validation.
    #[error("corrupt table {file_number}: {reason}")]
    Corrupt {
        /// File number of the damaged table.
        file_number: u64,
        /// What failed to validate.
        reason: String,
    },

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// On-disk format structures
// ------------------------------------------------------------------------------------------------

/// Location of one block inside a table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHandle {
    /// Byte offset of the block payload.
    pub offset: u64,

    /// Payload length, excluding the CRC trailer.
    pub size: u64,
}

impl Encode for BlockHandle {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.offset.encode_to(buf)?;
        self.size.encode_to(buf)
    }
}

impl Decode for BlockHandle {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (block_offset, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (size, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                offset: block_offset,
                size,
            },
            offset,
        ))
    }
}

/// Fixed footer at the tail of every table file.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Footer {
    pub(crate) filter: BlockHandle,
    pub(crate) index: BlockHandle,
}

impl Footer {
    pub(crate) fn encode(&self) -> Result<Vec<u8>, EncodingError> {
        let mut buf = Vec::with_capacity(FOOTER_SIZE);
        self.filter.encode_to(&mut buf)?;
        self.index.encode_to(&mut buf)?;
        TABLE_MAGIC.encode_to(&mut buf)?;
        Ok(buf)
    }

    pub(crate) fn decode(buf: &[u8], file_number: u64) -> Result<Self, SstableError> {
        let (filter, mut offset) = BlockHandle::decode_from(buf)?;
        let (index, n) = BlockHandle::decode_from(&buf[offset..])?;
        offset += n;
        let (magic, _) = u64::decode_from(&buf[offset..])?;
        if magic != TABLE_MAGIC {
            return Err(SstableError::Corrupt {
                file_number,
                reason: format!("bad footer magic 0x{magic:016x}"),
            });
        }
        Ok(Self { filter, index })
    }
}

/// One index-block entry: the last internal key of a data block.
#[derive(Debug, Clone)]
pub(crate) struct IndexEntry {
    pub(crate) last_key: InternalKey,
    pub(crate) handle: BlockHandle,
}

impl Encode for IndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.last_key.encode_to(buf)?;
        self.handle.encode_to(buf)
    }
}

impl Decode for IndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (last_key, n) = InternalKey::decode_from(&buf[offset..])?;
        offset += n;
        let (handle, n) = BlockHandle::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { last_key, handle }, offset))
    }
}

// ------------------------------------------------------------------------------------------------
// Block cache
// ------------------------------------------------------------------------------------------------

/// Cache key: which block of which opened table.
///
/// Keys use the table's process-global [`Table::cache_id`] rather than its
/// file number — file numbers are only unique per engine, and the block
/// cache is shared by every engine on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockCacheKey {
    /// Owning table's cache id.
    pub cache_id: u64,
    /// Block offset inside the file.
    pub offset: u64,
}

#[derive(Clone)]
struct BlockWeighter;

impl Weighter<BlockCacheKey, Arc<Vec<u8>>> for BlockWeighter {
    fn weight(&self, _key: &BlockCacheKey, block: &Arc<Vec<u8>>) -> u64 {
        block.len() as u64
    }
}

/// Server-wide in-memory LRU of decoded data blocks, capacity in bytes.
///
/// Shared by every engine on the server; one budget for the process.
pub struct BlockCache {
    cache: Cache<BlockCacheKey, Arc<Vec<u8>>, BlockWeighter>,
}

impl BlockCache {
    /// Create a cache bounded at `capacity_bytes`.
    pub fn new(capacity_bytes: u64) -> Self {
        // Estimate item slots assuming roughly block-sized entries.
        let estimated = (capacity_bytes / DEFAULT_BLOCK_SIZE as u64).max(16) as usize;
        Self {
            cache: Cache::with_weighter(estimated, capacity_bytes, BlockWeighter),
        }
    }

    /// Fetch a resident block.
    pub fn get(&self, key: &BlockCacheKey) -> Option<Arc<Vec<u8>>> {
        self.cache.get(key)
    }

    /// Insert a freshly decoded block.
    pub fn insert(&self, key: BlockCacheKey, block: Arc<Vec<u8>>) {
        self.cache.insert(key, block);
    }
}

// ------------------------------------------------------------------------------------------------
// Table
// ------------------------------------------------------------------------------------------------

/// Outcome of a point lookup inside one table.
#[derive(Debug, PartialEq, Eq)]
pub enum TableGet {
    /// A live value visible at the lookup snapshot.
    Found(Vec<u8>),

    /// The newest visible version here is a tombstone.
    Deleted,

    /// No visible version in this table.
    NotFound,
}

/// An opened, immutable sorted table: index and filter resident, data
/// blocks fetched through the block cache on demand.
pub struct Table {
    file: Arc<dyn RandomAccessFile>,
    file_number: u64,

    /// Process-global identity for block-cache keys.
    cache_id: u64,

    index: Vec<IndexEntry>,
    bloom: Vec<u8>,

    block_cache: Arc<BlockCache>,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("file_number", &self.file_number)
            .field("cache_id", &self.cache_id)
            .finish()
    }
}

/// Source of process-global table cache ids.
static NEXT_CACHE_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

impl Table {
    /// Open a table file, reading footer, index, and filter.
    pub fn open(
        file: Arc<dyn RandomAccessFile>,
        file_number: u64,
        size: u64,
        block_cache: Arc<BlockCache>,
    ) -> Result<Self, SstableError> {
        if (size as usize) < FOOTER_SIZE {
            return Err(SstableError::Corrupt {
                file_number,
                reason: format!("file of {size} bytes is smaller than the footer"),
            });
        }

        let mut footer_buf = vec![0u8; FOOTER_SIZE];
        read_exact_at(file.as_ref(), size - FOOTER_SIZE as u64, &mut footer_buf)
            .map_err(SstableError::Dfs)?;
        let footer = Footer::decode(&footer_buf, file_number)?;

        let index_bytes = read_verified_block(file.as_ref(), file_number, footer.index)?;
        let (index, _) = encoding::decode_vec::<IndexEntry>(&index_bytes)?;

        let bloom = read_verified_block(file.as_ref(), file_number, footer.filter)?;

        debug!(file_number, blocks = index.len(), "table opened");
        Ok(Self {
            file,
            file_number,
            cache_id: NEXT_CACHE_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            index,
            bloom,
            block_cache,
        })
    }

    /// File number this table was opened under.
    pub fn file_number(&self) -> u64 {
        self.file_number
    }

    /// Process-global identity used for block-cache keys.
    pub fn cache_id(&self) -> u64 {
        self.cache_id
    }

    /// Number of data blocks.
    pub fn block_count(&self) -> usize {
        self.index.len()
    }

    /// Bloom check: false means the user key is definitely absent.
    pub fn may_contain(&self, user_key: &[u8]) -> bool {
        if self.bloom.is_empty() {
            return true;
        }
        match Bloom::from_slice(&self.bloom) {
            Ok(bloom) => bloom.check(&user_key.to_vec()),
            // A damaged filter only costs extra reads.
            Err(_) => true,
        }
    }

    /// Look up the newest version of `lookup.user_key` visible at
    /// `lookup.snapshot`, skipping rolled-back sequences.
    pub fn get(&self, lookup: &LookupKey, rollbacks: &Rollbacks) -> Result<TableGet, SstableError> {
        if !self.may_contain(&lookup.user_key) {
            return Ok(TableGet::NotFound);
        }

        let target = InternalKey::seek_to(lookup.user_key.clone(), lookup.snapshot);
        let Some(start_block) = self.first_block_containing(&target) else {
            return Ok(TableGet::NotFound);
        };

        // Versions of one user key can spill into following blocks.
        for block_idx in start_block..self.index.len() {
            let block = self.read_block(self.index[block_idx].handle)?;
            for (key, value) in iterator::decode_block_cells(&block, self.file_number)? {
                if key.user_key.as_slice() > lookup.user_key.as_slice() {
                    return Ok(TableGet::NotFound);
                }
                if key.user_key != lookup.user_key {
                    continue;
                }
                if key.sequence > lookup.snapshot || is_rolled_back(rollbacks, key.sequence) {
                    continue;
                }
                return Ok(match key.kind {
                    ValueKind::Value => TableGet::Found(value),
                    ValueKind::Deletion => TableGet::Deleted,
                });
            }
        }
        Ok(TableGet::NotFound)
    }

    /// Index of the first block whose last key is ≥ `target`, i.e. the only
    /// block that can contain `target`.
    pub(crate) fn first_block_containing(&self, target: &InternalKey) -> Option<usize> {
        let idx = self
            .index
            .partition_point(|entry| entry.last_key < *target);
        (idx < self.index.len()).then_some(idx)
    }

    /// Fetch one data block, consulting the block cache.
    pub(crate) fn read_block(&self, handle: BlockHandle) -> Result<Arc<Vec<u8>>, SstableError> {
        let cache_key = BlockCacheKey {
            cache_id: self.cache_id,
            offset: handle.offset,
        };
        if let Some(block) = self.block_cache.get(&cache_key) {
            trace!(file_number = self.file_number, offset = handle.offset, "block cache hit");
            return Ok(block);
        }

        let block = Arc::new(read_verified_block(
            self.file.as_ref(),
            self.file_number,
            handle,
        )?);
        self.block_cache.insert(cache_key, Arc::clone(&block));
        Ok(block)
    }

    /// Iterate every cell of the table in internal-key order.
    pub fn iter(self: &Arc<Self>) -> TableIter {
        TableIter::new(Arc::clone(self))
    }

    /// Approximate file offset at which `target` would live; used by
    /// split-key discovery.
    pub fn approximate_offset_of(&self, target: &InternalKey) -> u64 {
        match self.first_block_containing(target) {
            Some(idx) => self.index[idx].handle.offset,
            None => self
                .index
                .last()
                .map(|entry| entry.handle.offset + entry.handle.size)
                .unwrap_or(0),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Table cache
// ------------------------------------------------------------------------------------------------

/// Pool of opened [`Table`] handles keyed by file path.
///
/// Keeps index + filter resident for hot tables; shared server-wide (file
/// numbers repeat across engines, paths do not).
pub struct TableCache {
    dfs: Arc<dyn Dfs>,
    cache: Cache<String, Arc<Table>>,
    block_cache: Arc<BlockCache>,
}

impl TableCache {
    /// Create a pool holding at most `capacity` open tables.
    pub fn new(dfs: Arc<dyn Dfs>, capacity: usize, block_cache: Arc<BlockCache>) -> Self {
        Self {
            dfs,
            cache: Cache::new(capacity.max(4)),
            block_cache,
        }
    }

    /// The block cache shared through this pool.
    pub fn block_cache(&self) -> &Arc<BlockCache> {
        &self.block_cache
    }

    /// Fetch (opening if needed) the table at `path` with file `number`.
    ///
    /// `size` is the file length recorded in version metadata.
    pub fn get_table(
        &self,
        file_number: u64,
        path: &str,
        size: u64,
    ) -> Result<Arc<Table>, SstableError> {
        if let Some(table) = self.cache.get(path) {
            return Ok(table);
        }

        let file = self.dfs.open_random(path, Some(size))?;
        let table = Arc::new(Table::open(
            file,
            file_number,
            size,
            Arc::clone(&self.block_cache),
        )?);
        self.cache.insert(path.to_string(), Arc::clone(&table));
        Ok(table)
    }

    /// Drop the pooled handle for a deleted file.
    pub fn evict(&self, path: &str) {
        self.cache.remove(path);
    }
}

// ------------------------------------------------------------------------------------------------
// Block I/O helpers
// ------------------------------------------------------------------------------------------------

pub(crate) fn read_exact_at(
    file: &dyn RandomAccessFile,
    offset: u64,
    buf: &mut [u8],
) -> Result<(), DfsError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read_at(offset + filled as u64, &mut buf[filled..])?;
        if n == 0 {
            return Err(DfsError::Io {
                path: String::new(),
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "short read inside a table file",
                ),
            });
        }
        filled += n;
    }
    Ok(())
}

/// Read a block's payload and verify its CRC trailer.
pub(crate) fn read_verified_block(
    file: &dyn RandomAccessFile,
    file_number: u64,
    handle: BlockHandle,
) -> Result<Vec<u8>, SstableError> {
    let total = handle.size as usize + BLOCK_TRAILER_SIZE;
    let mut buf = vec![0u8; total];
    read_exact_at(file, handle.offset, &mut buf).map_err(SstableError::Dfs)?;

    let payload = &buf[..handle.size as usize];
    let stored = u32::from_le_bytes([
        buf[handle.size as usize],
        buf[handle.size as usize + 1],
        buf[handle.size as usize + 2],
        buf[handle.size as usize + 3],
    ]);

    let mut hasher = Crc32::new();
    hasher.update(payload);
    if hasher.finalize() != stored {
        return Err(SstableError::Corrupt {
            file_number,
            reason: format!("block at offset {} failed checksum", handle.offset),
        });
    }

    buf.truncate(handle.size as usize);
    Ok(buf)
}
