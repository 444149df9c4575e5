//! Streaming table construction.
//!
//! [`TableBuilder`] consumes cells in internal-key order (the order every
//! flush and compaction merge produces) and writes a complete table file:
//! data blocks as they fill, then filter, index, and footer on
//! [`TableBuilder::finish`]. One data block is buffered at a time.

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use tracing::debug;

use crate::dfs::WritableFile;
use crate::encoding::{self, Encode};
use crate::engine::key::{InternalKey, ValueKind};

use super::{BLOOM_FP_RATE, BlockHandle, Footer, IndexEntry, SstableError};

/// Statistics of a finished table, destined for version metadata.
#[derive(Debug, Clone)]
pub struct TableBuildResult {
    /// Total file size in bytes.
    pub file_size: u64,

    /// Number of cells written.
    pub entries: u64,

    /// Smallest internal key, absent for an empty table.
    pub smallest: Option<InternalKey>,

    /// Largest internal key, absent for an empty table.
    pub largest: Option<InternalKey>,

    /// Share of cells that are tombstones, in percent.
    pub delete_tag_percent: u8,

    /// Microsecond timestamp below which the configured TTL percentile of
    /// cells has expired; 0 when TTL tracking is off.
    pub ttl_percentile_expiry: u64,
}

/// Builds one table file from sorted cells.
pub struct TableBuilder {
    file: Box<dyn WritableFile>,

    /// Target payload size of a data block.
    block_size: usize,

    /// Cells buffered for the current block.
    block_buf: Vec<u8>,

    /// Last key added to the current block.
    block_last_key: Option<InternalKey>,

    /// Completed index entries.
    index: Vec<IndexEntry>,

    /// Current write offset.
    offset: u64,

    /// User keys fed to the bloom filter at finish.
    bloom_keys: Vec<Vec<u8>>,

    entries: u64,
    deletions: u64,
    smallest: Option<InternalKey>,
    largest: Option<InternalKey>,

    /// Expiry timestamps of TTL-carrying cells, for the percentile stat.
    ttl_expiries: Vec<u64>,
}

impl TableBuilder {
    /// Start building into `file` with the given data-block target size.
    pub fn new(file: Box<dyn WritableFile>, block_size: usize) -> Self {
        Self {
            file,
            block_size: block_size.max(128),
            block_buf: Vec::new(),
            block_last_key: None,
            index: Vec::new(),
            offset: 0,
            bloom_keys: Vec::new(),
            entries: 0,
            deletions: 0,
            smallest: None,
            largest: None,
            ttl_expiries: Vec::new(),
        }
    }

    /// Append one cell. Keys must arrive in strictly ascending
    /// internal-key order.
    pub fn add(&mut self, key: &InternalKey, value: &[u8]) -> Result<(), SstableError> {
        self.add_with_expiry(key, value, 0)
    }

    /// Append one cell carrying a TTL expiry timestamp (0 = no TTL).
    pub fn add_with_expiry(
        &mut self,
        key: &InternalKey,
        value: &[u8],
        expires_at: u64,
    ) -> Result<(), SstableError> {
        key.encode_to(&mut self.block_buf)?;
        value.to_vec().encode_to(&mut self.block_buf)?;

        if self.smallest.is_none() {
            self.smallest = Some(key.clone());
        }
        self.largest = Some(key.clone());
        self.block_last_key = Some(key.clone());

        if self
            .bloom_keys
            .last()
            .is_none_or(|last| *last != key.user_key)
        {
            self.bloom_keys.push(key.user_key.clone());
        }

        self.entries += 1;
        if key.kind == ValueKind::Deletion {
            self.deletions += 1;
        }
        if expires_at != 0 {
            self.ttl_expiries.push(expires_at);
        }

        if self.block_buf.len() >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Bytes written so far plus the buffered block.
    pub fn current_size(&self) -> u64 {
        self.offset + self.block_buf.len() as u64
    }

    /// Number of cells added so far.
    pub fn entry_count(&self) -> u64 {
        self.entries
    }

    fn flush_block(&mut self) -> Result<(), SstableError> {
        if self.block_buf.is_empty() {
            return Ok(());
        }
        let payload = std::mem::take(&mut self.block_buf);
        let handle = self.write_checksummed(&payload)?;

        let last_key = self.block_last_key.take().ok_or_else(|| {
            SstableError::Internal("non-empty block without a last key".into())
        })?;
        self.index.push(IndexEntry { last_key, handle });
        Ok(())
    }

    fn write_checksummed(&mut self, payload: &[u8]) -> Result<BlockHandle, SstableError> {
        let mut hasher = Crc32::new();
        hasher.update(payload);
        let crc = hasher.finalize();

        let handle = BlockHandle {
            offset: self.offset,
            size: payload.len() as u64,
        };
        self.file.append(payload)?;
        self.file.append(&crc.to_le_bytes())?;
        self.offset += payload.len() as u64 + 4;
        Ok(handle)
    }

    /// Flush the final block, write filter + index + footer, and sync.
    pub fn finish(mut self) -> Result<TableBuildResult, SstableError> {
        self.flush_block()?;

        // Filter block: one bloom over the table's distinct user keys.
        let filter_bytes = if self.bloom_keys.is_empty() {
            Vec::new()
        } else {
            let mut bloom = Bloom::new_for_fp_rate(self.bloom_keys.len(), BLOOM_FP_RATE)
                .map_err(|e| SstableError::Internal(e.to_string()))?;
            for key in &self.bloom_keys {
                bloom.set(key);
            }
            bloom.as_slice().to_vec()
        };
        let filter = self.write_checksummed(&filter_bytes)?;

        // Index block.
        let mut index_bytes = Vec::new();
        encoding::encode_vec(&self.index, &mut index_bytes)?;
        let index = self.write_checksummed(&index_bytes)?;

        // Footer.
        let footer = Footer { filter, index }.encode()?;
        self.file.append(&footer)?;
        self.offset += footer.len() as u64;
        self.file.sync()?;

        let delete_tag_percent = if self.entries == 0 {
            0
        } else {
            ((self.deletions * 100) / self.entries) as u8
        };

        // 90th-percentile expiry of TTL-carrying cells.
        let ttl_percentile_expiry = if self.ttl_expiries.is_empty() {
            0
        } else {
            let mut expiries = std::mem::take(&mut self.ttl_expiries);
            expiries.sort_unstable();
            let idx = (expiries.len() * 9 / 10).min(expiries.len() - 1);
            expiries[idx]
        };

        debug!(
            entries = self.entries,
            blocks = self.index.len(),
            size = self.offset,
            "table built"
        );

        Ok(TableBuildResult {
            file_size: self.offset,
            entries: self.entries,
            smallest: self.smallest,
            largest: self.largest,
            delete_tag_percent,
            ttl_percentile_expiry,
        })
    }
}
