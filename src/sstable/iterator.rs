//! Table iteration for scans and compaction merges.
//!
//! A data block is small (≈4 KiB), so iteration decodes one block at a time
//! into an owned cell list and walks it; the block bytes themselves stay
//! shared through the block cache.

use std::sync::Arc;

use crate::encoding::Decode;
use crate::engine::key::InternalKey;

use super::{SstableError, Table};

/// Decode every `(internal key, value)` cell of one block payload.
pub(crate) fn decode_block_cells(
    block: &[u8],
    file_number: u64,
) -> Result<Vec<(InternalKey, Vec<u8>)>, SstableError> {
    let mut cells = Vec::new();
    let mut offset = 0;
    while offset < block.len() {
        let (key, n) = InternalKey::decode_from(&block[offset..]).map_err(|e| {
            SstableError::Corrupt {
                file_number,
                reason: format!("cell key at block offset {offset}: {e}"),
            }
        })?;
        offset += n;
        let (value, n) = Vec::<u8>::decode_from(&block[offset..]).map_err(|e| {
            SstableError::Corrupt {
                file_number,
                reason: format!("cell value at block offset {offset}: {e}"),
            }
        })?;
        offset += n;
        cells.push((key, value));
    }
    Ok(cells)
}

/// Streaming iterator over every cell of a table, in internal-key order.
///
/// Holds a reference to the table (and through it the file handle), so the
/// underlying storage stays open for the iterator's lifetime.
pub struct TableIter {
    table: Arc<Table>,

    /// Index of the block `cells` was decoded from.
    block_idx: usize,

    /// Decoded cells of the current block.
    cells: Vec<(InternalKey, Vec<u8>)>,

    /// Next cell to yield from `cells`.
    cell_idx: usize,

    /// Set once a block failed to load; iteration ends after reporting it.
    failed: bool,
}

impl TableIter {
    pub(crate) fn new(table: Arc<Table>) -> Self {
        Self {
            table,
            block_idx: 0,
            cells: Vec::new(),
            cell_idx: 0,
            failed: false,
        }
    }

    /// Position so the next yielded cell is the first with key ≥ `target`.
    pub fn seek(&mut self, target: &InternalKey) -> Result<(), SstableError> {
        match self.table.first_block_containing(target) {
            None => {
                // Past the last key: exhaust.
                self.block_idx = self.table.block_count();
                self.cells.clear();
                self.cell_idx = 0;
            }
            Some(block_idx) => {
                self.load_block(block_idx)?;
                self.cell_idx = self.cells.partition_point(|(key, _)| key < target);
            }
        }
        Ok(())
    }

    fn load_block(&mut self, block_idx: usize) -> Result<(), SstableError> {
        let handle = self.table.index[block_idx].handle;
        let block = self.table.read_block(handle)?;
        self.cells = decode_block_cells(&block, self.table.file_number())?;
        self.block_idx = block_idx;
        self.cell_idx = 0;
        Ok(())
    }
}

impl Iterator for TableIter {
    type Item = Result<(InternalKey, Vec<u8>), SstableError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        loop {
            if self.cell_idx < self.cells.len() {
                let cell = self.cells[self.cell_idx].clone();
                self.cell_idx += 1;
                return Some(Ok(cell));
            }

            // First call starts at block 0; afterwards advance.
            let next_block = if self.cells.is_empty() && self.block_idx == 0 {
                0
            } else {
                self.block_idx + 1
            };
            if next_block >= self.table.block_count() {
                return None;
            }
            if let Err(e) = self.load_block(next_block) {
                self.failed = true;
                return Some(Err(e));
            }
        }
    }
}
