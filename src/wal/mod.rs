//! Write-Ahead Logging (WAL) Module
//!
//! An append-only, CRC-protected record log with **32 KiB physical block
//! framing**. Every engine mutation is appended here before it touches the
//! memtable; the MANIFEST uses the same format for version edits.
//!
//! ## Design Overview
//!
//! The file is a sequence of fixed-size physical blocks. A logical record is
//! stored as one or more *fragments*, each with its own header, and a
//! fragment never crosses a block boundary. Because the framing is fixed,
//! a reader can always locate the next fragment header, and a partial tail
//! record left by a crash is detectable and truncatable without scanning
//! heuristics.
//!
//! # On-disk layout
//!
//! ```text
//! block := fragment* padding?              (block = 32 KiB)
//! fragment := [CRC32_LE (4)][LENGTH_LE (2)][KIND (1)][PAYLOAD]
//! kind ∈ { FULL, FIRST, MIDDLE, LAST }
//! ```
//!
//! - The CRC covers `KIND || PAYLOAD`.
//! - A block tail shorter than the 7-byte header is zero padding.
//! - `FULL` holds a whole record; larger records are split
//!   `FIRST, MIDDLE*, LAST` across consecutive fragments.
//!
//! # Durability model
//!
//! The writer buffers in the OS; [`WalWriter::add_record`] flushes when the
//! unflushed byte count passes a threshold or a periodic interval elapses,
//! bounding the durability window. [`WalWriter::sync`] writes through, and
//! is driven by the engine's write options.
//!
//! # Recovery guarantees
//!
//! - Replay yields exactly the prefix of records whose bytes reached disk.
//! - A torn tail (short fragment or bad CRC in the final partial region)
//!   ends replay cleanly; [`WalReader::tail_truncated`] reports it.
//! - Corruption *before* the tail is an error unless the reader was opened
//!   with `tolerate_corruption`, in which case the damaged block is skipped.

#[cfg(test)]
mod tests;

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{trace, warn};

use std::io::Read;
use std::time::{Duration, Instant};

use crate::dfs::{DfsError, SequentialFile, WritableFile};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Physical block size. Fragments never span a block boundary.
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Fragment header: crc32 (4) + length (2) + kind (1).
pub const FRAGMENT_HEADER_SIZE: usize = 7;

/// Default unflushed-byte threshold before the writer pushes to the OS.
pub const DEFAULT_FLUSH_BYTES: usize = 64 * 1024;

/// Default interval between periodic writer flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

const KIND_FULL: u8 = 1;
const KIND_FIRST: u8 = 2;
const KIND_MIDDLE: u8 = 3;
const KIND_LAST: u8 = 4;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying filesystem failure.
    #[error("dfs error: {0}")]
    Dfs(#[from] DfsError),

    /// Underlying raw I/O failure during replay.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Damaged bytes before the tail of the log.
    #[error("log corruption at offset {offset}: {reason}")]
    Corruption {
        /// Byte offset of the damaged fragment header.
        offset: u64,
        /// What failed to validate.
        reason: String,
    },

}

// ------------------------------------------------------------------------------------------------
// Writer
// ------------------------------------------------------------------------------------------------

/// Appends framed records to a log file.
///
/// Not internally synchronised: the engine serialises writers through its
/// write queue, and the MANIFEST is written under the version-set lock.
pub struct WalWriter {
    file: Box<dyn WritableFile>,

    /// Byte offset inside the current physical block.
    block_offset: usize,

    /// Bytes appended since the last flush to the OS.
    unflushed: usize,

    /// Flush when `unflushed` passes this bound.
    flush_bytes: usize,

    /// Flush when this much time passed since the last flush.
    flush_interval: Duration,

    last_flush: Instant,
}

impl WalWriter {
    /// Wrap a fresh or truncated log file.
    pub fn new(file: Box<dyn WritableFile>) -> Self {
        Self::with_flush_policy(file, DEFAULT_FLUSH_BYTES, DEFAULT_FLUSH_INTERVAL)
    }

    /// Wrap a log file with an explicit flush policy.
    pub fn with_flush_policy(
        file: Box<dyn WritableFile>,
        flush_bytes: usize,
        flush_interval: Duration,
    ) -> Self {
        Self {
            file,
            block_offset: 0,
            unflushed: 0,
            flush_bytes,
            flush_interval,
            last_flush: Instant::now(),
        }
    }

    /// Append one logical record, fragmenting across blocks as needed.
    pub fn add_record(&mut self, record: &[u8]) -> Result<(), WalError> {
        let mut remaining = record;
        let mut first = true;

        loop {
            let room = BLOCK_SIZE - self.block_offset;

            // A tail too small for a header is zero-padded; the reader
            // recognises it and moves to the next block.
            if room < FRAGMENT_HEADER_SIZE {
                if room > 0 {
                    const ZEROS: [u8; FRAGMENT_HEADER_SIZE] = [0; FRAGMENT_HEADER_SIZE];
                    self.file.append(&ZEROS[..room])?;
                    self.unflushed += room;
                }
                self.block_offset = 0;
                continue;
            }

            let payload_room = room - FRAGMENT_HEADER_SIZE;
            let take = remaining.len().min(payload_room);
            let last = take == remaining.len();

            let kind = match (first, last) {
                (true, true) => KIND_FULL,
                (true, false) => KIND_FIRST,
                (false, false) => KIND_MIDDLE,
                (false, true) => KIND_LAST,
            };

            self.emit_fragment(kind, &remaining[..take])?;
            remaining = &remaining[take..];
            first = false;

            if last {
                break;
            }
        }

        self.maybe_flush()?;
        Ok(())
    }

    fn emit_fragment(&mut self, kind: u8, payload: &[u8]) -> Result<(), WalError> {
        // The length field is u16; payload_room ≤ BLOCK_SIZE - 7 < u16::MAX.
        let len = payload.len() as u16;

        let mut hasher = Crc32::new();
        hasher.update(&[kind]);
        hasher.update(payload);
        let crc = hasher.finalize();

        let mut header = [0u8; FRAGMENT_HEADER_SIZE];
        header[..4].copy_from_slice(&crc.to_le_bytes());
        header[4..6].copy_from_slice(&len.to_le_bytes());
        header[6] = kind;

        self.file.append(&header)?;
        self.file.append(payload)?;

        self.block_offset += FRAGMENT_HEADER_SIZE + payload.len();
        self.unflushed += FRAGMENT_HEADER_SIZE + payload.len();
        Ok(())
    }

    fn maybe_flush(&mut self) -> Result<(), WalError> {
        if self.unflushed >= self.flush_bytes || self.last_flush.elapsed() >= self.flush_interval {
            self.flush()?;
        }
        Ok(())
    }

    /// Push buffered bytes to the OS.
    pub fn flush(&mut self) -> Result<(), WalError> {
        self.file.flush()?;
        self.unflushed = 0;
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Write through to stable storage.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.file.flush()?;
        self.file.sync()?;
        self.unflushed = 0;
        self.last_flush = Instant::now();
        trace!("log synced");
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

/// Replays framed records from a log file.
pub struct WalReader {
    file: Box<dyn SequentialFile>,

    /// Current physical block, refilled a block at a time.
    block: Vec<u8>,

    /// Cursor inside `block`.
    pos: usize,

    /// Offset of `block[0]` within the file.
    block_start: u64,

    /// The file is exhausted; `block[pos..]` is all that remains.
    hit_eof: bool,

    /// A torn tail record was detected and dropped.
    truncated_tail: bool,

    /// Skip damaged blocks instead of failing.
    tolerate_corruption: bool,
}

enum Fragment {
    Data(u8, Vec<u8>),
    BlockExhausted,
    Eof,
    /// Partial data at the very end of the file.
    Torn,
}

impl WalReader {
    /// Wrap a log file for replay from the start.
    pub fn new(file: Box<dyn SequentialFile>) -> Self {
        Self::with_tolerance(file, false)
    }

    /// Wrap a log file; with `tolerate_corruption`, damaged blocks are
    /// skipped with a warning instead of ending replay with an error.
    pub fn with_tolerance(file: Box<dyn SequentialFile>, tolerate_corruption: bool) -> Self {
        Self {
            file,
            block: Vec::new(),
            pos: 0,
            block_start: 0,
            hit_eof: false,
            truncated_tail: false,
            tolerate_corruption,
        }
    }

    /// True when replay ended because a partial tail record was dropped.
    pub fn tail_truncated(&self) -> bool {
        self.truncated_tail
    }

    /// Read the next logical record, or `None` at end of log.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>, WalError> {
        let mut assembled: Option<Vec<u8>> = None;

        loop {
            match self.read_fragment()? {
                Fragment::Eof => {
                    if assembled.is_some() {
                        // FIRST (+MIDDLEs) written, LAST lost in the crash.
                        self.truncated_tail = true;
                    }
                    return Ok(None);
                }
                Fragment::Torn => {
                    self.truncated_tail = true;
                    return Ok(None);
                }
                Fragment::BlockExhausted => continue,
                Fragment::Data(kind, payload) => match kind {
                    KIND_FULL if assembled.is_none() => return Ok(Some(payload)),
                    KIND_FIRST if assembled.is_none() => assembled = Some(payload),
                    KIND_MIDDLE if assembled.is_some() => {
                        if let Some(buf) = assembled.as_mut() {
                            buf.extend_from_slice(&payload);
                        }
                    }
                    KIND_LAST if assembled.is_some() => {
                        let mut record = assembled.take().unwrap_or_default();
                        record.extend_from_slice(&payload);
                        return Ok(Some(record));
                    }
                    kind => {
                        self.fail_or_skip(format!("fragment kind {kind} out of sequence"))?;
                        assembled = None;
                    }
                },
            }
        }
    }

    /// Collect every remaining record.
    pub fn read_all(&mut self) -> Result<Vec<Vec<u8>>, WalError> {
        let mut records = Vec::new();
        while let Some(record) = self.read_record()? {
            records.push(record);
        }
        Ok(records)
    }

    fn read_fragment(&mut self) -> Result<Fragment, WalError> {
        if self.block.len() - self.pos < FRAGMENT_HEADER_SIZE {
            // Writer padding is always zeros; nonzero bytes too short for a
            // header in the final short block are a torn fragment header.
            if self.hit_eof
                && self.block.len() < BLOCK_SIZE
                && self.block[self.pos..].iter().any(|&b| b != 0)
            {
                warn!(
                    offset = self.offset_of_pos(),
                    "dropping torn fragment header at log tail"
                );
                self.truncated_tail = true;
            }
            if !self.refill()? {
                return Ok(Fragment::Eof);
            }
            return Ok(Fragment::BlockExhausted);
        }

        let header = &self.block[self.pos..self.pos + FRAGMENT_HEADER_SIZE];
        let crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let len = u16::from_le_bytes([header[4], header[5]]) as usize;
        let kind = header[6];

        // An all-zero header is block padding.
        if kind == 0 && crc == 0 && len == 0 {
            self.pos = self.block.len();
            return Ok(Fragment::BlockExhausted);
        }

        let payload_start = self.pos + FRAGMENT_HEADER_SIZE;
        if payload_start + len > self.block.len() {
            if self.hit_eof {
                warn!(
                    offset = self.offset_of_pos(),
                    "dropping torn record at log tail"
                );
                return Ok(Fragment::Torn);
            }
            self.fail_or_skip("fragment length exceeds block".to_string())?;
            self.pos = self.block.len();
            return Ok(Fragment::BlockExhausted);
        }

        let payload = &self.block[payload_start..payload_start + len];
        let mut hasher = Crc32::new();
        hasher.update(&[kind]);
        hasher.update(payload);

        if hasher.finalize() != crc {
            // A bad checksum in the final partial block is a torn tail;
            // anywhere else it is damage.
            if self.hit_eof && self.block.len() < BLOCK_SIZE {
                warn!(
                    offset = self.offset_of_pos(),
                    "dropping record with torn checksum at log tail"
                );
                return Ok(Fragment::Torn);
            }
            self.fail_or_skip("fragment checksum mismatch".to_string())?;
            self.pos = self.block.len();
            return Ok(Fragment::BlockExhausted);
        }

        let payload = payload.to_vec();
        self.pos = payload_start + len;
        Ok(Fragment::Data(kind, payload))
    }

    /// Load the next physical block. Returns false at end of file.
    fn refill(&mut self) -> Result<bool, WalError> {
        if self.hit_eof {
            return Ok(false);
        }

        self.block_start += self.block.len() as u64;
        self.block.clear();
        self.block.resize(BLOCK_SIZE, 0);

        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = self.file.read(&mut self.block[filled..])?;
            if n == 0 {
                self.hit_eof = true;
                break;
            }
            filled += n;
        }
        self.block.truncate(filled);
        self.pos = 0;
        Ok(filled > 0)
    }

    fn offset_of_pos(&self) -> u64 {
        self.block_start + self.pos as u64
    }

    fn fail_or_skip(&mut self, reason: String) -> Result<(), WalError> {
        if self.tolerate_corruption {
            warn!(offset = self.offset_of_pos(), reason, "skipping damaged log block");
            Ok(())
        } else {
            Err(WalError::Corruption {
                offset: self.offset_of_pos(),
                reason,
            })
        }
    }
}
