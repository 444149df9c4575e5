//! # LSM Engine
//!
//! One engine per locality group: a durable, ordered key-value store with
//! snapshot reads, range scans, leveled background compaction, rollback
//! windows, on-line schema reload, split-key discovery, and crash recovery.
//!
//! ## Design Overview
//!
//! State lives in three places, queried newest-first:
//!
//! 1. the **mutable memtable** (backed by the live WAL segment),
//! 2. the **immutable memtable**, frozen and awaiting flush,
//! 3. **table files** at levels `0..7` described by the current
//!    [`Version`](version::Version).
//!
//! ## Write discipline
//!
//! Writers pass through a single FIFO ticket queue: each writer waits for
//! its turn, and only the writer at the head appends to the WAL, inserts
//! into the memtable, and advances the sequence counter. This queue is the
//! sole mechanism serialising memtable switches and version installs
//! against writes — no writer ever holds the WAL and the MANIFEST at once.
//!
//! When level 0 grows past the slowdown trigger each write is delayed once
//! by ~1 ms; past the stop trigger, writers wait on the background
//! condition until compaction drains level 0.
//!
//! ## Background work
//!
//! Flushes and compactions run on the shared compaction pool when one is
//! configured, and inline (synchronously, from the write path or explicit
//! calls) when not. Background errors are retried with exponential backoff
//! capped at 8 s; after the retry bound, or immediately on a
//! permission-denied failure, the engine marks itself **force-unload** and
//! stops scheduling work.
//!
//! ## Concurrency Model
//!
//! A single mutex guards the engine core (memtables, version set, snapshot
//! multiset, rollback map, pending outputs); the write queue has its own
//! lock, and reads only take the core lock long enough to clone `Arc`s.

pub mod compaction;
pub mod key;
pub mod version;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::dfs::{Dfs, DfsError};
use crate::encoding::{Decode, Encode, EncodingError};
use crate::memtable::{MemTable, MemTableError, MemTableGet, MemTableKind};
use crate::sstable::{
    SstableError, TableBuilder, TableCache, TableGet,
};
use crate::threadpool::ThreadPool;
use crate::wal::{WalError, WalReader, WalWriter};

use compaction::{
    CompactionError, CompactionJob, CompactionReason, StrategyKind, StrategyLimits,
    pick_compaction, run_compaction,
};
use key::{
    InternalKey, LookupKey, MAX_SEQUENCE, Rollbacks, SequenceNumber, ValueKind, is_rolled_back,
};
use version::{
    EngineFile, FileMeta, L0_SLOWDOWN_TRIGGER, L0_STOP_TRIGGER, NUM_LEVELS, VersionEdit,
    VersionError, VersionSet, log_file_path, parse_engine_file, table_file_path,
};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem failure.
    #[error("dfs error: {0}")]
    Dfs(#[from] DfsError),

    /// WAL failure.
    #[error("wal error: {0}")]
    Wal(#[from] WalError),

    /// Version-set / MANIFEST failure.
    #[error("version error: {0}")]
    Version(#[from] VersionError),

    /// Table read/build failure.
    #[error("sstable error: {0}")]
    Sstable(#[from] SstableError),

    /// Memtable failure.
    #[error("memtable error: {0}")]
    MemTable(#[from] MemTableError),

    /// Encoding failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A stored background error now failing writes fast.
    #[error("background error: {0}")]
    Background(String),

    /// The engine declared itself unrecoverable.
    #[error("engine force-unloaded: {0}")]
    ForceUnload(String),

    /// Internal invariant violation (poisoned lock, bad state).
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Options
// ------------------------------------------------------------------------------------------------

/// Per-engine tuning and schema-derived settings.
///
/// The schema-derived subset (`max_versions`, `ttl_micros`, `strategy`,
/// `bloom_enabled`, `compression_id`) is swappable at runtime by
/// [`LsmEngine::apply_schema`]; in-flight background jobs finish under the
/// values they started with.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Memtable size that freezes it for flush.
    pub write_buffer_size: usize,

    /// WAL bytes that force a flush even below the memtable bound.
    pub wal_size_limit: u64,

    /// Data-block payload target for new tables.
    pub block_size: usize,

    /// Output-file size bound for compaction.
    pub max_output_file_size: u64,

    /// Memtable layout.
    pub memtable_kind: MemTableKind,

    /// Versions kept per user key (0 = unlimited).
    pub max_versions: u32,

    /// Cell TTL in microseconds (0 = off).
    pub ttl_micros: u64,

    /// Trailing 8 bytes of user keys carry the inverted cell timestamp.
    pub timestamped_keys: bool,

    /// Compaction strategy family.
    pub strategy: StrategyKind,

    /// Drop base-level tombstones with nothing left to shadow.
    pub drop_base_level_del: bool,

    /// Bloom filters on new tables.
    pub bloom_enabled: bool,

    /// Compression algorithm id recorded for new tables (0 = none; the id
    /// is preserved on disk so a codec can be added without a format
    /// change).
    pub compression_id: u8,

    /// Parallel shards for large compactions (1 = inline).
    pub sub_compactions: usize,

    /// Create the engine directory when nothing exists yet.
    pub create_if_missing: bool,

    /// Tolerate missing/damaged state at open by editing it out.
    pub ignore_corruption_in_open: bool,

    /// Skip damaged inputs during compaction instead of failing.
    pub ignore_corruption_in_compaction: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            write_buffer_size: 4 * 1024 * 1024,
            wal_size_limit: 32 * 1024 * 1024,
            block_size: crate::sstable::DEFAULT_BLOCK_SIZE,
            max_output_file_size: 2 * 1024 * 1024,
            memtable_kind: MemTableKind::Single,
            max_versions: 0,
            ttl_micros: 0,
            timestamped_keys: false,
            strategy: StrategyKind::CheckTag,
            drop_base_level_del: true,
            bloom_enabled: true,
            compression_id: 0,
            sub_compactions: 1,
            create_if_missing: true,
            ignore_corruption_in_open: false,
            ignore_corruption_in_compaction: false,
        }
    }
}

/// Durability of one write call.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Fsync the WAL before acknowledging.
    pub sync: bool,
}

/// One mutation inside a write batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    /// Value or tombstone.
    pub kind: ValueKind,

    /// User key (already packed by the tablet layer).
    pub key: Vec<u8>,

    /// Value bytes (empty for tombstones).
    pub value: Vec<u8>,

    /// Caller-supplied sequence; `None` lets the engine assign one.
    pub sequence: Option<SequenceNumber>,
}

impl WriteRecord {
    /// A plain put.
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: ValueKind::Value,
            key: key.into(),
            value: value.into(),
            sequence: None,
        }
    }

    /// A point delete.
    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: ValueKind::Deletion,
            key: key.into(),
            value: Vec::new(),
            sequence: None,
        }
    }
}

// WAL batch record: [count u32] then per record [kind u8][seq u64][key][value].
fn encode_batch(records: &[(SequenceNumber, &WriteRecord)]) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::new();
    (records.len() as u32).encode_to(&mut buf)?;
    for (sequence, record) in records {
        (record.kind as u8).encode_to(&mut buf)?;
        sequence.encode_to(&mut buf)?;
        record.key.encode_to(&mut buf)?;
        record.value.encode_to(&mut buf)?;
    }
    Ok(buf)
}

fn decode_batch(
    bytes: &[u8],
) -> Result<Vec<(SequenceNumber, ValueKind, Vec<u8>, Vec<u8>)>, EncodingError> {
    let (count, mut offset) = u32::decode_from(bytes)?;
    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (kind_byte, n) = u8::decode_from(&bytes[offset..])?;
        offset += n;
        let kind = ValueKind::from_u8(kind_byte).ok_or(EncodingError::InvalidTag {
            tag: u32::from(kind_byte),
            type_name: "ValueKind",
        })?;
        let (sequence, n) = u64::decode_from(&bytes[offset..])?;
        offset += n;
        let (user_key, n) = Vec::<u8>::decode_from(&bytes[offset..])?;
        offset += n;
        let (value, n) = Vec::<u8>::decode_from(&bytes[offset..])?;
        offset += n;
        records.push((sequence, kind, user_key, value));
    }
    Ok(records)
}

// ------------------------------------------------------------------------------------------------
// Scans
// ------------------------------------------------------------------------------------------------

/// Parameters of one scan page.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Inclusive start of user-key space.
    pub start: Vec<u8>,

    /// Exclusive end; empty = unbounded.
    pub end: Vec<u8>,

    /// Snapshot to read at; `None` = latest.
    pub snapshot: Option<SequenceNumber>,

    /// Stop after roughly this many value bytes (0 = unbounded).
    pub byte_budget: usize,

    /// Stop after this many cells (0 = unbounded).
    pub row_budget: usize,

    /// Versions returned per user key (0 = engine default).
    pub max_versions: u32,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            start: Vec::new(),
            end: Vec::new(),
            snapshot: None,
            byte_budget: 0,
            row_budget: 0,
            max_versions: 0,
        }
    }
}

/// One page of scan results.
#[derive(Debug)]
pub struct ScanPage {
    /// Visible cells in key order.
    pub cells: Vec<(Vec<u8>, Vec<u8>)>,

    /// True when a budget cut the page short.
    pub more: bool,

    /// Resume point for the next page when `more`.
    pub next_start: Option<Vec<u8>>,
}

// ------------------------------------------------------------------------------------------------
// Engine state machine
// ------------------------------------------------------------------------------------------------

/// Lifecycle of one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed, not yet recovered.
    Init,
    /// Recovered and serving.
    Opened,
    /// Unrecoverable; the owner must unload the tablet.
    ForceUnload,
}

/// Retry bound before a failing background job becomes force-unload.
const BG_RETRY_BOUND: u32 = 16;

/// Backoff cap between background retries.
const BG_BACKOFF_CAP: Duration = Duration::from_secs(8);

// ------------------------------------------------------------------------------------------------
// Core
// ------------------------------------------------------------------------------------------------

struct EngineCore {
    mem: Arc<MemTable>,
    imm: Option<Arc<MemTable>>,

    versions: VersionSet,

    /// Live WAL writer and its file number.
    log: Option<WalWriter>,
    log_number: u64,

    /// Bytes appended to the live WAL segment.
    wal_bytes: u64,

    /// Pinned snapshots (multiset as sequence → count).
    snapshots: BTreeMap<SequenceNumber, usize>,

    /// Rollback windows.
    rollbacks: Rollbacks,

    /// Output files being written by in-flight jobs; protected from GC.
    pending_outputs: HashSet<u64>,

    /// File charged by the read path, awaiting a seek compaction.
    file_to_compact: Option<(usize, Arc<FileMeta>)>,

    /// Requested manual range, `[start, end)`.
    manual_request: Option<(Vec<u8>, Vec<u8>)>,

    /// A background task is queued or running.
    bg_scheduled: bool,

    /// A flush or compaction is mutating the file set right now. Flush
    /// and compaction are mutually exclusive, like a single background
    /// thread: their edits assume the version they started from.
    bg_running: bool,

    /// Sticky background failure; writes observe it and fail fast.
    bg_error: Option<String>,

    /// Consecutive background failures, for backoff and the unload bound.
    bg_retries: u32,

    state: EngineState,
}

struct WriteQueue {
    next_ticket: u64,
    serving: u64,
}

struct EngineInner {
    dfs: Arc<dyn Dfs>,
    dir: String,

    opts: RwLock<EngineOptions>,
    table_cache: Arc<TableCache>,

    core: Mutex<EngineCore>,

    /// Signalled when background work finishes or memtable room appears.
    bg_cv: Condvar,

    write_queue: Mutex<WriteQueue>,
    write_cv: Condvar,

    compact_pool: Option<Arc<ThreadPool>>,

    shutdown: AtomicBool,
}

/// Cloneable handle to one locality group's LSM engine.
pub struct LsmEngine {
    inner: Arc<EngineInner>,
}

impl Clone for LsmEngine {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl LsmEngine {
    // --------------------------------------------------------------------------------------------
    // Open / recovery
    // --------------------------------------------------------------------------------------------

    /// Open (or create, or inherit) the engine at `dir`.
    ///
    /// `parents` are parent-tablet engine directories for split/merge
    /// children; `snapshots` and `rollbacks` restore state the coordinator
    /// tracked across a move.
    pub fn open(
        dfs: Arc<dyn Dfs>,
        dir: impl Into<String>,
        opts: EngineOptions,
        table_cache: Arc<TableCache>,
        compact_pool: Option<Arc<ThreadPool>>,
        parents: &[String],
        snapshots: &[SequenceNumber],
        rollbacks: Rollbacks,
    ) -> Result<Self, EngineError> {
        let dir = dir.into();
        let mut versions = VersionSet::new(Arc::clone(&dfs), dir.clone());
        versions.recover(
            parents,
            opts.create_if_missing,
            opts.ignore_corruption_in_open,
        )?;

        let mut core = EngineCore {
            mem: Arc::new(MemTable::new(opts.memtable_kind)),
            imm: None,
            versions,
            log: None,
            log_number: 0,
            wal_bytes: 0,
            snapshots: BTreeMap::new(),
            rollbacks,
            pending_outputs: HashSet::new(),
            file_to_compact: None,
            manual_request: None,
            bg_scheduled: false,
            bg_running: false,
            bg_error: None,
            bg_retries: 0,
            state: EngineState::Init,
        };
        for &snapshot in snapshots {
            *core.snapshots.entry(snapshot).or_insert(0) += 1;
        }

        let engine = Self {
            inner: Arc::new(EngineInner {
                dfs,
                dir,
                opts: RwLock::new(opts),
                table_cache,
                core: Mutex::new(core),
                bg_cv: Condvar::new(),
                write_queue: Mutex::new(WriteQueue {
                    next_ticket: 0,
                    serving: 0,
                }),
                write_cv: Condvar::new(),
                compact_pool,
                shutdown: AtomicBool::new(false),
            }),
        };
        engine.replay_logs()?;
        engine.delete_obsolete_files()?;
        info!(dir = %engine.inner.dir, "engine opened");
        Ok(engine)
    }

    /// Replay WAL segments at or above the recovered log number, flushing
    /// the recovery memtable whenever it outgrows the write buffer, then
    /// start a fresh segment.
    fn replay_logs(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        let (tolerate, write_buffer) = {
            let opts = self.opts();
            (opts.ignore_corruption_in_open, opts.write_buffer_size)
        };

        let mut log_numbers: Vec<u64> = Vec::new();
        if let Ok(names) = inner.dfs.list(&inner.dir) {
            let floor = {
                let core = self.core()?;
                core.versions.log_number
            };
            for name in names {
                if let EngineFile::Log(number) = parse_engine_file(&name) {
                    if number >= floor {
                        log_numbers.push(number);
                    }
                }
            }
        }
        log_numbers.sort_unstable();

        let mut max_sequence: SequenceNumber = 0;
        let mut replayed = 0usize;
        for number in &log_numbers {
            let path = log_file_path(&inner.dir, *number);
            let file = inner.dfs.open_sequential(&path)?;
            let mut reader = WalReader::with_tolerance(file, tolerate);

            while let Some(record) = reader.read_record()? {
                let batch = decode_batch(&record)?;
                let mut core = self.core()?;
                for (sequence, kind, user_key, value) in batch {
                    core.mem.add(sequence, kind, &user_key, &value)?;
                    if sequence > max_sequence {
                        max_sequence = sequence;
                    }
                    replayed += 1;
                }

                if core.mem.approximate_memory_usage() >= write_buffer {
                    let full = Arc::clone(&core.mem);
                    full.set_being_flushed(true);
                    core.imm = Some(full);
                    core.mem = Arc::new(MemTable::new(self.opts().memtable_kind));
                    drop(core);
                    self.flush_imm()?;
                } else {
                    drop(core);
                }
            }
            if reader.tail_truncated() {
                warn!(path, "torn tail dropped during log replay");
            }
        }

        // Persist everything replayed BEFORE advancing the replay floor;
        // a crash in between must still find the old segments covered.
        {
            let mut core = self.core()?;
            if max_sequence > core.versions.last_sequence {
                core.versions.last_sequence = max_sequence;
            }
            let leftover = !core.mem.is_empty();
            if leftover && core.imm.is_none() {
                let full = Arc::clone(&core.mem);
                full.set_being_flushed(true);
                core.imm = Some(full);
                let kind = self.opts().memtable_kind;
                core.mem = Arc::new(MemTable::new(kind));
            }
        }
        let has_imm = { self.core()?.imm.is_some() };
        if has_imm {
            self.flush_imm()?;
        }

        // Cut over to a fresh segment and advance the replay floor.
        let mut core = self.core()?;
        let new_log = core.versions.new_file_number();
        let path = log_file_path(&inner.dir, new_log);
        core.log = Some(WalWriter::new(inner.dfs.create(&path)?));
        core.log_number = new_log;
        core.wal_bytes = 0;

        let mut edit = VersionEdit {
            log_number: Some(new_log),
            ..Default::default()
        };
        core.versions.log_and_apply(&mut edit)?;
        core.state = EngineState::Opened;
        drop(core);

        debug!(dir = %inner.dir, segments = log_numbers.len(), records = replayed, "log replay finished");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Accessors
    // --------------------------------------------------------------------------------------------

    fn core(&self) -> Result<std::sync::MutexGuard<'_, EngineCore>, EngineError> {
        self.inner
            .core
            .lock()
            .map_err(|_| EngineError::Internal("engine mutex poisoned".into()))
    }

    fn opts(&self) -> EngineOptions {
        self.inner
            .opts
            .read()
            .map(|opts| opts.clone())
            .unwrap_or_default()
    }

    /// The engine's directory.
    pub fn dir(&self) -> &str {
        &self.inner.dir
    }

    /// Highest sequence stamped on an acknowledged write.
    pub fn last_sequence(&self) -> SequenceNumber {
        self.core().map(|core| core.versions.last_sequence).unwrap_or(0)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.core().map(|core| core.state).unwrap_or(EngineState::Init)
    }

    /// The sticky background error, if any.
    pub fn background_error(&self) -> Option<String> {
        self.core().ok().and_then(|core| core.bg_error.clone())
    }

    /// True once the engine declared itself unrecoverable.
    pub fn is_force_unload(&self) -> bool {
        self.state() == EngineState::ForceUnload
    }

    /// Approximate on-disk size plus memtable footprint.
    pub fn approximate_size(&self) -> u64 {
        match self.core() {
            Ok(core) => {
                let version = core.versions.current();
                let files: u64 = (0..NUM_LEVELS).map(|l| version.level_bytes(l)).sum();
                files
                    + core.mem.approximate_memory_usage() as u64
                    + core
                        .imm
                        .as_ref()
                        .map(|m| m.approximate_memory_usage() as u64)
                        .unwrap_or(0)
            }
            Err(_) => 0,
        }
    }

    /// Per-level file counts, for metrics.
    pub fn level_summary(&self) -> String {
        self.core()
            .map(|core| core.versions.current().level_summary())
            .unwrap_or_else(|_| "[]".into())
    }

    /// Paths of referenced files living in parent-tablet directories.
    /// The table-level trash collector must preserve these.
    pub fn inherited_files(&self) -> Vec<String> {
        match self.core() {
            Ok(core) => {
                let version = core.versions.current();
                version
                    .files
                    .iter()
                    .flatten()
                    .filter(|file| file.dir != self.inner.dir)
                    .map(|file| file.path())
                    .collect()
            }
            Err(_) => Vec::new(),
        }
    }

    fn strategy_limits(&self, opts: &EngineOptions) -> StrategyLimits {
        StrategyLimits {
            max_versions: opts.max_versions,
            ttl_micros: opts.ttl_micros,
            now_micros: now_micros(),
            timestamped_keys: opts.timestamped_keys,
        }
    }

    // --------------------------------------------------------------------------------------------
    // Write path
    // --------------------------------------------------------------------------------------------

    /// Apply a batch of mutations.
    ///
    /// Records are stamped with server-assigned sequences unless they carry
    /// their own; the batch is WAL-appended, then memtable-inserted, and
    /// the last-sequence watermark advances only after both.
    pub fn write(
        &self,
        records: &[WriteRecord],
        options: &WriteOptions,
    ) -> Result<SequenceNumber, EngineError> {
        if records.is_empty() {
            return Ok(self.last_sequence());
        }

        let ticket = self.enter_write_queue()?;
        let result = self.write_locked(records, options);
        self.leave_write_queue(ticket);
        result
    }

    fn enter_write_queue(&self) -> Result<u64, EngineError> {
        let mut queue = self
            .inner
            .write_queue
            .lock()
            .map_err(|_| EngineError::Internal("write queue poisoned".into()))?;
        let ticket = queue.next_ticket;
        queue.next_ticket += 1;
        while queue.serving != ticket {
            queue = self
                .inner
                .write_cv
                .wait(queue)
                .map_err(|_| EngineError::Internal("write queue poisoned".into()))?;
        }
        Ok(ticket)
    }

    fn leave_write_queue(&self, ticket: u64) {
        if let Ok(mut queue) = self.inner.write_queue.lock() {
            debug_assert_eq!(queue.serving, ticket);
            queue.serving = ticket + 1;
        }
        self.inner.write_cv.notify_all();
    }

    /// The head writer's critical section.
    fn write_locked(
        &self,
        records: &[WriteRecord],
        options: &WriteOptions,
    ) -> Result<SequenceNumber, EngineError> {
        self.make_room_for_write()?;

        let mut core = self.core()?;
        if let Some(bg_error) = &core.bg_error {
            return Err(EngineError::Background(bg_error.clone()));
        }
        if core.state == EngineState::ForceUnload {
            return Err(EngineError::ForceUnload(
                core.bg_error.clone().unwrap_or_default(),
            ));
        }

        // Stamp sequences. Holding the head-writer turn makes this the
        // only thread advancing the counter.
        let mut last = core.versions.last_sequence;
        let mut stamped: Vec<(SequenceNumber, &WriteRecord)> = Vec::with_capacity(records.len());
        for record in records {
            let sequence = match record.sequence {
                Some(sequence) => {
                    if sequence > last {
                        last = sequence;
                    }
                    sequence
                }
                None => {
                    last += 1;
                    last
                }
            };
            stamped.push((sequence, record));
        }

        // WAL first; the memtable is untouched if the append fails.
        let batch = encode_batch(&stamped)?;
        let batch_len = batch.len() as u64;
        let log = core
            .log
            .as_mut()
            .ok_or_else(|| EngineError::Internal("engine has no live log".into()))?;
        log.add_record(&batch)?;
        if options.sync {
            log.sync()?;
        }
        core.wal_bytes += batch_len;

        let mem = Arc::clone(&core.mem);
        for (sequence, record) in &stamped {
            mem.add(*sequence, record.kind, &record.key, &record.value)?;
        }
        core.versions.last_sequence = last;
        Ok(last)
    }

    /// Ensure the mutable memtable can take another batch, freezing and
    /// flushing as needed. Runs under the head-writer turn.
    fn make_room_for_write(&self) -> Result<(), EngineError> {
        let opts = self.opts();
        let mut slowdown_done = false;

        loop {
            let mut core = self.core()?;
            if let Some(bg_error) = &core.bg_error {
                return Err(EngineError::Background(bg_error.clone()));
            }

            let l0_files = core.versions.current().level_len(0);

            // Soft slowdown: one ~1 ms delay per write while level 0 is
            // over the trigger, giving compaction a chance to keep up.
            if l0_files >= L0_SLOWDOWN_TRIGGER && !slowdown_done {
                drop(core);
                std::thread::sleep(Duration::from_millis(1));
                slowdown_done = true;
                continue;
            }

            let mem_full = core.mem.approximate_memory_usage() >= opts.write_buffer_size;
            let wal_full = core.wal_bytes >= opts.wal_size_limit;
            if !mem_full && !wal_full {
                return Ok(());
            }

            if core.imm.is_some() {
                // Previous flush still pending.
                if self.inner.compact_pool.is_some() {
                    self.maybe_schedule_compaction(&mut core);
                    let (guard, _timeout) = self
                        .inner
                        .bg_cv
                        .wait_timeout(core, Duration::from_millis(100))
                        .map_err(|_| EngineError::Internal("engine mutex poisoned".into()))?;
                    drop(guard);
                } else {
                    drop(core);
                    self.flush_imm()?;
                }
                continue;
            }

            if l0_files >= L0_STOP_TRIGGER {
                warn!(dir = %self.inner.dir, l0_files, "write stopped on level-0 backlog");
                if self.inner.compact_pool.is_some() {
                    self.maybe_schedule_compaction(&mut core);
                    let (guard, _timeout) = self
                        .inner
                        .bg_cv
                        .wait_timeout(core, Duration::from_millis(100))
                        .map_err(|_| EngineError::Internal("engine mutex poisoned".into()))?;
                    drop(guard);
                } else {
                    drop(core);
                    self.compact_once()?;
                }
                continue;
            }

            // Freeze: switch to a fresh WAL segment and memtable; the old
            // pair becomes the immutable flush input.
            let new_log = core.versions.new_file_number();
            let path = log_file_path(&self.inner.dir, new_log);
            let writer = WalWriter::new(self.inner.dfs.create(&path)?);
            if let Some(mut old_log) = core.log.take() {
                old_log.sync()?;
            }
            core.log = Some(writer);
            core.log_number = new_log;
            core.wal_bytes = 0;

            let full = Arc::clone(&core.mem);
            full.set_being_flushed(true);
            core.imm = Some(full);
            core.mem = Arc::new(MemTable::new(opts.memtable_kind));
            debug!(dir = %self.inner.dir, new_log, "memtable frozen");

            if self.inner.compact_pool.is_some() {
                self.maybe_schedule_compaction(&mut core);
                drop(core);
            } else {
                drop(core);
                self.flush_imm()?;
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Flush
    // --------------------------------------------------------------------------------------------

    /// Freeze the mutable memtable (if non-empty) and flush everything to
    /// level files. Explicit-flush entry point.
    pub fn flush(&self) -> Result<(), EngineError> {
        {
            let mut core = self.core()?;
            if core.imm.is_none() && !core.mem.is_empty() {
                let new_log = core.versions.new_file_number();
                let path = log_file_path(&self.inner.dir, new_log);
                let writer = WalWriter::new(self.inner.dfs.create(&path)?);
                if let Some(mut old_log) = core.log.take() {
                    old_log.sync()?;
                }
                core.log = Some(writer);
                core.log_number = new_log;
                core.wal_bytes = 0;

                let full = Arc::clone(&core.mem);
                full.set_being_flushed(true);
                core.imm = Some(full);
                let kind = self.opts().memtable_kind;
                core.mem = Arc::new(MemTable::new(kind));
            }
        }
        let has_imm = { self.core()?.imm.is_some() };
        if has_imm {
            self.flush_imm()?;
        }
        Ok(())
    }

    /// Write the immutable memtable as a level file and install the edit.
    fn flush_imm(&self) -> Result<(), EngineError> {
        let (imm, number, log_floor) = {
            let mut core = self.acquire_bg_slot()?;
            let Some(imm) = core.imm.clone() else {
                core.bg_running = false;
                return Ok(());
            };
            let number = core.versions.new_file_number();
            core.pending_outputs.insert(number);
            (imm, number, core.log_number)
        };

        let opts = self.opts();
        let limits = self.strategy_limits(&opts);
        let result = self.build_table_from_mem(&imm, number, &opts, &limits);

        let mut core = self.core()?;
        core.bg_running = false;
        core.pending_outputs.remove(&number);
        let meta = match result {
            Ok(meta) => meta,
            Err(e) => {
                drop(core);
                self.inner.bg_cv.notify_all();
                let path = table_file_path(&self.inner.dir, number);
                let _ = self.inner.dfs.delete(&path);
                return Err(e);
            }
        };

        let mut edit = VersionEdit {
            log_number: Some(log_floor),
            ..Default::default()
        };
        if let Some(meta) = meta {
            let level = core
                .versions
                .current()
                .pick_level_for_output(&meta.smallest.user_key, &meta.largest.user_key);
            debug!(dir = %self.inner.dir, file = meta.number, level, entries = meta.entries, "memtable flushed");
            edit.added_files.push((level as u32, meta));
        }
        core.versions.log_and_apply(&mut edit)?;
        core.imm = None;
        core.bg_retries = 0;
        drop(core);

        self.inner.bg_cv.notify_all();
        self.delete_obsolete_files()?;
        Ok(())
    }

    /// Serialize a memtable into a new table file. Returns `None` when the
    /// memtable had nothing visible to persist.
    fn build_table_from_mem(
        &self,
        mem: &MemTable,
        number: u64,
        opts: &EngineOptions,
        limits: &StrategyLimits,
    ) -> Result<Option<FileMeta>, EngineError> {
        let entries = mem.collect_all()?;
        if entries.is_empty() {
            return Ok(None);
        }

        let path = table_file_path(&self.inner.dir, number);
        let file = self.inner.dfs.create(&path)?;
        let mut builder = TableBuilder::new(file, opts.block_size);
        for (key, value) in &entries {
            let expiry = if opts.ttl_micros != 0 {
                limits
                    .timestamp_of(&key.user_key)
                    .map(|ts| ts.saturating_add(opts.ttl_micros))
                    .unwrap_or(0)
            } else {
                0
            };
            builder.add_with_expiry(key, value, expiry)?;
        }
        let result = builder.finish()?;
        let (Some(smallest), Some(largest)) = (result.smallest, result.largest) else {
            return Ok(None);
        };

        Ok(Some(FileMeta {
            number,
            dir: self.inner.dir.clone(),
            size: result.file_size,
            entries: result.entries,
            smallest,
            largest,
            delete_tag_percent: result.delete_tag_percent,
            ttl_percentile_expiry: result.ttl_percentile_expiry,
            allowed_seeks: std::sync::atomic::AtomicI64::new(
                ((result.file_size / 16_384) as i64).max(100),
            ),
        }))
    }

    // --------------------------------------------------------------------------------------------
    // Read path
    // --------------------------------------------------------------------------------------------

    /// Point lookup at `snapshot` (`None` = latest).
    pub fn get(
        &self,
        user_key: &[u8],
        snapshot: Option<SequenceNumber>,
    ) -> Result<Option<Vec<u8>>, EngineError> {
        let opts = self.opts();
        let limits = self.strategy_limits(&opts);

        // Strategy drop at read time: an expired cell is absent even while
        // physically present.
        if opts.ttl_micros != 0 && limits.timestamp_of(user_key).is_some_and(|ts| {
            ts.saturating_add(opts.ttl_micros) <= limits.now_micros
        }) {
            return Ok(None);
        }

        let (mem, imm, current, rollbacks, snapshot) = {
            let core = self.core()?;
            (
                Arc::clone(&core.mem),
                core.imm.clone(),
                core.versions.current(),
                core.rollbacks.clone(),
                snapshot.unwrap_or(MAX_SEQUENCE),
            )
        };
        let lookup = LookupKey::at(user_key, snapshot);

        match mem.get(&lookup, &rollbacks)? {
            MemTableGet::Found(value) => return Ok(Some(value)),
            MemTableGet::Deleted => return Ok(None),
            MemTableGet::NotFound => {}
        }
        if let Some(imm) = imm {
            match imm.get(&lookup, &rollbacks)? {
                MemTableGet::Found(value) => return Ok(Some(value)),
                MemTableGet::Deleted => return Ok(None),
                MemTableGet::NotFound => {}
            }
        }

        // Table probes, charging the first file once a second file had to
        // be consulted.
        let mut first_probed: Option<(usize, Arc<FileMeta>)> = None;
        let mut probes = 0usize;
        for (level, file) in current.files_for_get(user_key) {
            let table =
                self.inner
                    .table_cache
                    .get_table(file.number, &file.path(), file.size)?;
            if !table.may_contain(user_key) {
                continue;
            }
            probes += 1;
            if probes == 1 {
                first_probed = Some((level, Arc::clone(&file)));
            } else if probes == 2 {
                if let Some((first_level, first_file)) = &first_probed {
                    let remaining = first_file
                        .allowed_seeks
                        .fetch_sub(1, Ordering::Relaxed);
                    if remaining <= 1 {
                        let mut core = self.core()?;
                        if core.file_to_compact.is_none() {
                            core.file_to_compact =
                                Some((*first_level, Arc::clone(first_file)));
                            self.maybe_schedule_compaction(&mut core);
                        }
                    }
                }
            }

            match table.get(&lookup, &rollbacks)? {
                TableGet::Found(value) => return Ok(Some(value)),
                TableGet::Deleted => return Ok(None),
                TableGet::NotFound => {}
            }
        }
        Ok(None)
    }

    // --------------------------------------------------------------------------------------------
    // Scans
    // --------------------------------------------------------------------------------------------

    /// One page of a snapshot-consistent range scan.
    pub fn scan(&self, options: &ScanOptions) -> Result<ScanPage, EngineError> {
        let opts = self.opts();
        let limits = self.strategy_limits(&opts);
        let snapshot = options.snapshot.unwrap_or(MAX_SEQUENCE);
        let max_versions = if options.max_versions != 0 {
            options.max_versions
        } else if opts.max_versions != 0 {
            opts.max_versions
        } else {
            u32::MAX
        };

        let (mem, imm, current, rollbacks) = {
            let core = self.core()?;
            (
                Arc::clone(&core.mem),
                core.imm.clone(),
                core.versions.current(),
                core.rollbacks.clone(),
            )
        };

        let mut streams: Vec<Box<compaction::CellIter>> = Vec::new();
        let mem_cells = mem.collect_range(&options.start, &options.end)?;
        streams.push(Box::new(mem_cells.into_iter().map(Ok)));
        if let Some(imm) = imm {
            let imm_cells = imm.collect_range(&options.start, &options.end)?;
            streams.push(Box::new(imm_cells.into_iter().map(Ok)));
        }
        for level in 0..NUM_LEVELS {
            for file in current.overlapping_files(level, &options.start, &options.end) {
                let table =
                    self.inner
                        .table_cache
                        .get_table(file.number, &file.path(), file.size)?;
                let mut iter = table.iter();
                if !options.start.is_empty() {
                    iter.seek(&InternalKey::seek_to(options.start.clone(), MAX_SEQUENCE))?;
                }
                streams.push(Box::new(iter));
            }
        }

        let merged = compaction::MergeIter::new(streams, options.end.clone());

        // Visibility: newest-first per user key; the first visible version
        // decides between value and tombstone, later versions count
        // against the cap.
        let mut cells = Vec::new();
        let mut bytes = 0usize;
        let mut more = false;
        let mut next_start: Option<Vec<u8>> = None;

        let mut current_key: Option<Vec<u8>> = None;
        let mut versions_emitted = 0u32;
        let mut key_shadowed = false;

        for cell in merged {
            let (key, value) = cell?;

            if key.sequence > snapshot || is_rolled_back(&rollbacks, key.sequence) {
                continue;
            }

            if current_key.as_deref() != Some(key.user_key.as_slice()) {
                current_key = Some(key.user_key.clone());
                versions_emitted = 0;
                key_shadowed = false;
            }
            if key_shadowed || versions_emitted >= max_versions {
                continue;
            }
            if key.kind == ValueKind::Deletion {
                key_shadowed = true;
                continue;
            }
            if opts.ttl_micros != 0
                && limits.timestamp_of(&key.user_key).is_some_and(|ts| {
                    ts.saturating_add(opts.ttl_micros) <= limits.now_micros
                })
            {
                key_shadowed = true;
                continue;
            }

            versions_emitted += 1;
            bytes += key.user_key.len() + value.len();
            cells.push((key.user_key.clone(), value));

            let over_rows = options.row_budget != 0 && cells.len() >= options.row_budget;
            let over_bytes = options.byte_budget != 0 && bytes >= options.byte_budget;
            if over_rows || over_bytes {
                // Resume after this user key so a page break never splits
                // one key's versions.
                let mut resume = key.user_key.clone();
                resume.push(0);
                next_start = Some(resume);
                more = true;
                break;
            }
        }

        Ok(ScanPage {
            cells,
            more,
            next_start,
        })
    }

    // --------------------------------------------------------------------------------------------
    // Snapshots and rollbacks
    // --------------------------------------------------------------------------------------------

    /// Pin the current last sequence and return it.
    pub fn get_snapshot(&self) -> Result<SequenceNumber, EngineError> {
        let mut core = self.core()?;
        let sequence = core.versions.last_sequence;
        *core.snapshots.entry(sequence).or_insert(0) += 1;
        core.mem.get_snapshot(sequence);
        Ok(sequence)
    }

    /// Pin an explicit sequence (coordinator-restored snapshots).
    pub fn get_snapshot_at(&self, sequence: SequenceNumber) -> Result<(), EngineError> {
        let mut core = self.core()?;
        *core.snapshots.entry(sequence).or_insert(0) += 1;
        core.mem.get_snapshot(sequence);
        Ok(())
    }

    /// Release one pin of `sequence`.
    pub fn release_snapshot(&self, sequence: SequenceNumber) -> Result<(), EngineError> {
        let mut core = self.core()?;
        if let Some(count) = core.snapshots.get_mut(&sequence) {
            *count -= 1;
            if *count == 0 {
                core.snapshots.remove(&sequence);
            }
        }
        core.mem.release_snapshot(sequence);
        Ok(())
    }

    /// Record a rollback window: hide `(snapshot, point]` from reads and
    /// compaction retention.
    pub fn rollback(
        &self,
        snapshot: SequenceNumber,
        point: SequenceNumber,
    ) -> Result<(), EngineError> {
        let mut core = self.core()?;
        core.rollbacks.insert(snapshot, point);
        info!(dir = %self.inner.dir, snapshot, point, "rollback window recorded");
        Ok(())
    }

    fn smallest_snapshot_locked(core: &EngineCore) -> SequenceNumber {
        core.snapshots
            .keys()
            .next()
            .copied()
            .unwrap_or(core.versions.last_sequence)
    }

    /// Take the exclusive background slot, waiting out a running flush or
    /// compaction. Returns with the core locked and `bg_running` set.
    fn acquire_bg_slot(&self) -> Result<std::sync::MutexGuard<'_, EngineCore>, EngineError> {
        let mut core = self.core()?;
        while core.bg_running {
            core = self
                .inner
                .bg_cv
                .wait(core)
                .map_err(|_| EngineError::Internal("engine mutex poisoned".into()))?;
        }
        core.bg_running = true;
        Ok(core)
    }

    // --------------------------------------------------------------------------------------------
    // Compaction driving
    // --------------------------------------------------------------------------------------------

    /// Queue background work on the pool if something needs doing.
    fn maybe_schedule_compaction(&self, core: &mut EngineCore) {
        let Some(pool) = &self.inner.compact_pool else {
            return;
        };
        if core.bg_scheduled
            || core.state == EngineState::ForceUnload
            || self.inner.shutdown.load(Ordering::Acquire)
        {
            return;
        }
        let needed = core.imm.is_some()
            || core.manual_request.is_some()
            || core.file_to_compact.is_some()
            || core
                .versions
                .current()
                .compaction_scores()
                .first()
                .is_some_and(|&(_, score)| score >= 1.0);
        if !needed {
            return;
        }
        core.bg_scheduled = true;
        let engine = self.clone();
        pool.execute(move || engine.background_work());
    }

    /// Pool entry point: drain flush + compaction work, with backoff on
    /// failure.
    fn background_work(&self) {
        let result = self.background_round();
        match result {
            Ok(()) => {
                if let Ok(mut core) = self.core() {
                    core.bg_scheduled = false;
                    core.bg_retries = 0;
                    self.maybe_schedule_compaction(&mut core);
                }
                self.inner.bg_cv.notify_all();
            }
            Err(e) => {
                self.note_background_failure(&e);
            }
        }
    }

    fn note_background_failure(&self, e: &EngineError) {
        let permission_denied = matches!(
            e,
            EngineError::Dfs(err) if err.is_permission_denied()
        );
        let Ok(mut core) = self.core() else { return };
        core.bg_scheduled = false;
        core.bg_retries += 1;
        let retries = core.bg_retries;
        error!(dir = %self.inner.dir, retries, error = %e, "background work failed");

        if permission_denied || retries >= BG_RETRY_BOUND {
            core.bg_error = Some(e.to_string());
            core.state = EngineState::ForceUnload;
            drop(core);
            self.inner.bg_cv.notify_all();
            return;
        }
        drop(core);
        self.inner.bg_cv.notify_all();

        // Exponential backoff, capped at 8 s.
        let backoff = Duration::from_millis(100)
            .saturating_mul(1u32 << retries.min(10))
            .min(BG_BACKOFF_CAP);
        if let Some(pool) = &self.inner.compact_pool {
            let engine = self.clone();
            pool.execute_after(backoff, move || {
                if let Ok(mut core) = engine.core() {
                    if !core.bg_scheduled {
                        core.bg_scheduled = true;
                        drop(core);
                        engine.background_work();
                    }
                }
            });
        }
    }

    fn background_round(&self) -> Result<(), EngineError> {
        loop {
            if self.inner.shutdown.load(Ordering::Acquire) {
                return Ok(());
            }
            let has_imm = { self.core()?.imm.is_some() };
            if has_imm {
                self.flush_imm()?;
                continue;
            }
            if !self.compact_once()? {
                return Ok(());
            }
        }
    }

    /// Compact `[start, end)` down through the tree until the range is
    /// quiet. Empty bounds mean unbounded. Each round re-requests the
    /// range so the data cascades one level per round; the bottom level is
    /// rewritten at most once.
    pub fn compact_range(&self, start: &[u8], end: &[u8]) -> Result<(), EngineError> {
        self.flush()?;
        let mut bottom_rewritten = false;
        for _ in 0..NUM_LEVELS + 2 {
            let only_bottom = {
                let mut core = self.core()?;
                core.manual_request = Some((start.to_vec(), end.to_vec()));
                let version = core.versions.current();
                (0..NUM_LEVELS - 1)
                    .all(|level| version.overlapping_files(level, start, end).is_empty())
            };
            if only_bottom {
                if bottom_rewritten {
                    break;
                }
                bottom_rewritten = true;
            }
            if !self.compact_once()? {
                break;
            }
        }
        let mut core = self.core()?;
        core.manual_request = None;
        Ok(())
    }

    /// Run one picked compaction. Returns false when nothing was pending.
    pub fn compact_once(&self) -> Result<bool, EngineError> {
        let opts = self.opts();
        let job = {
            // Flush and compaction are mutually exclusive; the pick below
            // must come from the version the job will edit.
            let mut core = self.acquire_bg_slot()?;
            if core.state == EngineState::ForceUnload {
                core.bg_running = false;
                return Ok(false);
            }
            let manual = core.manual_request.clone();
            let picked = pick_compaction(
                &core.versions,
                manual.as_ref(),
                core.file_to_compact.as_ref(),
            );
            let Some(picked) = picked else {
                core.manual_request = None;
                core.bg_running = false;
                drop(core);
                self.inner.bg_cv.notify_all();
                return Ok(false);
            };
            if picked.reason == CompactionReason::Seek {
                core.file_to_compact = None;
            }
            if picked.reason == CompactionReason::Manual {
                core.manual_request = None;
            }

            // Trivial move: re-level the file with a metadata-only edit.
            if picked.is_trivial_move() && picked.level + 1 < NUM_LEVELS {
                let file = Arc::clone(&picked.inputs0[0]);
                let mut edit = VersionEdit::default();
                edit.deleted_files
                    .push((picked.level as u32, file.number, file.dir.clone()));
                edit.added_files
                    .push((picked.level as u32 + 1, (*file).clone()));
                let applied = core.versions.log_and_apply(&mut edit);
                core.bg_running = false;
                drop(core);
                self.inner.bg_cv.notify_all();
                applied?;
                debug!(dir = %self.inner.dir, file = file.number, from = picked.level, "trivial move");
                return Ok(true);
            }

            let smallest_snapshot = Self::smallest_snapshot_locked(&core);
            let job = CompactionJob {
                version: core.versions.current(),
                smallest_snapshot,
                rollbacks: core.rollbacks.clone(),
                strategy_kind: opts.strategy,
                strategy_limits: self.strategy_limits(&opts),
                drop_base_level_del: opts.drop_base_level_del,
                max_output_file_size: opts.max_output_file_size,
                grandparent_overlap_bytes: compaction::DEFAULT_GRANDPARENT_OVERLAP_BYTES,
                block_size: opts.block_size,
                output_dir: self.inner.dir.clone(),
                sub_compactions: opts.sub_compactions.max(1),
                compaction: picked,
            };
            job
        };

        let engine = self.clone();
        let alloc = move || {
            engine
                .core()
                .map(|mut core| {
                    let number = core.versions.new_file_number();
                    core.pending_outputs.insert(number);
                    number
                })
                .unwrap_or(0)
        };

        let outputs = run_compaction(
            &job,
            &self.inner.dfs,
            &self.inner.table_cache,
            &alloc,
            &self.inner.shutdown,
        );

        let mut core = self.core()?;
        core.bg_running = false;
        let outputs = match outputs {
            Ok(outputs) => outputs,
            Err(CompactionError::Cancelled) => {
                drop(core);
                self.inner.bg_cv.notify_all();
                return Ok(false);
            }
            Err(e) => {
                if opts.ignore_corruption_in_compaction
                    && matches!(e, CompactionError::Sstable(SstableError::Corrupt { .. }))
                {
                    warn!(dir = %self.inner.dir, error = %e, "corruption skipped in compaction");
                    drop(core);
                    self.inner.bg_cv.notify_all();
                    return Ok(false);
                }
                if e.is_permission_denied() {
                    core.bg_error = Some(e.to_string());
                    core.state = EngineState::ForceUnload;
                }
                drop(core);
                self.inner.bg_cv.notify_all();
                return Err(match e {
                    CompactionError::Sstable(e) => EngineError::Sstable(e),
                    CompactionError::Dfs(e) => EngineError::Dfs(e),
                    CompactionError::Cancelled => EngineError::Internal("cancelled".into()),
                });
            }
        };

        let mut edit = VersionEdit::default();
        for file in job.compaction.inputs0.iter() {
            edit.deleted_files
                .push((job.compaction.level as u32, file.number, file.dir.clone()));
        }
        for file in job.compaction.inputs1.iter() {
            edit.deleted_files.push((
                job.compaction.level as u32 + 1,
                file.number,
                file.dir.clone(),
            ));
        }
        let output_level = (job.compaction.level + 1).min(NUM_LEVELS - 1) as u32;
        let mut produced = 0u64;
        for output in outputs {
            core.pending_outputs.remove(&output.meta.number);
            produced += output.meta.size;
            edit.added_files.push((output_level, output.meta));
        }
        // Rotate the size-compaction cursor past the consumed span.
        if let Some(last_input) = job.compaction.inputs0.last() {
            edit.compact_pointers
                .push((job.compaction.level as u32, last_input.largest.clone()));
        }
        core.versions.log_and_apply(&mut edit)?;
        core.bg_retries = 0;
        info!(
            dir = %self.inner.dir,
            level = job.compaction.level,
            in_bytes = job.compaction.input_bytes(),
            out_bytes = produced,
            levels = %core.versions.current().level_summary(),
            "compaction installed"
        );
        drop(core);

        self.inner.bg_cv.notify_all();
        self.delete_obsolete_files()?;
        Ok(true)
    }

    // --------------------------------------------------------------------------------------------
    // File garbage collection
    // --------------------------------------------------------------------------------------------

    /// Delete files in the engine directory that no version references.
    ///
    /// Inherited files live in parent directories and are never touched
    /// here; the table-level trash collector owns those.
    pub fn delete_obsolete_files(&self) -> Result<(), EngineError> {
        let (live, log_floor, manifest_number, pending) = {
            let core = self.core()?;
            (
                core.versions.live_files(),
                core.versions.log_number,
                core.versions.manifest_number(),
                core.pending_outputs.clone(),
            )
        };

        let names = match self.inner.dfs.list(&self.inner.dir) {
            Ok(names) => names,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for name in names {
            let keep = match parse_engine_file(&name) {
                EngineFile::Log(number) => number >= log_floor,
                EngineFile::Table(number) => live.contains(&number) || pending.contains(&number),
                EngineFile::Manifest(number) => number == manifest_number,
                EngineFile::Current | EngineFile::InitLock | EngineFile::Unknown => true,
            };
            if keep {
                continue;
            }
            let path = format!("{}/{}", self.inner.dir, name);
            self.inner.table_cache.evict(&path);
            match self.inner.dfs.delete(&path) {
                Ok(()) => debug!(path, "obsolete file deleted"),
                Err(e) => warn!(path, error = %e, "obsolete file delete failed"),
            }
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Split support
    // --------------------------------------------------------------------------------------------

    /// A user key at roughly `ratio` through the engine's total byte span,
    /// or `None` when the engine is too small to split.
    pub fn find_split_key(&self, ratio: f64) -> Result<Option<Vec<u8>>, EngineError> {
        let version = { self.core()?.versions.current() };

        let mut spans: Vec<(Vec<u8>, u64)> = Vec::new();
        for level in 0..NUM_LEVELS {
            for file in &version.files[level] {
                spans.push((file.largest.user_key.clone(), file.size));
            }
        }
        if spans.is_empty() {
            return Ok(None);
        }
        spans.sort_by(|a, b| a.0.cmp(&b.0));

        let total: u64 = spans.iter().map(|(_, size)| size).sum();
        let target = (total as f64 * ratio.clamp(0.0, 1.0)) as u64;
        let mut accumulated = 0u64;
        for (key, size) in &spans {
            accumulated += size;
            if accumulated >= target {
                return Ok(Some(key.clone()));
            }
        }
        Ok(spans.last().map(|(key, _)| key.clone()))
    }

    // --------------------------------------------------------------------------------------------
    // Schema reload
    // --------------------------------------------------------------------------------------------

    /// Swap the schema-derived settings in place. Background jobs pick the
    /// new values up at their next iteration; in-flight jobs finish under
    /// the old ones.
    pub fn apply_schema(
        &self,
        max_versions: u32,
        ttl_micros: u64,
        strategy: StrategyKind,
        bloom_enabled: bool,
        compression_id: u8,
    ) -> Result<(), EngineError> {
        let mut opts = self
            .inner
            .opts
            .write()
            .map_err(|_| EngineError::Internal("options lock poisoned".into()))?;
        opts.max_versions = max_versions;
        opts.ttl_micros = ttl_micros;
        opts.strategy = strategy;
        opts.bloom_enabled = bloom_enabled;
        opts.compression_id = compression_id;
        info!(dir = %self.inner.dir, max_versions, ttl_micros, "schema applied");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Shutdown
    // --------------------------------------------------------------------------------------------

    /// Stop background work, flush what is in memory, and sync the log.
    pub fn close(&self) -> Result<(), EngineError> {
        self.inner.shutdown.store(true, Ordering::Release);

        // Wait out a scheduled background round.
        {
            let mut core = self.core()?;
            while core.bg_scheduled {
                let (guard, timeout) = self
                    .inner
                    .bg_cv
                    .wait_timeout(core, Duration::from_millis(50))
                    .map_err(|_| EngineError::Internal("engine mutex poisoned".into()))?;
                core = guard;
                if timeout.timed_out() {
                    break;
                }
            }
        }

        if self.state() == EngineState::Opened {
            self.flush()?;
        }
        let mut core = self.core()?;
        if let Some(log) = core.log.as_mut() {
            log.sync()?;
        }
        info!(dir = %self.inner.dir, "engine closed");
        Ok(())
    }
}

/// Microseconds since the UNIX epoch.
pub(crate) fn now_micros() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
