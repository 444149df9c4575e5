//! Background compaction: picking, drop rules, strategies, execution.
//!
//! ## Picking
//!
//! [`pick_compaction`] chooses `(level, inputs₀, inputs₁)` by priority:
//!
//! 1. **Manual** — an explicitly requested user-key range.
//! 2. **Size** — the level whose `bytes / target(level)` score is highest
//!    and ≥ 1 (level 0 scores by file count). The starting file rotates
//!    through the level via the per-level compact pointer.
//! 3. **Seek** — a file that absorbed more wasted read probes than its
//!    `allowed_seeks` budget.
//!
//! ## Drop rules
//!
//! Walking the merged inputs in internal-key order, an entry is dropped
//! when any of these hold:
//!
//! - its sequence falls in a recorded rollback window,
//! - a newer entry for the same user key at-or-below `smallest_snapshot`
//!   was already kept (only the first such entry survives),
//! - it is a tombstone at-or-below `smallest_snapshot`, base-level deletes
//!   are enabled, and no deeper level can contain the key.
//!
//! Survivors then pass through the configured [`CompactionStrategy`], which
//! may drop further (TTL, version caps), coalesce atomic adds, or just
//! account statistics.
//!
//! ## Outputs
//!
//! An output file is cut when it reaches `max_output_file_size` or when it
//! would overlap more than the grandparent bound at level+2, keeping any
//! future compaction of the output bounded.
//!
//! ## Parallel sub-compactions
//!
//! A large job is partitioned at input-file boundary keys; each shard runs
//! on its own worker and produces independent outputs, and the caller
//! applies all shard outputs in one atomic [`VersionEdit`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{debug, info};

use crate::dfs::{Dfs, DfsError};
use crate::engine::key::{InternalKey, Rollbacks, SequenceNumber, ValueKind, is_rolled_back};
use crate::engine::version::{
    FileMeta, NUM_LEVELS, Version, VersionSet, table_file_path, target_bytes_for_level,
};
use crate::sstable::{SstableError, TableBuilder, TableCache};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by compaction execution.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// Table read/write failure.
    #[error("sstable error: {0}")]
    Sstable(#[from] SstableError),

    /// Filesystem failure.
    #[error("dfs error: {0}")]
    Dfs(#[from] DfsError),

    /// The engine is shutting down; partial outputs were abandoned.
    #[error("compaction cancelled")]
    Cancelled,
}

impl CompactionError {
    /// True when the underlying failure is terminal for the engine.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::Dfs(e) => e.is_permission_denied(),
            Self::Sstable(SstableError::Dfs(e)) => e.is_permission_denied(),
            _ => false,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Picking
// ------------------------------------------------------------------------------------------------

/// Why a compaction was picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionReason {
    /// Level score reached 1.
    Size,
    /// A file ran out of `allowed_seeks`.
    Seek,
    /// Explicitly requested range.
    Manual,
}

/// A chosen compaction: inputs at `level` and `level + 1`.
#[derive(Debug)]
pub struct Compaction {
    /// Input level.
    pub level: usize,

    /// Files taken from `level`.
    pub inputs0: Vec<Arc<FileMeta>>,

    /// Overlapping files taken from `level + 1`.
    pub inputs1: Vec<Arc<FileMeta>>,

    /// Files at `level + 2` overlapping the output span; bound output
    /// growth.
    pub grandparents: Vec<Arc<FileMeta>>,

    /// What triggered the pick.
    pub reason: CompactionReason,
}

impl Compaction {
    /// All inputs, level files first.
    pub fn all_inputs(&self) -> impl Iterator<Item = &Arc<FileMeta>> {
        self.inputs0.iter().chain(self.inputs1.iter())
    }

    /// Total input bytes.
    pub fn input_bytes(&self) -> u64 {
        self.all_inputs().map(|f| f.size).sum()
    }

    /// A single input file with nothing to merge against can be moved to
    /// the next level by a metadata-only edit.
    pub fn is_trivial_move(&self) -> bool {
        self.inputs0.len() == 1
            && self.inputs1.is_empty()
            && self.grandparents.iter().map(|f| f.size).sum::<u64>()
                <= DEFAULT_GRANDPARENT_OVERLAP_BYTES
    }

    /// The user-key span covered by every input.
    pub fn key_span(&self) -> (Vec<u8>, Vec<u8>) {
        let mut smallest: Option<&[u8]> = None;
        let mut largest: Option<&[u8]> = None;
        for file in self.all_inputs() {
            if smallest.is_none_or(|s| file.smallest.user_key.as_slice() < s) {
                smallest = Some(&file.smallest.user_key);
            }
            if largest.is_none_or(|l| file.largest.user_key.as_slice() > l) {
                largest = Some(&file.largest.user_key);
            }
        }
        (
            smallest.unwrap_or_default().to_vec(),
            largest.unwrap_or_default().to_vec(),
        )
    }
}

/// Output-file split bound on grandparent overlap.
pub const DEFAULT_GRANDPARENT_OVERLAP_BYTES: u64 = 10 * 2 * 1024 * 1024;

/// Choose the next compaction, if any is warranted.
///
/// `manual` is an explicit `[start, end)` user-key range request (empty
/// bounds mean unbounded); `seek_file` is the file charged by the read
/// path. Called under the engine mutex.
pub fn pick_compaction(
    versions: &VersionSet,
    manual: Option<&(Vec<u8>, Vec<u8>)>,
    seek_file: Option<&(usize, Arc<FileMeta>)>,
) -> Option<Compaction> {
    let version = versions.current();

    if let Some((start, end)) = manual {
        // The last level is included: a bottom-level rewrite is what
        // finally drops tombstones with nothing left to shadow.
        for level in 0..NUM_LEVELS {
            let inputs0 = version.overlapping_files(level, start, end);
            if inputs0.is_empty() {
                continue;
            }
            return Some(finish_pick(&version, level, inputs0, CompactionReason::Manual));
        }
        return None;
    }

    // Size first: it keeps the shape of the tree bounded.
    let scores = version.compaction_scores();
    if let Some(&(level, score)) = scores.first() {
        if score >= 1.0 {
            let inputs0 = pick_size_inputs(versions, &version, level);
            if !inputs0.is_empty() {
                return Some(finish_pick(&version, level, inputs0, CompactionReason::Size));
            }
        }
    }

    if let Some((level, file)) = seek_file {
        if *level < NUM_LEVELS - 1 {
            return Some(finish_pick(
                &version,
                *level,
                vec![Arc::clone(file)],
                CompactionReason::Seek,
            ));
        }
    }
    None
}

/// First file past the level's compact pointer, wrapped to the start.
fn pick_size_inputs(versions: &VersionSet, version: &Version, level: usize) -> Vec<Arc<FileMeta>> {
    let files = &version.files[level];
    if files.is_empty() {
        return Vec::new();
    }
    let start_file = match &versions.compact_pointers[level] {
        Some(pointer) => files
            .iter()
            .find(|f| f.largest > *pointer)
            .unwrap_or(&files[0]),
        None => &files[0],
    };
    let mut inputs = vec![Arc::clone(start_file)];

    // Level 0 files overlap each other: pull in everything the chosen
    // file's span touches, to a fixed point.
    if level == 0 {
        loop {
            let (start, end) = span_of(&inputs);
            let mut end_inclusive = end;
            end_inclusive.push(0);
            let expanded = version.overlapping_files(0, &start, &end_inclusive);
            if expanded.len() == inputs.len() {
                break;
            }
            inputs = expanded;
        }
    }
    inputs
}

fn span_of(files: &[Arc<FileMeta>]) -> (Vec<u8>, Vec<u8>) {
    let mut smallest = files[0].smallest.user_key.clone();
    let mut largest = files[0].largest.user_key.clone();
    for file in &files[1..] {
        if file.smallest.user_key < smallest {
            smallest = file.smallest.user_key.clone();
        }
        if file.largest.user_key > largest {
            largest = file.largest.user_key.clone();
        }
    }
    (smallest, largest)
}

fn finish_pick(
    version: &Version,
    level: usize,
    inputs0: Vec<Arc<FileMeta>>,
    reason: CompactionReason,
) -> Compaction {
    let (start, end) = span_of(&inputs0);
    let mut end_inclusive = end.clone();
    end_inclusive.push(0);

    let inputs1 = if level + 1 < NUM_LEVELS {
        version.overlapping_files(level + 1, &start, &end_inclusive)
    } else {
        Vec::new()
    };

    let grandparents = if level + 2 < NUM_LEVELS {
        let (full_start, full_end) = span_of(
            &inputs0
                .iter()
                .chain(inputs1.iter())
                .cloned()
                .collect::<Vec<_>>(),
        );
        let mut full_end_inclusive = full_end;
        full_end_inclusive.push(0);
        version.overlapping_files(level + 2, &full_start, &full_end_inclusive)
    } else {
        Vec::new()
    };

    debug!(
        level,
        inputs0 = inputs0.len(),
        inputs1 = inputs1.len(),
        ?reason,
        "compaction picked"
    );
    Compaction {
        level,
        inputs0,
        inputs1,
        grandparents,
        reason,
    }
}

// ------------------------------------------------------------------------------------------------
// Strategies
// ------------------------------------------------------------------------------------------------

/// Which strategy family an engine runs. Selected per locality group and
/// swappable by a schema update; a running compaction finishes under the
/// strategy it started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// Drop TTL-expired cells and versions beyond the per-key cap.
    Drop,
    /// Like [`StrategyKind::Drop`], plus coalescing of atomic-add cells.
    MergeAtomicOps,
    /// Keep everything; only account statistics.
    CheckTag,
}

/// Statistics accumulated by a strategy over one compaction.
#[derive(Debug, Default, Clone)]
pub struct StrategyStats {
    /// Cells examined.
    pub cells_seen: u64,
    /// Cells the strategy itself dropped.
    pub cells_dropped: u64,
    /// Tombstones among examined cells.
    pub tombstones_seen: u64,
}

/// Per-compaction cell transformer.
///
/// `transform` receives survivors of the engine-level drop rules in
/// internal-key order and emits zero or more cells; `finish` flushes any
/// buffered state at end of input.
pub trait CompactionStrategy: Send {
    /// Process one cell.
    fn transform(
        &mut self,
        key: InternalKey,
        value: Vec<u8>,
        emit: &mut dyn FnMut(InternalKey, Vec<u8>),
    );

    /// Flush buffered state.
    fn finish(&mut self, emit: &mut dyn FnMut(InternalKey, Vec<u8>));

    /// Statistics for the picker and metrics.
    fn stats(&self) -> StrategyStats;
}

/// Limits shared by the dropping strategies.
#[derive(Debug, Clone, Copy)]
pub struct StrategyLimits {
    /// Versions kept per user key (0 = unlimited).
    pub max_versions: u32,

    /// Cell time-to-live in microseconds (0 = no TTL).
    pub ttl_micros: u64,

    /// "Now" for TTL decisions, microseconds.
    pub now_micros: u64,

    /// When set, the trailing 8 bytes of every user key are the cell's
    /// bitwise-inverted big-endian write timestamp.
    pub timestamped_keys: bool,
}

impl StrategyLimits {
    /// Extract the cell timestamp packed into `user_key`, when enabled.
    pub fn timestamp_of(&self, user_key: &[u8]) -> Option<u64> {
        if !self.timestamped_keys || user_key.len() < 8 {
            return None;
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&user_key[user_key.len() - 8..]);
        Some(!u64::from_be_bytes(raw))
    }

    /// The prefix that identifies one logical cell for version counting:
    /// with timestamped keys, versions of a cell differ only in the
    /// trailing timestamp bytes.
    pub fn version_group<'k>(&self, user_key: &'k [u8]) -> &'k [u8] {
        if self.timestamped_keys && user_key.len() >= 8 {
            &user_key[..user_key.len() - 8]
        } else {
            user_key
        }
    }

    fn expired(&self, user_key: &[u8]) -> bool {
        if self.ttl_micros == 0 {
            return false;
        }
        match self.timestamp_of(user_key) {
            Some(ts) => ts.saturating_add(self.ttl_micros) <= self.now_micros,
            None => false,
        }
    }
}

/// Build the configured strategy.
pub fn make_strategy(kind: StrategyKind, limits: StrategyLimits) -> Box<dyn CompactionStrategy> {
    match kind {
        StrategyKind::Drop => Box::new(DropStrategy::new(limits)),
        StrategyKind::MergeAtomicOps => Box::new(MergeAtomicOps::new(limits)),
        StrategyKind::CheckTag => Box::new(CheckTag::default()),
    }
}

// --- Drop ---------------------------------------------------------------------------------------

/// Drops TTL-expired cells and versions beyond the per-key cap.
pub struct DropStrategy {
    limits: StrategyLimits,
    stats: StrategyStats,
    current_key: Option<Vec<u8>>,
    versions_kept: u32,
}

impl DropStrategy {
    fn new(limits: StrategyLimits) -> Self {
        Self {
            limits,
            stats: StrategyStats::default(),
            current_key: None,
            versions_kept: 0,
        }
    }
}

impl CompactionStrategy for DropStrategy {
    fn transform(
        &mut self,
        key: InternalKey,
        value: Vec<u8>,
        emit: &mut dyn FnMut(InternalKey, Vec<u8>),
    ) {
        self.stats.cells_seen += 1;
        if key.kind == ValueKind::Deletion {
            self.stats.tombstones_seen += 1;
        }

        let group = self.limits.version_group(&key.user_key);
        if self.current_key.as_deref() != Some(group) {
            self.current_key = Some(group.to_vec());
            self.versions_kept = 0;
        }

        if self.limits.expired(&key.user_key) {
            self.stats.cells_dropped += 1;
            return;
        }
        if self.limits.max_versions != 0 && self.versions_kept >= self.limits.max_versions {
            self.stats.cells_dropped += 1;
            return;
        }
        self.versions_kept += 1;
        emit(key, value);
    }

    fn finish(&mut self, _emit: &mut dyn FnMut(InternalKey, Vec<u8>)) {}

    fn stats(&self) -> StrategyStats {
        self.stats.clone()
    }
}

// --- MergeAtomicOps -----------------------------------------------------------------------------

/// Marker byte opening an atomic-add cell value.
pub const ATOMIC_ADD_TAG: u8 = 0xAD;

/// Encode a counter delta as an atomic-add cell value.
pub fn encode_atomic_add(delta: i64) -> Vec<u8> {
    let mut value = Vec::with_capacity(9);
    value.push(ATOMIC_ADD_TAG);
    value.extend_from_slice(&delta.to_le_bytes());
    value
}

/// Decode an atomic-add cell value, if `value` is one.
pub fn decode_atomic_add(value: &[u8]) -> Option<i64> {
    if value.len() == 9 && value[0] == ATOMIC_ADD_TAG {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&value[1..]);
        Some(i64::from_le_bytes(raw))
    } else {
        None
    }
}

/// Coalesces runs of atomic-add cells into one cell, then applies the
/// same TTL / version-cap dropping as [`DropStrategy`].
pub struct MergeAtomicOps {
    dropper: DropStrategy,

    /// Newest pending add's key for the current user key.
    pending_key: Option<InternalKey>,

    /// Sum of pending deltas.
    pending_sum: i64,
}

impl MergeAtomicOps {
    fn new(limits: StrategyLimits) -> Self {
        Self {
            dropper: DropStrategy::new(limits),
            pending_key: None,
            pending_sum: 0,
        }
    }

    fn flush_pending(&mut self, emit: &mut dyn FnMut(InternalKey, Vec<u8>)) {
        if let Some(key) = self.pending_key.take() {
            let sum = self.pending_sum;
            self.pending_sum = 0;
            // No base value found below the adds: the run stays an add so
            // deeper levels can still absorb it.
            self.dropper.transform(key, encode_atomic_add(sum), emit);
        }
    }
}

impl CompactionStrategy for MergeAtomicOps {
    fn transform(
        &mut self,
        key: InternalKey,
        value: Vec<u8>,
        emit: &mut dyn FnMut(InternalKey, Vec<u8>),
    ) {
        let same_key = self
            .pending_key
            .as_ref()
            .is_some_and(|pending| pending.user_key == key.user_key);
        if !same_key {
            self.flush_pending(emit);
        }

        match decode_atomic_add(&value) {
            Some(delta) if key.kind == ValueKind::Value => {
                if self.pending_key.is_none() {
                    self.pending_key = Some(key);
                }
                self.pending_sum = self.pending_sum.wrapping_add(delta);
            }
            _ => {
                if let Some(add_key) = self.pending_key.take() {
                    // A concrete base below the adds: fold the sum in and
                    // emit one combined cell at the newest add's sequence.
                    let sum = self.pending_sum;
                    self.pending_sum = 0;
                    let base = if key.kind == ValueKind::Value {
                        i64::from_le_bytes(pad_to_i64(&value))
                    } else {
                        0
                    };
                    let merged = base.wrapping_add(sum);
                    self.dropper
                        .transform(add_key, merged.to_le_bytes().to_vec(), emit);
                    if key.kind == ValueKind::Deletion {
                        // Keep the tombstone: it still shadows older cells.
                        self.dropper.transform(key, value, emit);
                    }
                } else {
                    self.dropper.transform(key, value, emit);
                }
            }
        }
    }

    fn finish(&mut self, emit: &mut dyn FnMut(InternalKey, Vec<u8>)) {
        self.flush_pending(emit);
    }

    fn stats(&self) -> StrategyStats {
        self.dropper.stats()
    }
}

fn pad_to_i64(value: &[u8]) -> [u8; 8] {
    let mut raw = [0u8; 8];
    let n = value.len().min(8);
    raw[..n].copy_from_slice(&value[..n]);
    raw
}

// --- CheckTag -----------------------------------------------------------------------------------

/// Pass-through strategy that only accounts statistics.
#[derive(Default)]
pub struct CheckTag {
    stats: StrategyStats,
}

impl CompactionStrategy for CheckTag {
    fn transform(
        &mut self,
        key: InternalKey,
        value: Vec<u8>,
        emit: &mut dyn FnMut(InternalKey, Vec<u8>),
    ) {
        self.stats.cells_seen += 1;
        if key.kind == ValueKind::Deletion {
            self.stats.tombstones_seen += 1;
        }
        emit(key, value);
    }

    fn finish(&mut self, _emit: &mut dyn FnMut(InternalKey, Vec<u8>)) {}

    fn stats(&self) -> StrategyStats {
        self.stats.clone()
    }
}

// ------------------------------------------------------------------------------------------------
// Execution
// ------------------------------------------------------------------------------------------------

/// Everything a compaction run needs besides the engine mutex.
pub struct CompactionJob {
    /// The picked inputs.
    pub compaction: Compaction,

    /// Version the inputs were picked from; consulted for the base-level
    /// tombstone rule.
    pub version: Arc<Version>,

    /// Snapshot floor: entries above it are always kept.
    pub smallest_snapshot: SequenceNumber,

    /// Rollback windows frozen at job start.
    pub rollbacks: Rollbacks,

    /// Strategy selection.
    pub strategy_kind: StrategyKind,

    /// Strategy limits frozen at job start.
    pub strategy_limits: StrategyLimits,

    /// Drop base-level tombstones when no deeper level holds the key.
    pub drop_base_level_del: bool,

    /// Cut outputs at this size.
    pub max_output_file_size: u64,

    /// Cut outputs at this much grandparent overlap.
    pub grandparent_overlap_bytes: u64,

    /// Data-block size for outputs.
    pub block_size: usize,

    /// Directory new outputs are written into.
    pub output_dir: String,

    /// Shards for parallel execution (1 = inline).
    pub sub_compactions: usize,
}

/// One finished output file.
#[derive(Debug)]
pub struct CompactionOutput {
    /// Metadata for the version edit.
    pub meta: FileMeta,

    /// Strategy statistics from the shard that produced it.
    pub stats: StrategyStats,
}

/// Run a compaction to completion, returning output metadata.
///
/// `alloc_file_number` hands out engine file numbers (it may briefly take
/// the engine mutex); `shutdown` is polled between output files.
pub fn run_compaction(
    job: &CompactionJob,
    dfs: &Arc<dyn Dfs>,
    table_cache: &Arc<TableCache>,
    alloc_file_number: &(dyn Fn() -> u64 + Sync),
    shutdown: &AtomicBool,
) -> Result<Vec<CompactionOutput>, CompactionError> {
    let boundaries = shard_boundaries(&job.compaction, job.sub_compactions);

    if boundaries.len() <= 1 {
        let (start, end) = full_span(&job.compaction);
        return run_shard(job, dfs, table_cache, alloc_file_number, shutdown, &start, &end);
    }

    // Shards cover [b₀, b₁), [b₁, b₂), …; workers run independently and
    // the caller installs every output in one edit.
    let mut results: Vec<Result<Vec<CompactionOutput>, CompactionError>> = Vec::new();
    crossbeam::thread::scope(|scope| {
        let mut handles = Vec::new();
        for window in boundaries.windows(2) {
            let start = window[0].clone();
            let end = window[1].clone();
            handles.push(scope.spawn(move |_| {
                run_shard(job, dfs, table_cache, alloc_file_number, shutdown, &start, &end)
            }));
        }
        for handle in handles {
            results.push(handle.join().unwrap_or(Err(CompactionError::Cancelled)));
        }
    })
    .map_err(|_| CompactionError::Cancelled)?;

    let mut outputs = Vec::new();
    for result in results {
        outputs.extend(result?);
    }
    Ok(outputs)
}

/// Boundary keys splitting the job into roughly even shards. Returns
/// `n + 1` bounds including the open ends.
fn shard_boundaries(compaction: &Compaction, sub_compactions: usize) -> Vec<Vec<u8>> {
    if sub_compactions <= 1 || compaction.inputs1.len() < sub_compactions {
        let (start, end) = full_span_pair(compaction);
        return vec![start, end];
    }

    // inputs1 is sorted and disjoint; its file edges are natural cut
    // points that keep shard outputs non-overlapping.
    let step = compaction.inputs1.len() / sub_compactions;
    let mut bounds = vec![full_span_pair(compaction).0];
    for shard in 1..sub_compactions {
        bounds.push(compaction.inputs1[shard * step].smallest.user_key.clone());
    }
    bounds.push(full_span_pair(compaction).1);
    bounds.dedup();
    bounds
}

fn full_span(compaction: &Compaction) -> (Vec<u8>, Vec<u8>) {
    full_span_pair(compaction)
}

fn full_span_pair(compaction: &Compaction) -> (Vec<u8>, Vec<u8>) {
    let (start, _) = compaction.key_span();
    // The end bound is exclusive; an empty vec means unbounded, which is
    // always correct for the final shard.
    (start, Vec::new())
}

/// Merge-and-rewrite one key shard `[start, end)` (empty end = unbounded).
fn run_shard(
    job: &CompactionJob,
    dfs: &Arc<dyn Dfs>,
    table_cache: &Arc<TableCache>,
    alloc_file_number: &(dyn Fn() -> u64 + Sync),
    shutdown: &AtomicBool,
    start: &[u8],
    end: &[u8],
) -> Result<Vec<CompactionOutput>, CompactionError> {
    let mut strategy = make_strategy(job.strategy_kind, job.strategy_limits);
    let mut merged = merge_inputs(&job.compaction, table_cache, start, end)?;

    let mut outputs: Vec<CompactionOutput> = Vec::new();
    let mut builder: Option<(u64, TableBuilder)> = None;

    // Drop-rule state.
    let mut last_user_key: Option<Vec<u8>> = None;
    let mut last_sequence_for_key = SequenceNumber::MAX;

    // Grandparent overlap tracking for the current output.
    let mut grandparent_idx = 0usize;
    let mut overlap_bytes = 0u64;

    let mut emitted: Vec<(InternalKey, Vec<u8>)> = Vec::new();

    while let Some(cell) = merged.next() {
        let (key, value) = cell?;

        if last_user_key.as_deref() != Some(key.user_key.as_slice()) {
            last_user_key = Some(key.user_key.clone());
            last_sequence_for_key = SequenceNumber::MAX;
        }

        let mut drop = false;
        if is_rolled_back(&job.rollbacks, key.sequence) {
            // Rollback-erased: invisible to reads, gone after compaction.
            drop = true;
        } else if last_sequence_for_key <= job.smallest_snapshot {
            // A newer entry at-or-below the snapshot floor was kept; this
            // one can never be observed again.
            drop = true;
        } else if key.kind == ValueKind::Deletion
            && key.sequence <= job.smallest_snapshot
            && job.drop_base_level_del
            && is_base_level_for_key(&job.version, job.compaction.level, &key.user_key)
        {
            drop = true;
        }

        if !is_rolled_back(&job.rollbacks, key.sequence) {
            last_sequence_for_key = key.sequence;
        }
        if drop {
            continue;
        }

        strategy.transform(key, value, &mut |k, v| emitted.push((k, v)));
        flush_emitted(
            job,
            dfs,
            alloc_file_number,
            &mut emitted,
            &mut builder,
            &mut outputs,
            &mut grandparent_idx,
            &mut overlap_bytes,
            &mut strategy,
        )?;

        if shutdown.load(Ordering::Acquire) {
            // Abandon the open output; finished outputs were already
            // synced and will be garbage-collected as unreferenced.
            return Err(CompactionError::Cancelled);
        }
    }

    strategy.finish(&mut |k, v| emitted.push((k, v)));
    flush_emitted(
        job,
        dfs,
        alloc_file_number,
        &mut emitted,
        &mut builder,
        &mut outputs,
        &mut grandparent_idx,
        &mut overlap_bytes,
        &mut strategy,
    )?;

    if let Some((number, table_builder)) = builder.take() {
        finish_output(job, number, table_builder, &mut outputs, &strategy)?;
    }

    info!(
        level = job.compaction.level,
        outputs = outputs.len(),
        "compaction shard finished"
    );
    Ok(outputs)
}

/// Write strategy-emitted cells into the open output, cutting files on the
/// size and grandparent bounds.
#[allow(clippy::too_many_arguments)]
fn flush_emitted(
    job: &CompactionJob,
    dfs: &Arc<dyn Dfs>,
    alloc_file_number: &(dyn Fn() -> u64 + Sync),
    emitted: &mut Vec<(InternalKey, Vec<u8>)>,
    builder: &mut Option<(u64, TableBuilder)>,
    outputs: &mut Vec<CompactionOutput>,
    grandparent_idx: &mut usize,
    overlap_bytes: &mut u64,
    strategy: &mut Box<dyn CompactionStrategy>,
) -> Result<(), CompactionError> {
    for (key, value) in emitted.drain(..) {
        // Advance grandparent overlap to this key.
        while *grandparent_idx < job.compaction.grandparents.len() {
            let grandparent = &job.compaction.grandparents[*grandparent_idx];
            if grandparent.largest.user_key.as_slice() < key.user_key.as_slice() {
                *overlap_bytes += grandparent.size;
                *grandparent_idx += 1;
            } else {
                break;
            }
        }

        let cut = match builder {
            Some((_, open)) => {
                open.current_size() >= job.max_output_file_size
                    || *overlap_bytes > job.grandparent_overlap_bytes
            }
            None => false,
        };
        if cut {
            if let Some((number, table_builder)) = builder.take() {
                finish_output(job, number, table_builder, outputs, strategy)?;
            }
            *overlap_bytes = 0;
        }

        if builder.is_none() {
            let number = alloc_file_number();
            let path = table_file_path(&job.output_dir, number);
            let file = dfs.create(&path)?;
            *builder = Some((number, TableBuilder::new(file, job.block_size)));
        }

        if let Some((_, open)) = builder {
            open.add(&key, &value)?;
        }
    }
    Ok(())
}

fn finish_output(
    job: &CompactionJob,
    number: u64,
    builder: TableBuilder,
    outputs: &mut Vec<CompactionOutput>,
    strategy: &Box<dyn CompactionStrategy>,
) -> Result<(), CompactionError> {
    if builder.entry_count() == 0 {
        return Ok(());
    }
    let result = builder.finish()?;
    let (Some(smallest), Some(largest)) = (result.smallest, result.largest) else {
        return Ok(());
    };
    outputs.push(CompactionOutput {
        meta: FileMeta {
            number,
            dir: job.output_dir.clone(),
            size: result.file_size,
            entries: result.entries,
            smallest,
            largest,
            delete_tag_percent: result.delete_tag_percent,
            ttl_percentile_expiry: result.ttl_percentile_expiry,
            allowed_seeks: std::sync::atomic::AtomicI64::new(
                ((result.file_size / 16_384) as i64).max(100),
            ),
        },
        stats: strategy.stats(),
    });
    Ok(())
}

/// True when no level deeper than the compaction's output level can hold
/// `user_key`: a tombstone reaching here has nothing left to shadow.
fn is_base_level_for_key(version: &Version, level: usize, user_key: &[u8]) -> bool {
    for deeper in (level + 2)..NUM_LEVELS {
        for file in &version.files[deeper] {
            if file.smallest.user_key.as_slice() <= user_key
                && user_key <= file.largest.user_key.as_slice()
            {
                return false;
            }
        }
    }
    true
}

/// Merging iterator over every input file restricted to `[start, end)`.
fn merge_inputs(
    compaction: &Compaction,
    table_cache: &Arc<TableCache>,
    start: &[u8],
    end: &[u8],
) -> Result<MergeIter, CompactionError> {
    let mut inputs: Vec<Box<CellIter>> = Vec::new();
    for file in compaction.all_inputs() {
        let table = table_cache.get_table(file.number, &file.path(), file.size)?;
        let mut iter = table.iter();
        if !start.is_empty() {
            iter.seek(&InternalKey::seek_to(start.to_vec(), crate::engine::key::MAX_SEQUENCE))?;
        }
        inputs.push(Box::new(iter));
    }
    Ok(MergeIter::new(inputs, end.to_vec()))
}

/// Boxed cell stream used by merges.
pub type CellIter = dyn Iterator<Item = Result<(InternalKey, Vec<u8>), SstableError>> + Send;

/// K-way merge over sorted cell streams, in internal-key order.
///
/// Streams must each be individually sorted; ties across streams are
/// broken by stream index, which callers arrange to mean "newer first".
pub struct MergeIter {
    streams: Vec<Box<CellIter>>,
    heads: Vec<Option<(InternalKey, Vec<u8>)>>,
    /// Exclusive user-key upper bound; empty = unbounded.
    end: Vec<u8>,
    primed: bool,
    failed: bool,
}

impl MergeIter {
    /// Merge `streams` up to the exclusive `end` bound.
    pub fn new(streams: Vec<Box<CellIter>>, end: Vec<u8>) -> Self {
        let heads = (0..streams.len()).map(|_| None).collect();
        Self {
            streams,
            heads,
            end,
            primed: false,
            failed: false,
        }
    }

    fn prime(&mut self) -> Result<(), SstableError> {
        for idx in 0..self.streams.len() {
            self.advance(idx)?;
        }
        self.primed = true;
        Ok(())
    }

    fn advance(&mut self, idx: usize) -> Result<(), SstableError> {
        self.heads[idx] = match self.streams[idx].next() {
            None => None,
            Some(Err(e)) => return Err(e),
            Some(Ok((key, value))) => {
                if !self.end.is_empty() && key.user_key.as_slice() >= self.end.as_slice() {
                    None
                } else {
                    Some((key, value))
                }
            }
        };
        Ok(())
    }
}

impl Iterator for MergeIter {
    type Item = Result<(InternalKey, Vec<u8>), SstableError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if !self.primed {
            if let Err(e) = self.prime() {
                self.failed = true;
                return Some(Err(e));
            }
        }

        let mut best: Option<usize> = None;
        for (idx, head) in self.heads.iter().enumerate() {
            let Some((key, _)) = head else { continue };
            match best {
                None => best = Some(idx),
                Some(best_idx) => {
                    if let Some((best_key, _)) = &self.heads[best_idx] {
                        if key < best_key {
                            best = Some(idx);
                        }
                    }
                }
            }
        }

        let idx = best?;
        let cell = self.heads[idx].take();
        if let Err(e) = self.advance(idx) {
            self.failed = true;
            return Some(Err(e));
        }
        cell.map(Ok)
    }
}

/// Post-compaction size estimate for the picker's next round; logged with
/// the edit.
pub fn level_fill_ratio(version: &Version, level: usize) -> f64 {
    if level == 0 {
        version.level_len(0) as f64 / super::version::L0_COMPACTION_TRIGGER as f64
    } else {
        version.level_bytes(level) as f64 / target_bytes_for_level(level) as f64
    }
}
