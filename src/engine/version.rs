//! Versions, version edits, and the MANIFEST.
//!
//! An engine's file set is described by an immutable [`Version`]: the table
//! files of every level plus the log number and last sequence. Mutations
//! never touch a version in place; they produce a [`VersionEdit`], append it
//! to the MANIFEST (a [`WalWriter`] record log), and install a fresh version
//! built from `current + edit`. `CURRENT` names the live MANIFEST; a new
//! MANIFEST becomes visible only by atomically rewriting `CURRENT`, so an
//! interrupted version install never becomes the recovery source.
//!
//! ## Edit record format
//!
//! An edit is a run of tagged fields: `[u32 tag][payload]`. Unknown tags at
//! or above [`TAG_FORWARD_COMPAT`] are skipped so newer writers stay
//! readable by older code.
//!
//! ## Inheritance
//!
//! A child tablet's engine starts with no `CURRENT` of its own and a list
//! of parent directories. Recovery then reads each parent's version and
//! adds the parent's live files — under their original paths — to the
//! child's first MANIFEST. The files are never copied or re-keyed.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dfs::Dfs;
use crate::encoding::{Decode, Encode, EncodingError};
use crate::engine::key::{InternalKey, SequenceNumber};
use crate::wal::{WalError, WalReader, WalWriter};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Number of levels in an engine.
pub const NUM_LEVELS: usize = 7;

/// Level-0 file count that starts write slowdown.
pub const L0_SLOWDOWN_TRIGGER: usize = 8;

/// Level-0 file count that stops writes until compaction drains.
pub const L0_STOP_TRIGGER: usize = 12;

/// Level-0 file count that triggers a compaction.
pub const L0_COMPACTION_TRIGGER: usize = 4;

/// Deepest level a fresh memtable flush may be placed at.
pub const MAX_MEM_COMPACT_LEVEL: usize = 2;

// Edit field tags.
const TAG_COMPARATOR: u32 = 1;
const TAG_LOG_NUMBER: u32 = 2;
const TAG_NEXT_FILE: u32 = 3;
const TAG_LAST_SEQUENCE: u32 = 4;
const TAG_COMPACT_POINTER: u32 = 5;
const TAG_DELETE_FILE: u32 = 6;
const TAG_ADD_FILE: u32 = 7;

/// Tags at or above this value are skipped by older readers.
const TAG_FORWARD_COMPAT: u32 = 200;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors from version-set operations.
#[derive(Debug, Error)]
pub enum VersionError {
    /// Underlying filesystem failure.
    #[error("dfs error: {0}")]
    Dfs(#[from] crate::dfs::DfsError),

    /// MANIFEST log failure.
    #[error("manifest log error: {0}")]
    Wal(#[from] WalError),

    /// Encoding failure inside an edit record.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Metadata does not describe a usable engine.
    #[error("corrupt version state: {0}")]
    Corrupt(String),
}

// ------------------------------------------------------------------------------------------------
// File naming
// ------------------------------------------------------------------------------------------------

/// What a file name inside an engine directory means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineFile {
    /// `NNNNNNNN.log`
    Log(u64),
    /// `NNNNNNNN.sst`
    Table(u64),
    /// `MANIFEST-NNNNNN`
    Manifest(u64),
    /// `CURRENT`
    Current,
    /// `__init_load_filelock`
    InitLock,
    /// Anything else.
    Unknown,
}

/// Path of a numbered WAL segment.
pub fn log_file_path(dir: &str, number: u64) -> String {
    format!("{dir}/{number:08}.log")
}

/// Path of a numbered table file.
pub fn table_file_path(dir: &str, number: u64) -> String {
    format!("{dir}/{number:08}.sst")
}

/// Path of a numbered MANIFEST.
pub fn manifest_file_path(dir: &str, number: u64) -> String {
    format!("{dir}/MANIFEST-{number:06}")
}

/// Path of the `CURRENT` pointer file.
pub fn current_file_path(dir: &str) -> String {
    format!("{dir}/CURRENT")
}

/// Path of the new-engine transaction marker.
pub fn init_lock_path(dir: &str) -> String {
    format!("{dir}/__init_load_filelock")
}

/// Classify a bare file name from an engine directory listing.
pub fn parse_engine_file(name: &str) -> EngineFile {
    if name == "CURRENT" {
        return EngineFile::Current;
    }
    if name == "__init_load_filelock" {
        return EngineFile::InitLock;
    }
    if let Some(number) = name.strip_prefix("MANIFEST-") {
        if let Ok(number) = number.parse::<u64>() {
            return EngineFile::Manifest(number);
        }
    }
    if let Some(number) = name.strip_suffix(".log") {
        if let Ok(number) = number.parse::<u64>() {
            return EngineFile::Log(number);
        }
    }
    if let Some(number) = name.strip_suffix(".sst") {
        if let Ok(number) = number.parse::<u64>() {
            return EngineFile::Table(number);
        }
    }
    EngineFile::Unknown
}

// ------------------------------------------------------------------------------------------------
// File metadata
// ------------------------------------------------------------------------------------------------

/// Metadata of one table file, shared by every version that references it.
#[derive(Debug)]
pub struct FileMeta {
    /// Engine-unique file number.
    pub number: u64,

    /// Directory the file physically lives in. Differs from the engine's
    /// own directory for inherited files.
    pub dir: String,

    /// File length in bytes.
    pub size: u64,

    /// Cell count.
    pub entries: u64,

    /// Smallest internal key in the file.
    pub smallest: InternalKey,

    /// Largest internal key in the file.
    pub largest: InternalKey,

    /// Share of tombstone cells, in percent. Feeds the picker.
    pub delete_tag_percent: u8,

    /// 90th-percentile TTL expiry of the file's cells (0 = none).
    pub ttl_percentile_expiry: u64,

    /// Read misses this file may absorb before a seek compaction is
    /// charged against it.
    pub allowed_seeks: AtomicI64,
}

impl FileMeta {
    /// Path of the physical file.
    pub fn path(&self) -> String {
        table_file_path(&self.dir, self.number)
    }

    /// True when the file's key span overlaps `[start, end)` of user-key
    /// space (`end` empty = unbounded).
    pub fn overlaps_range(&self, start: &[u8], end: &[u8]) -> bool {
        let after = !end.is_empty() && self.smallest.user_key.as_slice() >= end;
        let before = !start.is_empty() && self.largest.user_key.as_slice() < start;
        !(after || before)
    }
}

impl Clone for FileMeta {
    fn clone(&self) -> Self {
        Self {
            number: self.number,
            dir: self.dir.clone(),
            size: self.size,
            entries: self.entries,
            smallest: self.smallest.clone(),
            largest: self.largest.clone(),
            delete_tag_percent: self.delete_tag_percent,
            ttl_percentile_expiry: self.ttl_percentile_expiry,
            allowed_seeks: AtomicI64::new(self.allowed_seeks.load(Ordering::Relaxed)),
        }
    }
}

impl Encode for FileMeta {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.number.encode_to(buf)?;
        self.dir.clone().encode_to(buf)?;
        self.size.encode_to(buf)?;
        self.entries.encode_to(buf)?;
        self.smallest.encode_to(buf)?;
        self.largest.encode_to(buf)?;
        self.delete_tag_percent.encode_to(buf)?;
        self.ttl_percentile_expiry.encode_to(buf)
    }
}

impl Decode for FileMeta {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (number, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (dir, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (size, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (entries, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (smallest, n) = InternalKey::decode_from(&buf[offset..])?;
        offset += n;
        let (largest, n) = InternalKey::decode_from(&buf[offset..])?;
        offset += n;
        let (delete_tag_percent, n) = u8::decode_from(&buf[offset..])?;
        offset += n;
        let (ttl_percentile_expiry, n) = u64::decode_from(&buf[offset..])?;
        offset += n;

        // Reads before a charged seek scale with file size, one seek per
        // 16 KiB, floored so tiny files are not compacted eagerly.
        let allowed = ((size / 16_384) as i64).max(100);
        Ok((
            Self {
                number,
                dir,
                size,
                entries,
                smallest,
                largest,
                delete_tag_percent,
                ttl_percentile_expiry,
                allowed_seeks: AtomicI64::new(allowed),
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// VersionEdit
// ------------------------------------------------------------------------------------------------

/// A delta against the current version, logged to the MANIFEST.
#[derive(Debug, Default)]
pub struct VersionEdit {
    /// Comparator name sanity check (set once on creation).
    pub comparator: Option<String>,

    /// New lowest live WAL number.
    pub log_number: Option<u64>,

    /// New next-file-number floor.
    pub next_file_number: Option<u64>,

    /// New last-sequence watermark.
    pub last_sequence: Option<SequenceNumber>,

    /// Per-level compaction cursors: `(level, key)`.
    pub compact_pointers: Vec<(u32, InternalKey)>,

    /// Files removed: `(level, file_number, dir)`. The directory
    /// disambiguates inherited files whose numbers collide across parents.
    pub deleted_files: Vec<(u32, u64, String)>,

    /// Files added: `(level, meta)`.
    pub added_files: Vec<(u32, FileMeta)>,
}

impl VersionEdit {
    /// Serialize as a run of tagged fields.
    pub fn encode(&self) -> Result<Vec<u8>, EncodingError> {
        let mut buf = Vec::new();
        if let Some(comparator) = &self.comparator {
            TAG_COMPARATOR.encode_to(&mut buf)?;
            comparator.encode_to(&mut buf)?;
        }
        if let Some(log_number) = self.log_number {
            TAG_LOG_NUMBER.encode_to(&mut buf)?;
            log_number.encode_to(&mut buf)?;
        }
        if let Some(next_file) = self.next_file_number {
            TAG_NEXT_FILE.encode_to(&mut buf)?;
            next_file.encode_to(&mut buf)?;
        }
        if let Some(last_sequence) = self.last_sequence {
            TAG_LAST_SEQUENCE.encode_to(&mut buf)?;
            last_sequence.encode_to(&mut buf)?;
        }
        for (level, key) in &self.compact_pointers {
            TAG_COMPACT_POINTER.encode_to(&mut buf)?;
            level.encode_to(&mut buf)?;
            key.encode_to(&mut buf)?;
        }
        for (level, number, dir) in &self.deleted_files {
            TAG_DELETE_FILE.encode_to(&mut buf)?;
            level.encode_to(&mut buf)?;
            number.encode_to(&mut buf)?;
            dir.encode_to(&mut buf)?;
        }
        for (level, meta) in &self.added_files {
            TAG_ADD_FILE.encode_to(&mut buf)?;
            level.encode_to(&mut buf)?;
            meta.encode_to(&mut buf)?;
        }
        Ok(buf)
    }

    /// Parse a record serialized by [`VersionEdit::encode`]. Unknown tags
    /// at or above the forward-compatibility watermark are skipped; lower
    /// unknown tags are corruption.
    pub fn decode(bytes: &[u8]) -> Result<Self, VersionError> {
        let mut edit = Self::default();
        let mut offset = 0;
        while offset < bytes.len() {
            let (tag, n) = u32::decode_from(&bytes[offset..])?;
            offset += n;
            match tag {
                TAG_COMPARATOR => {
                    let (value, n) = String::decode_from(&bytes[offset..])?;
                    offset += n;
                    edit.comparator = Some(value);
                }
                TAG_LOG_NUMBER => {
                    let (value, n) = u64::decode_from(&bytes[offset..])?;
                    offset += n;
                    edit.log_number = Some(value);
                }
                TAG_NEXT_FILE => {
                    let (value, n) = u64::decode_from(&bytes[offset..])?;
                    offset += n;
                    edit.next_file_number = Some(value);
                }
                TAG_LAST_SEQUENCE => {
                    let (value, n) = u64::decode_from(&bytes[offset..])?;
                    offset += n;
                    edit.last_sequence = Some(value);
                }
                TAG_COMPACT_POINTER => {
                    let (level, n) = u32::decode_from(&bytes[offset..])?;
                    offset += n;
                    let (key, n) = InternalKey::decode_from(&bytes[offset..])?;
                    offset += n;
                    edit.compact_pointers.push((level, key));
                }
                TAG_DELETE_FILE => {
                    let (level, n) = u32::decode_from(&bytes[offset..])?;
                    offset += n;
                    let (number, n) = u64::decode_from(&bytes[offset..])?;
                    offset += n;
                    let (dir, n) = String::decode_from(&bytes[offset..])?;
                    offset += n;
                    edit.deleted_files.push((level, number, dir));
                }
                TAG_ADD_FILE => {
                    let (level, n) = u32::decode_from(&bytes[offset..])?;
                    offset += n;
                    let (meta, n) = FileMeta::decode_from(&bytes[offset..])?;
                    offset += n;
                    edit.added_files.push((level, meta));
                }
                tag if tag >= TAG_FORWARD_COMPAT => {
                    // Later formats frame their payload as a byte string so
                    // old readers can hop over it.
                    let (_skipped, n) = Vec::<u8>::decode_from(&bytes[offset..])?;
                    offset += n;
                }
                tag => {
                    return Err(VersionError::Corrupt(format!(
                        "unknown edit tag {tag} below compatibility watermark"
                    )));
                }
            }
        }
        Ok(edit)
    }
}

// ------------------------------------------------------------------------------------------------
// Version
// ------------------------------------------------------------------------------------------------

/// An immutable snapshot of the engine's file set.
#[derive(Debug, Default, Clone)]
pub struct Version {
    /// Table files per level. Level 0 is newest-first and may overlap;
    /// deeper levels are disjoint and sorted by smallest key.
    pub files: Vec<Vec<Arc<FileMeta>>>,
}

impl Version {
    /// An empty version with all levels present.
    pub fn empty() -> Self {
        Self {
            files: vec![Vec::new(); NUM_LEVELS],
        }
    }

    /// Total bytes at `level`.
    pub fn level_bytes(&self, level: usize) -> u64 {
        self.files[level].iter().map(|f| f.size).sum()
    }

    /// Number of files at `level`.
    pub fn level_len(&self, level: usize) -> usize {
        self.files[level].len()
    }

    /// Every file number referenced by this version.
    pub fn live_file_numbers(&self) -> HashSet<u64> {
        self.files
            .iter()
            .flatten()
            .map(|f| f.number)
            .collect()
    }

    /// Files of `level` whose key span overlaps `[start, end)`.
    pub fn overlapping_files(&self, level: usize, start: &[u8], end: &[u8]) -> Vec<Arc<FileMeta>> {
        self.files[level]
            .iter()
            .filter(|f| f.overlaps_range(start, end))
            .cloned()
            .collect()
    }

    /// The files a point lookup must consult for `user_key`, in probe
    /// order: all overlapping level-0 files newest-first, then at most one
    /// file per deeper level.
    pub fn files_for_get(&self, user_key: &[u8]) -> Vec<(usize, Arc<FileMeta>)> {
        let mut out = Vec::new();

        for file in &self.files[0] {
            if file.smallest.user_key.as_slice() <= user_key
                && user_key <= file.largest.user_key.as_slice()
            {
                out.push((0, Arc::clone(file)));
            }
        }

        for level in 1..NUM_LEVELS {
            let files = &self.files[level];
            let idx = files.partition_point(|f| f.largest.user_key.as_slice() < user_key);
            if idx < files.len() && files[idx].smallest.user_key.as_slice() <= user_key {
                out.push((level, Arc::clone(&files[idx])));
            }
        }
        out
    }

    /// Pick the deepest level ≤ [`MAX_MEM_COMPACT_LEVEL`] a fresh flush
    /// covering `[smallest, largest]` can be placed at without overlapping
    /// that level or overlapping too much of its grandparent.
    pub fn pick_level_for_output(&self, smallest: &[u8], largest: &[u8]) -> usize {
        let mut end = largest.to_vec();
        end.push(0);

        if !self.overlapping_files(0, smallest, &end).is_empty() {
            return 0;
        }
        let mut level = 0;
        while level < MAX_MEM_COMPACT_LEVEL {
            if !self.overlapping_files(level + 1, smallest, &end).is_empty() {
                break;
            }
            if level + 2 < NUM_LEVELS {
                let grandparent_bytes: u64 = self
                    .overlapping_files(level + 2, smallest, &end)
                    .iter()
                    .map(|f| f.size)
                    .sum();
                if grandparent_bytes > 10 * 2 * 1024 * 1024 {
                    break;
                }
            }
            level += 1;
        }
        level
    }

    /// Size-compaction score per level. Level 0 scores by file count.
    pub fn compaction_scores(&self) -> Vec<(usize, f64)> {
        let mut scores = Vec::with_capacity(NUM_LEVELS - 1);
        for level in 0..NUM_LEVELS - 1 {
            let score = if level == 0 {
                self.level_len(0) as f64 / L0_COMPACTION_TRIGGER as f64
            } else {
                self.level_bytes(level) as f64 / target_bytes_for_level(level) as f64
            };
            scores.push((level, score));
        }
        scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scores
    }

    /// Human-readable per-level file counts, for logs and metrics.
    pub fn level_summary(&self) -> String {
        let counts: Vec<String> = self
            .files
            .iter()
            .map(|files| files.len().to_string())
            .collect();
        format!("[{}]", counts.join(" "))
    }
}

/// Size target for a level: 10 MiB at level 1, ×10 per deeper level.
pub fn target_bytes_for_level(level: usize) -> u64 {
    let mut target = 10 * 1024 * 1024u64;
    for _ in 1..level {
        target = target.saturating_mul(10);
    }
    target
}

// ------------------------------------------------------------------------------------------------
// VersionSet
// ------------------------------------------------------------------------------------------------

/// Owns the current [`Version`], the MANIFEST writer, and the engine's
/// number counters. Mutated only under the engine mutex.
pub struct VersionSet {
    dfs: Arc<dyn Dfs>,

    /// The engine's own directory.
    pub dir: String,

    /// Live version; readers clone the `Arc` and drop it when done.
    current: Arc<Version>,

    /// Next file number to hand out (tables, logs, manifests).
    next_file_number: u64,

    /// Lowest WAL number still needed by recovery.
    pub log_number: u64,

    /// Highest sequence stamped on an acknowledged write.
    pub last_sequence: SequenceNumber,

    /// Per-level cursor where the next size compaction starts.
    pub compact_pointers: Vec<Option<InternalKey>>,

    manifest: Option<WalWriter>,
    manifest_number: u64,
}

impl VersionSet {
    /// Create an in-memory set with nothing on disk yet.
    pub fn new(dfs: Arc<dyn Dfs>, dir: String) -> Self {
        Self {
            dfs,
            dir,
            current: Arc::new(Version::empty()),
            next_file_number: 2,
            log_number: 0,
            last_sequence: 0,
            compact_pointers: vec![None; NUM_LEVELS],
            manifest: None,
            manifest_number: 1,
        }
    }

    /// The live version.
    pub fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    /// Allocate a fresh file number.
    pub fn new_file_number(&mut self) -> u64 {
        let number = self.next_file_number;
        self.next_file_number += 1;
        number
    }

    /// The next file number that would be handed out.
    pub fn peek_next_file_number(&self) -> u64 {
        self.next_file_number
    }

    /// Bump the counter so `number` is never reused.
    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    /// Apply `edit` to the current version, append it to the MANIFEST, and
    /// install the result. The caller holds the engine mutex.
    pub fn log_and_apply(&mut self, edit: &mut VersionEdit) -> Result<(), VersionError> {
        if edit.log_number.is_none() {
            edit.log_number = Some(self.log_number);
        }
        edit.next_file_number = Some(self.next_file_number);
        edit.last_sequence = Some(self.last_sequence);

        let next = self.build_version(edit)?;

        // Log before install: an edit that never reached the MANIFEST must
        // not change what readers see.
        let record = edit.encode()?;
        let manifest = self
            .manifest
            .as_mut()
            .ok_or_else(|| VersionError::Corrupt("version set has no manifest open".into()))?;
        manifest.add_record(&record)?;
        manifest.sync()?;

        self.install(edit, next);
        Ok(())
    }

    fn install(&mut self, edit: &VersionEdit, next: Version) {
        if let Some(log_number) = edit.log_number {
            self.log_number = log_number;
        }
        if let Some(last_sequence) = edit.last_sequence {
            self.last_sequence = last_sequence;
        }
        for (level, key) in &edit.compact_pointers {
            self.compact_pointers[*level as usize] = Some(key.clone());
        }
        self.current = Arc::new(next);
    }

    /// `current + edit`, with deeper levels kept sorted by smallest key.
    fn build_version(&self, edit: &VersionEdit) -> Result<Version, VersionError> {
        let mut next = (*self.current).clone();

        for (level, number, dir) in &edit.deleted_files {
            let level = *level as usize;
            if level >= NUM_LEVELS {
                return Err(VersionError::Corrupt(format!(
                    "delete-file record names level {level}"
                )));
            }
            next.files[level].retain(|f| f.number != *number || f.dir != *dir);
        }

        for (level, meta) in &edit.added_files {
            let level = *level as usize;
            if level >= NUM_LEVELS {
                return Err(VersionError::Corrupt(format!(
                    "add-file record names level {level}"
                )));
            }
            next.files[level].push(Arc::new(meta.clone()));
        }

        // Level 0 stays newest-first (higher numbers first); deeper levels
        // sort by smallest key and must stay disjoint.
        next.files[0].sort_by(|a, b| b.number.cmp(&a.number));
        for level in 1..NUM_LEVELS {
            next.files[level].sort_by(|a, b| a.smallest.cmp(&b.smallest));
            for pair in next.files[level].windows(2) {
                if pair[1].smallest.user_key <= pair[0].largest.user_key {
                    return Err(VersionError::Corrupt(format!(
                        "overlapping files {} and {} at level {level}",
                        pair[0].number, pair[1].number
                    )));
                }
            }
        }
        Ok(next)
    }

    // --------------------------------------------------------------------------------------------
    // Bootstrap and recovery
    // --------------------------------------------------------------------------------------------

    /// Create a brand-new engine directory with an empty version.
    pub fn create_new(&mut self) -> Result<(), VersionError> {
        self.dfs.create_dir_all(&self.dir)?;

        // The init marker makes a half-created directory recognisable.
        drop(self.dfs.create(&init_lock_path(&self.dir))?);

        let mut edit = VersionEdit {
            comparator: Some(COMPARATOR_NAME.to_string()),
            ..Default::default()
        };
        self.open_fresh_manifest()?;
        self.log_and_apply(&mut edit)?;

        self.dfs.delete(&init_lock_path(&self.dir))?;
        self.dfs.sync_dir(&self.dir)?;
        info!(dir = %self.dir, "engine directory created");
        Ok(())
    }

    /// Recover state from `CURRENT`, or inherit from `parents`, or (with
    /// `create_if_missing`) create a fresh directory.
    pub fn recover(
        &mut self,
        parents: &[String],
        create_if_missing: bool,
        ignore_corruption: bool,
    ) -> Result<(), VersionError> {
        let current_path = current_file_path(&self.dir);
        if !self.dfs.exists(&current_path) {
            if !parents.is_empty() {
                return self.inherit_from_parents(parents);
            }
            if create_if_missing {
                return self.create_new();
            }
            return Err(VersionError::Corrupt(format!(
                "no CURRENT file in {}",
                self.dir
            )));
        }

        let manifest_name = self.read_current()?;
        let manifest_path = format!("{}/{}", self.dir, manifest_name);
        self.replay_manifest(&manifest_path, ignore_corruption)?;

        // Every referenced file must exist, unless the caller tolerates
        // editing missing ones out.
        let missing = self.missing_files();
        if !missing.is_empty() {
            if !ignore_corruption {
                return Err(VersionError::Corrupt(format!(
                    "version references missing files: {missing:?}"
                )));
            }
            warn!(dir = %self.dir, ?missing, "editing missing files out of recovered version");
            let mut edit = VersionEdit::default();
            for (level, number, dir) in missing {
                edit.deleted_files.push((level as u32, number, dir));
            }
            self.open_fresh_manifest()?;
            self.log_and_apply(&mut edit)?;
            return Ok(());
        }

        // Continue in a fresh MANIFEST so replay cost stays bounded.
        self.open_fresh_manifest()?;
        let mut edit = VersionEdit::default();
        self.log_and_apply(&mut edit)?;

        debug!(dir = %self.dir, levels = %self.current.level_summary(), "version set recovered");
        Ok(())
    }

    /// Child bootstrap: adopt every live file of each parent version.
    fn inherit_from_parents(&mut self, parents: &[String]) -> Result<(), VersionError> {
        self.dfs.create_dir_all(&self.dir)?;

        let mut edit = VersionEdit {
            comparator: Some(COMPARATOR_NAME.to_string()),
            ..Default::default()
        };
        let mut inherited = 0usize;

        for parent_dir in parents {
            let mut parent_set = VersionSet::new(Arc::clone(&self.dfs), parent_dir.clone());
            let manifest_name = parent_set.read_current()?;
            let manifest_path = format!("{parent_dir}/{manifest_name}");
            parent_set.replay_manifest(&manifest_path, false)?;

            let parent_version = parent_set.current();
            for (level, files) in parent_version.files.iter().enumerate() {
                for file in files {
                    let mut meta = (**file).clone();
                    // A renumbered copy would collide with nothing: child
                    // numbers continue above every inherited number.
                    self.mark_file_number_used(meta.number);
                    meta.allowed_seeks = AtomicI64::new(100);
                    edit.added_files.push((level as u32, meta));
                    inherited += 1;
                }
            }
            if parent_set.last_sequence > self.last_sequence {
                self.last_sequence = parent_set.last_sequence;
            }
        }

        self.open_fresh_manifest()?;
        self.log_and_apply(&mut edit)?;
        info!(
            dir = %self.dir,
            parents = parents.len(),
            files = inherited,
            "inherited parent versions"
        );
        Ok(())
    }

    /// Files referenced by `current` but absent on the filesystem.
    fn missing_files(&self) -> Vec<(usize, u64, String)> {
        let mut missing = Vec::new();
        for (level, files) in self.current.files.iter().enumerate() {
            for file in files {
                if !self.dfs.exists(&file.path()) {
                    missing.push((level, file.number, file.dir.clone()));
                }
            }
        }
        missing
    }

    fn read_current(&self) -> Result<String, VersionError> {
        use std::io::Read;
        let mut reader = self.dfs.open_sequential(&current_file_path(&self.dir))?;
        let mut name = String::new();
        reader
            .read_to_string(&mut name)
            .map_err(|e| VersionError::Corrupt(format!("unreadable CURRENT: {e}")))?;
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(VersionError::Corrupt("empty CURRENT file".into()));
        }
        Ok(name)
    }

    fn replay_manifest(&mut self, path: &str, tolerate: bool) -> Result<(), VersionError> {
        let file = self.dfs.open_sequential(path)?;
        let mut reader = WalReader::with_tolerance(file, tolerate);

        let mut version = Version::empty();
        let mut applied = 0usize;
        while let Some(record) = reader.read_record()? {
            let edit = VersionEdit::decode(&record)?;

            for (level, number, dir) in &edit.deleted_files {
                version.files[*level as usize]
                    .retain(|f| f.number != *number || f.dir != *dir);
            }
            for (level, meta) in &edit.added_files {
                version.files[*level as usize].push(Arc::new(meta.clone()));
            }
            if let Some(log_number) = edit.log_number {
                self.log_number = log_number;
            }
            if let Some(last_sequence) = edit.last_sequence {
                self.last_sequence = last_sequence;
            }
            if let Some(next_file) = edit.next_file_number {
                self.mark_file_number_used(next_file.saturating_sub(1));
            }
            for (level, key) in &edit.compact_pointers {
                self.compact_pointers[*level as usize] = Some(key.clone());
            }
            applied += 1;
        }

        version.files[0].sort_by(|a, b| b.number.cmp(&a.number));
        for level in 1..NUM_LEVELS {
            version.files[level].sort_by(|a, b| a.smallest.cmp(&b.smallest));
        }
        self.current = Arc::new(version);
        debug!(path, edits = applied, "manifest replayed");
        Ok(())
    }

    /// Start a fresh MANIFEST seeded with a full snapshot of the current
    /// state, then point `CURRENT` at it.
    fn open_fresh_manifest(&mut self) -> Result<(), VersionError> {
        let manifest_number = self.new_file_number();
        let manifest_path = manifest_file_path(&self.dir, manifest_number);
        let mut writer = WalWriter::new(self.dfs.create(&manifest_path)?);

        // Snapshot record: the whole current state as one edit.
        let mut snapshot = VersionEdit {
            comparator: Some(COMPARATOR_NAME.to_string()),
            log_number: Some(self.log_number),
            next_file_number: Some(self.next_file_number),
            last_sequence: Some(self.last_sequence),
            ..Default::default()
        };
        for (level, key) in self.compact_pointers.iter().enumerate() {
            if let Some(key) = key {
                snapshot.compact_pointers.push((level as u32, key.clone()));
            }
        }
        for (level, files) in self.current.files.iter().enumerate() {
            for file in files {
                snapshot.added_files.push((level as u32, (**file).clone()));
            }
        }
        writer.add_record(&snapshot.encode()?)?;
        writer.sync()?;

        self.set_current(manifest_number)?;
        self.manifest = Some(writer);
        self.manifest_number = manifest_number;
        Ok(())
    }

    /// Atomically rewrite `CURRENT` to name MANIFEST `number`.
    fn set_current(&self, number: u64) -> Result<(), VersionError> {
        let tmp_path = format!("{}/CURRENT.{number:06}.tmp", self.dir);
        let mut tmp = self.dfs.create(&tmp_path)?;
        tmp.append(format!("MANIFEST-{number:06}\n").as_bytes())?;
        tmp.sync()?;
        drop(tmp);
        self.dfs.rename(&tmp_path, &current_file_path(&self.dir))?;
        self.dfs.sync_dir(&self.dir)?;
        Ok(())
    }

    /// File numbers that must not be deleted: everything in the current
    /// version plus the live MANIFEST.
    pub fn live_files(&self) -> HashSet<u64> {
        let mut live = self.current.live_file_numbers();
        live.insert(self.manifest_number);
        live
    }

    /// The live MANIFEST's number.
    pub fn manifest_number(&self) -> u64 {
        self.manifest_number
    }
}

/// Comparator identity recorded in every MANIFEST.
pub const COMPARATOR_NAME: &str = "tabletdb.InternalKeyComparator";
