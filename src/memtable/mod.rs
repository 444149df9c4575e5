//! # Memtable Module
//!
//! The in-memory ordered write buffer of an LSM engine.
//!
//! ## Design Invariants
//!
//! - Entries are addressed by [`InternalKey`]; multiple versions per user
//!   key coexist, ordered newest-first by sequence.
//! - Deletes are tombstone entries, never physical removal.
//! - Once [`MemTable::set_being_flushed`] is set, no further `add` is
//!   accepted; the engine freezes a memtable before handing it to flush.
//! - Reads resolve against the engine's rollback windows: a version inside
//!   a window is invisible even though it is physically present.
//!
//! ## Variants
//!
//! Two layouts behind one API, selected at construction:
//!
//! - [`MemTableKind::Single`] — one ordered map under one `RwLock`; the
//!   default, cheapest for modest write rates.
//! - [`MemTableKind::Sharded`] — N independently locked shards selected by
//!   a hash of the user key; point operations touch one shard, iteration
//!   merges all shards back into internal-key order.
//!
//! ## Ownership
//!
//! Memtables are shared as `Arc<MemTable>`: the engine holds the mutable
//! and immutable tables, flush jobs and iterators hold clones, and the
//! memory is released when the last holder drops.

#[cfg(test)]
mod tests;

use std::{
    collections::BTreeMap,
    hash::{Hash, Hasher},
    sync::{
        RwLock,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use thiserror::Error;
use tracing::trace;

use crate::engine::key::{
    InternalKey, LookupKey, Rollbacks, SequenceNumber, ValueKind, is_rolled_back,
};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by memtable operations.
#[derive(Debug, Error)]
pub enum MemTableError {
    /// `add` was called after the table was frozen for flush.
    #[error("memtable is frozen for flush")]
    Frozen,

    /// Internal invariant violation (poisoned lock).
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Result of a point lookup
// ------------------------------------------------------------------------------------------------

/// Outcome of [`MemTable::get`].
#[derive(Debug, PartialEq, Eq)]
pub enum MemTableGet {
    /// A live value visible at the lookup snapshot.
    Found(Vec<u8>),

    /// The newest visible version is a tombstone.
    Deleted,

    /// No visible version in this memtable; descend to older layers.
    NotFound,
}

// ------------------------------------------------------------------------------------------------
// Layout selection
// ------------------------------------------------------------------------------------------------

/// Memtable layout, chosen per locality group by engine options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemTableKind {
    /// One ordered map.
    Single,

    /// `n` hash-selected shards, each independently locked.
    Sharded(usize),
}

// ------------------------------------------------------------------------------------------------
// Core
// ------------------------------------------------------------------------------------------------

/// One version of one user key.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CellVersion {
    kind: ValueKind,
    value: Vec<u8>,
}

/// A single shard: user key → versions ordered newest-first.
#[derive(Default)]
struct Shard {
    tree: BTreeMap<Vec<u8>, BTreeMap<std::cmp::Reverse<SequenceNumber>, CellVersion>>,
}

/// The in-memory ordered write buffer.
pub struct MemTable {
    shards: Vec<RwLock<Shard>>,

    /// Approximate heap footprint of keys + values, in bytes.
    approximate_size: AtomicUsize,

    /// Set once the engine hands the table to flush; writes are rejected.
    being_flushed: AtomicBool,

    /// Pinned snapshot sequences (a multiset as seq → count).
    snapshots: RwLock<BTreeMap<SequenceNumber, usize>>,
}

impl MemTable {
    /// Create an empty memtable with the given layout.
    pub fn new(kind: MemTableKind) -> Self {
        let shard_count = match kind {
            MemTableKind::Single => 1,
            MemTableKind::Sharded(n) => n.max(1),
        };
        let shards = (0..shard_count).map(|_| RwLock::new(Shard::default())).collect();
        Self {
            shards,
            approximate_size: AtomicUsize::new(0),
            being_flushed: AtomicBool::new(false),
            snapshots: RwLock::new(BTreeMap::new()),
        }
    }

    fn shard_for(&self, user_key: &[u8]) -> &RwLock<Shard> {
        if self.shards.len() == 1 {
            return &self.shards[0];
        }
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        user_key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Insert one entry. The engine stamps `sequence` before calling.
    pub fn add(
        &self,
        sequence: SequenceNumber,
        kind: ValueKind,
        user_key: &[u8],
        value: &[u8],
    ) -> Result<(), MemTableError> {
        if self.being_flushed.load(Ordering::Acquire) {
            return Err(MemTableError::Frozen);
        }

        let entry_size = user_key.len() + value.len() + ENTRY_OVERHEAD;
        let mut shard = self
            .shard_for(user_key)
            .write()
            .map_err(|_| MemTableError::Internal("shard lock poisoned".into()))?;

        shard
            .tree
            .entry(user_key.to_vec())
            .or_default()
            .insert(
                std::cmp::Reverse(sequence),
                CellVersion {
                    kind,
                    value: value.to_vec(),
                },
            );
        drop(shard);

        self.approximate_size.fetch_add(entry_size, Ordering::Relaxed);
        Ok(())
    }

    /// Look up the newest version of `lookup.user_key` visible at
    /// `lookup.snapshot`, skipping rolled-back sequences.
    pub fn get(&self, lookup: &LookupKey, rollbacks: &Rollbacks) -> Result<MemTableGet, MemTableError> {
        let shard = self
            .shard_for(&lookup.user_key)
            .read()
            .map_err(|_| MemTableError::Internal("shard lock poisoned".into()))?;

        let Some(versions) = shard.tree.get(&lookup.user_key) else {
            return Ok(MemTableGet::NotFound);
        };

        // Versions iterate newest-first; take the first visible one.
        for (std::cmp::Reverse(sequence), cell) in versions.range(std::cmp::Reverse(lookup.snapshot)..) {
            if is_rolled_back(rollbacks, *sequence) {
                continue;
            }
            return Ok(match cell.kind {
                ValueKind::Value => MemTableGet::Found(cell.value.clone()),
                ValueKind::Deletion => MemTableGet::Deleted,
            });
        }
        Ok(MemTableGet::NotFound)
    }

    /// Collect every entry in `[start, end)` of user-key space, in
    /// internal-key order. An empty `end` means unbounded.
    ///
    /// The result owns its data so callers can merge it with SSTable
    /// iterators without holding shard locks.
    pub fn collect_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<(InternalKey, Vec<u8>)>, MemTableError> {
        let mut entries = Vec::new();
        for locked in &self.shards {
            let shard = locked
                .read()
                .map_err(|_| MemTableError::Internal("shard lock poisoned".into()))?;

            type VersionMap = BTreeMap<std::cmp::Reverse<SequenceNumber>, CellVersion>;
            let range: Box<dyn Iterator<Item = (&Vec<u8>, &VersionMap)>> = if end.is_empty() {
                Box::new(shard.tree.range(start.to_vec()..))
            } else {
                Box::new(shard.tree.range(start.to_vec()..end.to_vec()))
            };

            for (user_key, versions) in range {
                for (std::cmp::Reverse(sequence), cell) in versions {
                    entries.push((
                        InternalKey::new(user_key.clone(), *sequence, cell.kind),
                        cell.value.clone(),
                    ));
                }
            }
        }
        // Single shard is already ordered; merged shards are not.
        if self.shards.len() > 1 {
            entries.sort_by(|a, b| a.0.cmp(&b.0));
        }
        Ok(entries)
    }

    /// Collect the whole table for flush, in internal-key order.
    pub fn collect_all(&self) -> Result<Vec<(InternalKey, Vec<u8>)>, MemTableError> {
        self.collect_range(b"", b"")
    }

    /// Approximate heap footprint in bytes.
    pub fn approximate_memory_usage(&self) -> usize {
        self.approximate_size.load(Ordering::Relaxed)
    }

    /// True when no entry was ever added.
    pub fn is_empty(&self) -> bool {
        self.approximate_memory_usage() == 0
    }

    /// Freeze (or unfreeze) the table for flush.
    pub fn set_being_flushed(&self, flushed: bool) {
        self.being_flushed.store(flushed, Ordering::Release);
        trace!(flushed, "memtable flush state changed");
    }

    /// True once the table was frozen for flush.
    pub fn is_being_flushed(&self) -> bool {
        self.being_flushed.load(Ordering::Acquire)
    }

    /// Pin `sequence` so state visible at it stays resolvable.
    pub fn get_snapshot(&self, sequence: SequenceNumber) {
        if let Ok(mut snapshots) = self.snapshots.write() {
            *snapshots.entry(sequence).or_insert(0) += 1;
        }
    }

    /// Release one pin of `sequence`.
    pub fn release_snapshot(&self, sequence: SequenceNumber) {
        if let Ok(mut snapshots) = self.snapshots.write() {
            if let Some(count) = snapshots.get_mut(&sequence) {
                *count -= 1;
                if *count == 0 {
                    snapshots.remove(&sequence);
                }
            }
        }
    }

    /// The smallest pinned snapshot, if any.
    pub fn smallest_snapshot(&self) -> Option<SequenceNumber> {
        self.snapshots
            .read()
            .ok()
            .and_then(|snapshots| snapshots.keys().next().copied())
    }
}

/// Fixed bookkeeping cost charged per entry on top of key + value bytes.
const ENTRY_OVERHEAD: usize = 64;
