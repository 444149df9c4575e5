//! Tablets and the tablet registry.
//!
//! A **tablet** owns a contiguous row-key range of one table: one LSM
//! engine per locality group, a shared schema, and a lifecycle state
//! machine driven by the server's control operations. The **manager** is
//! the server-wide registry mapping `(table, key_start)` to live tablets,
//! rejecting overlap and resolving point lookups to the unique containing
//! range.
//!
//! ## Lifecycle
//!
//! ```text
//! NotInit → OnLoad → Ready ─┬→ OnSplit → Splited
//!                           └→ Unloading → Unloading2 → (removed)
//! ```
//!
//! `Unloading` stops admitting foreground operations; `Unloading2` is the
//! second stop phase entered once in-flight operations drain, where
//! background work is cancelled and the engines close. Foreground
//! operations hold a [`TabletOpGuard`] so unload can wait for exactly the
//! operations admitted before the state flipped.

pub mod cellkey;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::engine::key::SequenceNumber;
use crate::engine::{
    EngineError, LsmEngine, ScanOptions, WriteOptions, WriteRecord, now_micros,
};
use crate::engine::key::ValueKind;
use crate::schema::{Schema, SchemaError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors from tablet operations.
#[derive(Debug, Error)]
pub enum TabletError {
    /// The target row is outside this tablet's range (or the tablet is
    /// not on this server).
    #[error("key not in range")]
    KeyNotInRange,

    /// A tablet overlapping the requested range is already registered.
    #[error("range overlaps tablet {0:?}")]
    RangeOverlap(String),

    /// No tablet registered under the requested identity.
    #[error("tablet not found")]
    NotFound,

    /// Illegal lifecycle transition.
    #[error("illegal state change {from:?} → {to:?}")]
    IllegalState {
        /// Current state.
        from: TabletState,
        /// Requested state.
        to: TabletState,
    },

    /// The tablet stopped admitting operations (unloading or split).
    #[error("tablet unavailable in state {0:?}")]
    Unavailable(TabletState),

    /// A row key the cell packing cannot represent.
    #[error("unpackable row key")]
    BadRowKey,

    /// The named column family is not in the schema.
    #[error("unknown column family {0:?}")]
    UnknownFamily(String),

    /// Engine failure.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Schema failure.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
}

// ------------------------------------------------------------------------------------------------
// Identity and lifecycle
// ------------------------------------------------------------------------------------------------

/// Lifecycle of one tablet on this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabletState {
    /// Constructed, engines not yet opened.
    NotInit,
    /// Engines opening.
    OnLoad,
    /// Serving reads and writes.
    Ready,
    /// A split is being computed; reads continue, writes drain.
    OnSplit,
    /// First unload phase: no new foreground operations.
    Unloading,
    /// Second unload phase: foreground drained, background cancelled.
    Unloading2,
    /// Split finished; children own the range.
    Splited,
}

impl TabletState {
    fn can_become(self, next: TabletState) -> bool {
        use TabletState::*;
        matches!(
            (self, next),
            (NotInit, OnLoad)
                | (OnLoad, Ready)
                | (Ready, OnSplit)
                | (Ready, Unloading)
                | (OnSplit, Ready)
                | (OnSplit, Splited)
                | (OnSplit, Unloading)
                | (Unloading, Unloading2)
        )
    }
}

/// A tablet's identity, as assigned by the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabletMeta {
    /// Owning table.
    pub table: String,

    /// Inclusive range start.
    pub key_start: Vec<u8>,

    /// Exclusive range end; empty = unbounded.
    pub key_end: Vec<u8>,

    /// DFS directory of this tablet (engines live under `path/<lg>`).
    pub path: String,

    /// Master-assigned creation time.
    pub create_time: u64,

    /// Master-assigned metadata version.
    pub version: u64,

    /// Parent tablet paths: empty (fresh), one (split child), or two
    /// (merge child).
    pub parents: Vec<String>,
}

impl TabletMeta {
    /// True when `row` falls inside `[key_start, key_end)`.
    pub fn contains_row(&self, row: &[u8]) -> bool {
        row >= self.key_start.as_slice() && (self.key_end.is_empty() || row < self.key_end.as_slice())
    }

    /// Registry key of this tablet.
    pub fn registry_key(&self) -> (String, Vec<u8>) {
        (self.table.clone(), self.key_start.clone())
    }
}

// ------------------------------------------------------------------------------------------------
// Data operation types
// ------------------------------------------------------------------------------------------------

/// One cell mutation inside a row write.
#[derive(Debug, Clone)]
pub struct CellMutation {
    /// Column family name.
    pub family: String,

    /// Column qualifier.
    pub qualifier: Vec<u8>,

    /// Cell timestamp; `None` = server-assigned now.
    pub timestamp: Option<u64>,

    /// Put a value or delete the cell version.
    pub op: MutationOp,
}

/// What a mutation does.
#[derive(Debug, Clone)]
pub enum MutationOp {
    /// Store a value.
    Put(Vec<u8>),
    /// Tombstone the cell (at the mutation's timestamp).
    Delete,
}

/// A materialised cell returned by reads and scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Row key.
    pub row: Vec<u8>,

    /// Column family name.
    pub family: String,

    /// Column qualifier.
    pub qualifier: Vec<u8>,

    /// Cell timestamp, microseconds.
    pub timestamp: u64,

    /// Cell value.
    pub value: Vec<u8>,
}

// ------------------------------------------------------------------------------------------------
// Tablet
// ------------------------------------------------------------------------------------------------

/// Guard held by every admitted foreground operation.
///
/// Unload waits for the count to drain before entering `Unloading2`.
pub struct TabletOpGuard {
    refs: Arc<AtomicUsize>,
}

impl Drop for TabletOpGuard {
    fn drop(&mut self) {
        self.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One loaded tablet: per-LG engines plus lifecycle state.
pub struct Tablet {
    meta: TabletMeta,
    schema: RwLock<Schema>,

    /// Engines by locality-group name.
    engines: HashMap<String, LsmEngine>,

    /// Family name → (group name, family id within the group).
    family_index: RwLock<HashMap<String, (String, u8)>>,

    state: Mutex<TabletState>,

    /// In-flight foreground operations.
    foreground: Arc<AtomicUsize>,
}

impl Tablet {
    /// Assemble a tablet from opened engines. The caller (the server's
    /// load pipeline) opens one engine per locality group first.
    pub fn new(meta: TabletMeta, schema: Schema, engines: HashMap<String, LsmEngine>) -> Self {
        let family_index = build_family_index(&schema);
        Self {
            meta,
            schema: RwLock::new(schema),
            engines,
            family_index: RwLock::new(family_index),
            state: Mutex::new(TabletState::NotInit),
            foreground: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Identity of this tablet.
    pub fn meta(&self) -> &TabletMeta {
        &self.meta
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TabletState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Transition the lifecycle, enforcing the legal edges.
    pub fn set_state(&self, next: TabletState) -> Result<(), TabletError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.can_become(next) {
            return Err(TabletError::IllegalState {
                from: *state,
                to: next,
            });
        }
        debug!(table = %self.meta.table, from = ?*state, to = ?next, "tablet state change");
        *state = next;
        Ok(())
    }

    /// Admit one foreground operation, or refuse in a non-serving state.
    pub fn admit(&self) -> Result<TabletOpGuard, TabletError> {
        let state = self.state();
        if !matches!(state, TabletState::Ready | TabletState::OnSplit) {
            return Err(TabletError::Unavailable(state));
        }
        self.foreground.fetch_add(1, Ordering::AcqRel);
        Ok(TabletOpGuard {
            refs: Arc::clone(&self.foreground),
        })
    }

    /// In-flight foreground operations.
    pub fn foreground_ops(&self) -> usize {
        self.foreground.load(Ordering::Acquire)
    }

    /// The engine of locality group `name`.
    pub fn engine(&self, name: &str) -> Option<&LsmEngine> {
        self.engines.get(name)
    }

    /// Every engine with its group name.
    pub fn engines(&self) -> impl Iterator<Item = (&String, &LsmEngine)> {
        self.engines.iter()
    }

    /// Total approximate size across locality groups.
    pub fn approximate_size(&self) -> u64 {
        self.engines.values().map(LsmEngine::approximate_size).sum()
    }

    /// The current schema.
    pub fn schema(&self) -> Schema {
        self.schema.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn family_coordinates(&self, family: &str) -> Result<(String, u8), TabletError> {
        self.family_index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(family)
            .cloned()
            .ok_or_else(|| TabletError::UnknownFamily(family.to_string()))
    }

    // --------------------------------------------------------------------------------------------
    // Data path
    // --------------------------------------------------------------------------------------------

    /// Apply one row's mutations atomically per locality group.
    pub fn write_row(
        &self,
        row: &[u8],
        mutations: &[CellMutation],
        sync: bool,
    ) -> Result<(), TabletError> {
        let _guard = self.admit()?;
        if !self.meta.contains_row(row) {
            return Err(TabletError::KeyNotInRange);
        }
        if !cellkey::row_is_packable(row) {
            return Err(TabletError::BadRowKey);
        }

        // Group mutations by engine.
        let mut by_group: HashMap<String, Vec<WriteRecord>> = HashMap::new();
        for mutation in mutations {
            let (group, family_id) = self.family_coordinates(&mutation.family)?;
            let timestamp = mutation.timestamp.unwrap_or_else(now_micros);
            let key = cellkey::pack(row, family_id, &mutation.qualifier, timestamp);
            let record = match &mutation.op {
                MutationOp::Put(value) => WriteRecord {
                    kind: ValueKind::Value,
                    key,
                    value: value.clone(),
                    sequence: None,
                },
                MutationOp::Delete => WriteRecord {
                    kind: ValueKind::Deletion,
                    key,
                    value: Vec::new(),
                    sequence: None,
                },
            };
            by_group.entry(group).or_default().push(record);
        }

        let options = WriteOptions { sync };
        for (group, records) in by_group {
            let engine = self
                .engines
                .get(&group)
                .ok_or_else(|| TabletError::UnknownFamily(group.clone()))?;
            engine.write(&records, &options)?;
        }
        Ok(())
    }

    /// Read every visible cell of one row, optionally restricted to
    /// families/qualifiers, capped at `max_versions` per cell.
    pub fn read_row(
        &self,
        row: &[u8],
        families: &[String],
        max_versions: u32,
        snapshot: Option<SequenceNumber>,
    ) -> Result<Vec<Cell>, TabletError> {
        let _guard = self.admit()?;
        if !self.meta.contains_row(row) {
            return Err(TabletError::KeyNotInRange);
        }

        let schema = self.schema();
        let start = cellkey::row_lower_bound(row);
        let end = cellkey::row_upper_bound(row);

        let mut cells = Vec::new();
        for group in &schema.groups {
            if !families.is_empty()
                && !group
                    .families
                    .iter()
                    .any(|f| families.iter().any(|wanted| *wanted == f.name))
            {
                continue;
            }
            let Some(engine) = self.engines.get(&group.name) else {
                continue;
            };
            let page = engine.scan(&ScanOptions {
                start: start.clone(),
                end: end.clone(),
                snapshot,
                max_versions,
                ..Default::default()
            })?;
            self.collect_cells(group.name.as_str(), &page.cells, families, &mut cells);
        }
        cells.sort_by(|a, b| {
            (&a.family, &a.qualifier, std::cmp::Reverse(a.timestamp)).cmp(&(
                &b.family,
                &b.qualifier,
                std::cmp::Reverse(b.timestamp),
            ))
        });

        // Version cap per (family, qualifier); timestamps within a cell
        // are already newest-first after the sort.
        if max_versions != 0 {
            let mut kept = Vec::with_capacity(cells.len());
            let mut current: Option<(String, Vec<u8>)> = None;
            let mut versions = 0u32;
            for cell in cells {
                let coordinate = (cell.family.clone(), cell.qualifier.clone());
                if current.as_ref() != Some(&coordinate) {
                    current = Some(coordinate);
                    versions = 0;
                }
                if versions < max_versions {
                    versions += 1;
                    kept.push(cell);
                }
            }
            return Ok(kept);
        }
        Ok(cells)
    }

    fn collect_cells(
        &self,
        group: &str,
        raw: &[(Vec<u8>, Vec<u8>)],
        families: &[String],
        out: &mut Vec<Cell>,
    ) {
        let schema = self.schema();
        let Some(group_schema) = schema.group(group) else {
            return;
        };
        for (packed, value) in raw {
            let Some(unpacked) = cellkey::unpack(packed) else {
                warn!(table = %self.meta.table, "unpackable cell key skipped");
                continue;
            };
            let Some(family) = group_schema.families.get(unpacked.family_id as usize) else {
                continue;
            };
            if !families.is_empty() && !families.iter().any(|wanted| *wanted == family.name) {
                continue;
            }
            out.push(Cell {
                row: unpacked.row,
                family: family.name.clone(),
                qualifier: unpacked.qualifier,
                timestamp: unpacked.timestamp,
                value: value.clone(),
            });
        }
    }

    /// Scan rows in `[start_row, end_row)` across every locality group,
    /// bounded by cell count. Returns the cells plus the resume row when
    /// the budget cut the page.
    pub fn scan_rows(
        &self,
        start_row: &[u8],
        end_row: &[u8],
        families: &[String],
        cell_budget: usize,
        snapshot: Option<SequenceNumber>,
    ) -> Result<(Vec<Cell>, Option<Vec<u8>>), TabletError> {
        let _guard = self.admit()?;

        // Clamp to the tablet's range.
        let start_row = if start_row < self.meta.key_start.as_slice() {
            &self.meta.key_start
        } else {
            start_row
        };
        let scan_start = if start_row.is_empty() {
            Vec::new()
        } else {
            cellkey::row_lower_bound(start_row)
        };
        let effective_end = if self.meta.key_end.is_empty() {
            end_row.to_vec()
        } else if end_row.is_empty() || self.meta.key_end.as_slice() < end_row {
            self.meta.key_end.clone()
        } else {
            end_row.to_vec()
        };
        let scan_end = if effective_end.is_empty() {
            Vec::new()
        } else {
            cellkey::row_lower_bound(&effective_end)
        };

        let schema = self.schema();
        let mut cells = Vec::new();
        // Rows at which an engine's page was cut; cells of those rows may
        // be incomplete in this pass.
        let mut cut_rows: Vec<Vec<u8>> = Vec::new();
        for group in &schema.groups {
            if !families.is_empty()
                && !group
                    .families
                    .iter()
                    .any(|f| families.iter().any(|wanted| *wanted == f.name))
            {
                continue;
            }
            let Some(engine) = self.engines.get(&group.name) else {
                continue;
            };
            let page = engine.scan(&ScanOptions {
                start: scan_start.clone(),
                end: scan_end.clone(),
                snapshot,
                byte_budget: 0,
                row_budget: cell_budget,
                max_versions: 0,
            })?;
            if page.more {
                if let Some(next) = &page.next_start {
                    cut_rows.push(cellkey::row_of(next).to_vec());
                }
            }
            self.collect_cells(group.name.as_str(), &page.cells, families, &mut cells);
        }

        // One global row/column order across groups.
        cells.sort_by(|a, b| {
            (&a.row, &a.family, &a.qualifier, std::cmp::Reverse(a.timestamp)).cmp(&(
                &b.row,
                &b.family,
                &b.qualifier,
                std::cmp::Reverse(b.timestamp),
            ))
        });

        // The page ends at the earliest incomplete row, whether cut by an
        // engine page or by the cell budget.
        let mut boundary: Option<Vec<u8>> = cut_rows.into_iter().min();
        if cell_budget != 0 && cells.len() > cell_budget {
            let budget_row = cells[cell_budget].row.clone();
            boundary = Some(match boundary {
                Some(row) => row.min(budget_row),
                None => budget_row,
            });
        }

        let Some(boundary) = boundary else {
            return Ok((cells, None));
        };
        if cells.first().is_some_and(|cell| cell.row == boundary) {
            // The boundary row is the very first row: emit it whole (a
            // row is never split across pages) and resume past it.
            let cells = self.scan_single_row(&boundary, families, snapshot)?;
            return Ok((cells, Some(cellkey::row_successor(&boundary))));
        }
        cells.retain(|cell| cell.row < boundary);
        Ok((cells, Some(boundary)))
    }

    /// Unbudgeted scan of exactly one row, for oversized-row pages.
    fn scan_single_row(
        &self,
        row: &[u8],
        families: &[String],
        snapshot: Option<SequenceNumber>,
    ) -> Result<Vec<Cell>, TabletError> {
        let schema = self.schema();
        let start = cellkey::row_lower_bound(row);
        let end = cellkey::row_upper_bound(row);
        let mut cells = Vec::new();
        for group in &schema.groups {
            let Some(engine) = self.engines.get(&group.name) else {
                continue;
            };
            let page = engine.scan(&ScanOptions {
                start: start.clone(),
                end: end.clone(),
                snapshot,
                ..Default::default()
            })?;
            self.collect_cells(group.name.as_str(), &page.cells, families, &mut cells);
        }
        cells.sort_by(|a, b| {
            (&a.family, &a.qualifier, std::cmp::Reverse(a.timestamp)).cmp(&(
                &b.family,
                &b.qualifier,
                std::cmp::Reverse(b.timestamp),
            ))
        });
        Ok(cells)
    }

    // --------------------------------------------------------------------------------------------
    // Control path
    // --------------------------------------------------------------------------------------------

    /// A row key splitting the tablet at roughly half its bytes, from the
    /// largest locality group. `None` when nothing is splittable.
    pub fn compute_split_key(&self) -> Result<Option<Vec<u8>>, TabletError> {
        let largest = self
            .engines
            .values()
            .max_by_key(|engine| engine.approximate_size());
        let Some(engine) = largest else {
            return Ok(None);
        };
        let Some(packed) = engine.find_split_key(0.5)? else {
            return Ok(None);
        };
        let row = cellkey::row_of(&packed).to_vec();

        // A split at or outside the range bounds is useless.
        if row <= self.meta.key_start
            || (!self.meta.key_end.is_empty() && row >= self.meta.key_end)
        {
            return Ok(None);
        }
        Ok(Some(row))
    }

    /// Swap the schema in place and push the derived settings into every
    /// engine.
    pub fn apply_schema(&self, new_schema: Schema) -> Result<(), TabletError> {
        new_schema.validate()?;
        for group in &new_schema.groups {
            if let Some(engine) = self.engines.get(&group.name) {
                engine.apply_schema(
                    group.effective_max_versions(),
                    group.effective_ttl_micros(),
                    group.strategy,
                    group.bloom,
                    group.compression_id,
                )?;
            }
        }
        *self.family_index.write().unwrap_or_else(|e| e.into_inner()) =
            build_family_index(&new_schema);
        *self.schema.write().unwrap_or_else(|e| e.into_inner()) = new_schema;
        info!(table = %self.meta.table, "schema updated in place");
        Ok(())
    }

    /// Trigger a manual compaction of one group or all of them.
    pub fn compact(&self, group: Option<&str>) -> Result<(), TabletError> {
        for (name, engine) in &self.engines {
            if group.is_some_and(|wanted| wanted != name) {
                continue;
            }
            engine.compact_range(b"", b"")?;
        }
        Ok(())
    }

    /// True when any engine declared itself unrecoverable.
    pub fn any_engine_force_unload(&self) -> bool {
        self.engines.values().any(LsmEngine::is_force_unload)
    }

    /// Close every engine (final unload phase).
    pub fn close_engines(&self) -> Result<(), TabletError> {
        for engine in self.engines.values() {
            engine.close()?;
        }
        Ok(())
    }

    /// The highest acknowledged sequence across groups.
    pub fn last_sequence(&self) -> SequenceNumber {
        self.engines
            .values()
            .map(LsmEngine::last_sequence)
            .max()
            .unwrap_or(0)
    }
}

fn build_family_index(schema: &Schema) -> HashMap<String, (String, u8)> {
    let mut index = HashMap::new();
    for group in &schema.groups {
        for (family_idx, family) in group.families.iter().enumerate() {
            index.insert(
                family.name.clone(),
                (group.name.clone(), family_idx as u8),
            );
        }
    }
    index
}

// ------------------------------------------------------------------------------------------------
// TabletManager
// ------------------------------------------------------------------------------------------------

/// Server-wide registry of live tablets, ordered by `(table, key_start)`.
pub struct TabletManager {
    tablets: Mutex<BTreeMap<(String, Vec<u8>), Arc<Tablet>>>,
}

impl TabletManager {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            tablets: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a tablet, rejecting any range overlap within its table.
    pub fn add(&self, tablet: Arc<Tablet>) -> Result<(), TabletError> {
        let mut tablets = self.tablets.lock().unwrap_or_else(|e| e.into_inner());
        let meta = tablet.meta();

        for ((table, _), existing) in tablets.iter() {
            if *table != meta.table {
                continue;
            }
            let other = existing.meta();
            let disjoint = (!meta.key_end.is_empty()
                && meta.key_end.as_slice() <= other.key_start.as_slice())
                || (!other.key_end.is_empty()
                    && other.key_end.as_slice() <= meta.key_start.as_slice());
            if !disjoint {
                return Err(TabletError::RangeOverlap(format!(
                    "{}:{:?}",
                    other.table, other.key_start
                )));
            }
        }

        tablets.insert(meta.registry_key(), Arc::clone(&tablet));
        Ok(())
    }

    /// Deregister by identity. Returns the removed tablet.
    pub fn remove(&self, table: &str, key_start: &[u8]) -> Result<Arc<Tablet>, TabletError> {
        let mut tablets = self.tablets.lock().unwrap_or_else(|e| e.into_inner());
        tablets
            .remove(&(table.to_string(), key_start.to_vec()))
            .ok_or(TabletError::NotFound)
    }

    /// The unique tablet whose range contains `(table, row)`.
    pub fn get_tablet(&self, table: &str, row: &[u8]) -> Result<Arc<Tablet>, TabletError> {
        let tablets = self.tablets.lock().unwrap_or_else(|e| e.into_inner());
        let upper = (table.to_string(), row.to_vec());
        let candidate = tablets
            .range(..=upper)
            .next_back()
            .filter(|((t, _), _)| t == table)
            .map(|(_, tablet)| Arc::clone(tablet));
        match candidate {
            Some(tablet) if tablet.meta().contains_row(row) => Ok(tablet),
            _ => Err(TabletError::KeyNotInRange),
        }
    }

    /// Every registered tablet.
    pub fn list(&self) -> Vec<Arc<Tablet>> {
        self.tablets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Number of registered tablets.
    pub fn len(&self) -> usize {
        self.tablets.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// True when no tablet is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TabletManager {
    fn default() -> Self {
        Self::new()
    }
}
