//! Tablet-server core.
//!
//! Owns the coordinator session, the tablet registry, the per-workload
//! thread pools, the shared caches, and every control and data operation
//! the master or a client can issue:
//!
//! `load_tablet, unload_tablet, write_tablet, read_tablet, scan_tablet,
//! compact_tablet, compute_split_key, update_schema, query, cmd_ctrl`.
//!
//! ## Session discipline
//!
//! The server mints a session id at startup (in production it is
//! registered in the coordinator namespace). Every **control** operation
//! carries the master's view of that id; a mismatch — a message from a
//! master that knew a previous incarnation — is rejected with
//! [`TabletStatus::IllegalAccess`] and has no side effects.
//!
//! ## Pools and limits
//!
//! Workloads are separated into control, light-control, read, write,
//! scan, and compaction pools. Remote reads are gated where they happen:
//! a [`ThrottledDfs`] layer sits directly over the remote filesystem,
//! below every cache layer, capping concurrent DFS reads under the
//! read-pool size — memtable hits, block-cache hits, and SSD-cache hits
//! never spend a permit, so local reads cannot starve behind remote
//! ones. The persistent cache additionally runs its miss list on a DFS
//! pool sized at the same limit.
//!
//! ## Background timers
//!
//! One maintenance thread drives the heartbeat-ish duties: refreshing
//! per-tablet status for `query`, force-unloading tablets whose engine
//! declared itself unrecoverable, evicting idle scan contexts, running
//! the cache GC cycle, and the periodic heap-release hook.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::dfs::{Dfs, LocalDfs, ThrottledDfs};
use crate::engine::key::Rollbacks;
use crate::engine::{EngineError, EngineOptions, LsmEngine, now_micros};
use crate::memtable::MemTableKind;
use crate::mirror::{FlashMirrorCache, MirrorDfs};
use crate::pbc::{CacheOptions, CachePools, CachedDfs, PersistentBlockCache};
use crate::schema::Schema;
use crate::sstable::{BlockCache, TableCache};
use crate::tablet::{
    Cell, CellMutation, Tablet, TabletError, TabletManager, TabletMeta, TabletState,
};
use crate::threadpool::ThreadPool;

// ------------------------------------------------------------------------------------------------
// Status taxonomy
// ------------------------------------------------------------------------------------------------

/// Per-operation status surfaced to clients and the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TabletStatus {
    /// Success.
    Ok,
    /// Target tablet not on this server or key outside its range.
    KeyNotInRange,
    /// Session-id mismatch, or schema invalid at load.
    IllegalAccess,
    /// Generic DFS or local I/O failure.
    IoError,
    /// Non-retriable storage failure; the engine force-unloads.
    IoPermissionDenied,
    /// Split requested where no split key exists.
    TableNotSupport,
    /// Client deadline elapsed before the work completed.
    RpcTimeout,
    /// Admission control rejected the request.
    TabletNodeIsBusy,
    /// Row absent or fully shadowed by tombstones.
    KeyNotExist,
    /// Malformed request.
    InvalidArgument,
    /// Structured load/compact corruption report.
    Corrupt(String),
}

impl TabletStatus {
    fn from_tablet_error(e: &TabletError) -> Self {
        match e {
            TabletError::KeyNotInRange | TabletError::NotFound => Self::KeyNotInRange,
            TabletError::RangeOverlap(_) => Self::InvalidArgument,
            TabletError::IllegalState { .. } | TabletError::Unavailable(_) => {
                Self::TabletNodeIsBusy
            }
            TabletError::BadRowKey | TabletError::UnknownFamily(_) => Self::InvalidArgument,
            TabletError::Schema(_) => Self::IllegalAccess,
            TabletError::Engine(EngineError::Dfs(err)) if err.is_permission_denied() => {
                Self::IoPermissionDenied
            }
            TabletError::Engine(_) => Self::IoError,
        }
    }
}

/// Server-level failures (initialisation, shutdown).
#[derive(Debug, Error)]
pub enum ServerError {
    /// Filesystem failure during startup.
    #[error("dfs error: {0}")]
    Dfs(#[from] crate::dfs::DfsError),

    /// Persistent-cache failure during startup; fatal by policy.
    #[error("cache init error: {0}")]
    Cache(#[from] crate::pbc::CacheError),

    /// Mirror-cache failure during startup.
    #[error("mirror init error: {0}")]
    Mirror(#[from] crate::mirror::MirrorError),

    /// Config failure.
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Server lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    /// Constructed.
    NotInited,
    /// Initialising storage and pools.
    IsIniting,
    /// Serving.
    IsRunning,
    /// Serving reads only.
    IsReadonly,
}

// ------------------------------------------------------------------------------------------------
// Request / response types
// ------------------------------------------------------------------------------------------------

/// `load_tablet` arguments.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    /// Owning table.
    pub table: String,
    /// Inclusive range start.
    pub key_start: Vec<u8>,
    /// Exclusive range end; empty = unbounded.
    pub key_end: Vec<u8>,
    /// Tablet directory on the DFS.
    pub path: String,
    /// Table schema.
    pub schema: Schema,
    /// Parent tablet paths (split/merge children).
    pub parents: Vec<String>,
    /// Locality groups whose open failures are tolerated.
    pub ignore_err_lgs: Vec<String>,
    /// Master-assigned creation time.
    pub create_time: u64,
    /// Master-assigned metadata version.
    pub version: u64,
    /// The master's view of this server's session.
    pub session_id: String,
}

/// One row's mutations in a `write_tablet` batch.
#[derive(Debug, Clone)]
pub struct RowWrite {
    /// Row key.
    pub row: Vec<u8>,
    /// Cell mutations.
    pub mutations: Vec<CellMutation>,
}

/// One row's read spec in a `read_tablet` batch.
#[derive(Debug, Clone)]
pub struct RowRead {
    /// Row key.
    pub row: Vec<u8>,
    /// Families to return (empty = all).
    pub families: Vec<String>,
    /// Versions per cell (0 = all).
    pub max_versions: u32,
}

/// One row's outcome in a `read_tablet` batch.
#[derive(Debug)]
pub struct RowResult {
    /// Status for this row.
    pub status: TabletStatus,
    /// The row's cells when `status == Ok`.
    pub cells: Vec<Cell>,
}

/// One row-level scan filter: the row passes when it holds a cell at
/// `(family, qualifier)` whose newest returned value equals `equals`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFilter {
    /// Family to test.
    pub family: String,
    /// Qualifier to test.
    pub qualifier: Vec<u8>,
    /// Required value.
    pub equals: Vec<u8>,
}

/// `scan_tablet` arguments.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    /// Table to scan.
    pub table: String,
    /// Inclusive start row.
    pub start: Vec<u8>,
    /// Exclusive end row; empty = unbounded.
    pub end: Vec<u8>,
    /// Families to return (empty = all).
    pub families: Vec<String>,
    /// Row filters; a row is returned only when every filter passes.
    pub filters: Vec<ScanFilter>,
    /// Cells per page (0 = server default).
    pub buffer_limit: usize,
    /// Resume a paged scan by session id.
    pub scan_id: Option<u64>,
    /// Client FIN: release the scan context without reading.
    pub close: bool,
}

impl Default for ScanRequest {
    fn default() -> Self {
        Self {
            table: String::new(),
            start: Vec::new(),
            end: Vec::new(),
            families: Vec::new(),
            filters: Vec::new(),
            buffer_limit: 0,
            scan_id: None,
            close: false,
        }
    }
}

/// One `scan_tablet` page.
#[derive(Debug)]
pub struct ScanResponse {
    /// Page status.
    pub status: TabletStatus,
    /// Cells of this page.
    pub cells: Vec<Cell>,
    /// True when the scan is finished and the context released.
    pub complete: bool,
    /// Session id for the next page.
    pub scan_id: Option<u64>,
}

/// Per-tablet snapshot reported by `query`.
#[derive(Debug, Clone)]
pub struct TabletInfo {
    /// Owning table.
    pub table: String,
    /// Range start.
    pub key_start: Vec<u8>,
    /// Range end.
    pub key_end: Vec<u8>,
    /// Lifecycle state.
    pub state: String,
    /// Approximate bytes.
    pub size: u64,
    /// Per-LG level summaries.
    pub level_summaries: Vec<String>,
    /// Inherited files the trash collector must preserve.
    pub inherited_files: Vec<String>,
}

/// `query` response: health plus per-tablet metrics.
#[derive(Debug)]
pub struct QueryResponse {
    /// Server status.
    pub status: ServerStatus,
    /// Session id currently held.
    pub session_id: String,
    /// Per-tablet info.
    pub tablets: Vec<TabletInfo>,
    /// Recent background errors (size-capped).
    pub background_errors: Vec<String>,
}

// ------------------------------------------------------------------------------------------------
// Internals
// ------------------------------------------------------------------------------------------------

/// Cap on the total bytes of retained background-error messages.
const BG_ERROR_BYTES_CAP: usize = 64 * 1024;

/// How long `unload_tablet` waits for foreground operations to drain.
const UNLOAD_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct ScanContext {
    table: String,
    next_start: Vec<u8>,
    end: Vec<u8>,
    families: Vec<String>,
    filters: Vec<ScanFilter>,
    last_used: Instant,
}

struct Pools {
    control: Arc<ThreadPool>,
    light_control: Arc<ThreadPool>,
    read: Arc<ThreadPool>,
    write: Arc<ThreadPool>,
    scan: Arc<ThreadPool>,
    compact: Arc<ThreadPool>,
}

struct ServerInner {
    config: RwLock<ServerConfig>,
    session_id: String,
    status: Mutex<ServerStatus>,

    dfs: Arc<dyn Dfs>,
    table_cache: Arc<TableCache>,
    pbc: Option<Arc<PersistentBlockCache>>,
    mirror: Option<Arc<FlashMirrorCache>>,

    manager: TabletManager,

    /// Ranges currently in the load pipeline, to reject duplicate loads.
    loading: Mutex<std::collections::HashSet<(String, Vec<u8>)>>,

    pools: Pools,

    scan_contexts: Mutex<HashMap<u64, ScanContext>>,
    next_scan_id: AtomicU64,

    /// Size-capped background error log, newest last.
    background_errors: Mutex<(std::collections::VecDeque<String>, usize)>,

    /// Cached per-tablet info refreshed by the maintenance timer.
    tablet_infos: Mutex<Vec<TabletInfo>>,

    shutdown: AtomicBool,
    maintenance: Mutex<Option<std::thread::JoinHandle<()>>>,
}

/// Cloneable handle to the tablet-server core.
pub struct TabletServer {
    inner: Arc<ServerInner>,
}

impl Clone for TabletServer {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl TabletServer {
    // --------------------------------------------------------------------------------------------
    // Startup / shutdown
    // --------------------------------------------------------------------------------------------

    /// Bring the server up: mount storage, stack the configured cache
    /// layer, start the pools and the maintenance timer.
    pub fn open(config: ServerConfig) -> Result<Self, ServerError> {
        let base: Arc<dyn Dfs> = Arc::new(LocalDfs::new(&config.data_root)?);

        // Remote reads are permit-gated at the remote layer itself, below
        // every cache: only true DFS reads spend permits.
        let remote: Arc<dyn Dfs> = ThrottledDfs::new(base, config.dfs_read_limit());

        let mut pbc = None;
        let mut mirror = None;
        let dfs: Arc<dyn Dfs> = if config.persistent_cache_enabled {
            let cache_pools = CachePools {
                read_pool: Arc::new(ThreadPool::new("cache-read", config.read_threads)),
                dfs_pool: Arc::new(ThreadPool::new("dfs-read", config.dfs_read_limit())),
            };
            let cache = PersistentBlockCache::open(
                &config.cache_root,
                Arc::clone(&remote),
                CacheOptions {
                    capacity: config.persistent_cache_capacity,
                    dataset_size: config.dataset_size,
                    block_size: config.cache_block_size,
                    clean_on_start: config.clean_cache_paths_on_start,
                },
                Some(cache_pools),
            )?;
            pbc = Some(Arc::clone(&cache));
            CachedDfs::new(remote, cache)
        } else if config.mirror_cache_enabled {
            let cache = FlashMirrorCache::open(&config.cache_root, Arc::clone(&remote), 2)?;
            mirror = Some(Arc::clone(&cache));
            MirrorDfs::new(remote, cache)
        } else {
            remote
        };

        let block_cache = Arc::new(BlockCache::new(config.block_cache_size));
        let table_cache = Arc::new(TableCache::new(
            Arc::clone(&dfs),
            config.table_cache_capacity,
            block_cache,
        ));

        let pools = Pools {
            control: Arc::new(ThreadPool::new("control", config.control_threads)),
            light_control: Arc::new(ThreadPool::new(
                "light-control",
                config.light_control_threads,
            )),
            read: Arc::new(ThreadPool::new("read", config.read_threads)),
            write: Arc::new(ThreadPool::new("write", config.write_threads)),
            scan: Arc::new(ThreadPool::new("scan", config.scan_threads)),
            compact: Arc::new(ThreadPool::new("compact", config.compact_threads)),
        };

        let session_id = mint_session_id();
        info!(session = %session_id, port = config.port, "tablet server starting");

        let server = Self {
            inner: Arc::new(ServerInner {
                config: RwLock::new(config),
                session_id,
                status: Mutex::new(ServerStatus::IsIniting),
                dfs,
                table_cache,
                pbc,
                mirror,
                manager: TabletManager::new(),
                loading: Mutex::new(std::collections::HashSet::new()),
                pools,
                scan_contexts: Mutex::new(HashMap::new()),
                next_scan_id: AtomicU64::new(1),
                background_errors: Mutex::new((std::collections::VecDeque::new(), 0)),
                tablet_infos: Mutex::new(Vec::new()),
                shutdown: AtomicBool::new(false),
                maintenance: Mutex::new(None),
            }),
        };
        server.start_maintenance();
        *server.inner.status.lock().unwrap_or_else(|e| e.into_inner()) = ServerStatus::IsRunning;
        Ok(server)
    }

    fn start_maintenance(&self) {
        let server = self.clone();
        let handle = std::thread::Builder::new()
            .name("maintenance".into())
            .spawn(move || server.maintenance_loop())
            .ok();
        *self
            .inner
            .maintenance
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = handle;
    }

    fn maintenance_loop(&self) {
        let mut last_heap_release = Instant::now();
        while !self.inner.shutdown.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(100));

            self.refresh_tablet_infos();
            self.force_unload_broken_tablets();
            self.evict_idle_scan_contexts();
            if let Some(pbc) = &self.inner.pbc {
                if let Err(e) = pbc.run_gc_cycle() {
                    warn!(error = %e, "cache gc cycle failed");
                }
            }

            let heap_period = {
                let config = self.config();
                Duration::from_millis(config.heap_release_period_ms.max(1))
            };
            if last_heap_release.elapsed() >= heap_period {
                release_free_heap();
                last_heap_release = Instant::now();
            }
        }
    }

    /// Stop timers and pools and close every tablet.
    pub fn close(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        if let Ok(mut handle) = self.inner.maintenance.lock() {
            if let Some(handle) = handle.take() {
                let _ = handle.join();
            }
        }
        for tablet in self.inner.manager.list() {
            let _ = tablet.set_state(TabletState::Unloading);
            let _ = tablet.set_state(TabletState::Unloading2);
            if let Err(e) = tablet.close_engines() {
                warn!(table = %tablet.meta().table, error = %e, "engine close failed at shutdown");
            }
        }
        info!("tablet server stopped");
    }

    // --------------------------------------------------------------------------------------------
    // Accessors
    // --------------------------------------------------------------------------------------------

    /// The session id minted at startup.
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Current lifecycle status.
    pub fn status(&self) -> ServerStatus {
        *self.inner.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn config(&self) -> ServerConfig {
        self.inner
            .config
            .read()
            .map(|config| config.clone())
            .unwrap_or_default()
    }

    fn check_session(&self, session: &str) -> Result<(), TabletStatus> {
        if session != self.inner.session_id {
            warn!(got = session, "stale session id rejected");
            return Err(TabletStatus::IllegalAccess);
        }
        Ok(())
    }

    fn report_background_error(&self, message: String) {
        error!(%message, "background error recorded");
        let mut errors = self
            .inner
            .background_errors
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        errors.1 += message.len();
        errors.0.push_back(message);
        while errors.1 > BG_ERROR_BYTES_CAP {
            if let Some(dropped) = errors.0.pop_front() {
                errors.1 -= dropped.len();
            } else {
                break;
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Control operations
    // --------------------------------------------------------------------------------------------

    /// Load a tablet: open one engine per locality group (in parallel)
    /// and register the tablet as `Ready`.
    pub fn load_tablet(&self, request: LoadRequest) -> Result<(), TabletStatus> {
        self.check_session(&request.session_id)?;
        if request.schema.validate().is_err() {
            return Err(TabletStatus::IllegalAccess);
        }

        let registry_key = (request.table.clone(), request.key_start.clone());
        {
            let mut loading = self.inner.loading.lock().unwrap_or_else(|e| e.into_inner());
            if loading.contains(&registry_key)
                || self
                    .inner
                    .manager
                    .get_tablet(&request.table, &request.key_start)
                    .is_ok()
            {
                // Already loading or serving: idempotent success.
                return Ok(());
            }
            loading.insert(registry_key.clone());
        }
        let result = self.load_tablet_locked(&request);
        self.inner
            .loading
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&registry_key);
        result
    }

    fn load_tablet_locked(&self, request: &LoadRequest) -> Result<(), TabletStatus> {
        let config = self.config();
        let engine_options = EngineOptions {
            write_buffer_size: config.write_buffer_size,
            block_size: config.sstable_block_size,
            sub_compactions: config.sub_compactions,
            memtable_kind: MemTableKind::Single,
            timestamped_keys: true,
            ignore_corruption_in_open: config.ignore_corruption_in_open,
            ignore_corruption_in_compaction: config.ignore_corruption_in_compaction,
            ..Default::default()
        };

        // Open every locality group in parallel; collect per-LG results.
        let mut engines = HashMap::new();
        let mut failures: Vec<(String, String)> = Vec::new();
        let results: Vec<(String, Result<LsmEngine, EngineError>)> =
            crossbeam::thread::scope(|scope| {
                let mut handles = Vec::new();
                for group in &request.schema.groups {
                    let dir = format!("{}/{}", request.path, group.name);
                    let dfs = Arc::clone(&self.inner.dfs);
                    let table_cache = Arc::clone(&self.inner.table_cache);
                    let compact_pool = Arc::clone(&self.inner.pools.compact);
                    let parents: Vec<String> = request
                        .parents
                        .iter()
                        .map(|parent| format!("{parent}/{}", group.name))
                        .collect();
                    let mut options = engine_options.clone();
                    options.max_versions = group.effective_max_versions();
                    options.ttl_micros = group.effective_ttl_micros();
                    options.strategy = group.strategy;
                    options.bloom_enabled = group.bloom;
                    options.compression_id = group.compression_id;
                    let name = group.name.clone();
                    handles.push(scope.spawn(move |_| {
                        let result = LsmEngine::open(
                            dfs,
                            dir,
                            options,
                            table_cache,
                            Some(compact_pool),
                            &parents,
                            &[],
                            Rollbacks::new(),
                        );
                        (name, result)
                    }));
                }
                handles
                    .into_iter()
                    .map(|handle| {
                        handle
                            .join()
                            .unwrap_or_else(|_| (String::new(), Err(EngineError::Internal(
                                "locality-group open panicked".into(),
                            ))))
                    })
                    .collect()
            })
            .unwrap_or_default();

        for (name, result) in results {
            match result {
                Ok(engine) => {
                    engines.insert(name, engine);
                }
                Err(e) => {
                    if request.ignore_err_lgs.contains(&name) {
                        warn!(lg = %name, error = %e, "locality group skipped by ignore list");
                    } else {
                        failures.push((name, e.to_string()));
                    }
                }
            }
        }

        if !failures.is_empty() || engines.is_empty() {
            let report = format!(
                "phase=loading path={} parents={:?} failed_lgs={:?}",
                request.path, request.parents, failures
            );
            self.report_background_error(report.clone());
            for engine in engines.values() {
                let _ = engine.close();
            }
            return Err(TabletStatus::Corrupt(report));
        }

        let meta = TabletMeta {
            table: request.table.clone(),
            key_start: request.key_start.clone(),
            key_end: request.key_end.clone(),
            path: request.path.clone(),
            create_time: request.create_time,
            version: request.version,
            parents: request.parents.clone(),
        };
        let tablet = Arc::new(Tablet::new(meta, request.schema.clone(), engines));
        tablet
            .set_state(TabletState::OnLoad)
            .and_then(|()| tablet.set_state(TabletState::Ready))
            .map_err(|e| TabletStatus::from_tablet_error(&e))?;

        self.inner
            .manager
            .add(Arc::clone(&tablet))
            .map_err(|e| TabletStatus::from_tablet_error(&e))?;
        info!(table = %request.table, path = %request.path, "tablet loaded");
        Ok(())
    }

    /// Unload a tablet: drain foreground work, cancel background work,
    /// close the engines, deregister.
    pub fn unload_tablet(
        &self,
        table: &str,
        key_start: &[u8],
        session_id: &str,
    ) -> Result<(), TabletStatus> {
        self.check_session(session_id)?;

        let tablet = self
            .inner
            .manager
            .get_tablet(table, key_start)
            .map_err(|e| TabletStatus::from_tablet_error(&e))?;
        tablet
            .set_state(TabletState::Unloading)
            .map_err(|e| TabletStatus::from_tablet_error(&e))?;

        // Phase one: wait out admitted operations.
        let deadline = Instant::now() + UNLOAD_DRAIN_TIMEOUT;
        while tablet.foreground_ops() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        // Phase two: stop the world for this tablet.
        tablet
            .set_state(TabletState::Unloading2)
            .map_err(|e| TabletStatus::from_tablet_error(&e))?;
        if let Err(e) = tablet.close_engines() {
            self.report_background_error(format!(
                "phase=unloading table={table} error={e}"
            ));
        }
        let start = tablet.meta().key_start.clone();
        let _ = self.inner.manager.remove(table, &start);
        info!(table, "tablet unloaded");
        Ok(())
    }

    /// Manually compact one tablet (optionally a single locality group).
    /// Returns the post-compaction size.
    pub fn compact_tablet(
        &self,
        table: &str,
        key_start: &[u8],
        group: Option<&str>,
    ) -> Result<u64, TabletStatus> {
        let tablet = self
            .inner
            .manager
            .get_tablet(table, key_start)
            .map_err(|e| TabletStatus::from_tablet_error(&e))?;
        tablet
            .compact(group)
            .map_err(|e| TabletStatus::from_tablet_error(&e))?;
        Ok(tablet.approximate_size())
    }

    /// A row key splitting the tablet at roughly half its bytes.
    pub fn compute_split_key(
        &self,
        table: &str,
        key_start: &[u8],
    ) -> Result<Vec<u8>, TabletStatus> {
        let tablet = self
            .inner
            .manager
            .get_tablet(table, key_start)
            .map_err(|e| TabletStatus::from_tablet_error(&e))?;
        match tablet.compute_split_key() {
            Ok(Some(key)) => Ok(key),
            Ok(None) => Err(TabletStatus::TableNotSupport),
            Err(e) => Err(TabletStatus::from_tablet_error(&e)),
        }
    }

    /// Apply a new schema to every loaded tablet of its table.
    pub fn update_schema(&self, schema: Schema, session_id: &str) -> Result<(), TabletStatus> {
        self.check_session(session_id)?;
        if schema.validate().is_err() {
            return Err(TabletStatus::InvalidArgument);
        }
        for tablet in self.inner.manager.list() {
            if tablet.meta().table != schema.table {
                continue;
            }
            tablet
                .apply_schema(schema.clone())
                .map_err(|e| TabletStatus::from_tablet_error(&e))?;
        }
        Ok(())
    }

    /// Health, per-tablet metrics, inherited files, background errors.
    pub fn query(&self) -> QueryResponse {
        let tablets = self
            .inner
            .tablet_infos
            .lock()
            .map(|infos| infos.clone())
            .unwrap_or_default();
        let background_errors = self
            .inner
            .background_errors
            .lock()
            .map(|errors| errors.0.iter().cloned().collect())
            .unwrap_or_default();
        QueryResponse {
            status: self.status(),
            session_id: self.inner.session_id.clone(),
            tablets,
            background_errors,
        }
    }

    /// Runtime control: `"reload config"` re-reads the flag file.
    pub fn cmd_ctrl(&self, command: &str, session_id: &str) -> Result<(), TabletStatus> {
        self.check_session(session_id)?;
        match command {
            "reload config" => {
                let mut config = self
                    .inner
                    .config
                    .write()
                    .map_err(|_| TabletStatus::IoError)?;
                config.reload().map_err(|e| {
                    warn!(error = %e, "config reload failed");
                    TabletStatus::InvalidArgument
                })?;
                Ok(())
            }
            _ => Err(TabletStatus::InvalidArgument),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Data operations
    // --------------------------------------------------------------------------------------------

    /// Apply a batch of row writes. The call succeeds; per-row failures
    /// land in the returned status vector.
    pub fn write_tablet(
        &self,
        table: &str,
        rows: &[RowWrite],
        is_instant: bool,
    ) -> Vec<TabletStatus> {
        rows.iter()
            .map(|row_write| {
                match self.inner.manager.get_tablet(table, &row_write.row) {
                    Err(e) => TabletStatus::from_tablet_error(&e),
                    Ok(tablet) => {
                        match tablet.write_row(&row_write.row, &row_write.mutations, is_instant) {
                            Ok(()) => TabletStatus::Ok,
                            Err(e) => TabletStatus::from_tablet_error(&e),
                        }
                    }
                }
            })
            .collect()
    }

    /// Batched point reads, sharded across the read pool.
    ///
    /// Rows are split into `rows_per_task` shards; earlier shards run on
    /// the read pool, the final shard on the caller thread, and a
    /// completion latch joins them. Once `client_timeout_ms` elapses,
    /// remaining rows short-circuit to [`TabletStatus::RpcTimeout`].
    pub fn read_tablet(
        &self,
        table: &str,
        rows: &[RowRead],
        client_timeout_ms: u64,
        snapshot: Option<u64>,
    ) -> (Vec<RowResult>, u64) {
        let config = self.config();
        let rows_per_task = config.rows_per_task.max(1);
        let deadline = Instant::now() + Duration::from_millis(client_timeout_ms);

        let results: Vec<Mutex<Option<RowResult>>> =
            rows.iter().map(|_| Mutex::new(None)).collect();
        let results = Arc::new(results);
        let pending = Arc::new((Mutex::new(0usize), Condvar::new()));

        let shards: Vec<(usize, &[RowRead])> = rows
            .chunks(rows_per_task)
            .enumerate()
            .map(|(idx, chunk)| (idx * rows_per_task, chunk))
            .collect();
        let shard_count = shards.len();

        for (shard_idx, (base, chunk)) in shards.into_iter().enumerate() {
            let last = shard_idx + 1 == shard_count;
            if last {
                // The caller thread works the final shard itself.
                self.read_shard(table, base, chunk, deadline, snapshot, &results);
                continue;
            }
            {
                let (count, _) = &*pending;
                *count.lock().unwrap_or_else(|e| e.into_inner()) += 1;
            }
            let server = self.clone();
            let table = table.to_string();
            let chunk: Vec<RowRead> = chunk.to_vec();
            let results = Arc::clone(&results);
            let pending = Arc::clone(&pending);
            self.inner.pools.read.execute(move || {
                server.read_shard(&table, base, &chunk, deadline, snapshot, &results);
                let (count, cv) = &*pending;
                *count.lock().unwrap_or_else(|e| e.into_inner()) -= 1;
                cv.notify_all();
            });
        }

        // Join the pool shards.
        {
            let (count, cv) = &*pending;
            let mut remaining = count.lock().unwrap_or_else(|e| e.into_inner());
            while *remaining > 0 {
                remaining = cv.wait(remaining).unwrap_or_else(|e| e.into_inner());
            }
        }

        let mut out = Vec::with_capacity(rows.len());
        let mut success = 0u64;
        for slot in results.iter() {
            let result = slot
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
                .unwrap_or(RowResult {
                    status: TabletStatus::IoError,
                    cells: Vec::new(),
                });
            if result.status == TabletStatus::Ok {
                success += 1;
            }
            out.push(result);
        }
        (out, success)
    }

    fn read_shard(
        &self,
        table: &str,
        base: usize,
        rows: &[RowRead],
        deadline: Instant,
        snapshot: Option<u64>,
        results: &[Mutex<Option<RowResult>>],
    ) {
        for (offset, row_read) in rows.iter().enumerate() {
            let slot = &results[base + offset];
            // The deadline is checked before every row.
            if Instant::now() >= deadline {
                *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(RowResult {
                    status: TabletStatus::RpcTimeout,
                    cells: Vec::new(),
                });
                continue;
            }

            let result = match self.inner.manager.get_tablet(table, &row_read.row) {
                Err(e) => RowResult {
                    status: TabletStatus::from_tablet_error(&e),
                    cells: Vec::new(),
                },
                Ok(tablet) => match tablet.read_row(
                    &row_read.row,
                    &row_read.families,
                    row_read.max_versions,
                    snapshot,
                ) {
                    Err(e) => RowResult {
                        status: TabletStatus::from_tablet_error(&e),
                        cells: Vec::new(),
                    },
                    Ok(cells) if cells.is_empty() => RowResult {
                        status: TabletStatus::KeyNotExist,
                        cells,
                    },
                    Ok(cells) => RowResult {
                        status: TabletStatus::Ok,
                        cells,
                    },
                },
            };
            *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(result);
        }
    }

    /// Paged scan with resumable server-side contexts.
    pub fn scan_tablet(&self, request: &ScanRequest) -> ScanResponse {
        // Client FIN: drop the context.
        if request.close {
            if let Some(scan_id) = request.scan_id {
                self.inner
                    .scan_contexts
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&scan_id);
            }
            return ScanResponse {
                status: TabletStatus::Ok,
                cells: Vec::new(),
                complete: true,
                scan_id: None,
            };
        }

        let config = self.config();
        let budget = if request.buffer_limit != 0 {
            request.buffer_limit
        } else {
            config.scan_pack_size
        };

        // Resume or begin.
        let (scan_id, table, start, end, families, filters) = match request.scan_id {
            Some(scan_id) => {
                let contexts = self
                    .inner
                    .scan_contexts
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                match contexts.get(&scan_id) {
                    None => {
                        return ScanResponse {
                            status: TabletStatus::InvalidArgument,
                            cells: Vec::new(),
                            complete: true,
                            scan_id: None,
                        };
                    }
                    Some(context) => (
                        scan_id,
                        context.table.clone(),
                        context.next_start.clone(),
                        context.end.clone(),
                        context.families.clone(),
                        context.filters.clone(),
                    ),
                }
            }
            None => (
                self.inner.next_scan_id.fetch_add(1, Ordering::Relaxed),
                request.table.clone(),
                request.start.clone(),
                request.end.clone(),
                request.families.clone(),
                request.filters.clone(),
            ),
        };

        let tablet = match self.inner.manager.get_tablet(&table, &start) {
            Ok(tablet) => tablet,
            Err(e) => {
                return ScanResponse {
                    status: TabletStatus::from_tablet_error(&e),
                    cells: Vec::new(),
                    complete: true,
                    scan_id: None,
                };
            }
        };

        match tablet.scan_rows(&start, &end, &families, budget, None) {
            Err(e) => ScanResponse {
                status: TabletStatus::from_tablet_error(&e),
                cells: Vec::new(),
                complete: true,
                scan_id: None,
            },
            Ok((cells, resume)) => {
                let cells = apply_row_filters(cells, &filters);
                // Continue into the next tablet of the range when this
                // one is exhausted but the request range is not.
                let next_start = match resume {
                    Some(resume) => Some(resume),
                    None => {
                        let tablet_end = tablet.meta().key_end.clone();
                        let range_done = tablet_end.is_empty()
                            || (!end.is_empty() && tablet_end >= end);
                        if range_done { None } else { Some(tablet_end) }
                    }
                };
                match next_start {
                    None => {
                        self.inner
                            .scan_contexts
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .remove(&scan_id);
                        ScanResponse {
                            status: TabletStatus::Ok,
                            cells,
                            complete: true,
                            scan_id: None,
                        }
                    }
                    Some(next_start) => {
                        self.inner
                            .scan_contexts
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(
                                scan_id,
                                ScanContext {
                                    table,
                                    next_start,
                                    end,
                                    families,
                                    filters,
                                    last_used: Instant::now(),
                                },
                            );
                        ScanResponse {
                            status: TabletStatus::Ok,
                            cells,
                            complete: false,
                            scan_id: Some(scan_id),
                        }
                    }
                }
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Maintenance duties
    // --------------------------------------------------------------------------------------------

    fn refresh_tablet_infos(&self) {
        let infos: Vec<TabletInfo> = self
            .inner
            .manager
            .list()
            .into_iter()
            .map(|tablet| {
                let meta = tablet.meta();
                let mut level_summaries = Vec::new();
                let mut inherited_files = Vec::new();
                for (name, engine) in tablet.engines() {
                    level_summaries.push(format!("{name}:{}", engine.level_summary()));
                    inherited_files.extend(engine.inherited_files());
                }
                TabletInfo {
                    table: meta.table.clone(),
                    key_start: meta.key_start.clone(),
                    key_end: meta.key_end.clone(),
                    state: format!("{:?}", tablet.state()),
                    size: tablet.approximate_size(),
                    level_summaries,
                    inherited_files,
                }
            })
            .collect();
        *self
            .inner
            .tablet_infos
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = infos;
    }

    /// Force-unload tablets whose engine declared itself unrecoverable.
    fn force_unload_broken_tablets(&self) {
        for tablet in self.inner.manager.list() {
            if !tablet.any_engine_force_unload() {
                continue;
            }
            let meta = tablet.meta().clone();
            self.report_background_error(format!(
                "phase=running table={} range={:?} engine force-unload",
                meta.table, meta.key_start
            ));
            let _ = tablet.set_state(TabletState::Unloading);
            let _ = tablet.set_state(TabletState::Unloading2);
            let _ = tablet.close_engines();
            let _ = self.inner.manager.remove(&meta.table, &meta.key_start);
            warn!(table = %meta.table, "broken tablet force-unloaded");
        }
    }

    fn evict_idle_scan_contexts(&self) {
        let idle = {
            let config = self.config();
            Duration::from_millis(config.scan_context_idle_ms.max(1))
        };
        let mut contexts = self
            .inner
            .scan_contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let before = contexts.len();
        contexts.retain(|_, context| context.last_used.elapsed() < idle);
        let evicted = before - contexts.len();
        if evicted > 0 {
            debug!(evicted, "idle scan contexts released");
        }
    }
}

/// Drop every cell of rows that fail a filter. Rows are never split
/// across pages, so per-page filtering sees whole rows.
fn apply_row_filters(cells: Vec<Cell>, filters: &[ScanFilter]) -> Vec<Cell> {
    if filters.is_empty() {
        return cells;
    }

    let mut rejected: std::collections::HashSet<Vec<u8>> = std::collections::HashSet::new();
    let mut rows_seen: std::collections::HashSet<Vec<u8>> = std::collections::HashSet::new();
    for cell in &cells {
        rows_seen.insert(cell.row.clone());
    }
    for row in &rows_seen {
        let passes = filters.iter().all(|filter| {
            // The newest returned version of the filtered cell decides.
            cells
                .iter()
                .find(|cell| {
                    cell.row == *row
                        && cell.family == filter.family
                        && cell.qualifier == filter.qualifier
                })
                .is_some_and(|cell| cell.value == filter.equals)
        });
        if !passes {
            rejected.insert(row.clone());
        }
    }
    cells
        .into_iter()
        .filter(|cell| !rejected.contains(&cell.row))
        .collect()
}

/// Coordinator-session identifier: unique per server incarnation.
fn mint_session_id() -> String {
    static INCARNATION: AtomicU64 = AtomicU64::new(0);
    let counter = INCARNATION.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:x}-{counter:x}", std::process::id(), now_micros())
}

/// Hook for returning free heap to the OS on a periodic tick. The system
/// allocator has no portable trim call; the hook is the lifecycle point
/// an allocator-specific build wires its release into.
fn release_free_heap() {
    debug!("heap release tick");
}
