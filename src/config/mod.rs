//! Flag-file configuration, reloadable at runtime.
//!
//! The server reads a flag file of `key = value` lines at startup and
//! re-reads it when the master sends `cmd_ctrl("reload config")`. Values
//! are strings, integers, or booleans; `#` starts a comment; unknown keys
//! warn and are ignored so a newer flag file still loads on an older
//! binary.


use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors reading or parsing a flag file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Flag file unreadable.
    #[error("I/O error reading {path}: {source}")]
    Io {
        /// The flag-file path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A line was not `key = value`.
    #[error("malformed line {line}: {text:?}")]
    MalformedLine {
        /// 1-based line number.
        line: usize,
        /// The offending text.
        text: String,
    },

    /// A known key carried an unparsable value.
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue {
        /// Flag name.
        key: String,
        /// Rejected text.
        value: String,
    },
}

// ------------------------------------------------------------------------------------------------
// Server configuration
// ------------------------------------------------------------------------------------------------

/// Every recognised server flag, with deployable defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Listen port published to the coordinator.
    pub port: u16,

    /// Heartbeat interval to the coordinator, milliseconds.
    pub heartbeat_interval_ms: u64,

    /// In-memory block cache budget, bytes (server-wide).
    pub block_cache_size: u64,

    /// Open-table pool capacity (handles).
    pub table_cache_capacity: usize,

    /// Persistent SSD cache on/off.
    pub persistent_cache_enabled: bool,

    /// Persistent cache total capacity, bytes.
    pub persistent_cache_capacity: u64,

    /// Capacity of one persistent-cache data set, bytes.
    pub dataset_size: u64,

    /// Persistent-cache logical block size, bytes.
    pub cache_block_size: usize,

    /// Wipe persistent-cache paths at startup.
    pub clean_cache_paths_on_start: bool,

    /// Whole-file mirror cache on/off (alternative to the block cache).
    pub mirror_cache_enabled: bool,

    /// Worker counts per pool.
    pub control_threads: usize,
    /// Light control pool.
    pub light_control_threads: usize,
    /// Read pool.
    pub read_threads: usize,
    /// Write pool.
    pub write_threads: usize,
    /// Scan pool.
    pub scan_threads: usize,
    /// Compaction pool.
    pub compact_threads: usize,

    /// Share of the read pool allowed to touch the remote DFS at once,
    /// in percent; keeps SSD reads from starving behind remote ones.
    pub dfs_read_thread_ratio: u8,

    /// Heap-release tick, milliseconds (0 = off).
    pub heap_release_period_ms: u64,

    /// Rows per shard of a batched read.
    pub rows_per_task: usize,

    /// Cells per scan page.
    pub scan_pack_size: usize,

    /// Idle scan sessions are evicted after this long, milliseconds.
    pub scan_context_idle_ms: u64,

    /// Engine write buffer, bytes.
    pub write_buffer_size: usize,

    /// Engine data-block size, bytes.
    pub sstable_block_size: usize,

    /// Parallel shards for large compactions.
    pub sub_compactions: usize,

    /// Tolerate missing/damaged state when opening engines.
    pub ignore_corruption_in_open: bool,

    /// Skip damaged inputs during compaction.
    pub ignore_corruption_in_compaction: bool,

    /// Root directory of DFS-backed data.
    pub data_root: PathBuf,

    /// Root directory of SSD cache state.
    pub cache_root: PathBuf,

    /// The flag file this config was loaded from, for reload.
    pub flag_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 22_100,
            heartbeat_interval_ms: 3_000,
            block_cache_size: 256 * 1024 * 1024,
            table_cache_capacity: 1_024,
            persistent_cache_enabled: false,
            persistent_cache_capacity: 8 * 1024 * 1024 * 1024,
            dataset_size: 1024 * 1024 * 1024,
            cache_block_size: 4 * 1024,
            clean_cache_paths_on_start: false,
            mirror_cache_enabled: false,
            control_threads: 2,
            light_control_threads: 2,
            read_threads: 8,
            write_threads: 4,
            scan_threads: 4,
            compact_threads: 4,
            dfs_read_thread_ratio: 75,
            heap_release_period_ms: 10_000,
            rows_per_task: 64,
            scan_pack_size: 1_000,
            scan_context_idle_ms: 60_000,
            write_buffer_size: 4 * 1024 * 1024,
            sstable_block_size: 4 * 1024,
            sub_compactions: 1,
            ignore_corruption_in_open: false,
            ignore_corruption_in_compaction: false,
            data_root: PathBuf::from("./data"),
            cache_root: PathBuf::from("./cache"),
            flag_file: None,
        }
    }
}

impl ServerConfig {
    /// Load a config from a flag file over the defaults.
    pub fn from_flag_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_flag_file(path.as_ref())?;
        config.flag_file = Some(path.as_ref().to_path_buf());
        Ok(config)
    }

    /// Re-read the flag file this config came from. A config built from
    /// defaults has nothing to reload.
    pub fn reload(&mut self) -> Result<(), ConfigError> {
        let Some(path) = self.flag_file.clone() else {
            return Ok(());
        };
        self.apply_flag_file(&path)?;
        info!(path = %path.display(), "config reloaded");
        Ok(())
    }

    fn apply_flag_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string_lossy().into_owned(),
            source,
        })?;

        for (idx, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::MalformedLine {
                    line: idx + 1,
                    text: raw_line.to_string(),
                });
            };
            self.apply(key.trim(), value.trim())?;
        }
        Ok(())
    }

    /// Apply one flag. Unknown keys warn and are ignored.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
            value.parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            })
        }
        fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
            match value {
                "true" | "1" | "on" => Ok(true),
                "false" | "0" | "off" => Ok(false),
                _ => Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                }),
            }
        }

        match key {
            "port" => self.port = parse(key, value)?,
            "heartbeat_interval_ms" => self.heartbeat_interval_ms = parse(key, value)?,
            "block_cache_size" => self.block_cache_size = parse(key, value)?,
            "table_cache_capacity" => self.table_cache_capacity = parse(key, value)?,
            "persistent_cache_enabled" => {
                self.persistent_cache_enabled = parse_bool(key, value)?;
            }
            "persistent_cache_capacity" => self.persistent_cache_capacity = parse(key, value)?,
            "dataset_size" => self.dataset_size = parse(key, value)?,
            "cache_block_size" => self.cache_block_size = parse(key, value)?,
            "clean_cache_paths_on_start" => {
                self.clean_cache_paths_on_start = parse_bool(key, value)?;
            }
            "mirror_cache_enabled" => self.mirror_cache_enabled = parse_bool(key, value)?,
            "control_threads" => self.control_threads = parse(key, value)?,
            "light_control_threads" => self.light_control_threads = parse(key, value)?,
            "read_threads" => self.read_threads = parse(key, value)?,
            "write_threads" => self.write_threads = parse(key, value)?,
            "scan_threads" => self.scan_threads = parse(key, value)?,
            "compact_threads" => self.compact_threads = parse(key, value)?,
            "dfs_read_thread_ratio" => self.dfs_read_thread_ratio = parse(key, value)?,
            "heap_release_period_ms" => self.heap_release_period_ms = parse(key, value)?,
            "rows_per_task" => self.rows_per_task = parse(key, value)?,
            "scan_pack_size" => self.scan_pack_size = parse(key, value)?,
            "scan_context_idle_ms" => self.scan_context_idle_ms = parse(key, value)?,
            "write_buffer_size" => self.write_buffer_size = parse(key, value)?,
            "sstable_block_size" => self.sstable_block_size = parse(key, value)?,
            "sub_compactions" => self.sub_compactions = parse(key, value)?,
            "ignore_corruption_in_open" => {
                self.ignore_corruption_in_open = parse_bool(key, value)?;
            }
            "ignore_corruption_in_compaction" => {
                self.ignore_corruption_in_compaction = parse_bool(key, value)?;
            }
            "data_root" => self.data_root = PathBuf::from(value),
            "cache_root" => self.cache_root = PathBuf::from(value),
            unknown => warn!(flag = unknown, "unknown flag ignored"),
        }
        Ok(())
    }

    /// Concurrent remote reads allowed, derived from the read-pool size
    /// and the DFS ratio. Always below the pool size so local reads keep
    /// at least one worker.
    pub fn dfs_read_limit(&self) -> usize {
        let limit = self.read_threads * usize::from(self.dfs_read_thread_ratio) / 100;
        limit.clamp(1, self.read_threads.saturating_sub(1).max(1))
    }
}
