use std::sync::Arc;

use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use crate::dfs::{Dfs, LocalDfs};
use crate::engine::key::Rollbacks;
use crate::engine::{EngineOptions, LsmEngine, WriteOptions, WriteRecord};
use crate::sstable::{BlockCache, TableCache};

/// Initialize tracing controlled by `RUST_LOG`. First call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct EngineFixture {
    pub tmp: TempDir,
    pub dfs: Arc<dyn Dfs>,
    pub table_cache: Arc<TableCache>,
}

impl EngineFixture {
    pub fn new() -> Self {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let dfs: Arc<dyn Dfs> = Arc::new(LocalDfs::new(tmp.path()).unwrap());
        let block_cache = Arc::new(BlockCache::new(8 * 1024 * 1024));
        let table_cache = Arc::new(TableCache::new(Arc::clone(&dfs), 64, block_cache));
        Self {
            tmp,
            dfs,
            table_cache,
        }
    }

    pub fn open(&self, dir: &str, opts: EngineOptions) -> LsmEngine {
        LsmEngine::open(
            Arc::clone(&self.dfs),
            dir,
            opts,
            Arc::clone(&self.table_cache),
            None,
            &[],
            &[],
            Rollbacks::new(),
        )
        .unwrap()
    }

    pub fn open_with_parents(
        &self,
        dir: &str,
        opts: EngineOptions,
        parents: &[String],
    ) -> LsmEngine {
        LsmEngine::open(
            Arc::clone(&self.dfs),
            dir,
            opts,
            Arc::clone(&self.table_cache),
            None,
            parents,
            &[],
            Rollbacks::new(),
        )
        .unwrap()
    }
}

/// Options that keep everything in the memtable.
pub fn memtable_only_options() -> EngineOptions {
    EngineOptions {
        write_buffer_size: 8 * 1024 * 1024,
        ..Default::default()
    }
}

/// Small buffers so flushes and compactions trigger quickly.
pub fn small_buffer_options() -> EngineOptions {
    EngineOptions {
        write_buffer_size: 4 * 1024,
        wal_size_limit: 256 * 1024,
        block_size: 512,
        max_output_file_size: 16 * 1024,
        ..Default::default()
    }
}

pub fn put(engine: &LsmEngine, key: &[u8], value: &[u8]) {
    engine
        .write(&[WriteRecord::put(key, value)], &WriteOptions::default())
        .unwrap();
}

pub fn put_at(engine: &LsmEngine, key: &[u8], value: &[u8], sequence: u64) {
    let mut record = WriteRecord::put(key, value);
    record.sequence = Some(sequence);
    engine.write(&[record], &WriteOptions::default()).unwrap();
}

pub fn delete_at(engine: &LsmEngine, key: &[u8], sequence: u64) {
    let mut record = WriteRecord::delete(key);
    record.sequence = Some(sequence);
    engine.write(&[record], &WriteOptions::default()).unwrap();
}

pub fn fill_keys(engine: &LsmEngine, count: usize, prefix: &str) {
    for i in 0..count {
        let key = format!("{prefix}_{i:05}").into_bytes();
        let value = format!("value_with_some_padding_{i:05}").into_bytes();
        put(engine, &key, &value);
    }
}
