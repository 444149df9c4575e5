use std::sync::Arc;

use tempfile::TempDir;

use crate::dfs::{Dfs, LocalDfs};
use crate::pbc::{CacheOptions, CachePools, PersistentBlockCache};
use crate::threadpool::ThreadPool;

pub struct CacheFixture {
    pub tmp: TempDir,
    pub dfs: Arc<dyn Dfs>,
    pub cache: Arc<PersistentBlockCache>,
}

pub fn small_options() -> CacheOptions {
    CacheOptions {
        capacity: 256 * 1024,
        dataset_size: 64 * 1024,
        block_size: 4 * 1024,
        clean_on_start: false,
    }
}

/// Small pools so multi-block reads exercise the parallel path.
pub fn test_pools() -> Option<CachePools> {
    Some(CachePools {
        read_pool: Arc::new(ThreadPool::new("cache-read", 2)),
        dfs_pool: Arc::new(ThreadPool::new("dfs-read", 2)),
    })
}

impl CacheFixture {
    pub fn new() -> Self {
        Self::with_options(small_options())
    }

    pub fn with_options(options: CacheOptions) -> Self {
        let tmp = TempDir::new().unwrap();
        let dfs: Arc<dyn Dfs> =
            Arc::new(LocalDfs::new(tmp.path().join("dfs")).unwrap());
        let cache = PersistentBlockCache::open(
            tmp.path().join("cache"),
            Arc::clone(&dfs),
            options,
            test_pools(),
        )
        .unwrap();
        Self { tmp, dfs, cache }
    }

    /// Reopen the cache over the same directories (restart simulation).
    pub fn reopen(self) -> Self {
        let Self { tmp, dfs, cache } = self;
        drop(cache);
        let cache = PersistentBlockCache::open(
            tmp.path().join("cache"),
            Arc::clone(&dfs),
            small_options(),
            test_pools(),
        )
        .unwrap();
        Self { tmp, dfs, cache }
    }

    /// Write a deterministic file of `len` bytes on the inner DFS.
    pub fn seed_file(&self, path: &str, len: usize) -> Vec<u8> {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut file = self.dfs.create(path).unwrap();
        file.append(&data).unwrap();
        file.sync().unwrap();
        data
    }
}
