use std::sync::Arc;

use tempfile::TempDir;

use crate::dfs::{Dfs, LocalDfs};
use crate::engine::key::{InternalKey, ValueKind};
use crate::sstable::{BlockCache, Table, TableBuildResult, TableBuilder};

pub fn mount() -> (TempDir, Arc<LocalDfs>) {
    let tmp = TempDir::new().unwrap();
    let dfs = Arc::new(LocalDfs::new(tmp.path()).unwrap());
    (tmp, dfs)
}

pub fn cache() -> Arc<BlockCache> {
    Arc::new(BlockCache::new(8 * 1024 * 1024))
}

/// Build a table of `(key, seq, kind, value)` cells already in order.
pub fn build_table(
    dfs: &LocalDfs,
    path: &str,
    block_size: usize,
    cells: &[(&[u8], u64, ValueKind, &[u8])],
) -> TableBuildResult {
    let mut builder = TableBuilder::new(dfs.create(path).unwrap(), block_size);
    for (key, seq, kind, value) in cells {
        builder
            .add(&InternalKey::new(*key, *seq, *kind), value)
            .unwrap();
    }
    builder.finish().unwrap()
}

pub fn open_table(
    dfs: &Arc<LocalDfs>,
    path: &str,
    file_number: u64,
    size: u64,
    block_cache: Arc<BlockCache>,
) -> Arc<Table> {
    let file = dfs.open_random(path, Some(size)).unwrap();
    Arc::new(Table::open(file, file_number, size, block_cache).unwrap())
}

/// 100 ascending keys `key_0000…key_0099`, one version each.
pub fn hundred_cells() -> Vec<(Vec<u8>, u64, ValueKind, Vec<u8>)> {
    (0..100u64)
        .map(|i| {
            (
                format!("key_{i:04}").into_bytes(),
                i + 1,
                ValueKind::Value,
                format!("value_{i:04}").into_bytes(),
            )
        })
        .collect()
}
