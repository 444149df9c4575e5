use std::collections::HashMap;
use std::sync::Arc;

use tempfile::TempDir;

use crate::dfs::{Dfs, LocalDfs};
use crate::engine::key::Rollbacks;
use crate::engine::{EngineOptions, LsmEngine};
use crate::memtable::MemTableKind;
use crate::schema::Schema;
use crate::sstable::{BlockCache, TableCache};
use crate::tablet::{Tablet, TabletMeta, TabletState};

pub struct TabletFixture {
    pub tmp: TempDir,
    pub dfs: Arc<dyn Dfs>,
    pub table_cache: Arc<TableCache>,
}

impl TabletFixture {
    pub fn new() -> Self {
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

    /// Open one engine per locality group and assemble a ready tablet.
    pub fn load(&self, meta: TabletMeta, schema: Schema) -> Arc<Tablet> {
        schema.validate().unwrap();
        let mut engines = HashMap::new();
        for group in &schema.groups {
            let dir = format!("{}/{}", meta.path, group.name);
            let engine = LsmEngine::open(
                Arc::clone(&self.dfs),
                dir,
                EngineOptions {
                    write_buffer_size: 64 * 1024,
                    timestamped_keys: true,
                    memtable_kind: MemTableKind::Single,
                    ..Default::default()
                },
                Arc::clone(&self.table_cache),
                None,
                &meta.parents,
                &[],
                Rollbacks::new(),
            )
            .unwrap();
            engines.insert(group.name.clone(), engine);
        }
        let tablet = Arc::new(Tablet::new(meta, schema, engines));
        tablet.set_state(TabletState::OnLoad).unwrap();
        tablet.set_state(TabletState::Ready).unwrap();
        tablet
    }
}

pub fn meta(table: &str, start: &[u8], end: &[u8], path: &str) -> TabletMeta {
    TabletMeta {
        table: table.to_string(),
        key_start: start.to_vec(),
        key_end: end.to_vec(),
        path: path.to_string(),
        create_time: 0,
        version: 1,
        parents: Vec::new(),
    }
}

pub fn two_group_schema() -> Schema {
    use crate::schema::{ColumnFamilySchema, LocalityGroup};
    Schema {
        table: "users".into(),
        groups: vec![
            LocalityGroup::new(
                "lg0",
                vec![
                    ColumnFamilySchema::new("name"),
                    ColumnFamilySchema::new("mail"),
                ],
            ),
            LocalityGroup::new("lg1", vec![ColumnFamilySchema::new("blob")]),
        ],
    }
}
