use tempfile::TempDir;

use crate::config::ServerConfig;
use crate::schema::Schema;
use crate::server::{LoadRequest, RowWrite, TabletServer};
use crate::tablet::{CellMutation, MutationOp};

pub struct ServerFixture {
    pub tmp: TempDir,
    pub server: TabletServer,
}

impl ServerFixture {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut ServerConfig)) -> Self {
        let tmp = TempDir::new().unwrap();
        let mut config = ServerConfig {
            data_root: tmp.path().join("data"),
            cache_root: tmp.path().join("cache"),
            write_buffer_size: 64 * 1024,
            read_threads: 4,
            ..Default::default()
        };
        tweak(&mut config);
        let server = TabletServer::open(config).unwrap();
        Self { tmp, server }
    }

    pub fn session(&self) -> String {
        self.server.session_id().to_string()
    }

    pub fn load_request(&self, table: &str, start: &[u8], end: &[u8], path: &str) -> LoadRequest {
        LoadRequest {
            table: table.to_string(),
            key_start: start.to_vec(),
            key_end: end.to_vec(),
            path: path.to_string(),
            schema: users_schema(),
            parents: Vec::new(),
            ignore_err_lgs: Vec::new(),
            create_time: 0,
            version: 1,
            session_id: self.session(),
        }
    }
}

impl Drop for ServerFixture {
    fn drop(&mut self) {
        self.server.close();
    }
}

pub fn users_schema() -> Schema {
    let mut schema = Schema::single_group("lg0", &["cf"]);
    schema.table = "users".into();
    schema
}

pub fn put_row(row: &[u8], qualifier: &[u8], value: &[u8]) -> RowWrite {
    RowWrite {
        row: row.to_vec(),
        mutations: vec![CellMutation {
            family: "cf".into(),
            qualifier: qualifier.to_vec(),
            timestamp: None,
            op: MutationOp::Put(value.to_vec()),
        }],
    }
}
