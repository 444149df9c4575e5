//! # TabletDB
//!
//! The core of a wide-column **tablet server**: a set of *tablets* (contiguous
//! row-key ranges of tables), each backed by one **LSM engine per locality
//! group**, with a two-tier block cache between the engines and the
//! distributed filesystem.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                       TabletServer                         │
//! │  session id · status · thread pools · scan contexts        │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │                  TabletManager                       │  │
//! │  │   (table, key_start) → Tablet  (overlap-checked)     │  │
//! │  └──────────────┬───────────────────────────────────────┘  │
//! │                 │                                          │
//! │        ┌────────┴────────┐   one per locality group        │
//! │        │     Tablet      │──────────────┐                  │
//! │        └─────────────────┘              │                  │
//! │  ┌──────────────────────────────────────┴───────────────┐  │
//! │  │                     LsmEngine                        │  │
//! │  │  memtables · WAL · versions/MANIFEST · compaction    │  │
//! │  └──────┬───────────────────────────────────────────────┘  │
//! │         │ SSTable blocks (in-memory LRU)                   │
//! │  ┌──────┴───────────────┐  ┌───────────────────────────┐   │
//! │  │ PersistentBlockCache │  │    FlashMirrorCache       │   │
//! │  │  (SSD, survives      │  │  (whole-file SSD mirror)  │   │
//! │  │   restart)           │  │                           │   │
//! │  └──────┬───────────────┘  └───────────┬───────────────┘   │
//! │         └────────────┬─────────────────┘                   │
//! │                ┌─────┴─────┐                               │
//! │                │    Dfs    │  remote FS, local fallback    │
//! │                └───────────┘                               │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`server`] | Tablet-server core — load/unload/read/write/scan/compact/split, session and health |
//! | [`tablet`] | Tablet lifecycle and the range-keyed tablet registry |
//! | [`engine`] | Per-locality-group LSM engine — versions, write path, compaction, snapshots, split |
//! | [`memtable`] | In-memory ordered write buffer, single or hash-sharded |
//! | [`wal`] | Block-framed, CRC-protected write-ahead log |
//! | [`sstable`] | Immutable sorted tables, block/table caches |
//! | [`pbc`] | Content-addressed persistent SSD block cache |
//! | [`mirror`] | Whole-file SSD mirror cache |
//! | [`dfs`] | Filesystem façade over the remote DFS with the local OS as fallback |
//! | [`schema`] | Table schema — locality groups and column-family options |
//! | [`config`] | Flag-file configuration, reloadable at runtime |
//! | [`threadpool`] | Fixed-worker pools with priorities and delays |
//! | [`encoding`] | Deterministic binary encoding for every on-disk format |
//!
//! ## Key Features
//!
//! - **Durable writes** — every mutation enters the engine's WAL before the
//!   memtable; recovery replays the log prefix that reached disk.
//! - **Snapshot reads** — a read at sequence `s` sees exactly the writes with
//!   assigned sequence `≤ s`, stable across concurrent compaction.
//! - **Leveled compaction** — size-, seek-, and manually-triggered, with
//!   pluggable drop strategies and parallel sub-compactions.
//! - **Two-tier block cache** — an in-memory LRU in front of a
//!   content-addressed persistent SSD cache that survives process restarts.
//! - **Atomic tablet lifecycle** — load, unload, and split are coordinator-
//!   driven and crash-safe; children inherit parent SSTables in place.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tabletdb::config::ServerConfig;
//! use tabletdb::schema::Schema;
//! use tabletdb::server::{LoadRequest, TabletServer};
//!
//! let server = TabletServer::open(ServerConfig::default()).unwrap();
//! let session = server.session_id().to_string();
//!
//! server
//!     .load_tablet(LoadRequest {
//!         table: "users".into(),
//!         key_start: b"".to_vec(),
//!         key_end: b"".to_vec(),
//!         path: "users/tablet00000001".into(),
//!         schema: Schema::single_group("lg0", &["cf"]),
//!         parents: vec![],
//!         ignore_err_lgs: vec![],
//!         create_time: 0,
//!         version: 1,
//!         session_id: session,
//!     })
//!     .unwrap();
//! ```

#![allow(dead_code)]

pub mod config;
pub mod dfs;
pub mod encoding;
pub mod engine;
pub mod memtable;
pub mod mirror;
pub mod pbc;
pub mod schema;
pub mod server;
pub mod sstable;
pub mod tablet;
pub mod threadpool;
pub mod wal;
