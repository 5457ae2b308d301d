//! # SophiaDB
//!
//! An embeddable **ordered key-value storage engine** with ACID
//! transactions, multi-version concurrency control, and durable on-disk
//! persistence. Storage follows an LSM-like design with
//! **append-in-place compaction**: instead of tiered runs, the keyspace
//! is range-partitioned into nodes, and each node is periodically rebuilt
//! by merging its in-memory delta with its own on-disk pages.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                          Repo                              │
//! │  ┌───────────┐   ┌───────────────────────────────────┐    │
//! │  │  WAL      │   │  Store ("name")                    │    │
//! │  │  log/*.log│   │  ┌──────────┐  ┌──────────┐       │    │
//! │  └─────┬─────┘   │  │ MVCC     │  │ Node set  │       │    │
//! │        │ replay  │  │ intents  │  │ ┌───────┐ │       │    │
//! │        └────────►│  └──────────┘  │ │ i0/i1 │ │ ...   │    │
//! │                  │                │ │ pages │ │       │    │
//! │                  │                │ └───────┘ │       │    │
//! │                  │                └───────────┘       │    │
//! │                  └───────────────────────────────────┘    │
//! │  ┌──────────────────────────────────────────────────────┐ │
//! │  │ Planner workers: checkpoint / compact / gc / expire  │ │
//! │  │                  / backup / node-gc                  │ │
//! │  └──────────────────────────────────────────────────────┘ │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`record`] | Record codec and scheme (field layout, comparators, comparable form) |
//! | [`page`] | Page and page-index formats, byte-exact |
//! | [`node`] | On-disk nodes: file protocol, mmap reads, scans, the seal writer |
//! | [`memindex`] | Per-node in-memory version index with rotation |
//! | [`merge`] | N-way ordered merge, snapshot reads, the compaction stream |
//! | [`wal`] | Write-ahead log with rotation, mark/sweep GC, and replay |
//! | [`mvcc`] | Transactions, write intents, conflict and deadlock detection |
//! | [`planner`] | Task triggers and the node rebuild pipeline |
//! | [`store`] | Repository, stores, transactions, cursors, recovery |
//! | [`sequencer`] | The process-wide monotonic counter group |
//! | [`encoding`] | Byte-stable metadata codec (scheme file) |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sophiadb::{FieldDesc, FieldKind, Repo, RepoConfig, Scheme};
//!
//! let repo = Repo::open(RepoConfig::new("/tmp/db")).unwrap();
//! let scheme = Scheme::new(vec![
//!     FieldDesc::key("k", FieldKind::String, 0),
//!     FieldDesc::value("v", FieldKind::String),
//! ])
//! .unwrap();
//! let store = repo.create_store("s", scheme).unwrap();
//!
//! // Autocommit write and snapshot read.
//! store.set(&[b"alpha", b"1"]).unwrap();
//! let row = store.get(&[b"alpha"]).unwrap().unwrap();
//! assert_eq!(row.field(1).unwrap(), b"1");
//!
//! // Transactional write with conflict detection.
//! let tx = store.begin(sophiadb::TxType::ReadWrite);
//! tx.set(&[b"beta", b"2"]).unwrap();
//! match tx.commit().unwrap() {
//!     sophiadb::CommitOutcome::Committed => {}
//!     sophiadb::CommitOutcome::Lock(tx) => {
//!         tx.rollback().unwrap();
//!     }
//!     sophiadb::CommitOutcome::Rollback => {}
//! }
//!
//! repo.close().unwrap();
//! ```

pub mod encoding;
pub mod memindex;
pub mod merge;
pub mod mvcc;
pub mod node;
pub mod page;
pub mod planner;
pub mod record;
pub mod sequencer;
pub mod store;
pub mod version;
pub mod wal;

pub use merge::{Order, UpsertFn};
pub use mvcc::TxType;
pub use record::{FieldDesc, FieldKind, Record, Scheme, SortOrder};
pub use store::{
    CommitOutcome, Cursor, Repo, RepoConfig, Row, Status, Store, StoreError, Transaction,
};
