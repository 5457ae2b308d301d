//! Store façade — repository, stores, transactions, cursors, recovery.
//!
//! A [`Repo`] is one on-disk repository: a root directory with one
//! sub-directory per store plus a shared `log/` directory for the WAL.
//! Each [`Store`] is a named logical database owning its scheme, its
//! range-partitioned node set, an MVCC transaction manager, and planner
//! state. A background worker pool drains planner tasks; every task is
//! also drivable synchronously through the admin hooks
//! ([`Store::checkpoint`], [`Store::compact`], [`Repo::backup`], …).
//!
//! ## Write path
//!
//! client → [`Transaction::set`] → MVCC intent → [`Transaction::commit`]
//! → WAL append (LSNs stamped under the commit lock, so WAL order is
//! commit order) → per-node in-memory index. A single statement with no
//! live read-write transaction takes the autocommit fast path and skips
//! the intent protocol.
//!
//! ## Read path
//!
//! snapshot LSN → merge of (own uncommitted writes) ∪ (node `i0`, `i1`)
//! ∪ (node pages), visibility-filtered with LSN-descending tie-break,
//! upsert chains folded, tombstones dropped.
//!
//! ## Failure model
//!
//! I/O failures on the WAL append or compaction write path poison the
//! repository (`MALFUNCTION`): the status word flips, a diagnostic is
//! recorded, and further writes are rejected until the repository is
//! closed. Backup copy failures are ordinary errors. Commit conflicts are
//! not errors at all — they surface as [`CommitOutcome`] values.

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use crc32fast::Hasher as Crc32;
use crossbeam::channel::{Receiver, Sender, unbounded};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::encoding::EncodingError;
use crate::memindex::{VersionChain, VersionedRecord};
use crate::merge::{
    MergeEntry, MergeError, MergeIterator, Order, ReadIter, SourceIter, UpsertFn, WriteParams,
    node_source, snapshot_source,
};
use crate::mvcc::{Decision, TxError, TxManager, TxType};
use crate::node::{
    Direction, Node, NodeError, NodeFile, NodeState, db_path, gc_path, parse_file_name,
};
use crate::planner::{
    PlannerError, SealedNode, Task, TaskKind, Thresholds, backup_node, build_replacement_nodes,
    plan_node,
};
use crate::record::{Record, RecordError, Scheme, flags, now_seconds};
use crate::sequencer::Sequencer;
use crate::version::StorageVersion;
use crate::wal::{Wal, WalConfig, WalError};

const LOG_DIR: &str = "log";
const SCHEME_FILE: &str = "scheme";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by the store façade.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Record or scheme failure.
    #[error("record error: {0}")]
    Record(#[from] RecordError),

    /// WAL failure.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Node I/O failure.
    #[error("node error: {0}")]
    Node(#[from] NodeError),

    /// Merge or upsert failure.
    #[error("merge error: {0}")]
    Merge(#[from] MergeError),

    /// Transaction-manager failure.
    #[error("transaction error: {0}")]
    Tx(#[from] TxError),

    /// Planner task failure.
    #[error("planner error: {0}")]
    Planner(#[from] PlannerError),

    /// Metadata encoding failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The engine is in the sticky degraded state; writes are rejected.
    #[error("engine malfunction: {0}")]
    Malfunction(String),

    /// Operation rejected in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Scheme on disk does not match the declared scheme.
    #[error("scheme mismatch: {0}")]
    SchemeMismatch(String),

    /// No store registered under this name or id.
    #[error("unknown store: {0}")]
    UnknownStore(String),
}

// ------------------------------------------------------------------------------------------------
// Status word
// ------------------------------------------------------------------------------------------------

/// Engine lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Not yet opened.
    Offline,
    /// Recovery in progress.
    Recover,
    /// Serving reads and writes.
    Online,
    /// Draining; workers exit on their next poll.
    Shutdown,
    /// Poisoned by an I/O failure; writes rejected until close.
    Malfunction,
}

impl Status {
    fn from_u8(v: u8) -> Status {
        match v {
            1 => Status::Recover,
            2 => Status::Online,
            3 => Status::Shutdown,
            4 => Status::Malfunction,
            _ => Status::Offline,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Status::Offline => 0,
            Status::Recover => 1,
            Status::Online => 2,
            Status::Shutdown => 3,
            Status::Malfunction => 4,
        }
    }
}

/// Diagnostic captured for the most recent failure; sticky for
/// `Malfunction` until the repository closes.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Module that reported the failure.
    pub module: &'static str,
    /// Failure description.
    pub message: String,
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Repository configuration, passed to [`Repo::open`].
#[derive(Debug, Clone)]
pub struct RepoConfig {
    /// Repository root directory.
    pub path: PathBuf,
    /// Backup root; `None` disables backups.
    pub backup_path: Option<PathBuf>,
    /// Target uncompressed page size in bytes.
    pub page_size: usize,
    /// Target node file size in bytes (compaction split point).
    pub node_size: u64,
    /// Total in-memory delta budget across a store's nodes.
    pub memory_limit: usize,
    /// WAL rotation watermark in records.
    pub rotate_wm: u64,
    /// fsync the WAL on every commit.
    pub sync_on_write: bool,
    /// fsync WAL files on rotation.
    pub sync_on_rotate: bool,
    /// fsync node files at seal time.
    pub sync_on_seal: bool,
    /// Drop records older than this many seconds; zero disables.
    pub expire_period: u32,
    /// Duplicate ratio triggering GC compaction.
    pub gc_ratio: f64,
    /// Background worker threads.
    pub workers: usize,
    /// Direct-I/O alignment for the page-index trailer; 0 disables.
    pub align: u16,
}

impl RepoConfig {
    /// Defaults tuned for tests and small embedded use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backup_path: None,
            page_size: 4096,
            node_size: 16 << 20,
            memory_limit: 16 << 20,
            rotate_wm: 4096,
            sync_on_write: true,
            sync_on_rotate: false,
            sync_on_seal: true,
            expire_period: 0,
            gc_ratio: 0.5,
            workers: 6,
            align: 0,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Rows
// ------------------------------------------------------------------------------------------------

/// A record handed back to the caller, bound to its scheme.
#[derive(Debug, Clone)]
pub struct Row {
    rec: Arc<Record>,
    scheme: Arc<Scheme>,
}

impl Row {
    /// Field bytes by declaration index.
    pub fn field(&self, idx: usize) -> Result<&[u8], StoreError> {
        Ok(self.rec.field(&self.scheme, idx)?)
    }

    /// Field bytes by name.
    pub fn field_by_name(&self, name: &str) -> Result<&[u8], StoreError> {
        let idx = self
            .scheme
            .fields()
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| StoreError::InvalidState(format!("no field named '{name}'")))?;
        self.field(idx)
    }

    /// Record LSN.
    pub fn lsn(&self) -> u64 {
        self.rec.lsn()
    }
}

/// Commit outcome; conflicts are values, not errors.
pub enum CommitOutcome {
    /// The transaction is durable.
    Committed,
    /// Blocked behind an uncommitted writer; retry later or roll back.
    /// The transaction is handed back for the retry.
    Lock(Transaction),
    /// Write-write conflict; the transaction has been rolled back.
    Rollback,
}

// ------------------------------------------------------------------------------------------------
// Repo
// ------------------------------------------------------------------------------------------------

pub(crate) struct RepoShared {
    cfg: RepoConfig,
    seq: Arc<Sequencer>,
    wal: Wal,
    status: AtomicU8,
    diag: Mutex<Option<Diagnostic>>,
    stores: RwLock<BTreeMap<String, Arc<Store>>>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl RepoShared {
    fn status(&self) -> Status {
        Status::from_u8(self.status.load(AtomicOrdering::Acquire))
    }

    fn set_status(&self, s: Status) {
        self.status.store(s.as_u8(), AtomicOrdering::Release);
    }

    /// Flips the repository into the sticky degraded state.
    fn fail(&self, module: &'static str, message: String) {
        error!(module, %message, "engine malfunction");
        self.set_status(Status::Malfunction);
        let mut diag = self.diag.lock().expect("diag lock poisoned");
        if diag.is_none() || self.status() == Status::Malfunction {
            *diag = Some(Diagnostic { module, message });
        }
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        match self.status() {
            Status::Online => Ok(()),
            Status::Malfunction => {
                let diag = self.diag.lock().expect("diag lock poisoned");
                Err(StoreError::Malfunction(
                    diag.as_ref()
                        .map(|d| format!("{}: {}", d.module, d.message))
                        .unwrap_or_else(|| "unknown failure".into()),
                ))
            }
            s => Err(StoreError::InvalidState(format!(
                "repository is {s:?}, not online"
            ))),
        }
    }

    fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }
}

/// An open repository.
pub struct Repo {
    shared: Arc<RepoShared>,
}

impl Repo {
    /// Opens (or creates) a repository rooted at `cfg.path`.
    ///
    /// Recovery runs first: store directories are walked, interrupted
    /// compactions are disambiguated by file suffix, sequence counters
    /// are bumped past everything on disk, and the WAL is replayed. Only
    /// then does the repository come online and spawn its workers.
    pub fn open(cfg: RepoConfig) -> Result<Repo, StoreError> {
        fs::create_dir_all(&cfg.path)?;
        let seq = Arc::new(Sequencer::new());
        let wal = Wal::open(
            WalConfig {
                dir: cfg.path.join(LOG_DIR),
                sync_on_write: cfg.sync_on_write,
                sync_on_rotate: cfg.sync_on_rotate,
                rotate_wm: cfg.rotate_wm,
            },
            Arc::clone(&seq),
        )?;

        let (wake_tx, wake_rx) = unbounded();
        let shared = Arc::new(RepoShared {
            cfg,
            seq,
            wal,
            status: AtomicU8::new(Status::Recover.as_u8()),
            diag: Mutex::new(None),
            stores: RwLock::new(BTreeMap::new()),
            wake_tx,
            wake_rx,
            workers: Mutex::new(Vec::new()),
        });

        let repo = Repo {
            shared: Arc::clone(&shared),
        };
        repo.recover()?;

        // Keep the backup counter monotone across restarts.
        if let Some(root) = &shared.cfg.backup_path {
            if let Ok(entries) = fs::read_dir(root) {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let stem = name.strip_suffix(".incomplete").unwrap_or(&name);
                    if let Ok(bsn) = stem.parse::<u64>() {
                        shared.seq.bump_bsn(bsn);
                    }
                }
            }
        }

        shared.set_status(Status::Online);
        repo.spawn_workers();
        info!(path = %shared.cfg.path.display(), "repository online");
        Ok(repo)
    }

    /// Walks the repository, reopens every store, and replays the WAL.
    fn recover(&self) -> Result<(), StoreError> {
        let shared = &self.shared;
        let mut by_id: HashMap<u32, Arc<Store>> = HashMap::new();

        for entry in fs::read_dir(&shared.cfg.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == LOG_DIR {
                continue;
            }
            let store = Store::recover_dir(Arc::downgrade(shared), &name, &entry.path())?;
            by_id.insert(store.store_id, Arc::clone(&store));
            shared
                .stores
                .write()
                .expect("store registry lock poisoned")
                .insert(name, store);
        }

        let replayed = shared.wal.replay(|lfsn, store_id, payload| {
            let store = by_id.get(&store_id).ok_or_else(|| {
                WalError::Dispatch(format!("record for unknown store id {store_id}"))
            })?;
            store
                .replay_record(lfsn, payload)
                .map_err(|e| WalError::Dispatch(e.to_string()))
        })?;
        debug!(records = replayed, "WAL replay finished");
        Ok(())
    }

    fn spawn_workers(&self) {
        let mut workers = self
            .shared
            .workers
            .lock()
            .expect("worker registry lock poisoned");
        for i in 0..self.shared.cfg.workers {
            let shared = Arc::clone(&self.shared);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("sophiadb-worker-{i}"))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn worker thread"),
            );
        }
    }

    /// Declares a new store with the given scheme.
    pub fn create_store(&self, name: &str, scheme: Scheme) -> Result<Arc<Store>, StoreError> {
        self.shared.ensure_online()?;
        if name == LOG_DIR {
            return Err(StoreError::InvalidState(format!(
                "'{LOG_DIR}' is reserved"
            )));
        }
        let mut stores = self
            .shared
            .stores
            .write()
            .expect("store registry lock poisoned");
        if stores.contains_key(name) {
            return Err(StoreError::InvalidState(format!(
                "store '{name}' already exists"
            )));
        }

        let dir = self.shared.cfg.path.join(name);
        fs::create_dir_all(&dir)?;
        let store_id = self.shared.seq.next_dsn() as u32;
        write_scheme_file(&dir, store_id, &scheme)?;
        let node = Node::create_initial(
            &dir,
            self.shared.seq.next_nsn(),
            self.shared.cfg.sync_on_seal,
        )?;

        let store = Arc::new(Store {
            name: name.to_string(),
            store_id,
            dir,
            scheme: Arc::new(scheme),
            upsert: RwLock::new(None),
            mvcc: TxManager::new(Arc::clone(&self.shared.seq)),
            commit_lock: Mutex::new(()),
            inner: RwLock::new(StoreInner {
                nodes: BTreeMap::from([(Vec::new(), Arc::new(node))]),
                delayed: Vec::new(),
                checkpoint_target: None,
                backup: None,
            }),
            repo: Arc::downgrade(&self.shared),
        });
        stores.insert(name.to_string(), Arc::clone(&store));
        info!(name, store_id, "store created");
        Ok(store)
    }

    /// Fetches an existing store by name.
    pub fn store(&self, name: &str) -> Result<Arc<Store>, StoreError> {
        self.shared
            .stores
            .read()
            .expect("store registry lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownStore(name.to_string()))
    }

    /// Current lifecycle status.
    pub fn status(&self) -> Status {
        self.shared.status()
    }

    /// Most recent failure diagnostic, if any.
    pub fn diagnostic(&self) -> Option<Diagnostic> {
        self.shared.diag.lock().expect("diag lock poisoned").clone()
    }

    /// Repository statistics.
    pub fn stats(&self) -> RepoStats {
        let stores = self
            .shared
            .stores
            .read()
            .expect("store registry lock poisoned");
        let mut nodes = 0;
        let mut pages = 0;
        let mut pending_bytes = 0;
        for store in stores.values() {
            let inner = store.inner.read().expect("store lock poisoned");
            for node in inner.nodes.values() {
                nodes += 1;
                pages += node.index.count();
                pending_bytes += node.used();
            }
        }
        RepoStats {
            stores: stores.len(),
            nodes,
            pages,
            pending_bytes,
            wal_files: self.shared.wal.file_count(),
        }
    }

    /// Runs a full backup: every node file of every store is copied into
    /// `{bsn:020}.incomplete/` under the backup root, which is renamed to
    /// `{bsn:020}/` on success.
    ///
    /// Backup failures stop the backup but never poison the engine.
    pub fn backup(&self) -> Result<PathBuf, StoreError> {
        self.shared.ensure_online()?;
        let root = self
            .shared
            .cfg
            .backup_path
            .clone()
            .ok_or_else(|| StoreError::InvalidState("no backup path configured".into()))?;
        fs::create_dir_all(&root)?;

        let bsn = self.shared.seq.next_bsn();
        let staging = root.join(format!("{bsn:020}.incomplete"));
        let final_dir = root.join(format!("{bsn:020}"));
        fs::create_dir_all(&staging)?;

        let stores: Vec<Arc<Store>> = {
            let guard = self
                .shared
                .stores
                .read()
                .expect("store registry lock poisoned");
            guard.values().cloned().collect()
        };
        for store in stores {
            let store_dir = staging.join(&store.name);
            fs::create_dir_all(&store_dir)?;
            fs::copy(store.dir.join(SCHEME_FILE), store_dir.join(SCHEME_FILE))?;
            store.set_backup_target(bsn, store_dir);
            // Drain this store's backup tasks synchronously.
            while let Some(task) = store.plan_kind(TaskKind::Backup) {
                store.execute(task)?;
            }
            store.clear_backup_target();
        }

        fs::rename(&staging, &final_dir)?;
        info!(bsn, path = %final_dir.display(), "backup complete");
        Ok(final_dir)
    }

    /// Gracefully shuts the repository down: workers drain and exit, the
    /// WAL is collected one last time, and directories are fsynced.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.shared.status() == Status::Shutdown {
            return Ok(());
        }
        self.shared.set_status(Status::Shutdown);
        for _ in 0..self.shared.cfg.workers {
            self.shared.wake();
        }
        let handles: Vec<_> = {
            let mut workers = self
                .shared
                .workers
                .lock()
                .expect("worker registry lock poisoned");
            workers.drain(..).collect()
        };
        for h in handles {
            let _ = h.join();
        }
        let _ = self.shared.wal.gc();

        for dir in [self.shared.cfg.path.clone(), self.shared.cfg.path.join(LOG_DIR)] {
            if let Ok(d) = File::open(&dir) {
                let _ = d.sync_all();
            }
        }
        info!("repository closed");
        Ok(())
    }
}

impl Drop for Repo {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Repository statistics snapshot.
#[derive(Debug)]
pub struct RepoStats {
    /// Registered stores.
    pub stores: usize,
    /// Total live nodes.
    pub nodes: usize,
    /// Total on-disk pages.
    pub pages: usize,
    /// Bytes pending in in-memory deltas.
    pub pending_bytes: usize,
    /// Live WAL files.
    pub wal_files: usize,
}

// ------------------------------------------------------------------------------------------------
// Worker loop
// ------------------------------------------------------------------------------------------------

fn worker_loop(shared: Arc<RepoShared>) {
    loop {
        match shared.status() {
            Status::Shutdown | Status::Malfunction => break,
            _ => {}
        }

        let stores: Vec<Arc<Store>> = {
            let guard = shared.stores.read().expect("store registry lock poisoned");
            guard.values().cloned().collect()
        };

        let mut did_work = false;
        for store in stores {
            if shared.status() != Status::Online {
                break;
            }
            if let Some(task) = store.plan() {
                did_work = true;
                if let Err(e) = store.execute(task) {
                    warn!(store = %store.name, error = %e, "background task failed");
                }
            }
        }

        if !did_work {
            match shared.wake_rx.recv_timeout(Duration::from_millis(50)) {
                Ok(()) | Err(crossbeam::channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Store
// ------------------------------------------------------------------------------------------------

struct StoreInner {
    /// Nodes keyed by range-start key; the first node's key is empty so
    /// the tree always covers the whole keyspace.
    nodes: BTreeMap<Vec<u8>, Arc<Node>>,
    /// Replaced nodes awaiting their last reader (`.db.gc` files).
    delayed: Vec<Arc<Node>>,
    /// Pending checkpoint target LSN.
    checkpoint_target: Option<u64>,
    /// Pending backup `(bsn, staging dir)`.
    backup: Option<(u64, PathBuf)>,
}

/// A named logical database.
pub struct Store {
    name: String,
    pub(crate) store_id: u32,
    dir: PathBuf,
    scheme: Arc<Scheme>,
    upsert: RwLock<Option<UpsertFn>>,
    mvcc: TxManager,
    commit_lock: Mutex<()>,
    inner: RwLock<StoreInner>,
    repo: Weak<RepoShared>,
}

impl Store {
    // --------------------------------------------------------------------------------------------
    // Recovery
    // --------------------------------------------------------------------------------------------

    /// Reopens a store directory, applying the crash-disambiguation rules
    /// for interrupted compactions.
    fn recover_dir(
        repo: Weak<RepoShared>,
        name: &str,
        dir: &Path,
    ) -> Result<Arc<Store>, StoreError> {
        let shared = repo.upgrade().expect("repository gone during recovery");
        let (store_id, scheme) = read_scheme_file(dir)?;
        shared.seq.bump_dsn(store_id as u64);

        let mut dbs: Vec<u64> = Vec::new();
        let mut seals: HashMap<u64, Vec<u64>> = HashMap::new();
        let mut incompletes: HashMap<u64, Vec<u64>> = HashMap::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            match parse_file_name(&file_name) {
                Some(NodeFile::Db { id }) => dbs.push(id),
                Some(NodeFile::Seal { parent, id }) => seals.entry(parent).or_default().push(id),
                Some(NodeFile::Incomplete { parent, id }) => {
                    incompletes.entry(parent).or_default().push(id)
                }
                Some(NodeFile::Gc { id }) => {
                    // A deferred deletion that survived a crash.
                    info!(name, id, "removing leftover .gc node");
                    fs::remove_file(entry.path())?;
                }
                None => {}
            }
        }

        // Disambiguate interrupted compactions per parent.
        let parents: std::collections::BTreeSet<u64> =
            seals.keys().chain(incompletes.keys()).copied().collect();
        for parent in parents {
            let has_seal = seals.contains_key(&parent);
            let has_incomplete = incompletes.contains_key(&parent);
            match (has_incomplete, has_seal) {
                (true, _) => {
                    // Interrupted mid-write (or between write and publish):
                    // discard all children, the parent stays authoritative.
                    for id in incompletes.remove(&parent).unwrap_or_default() {
                        fs::remove_file(crate::node::incomplete_path(dir, parent, id))?;
                    }
                    for id in seals.remove(&parent).unwrap_or_default() {
                        fs::remove_file(crate::node::seal_path(dir, parent, id))?;
                    }
                    if !dbs.contains(&parent) {
                        return Err(StoreError::InvalidState(format!(
                            "store '{name}': interrupted compaction of node {parent} but the parent file is missing"
                        )));
                    }
                    info!(name, parent, "discarded interrupted compaction output");
                }
                (false, true) => {
                    // All outputs sealed: the compaction finished writing.
                    // Promote every seal and drop the parent.
                    for id in seals.remove(&parent).unwrap_or_default() {
                        fs::rename(
                            crate::node::seal_path(dir, parent, id),
                            db_path(dir, id),
                        )?;
                        dbs.push(id);
                        info!(name, parent, id, "promoted sealed node");
                    }
                    if dbs.contains(&parent) {
                        fs::remove_file(db_path(dir, parent))?;
                        dbs.retain(|&id| id != parent);
                    }
                }
                (false, false) => unreachable!("parent collected without children"),
            }
        }

        // Open the surviving nodes and key them by range start.
        let mut opened = Vec::with_capacity(dbs.len());
        for id in dbs {
            shared.seq.bump_nsn(id);
            let node = Node::open(&db_path(dir, id), id, 0)?;
            shared.seq.bump_lsn(node.index.header.lsn_max);
            opened.push(Arc::new(node));
        }
        let mut nodes = BTreeMap::new();
        if opened.is_empty() {
            let node = Node::create_initial(dir, shared.seq.next_nsn(), shared.cfg.sync_on_seal)?;
            nodes.insert(Vec::new(), Arc::new(node));
        } else {
            let mut keyed: Vec<(Vec<u8>, Arc<Node>)> = opened
                .into_iter()
                .map(|node| {
                    let key = node_range_start(&scheme, &node)?;
                    Ok::<_, StoreError>((key, node))
                })
                .collect::<Result<_, _>>()?;
            keyed.sort_by(|a, b| a.0.cmp(&b.0));
            // The lowest node anchors the keyspace.
            keyed[0].0 = Vec::new();
            nodes.extend(keyed);
        }

        info!(name, store_id, nodes = nodes.len(), "store recovered");
        Ok(Arc::new(Store {
            name: name.to_string(),
            store_id,
            dir: dir.to_path_buf(),
            scheme: Arc::new(scheme),
            upsert: RwLock::new(None),
            mvcc: TxManager::new(Arc::clone(&shared.seq)),
            commit_lock: Mutex::new(()),
            inner: RwLock::new(StoreInner {
                nodes,
                delayed: Vec::new(),
                checkpoint_target: None,
                backup: None,
            }),
            repo,
        }))
    }

    /// Installs one replayed WAL record, skipping records already
    /// absorbed by prior compactions.
    fn replay_record(&self, lfsn: u64, payload: &[u8]) -> Result<(), StoreError> {
        let rec = Record::from_bytes(&self.scheme, payload.to_vec())?;
        let shared = self.shared()?;
        shared.seq.bump_lsn(rec.lsn());

        let ik = self.scheme.index_key(&rec);
        let inner = self.inner.read().expect("store lock poisoned");
        let node = find_node(&inner.nodes, &ik);
        if rec.lsn() <= node.index.header.lsn_max {
            // Already absorbed by this node's pages; credit the sweep so
            // the log file stays collectable.
            shared.wal.sweep(lfsn, 1);
            return Ok(());
        }
        let mut ni = node.inner.write().expect("node lock poisoned");
        ni.i0.insert(
            ik,
            VersionedRecord {
                rec: Arc::new(rec),
                lfsn,
            },
        );
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Accessors
    // --------------------------------------------------------------------------------------------

    /// Store name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The store's scheme.
    pub fn scheme(&self) -> &Arc<Scheme> {
        &self.scheme
    }

    /// Binds the user merge function for `UPSERT` records.
    pub fn set_upsert(&self, f: UpsertFn) {
        *self.upsert.write().expect("upsert lock poisoned") = Some(f);
    }

    fn upsert_fn(&self) -> Option<UpsertFn> {
        self.upsert.read().expect("upsert lock poisoned").clone()
    }

    fn shared(&self) -> Result<Arc<RepoShared>, StoreError> {
        self.repo
            .upgrade()
            .ok_or_else(|| StoreError::InvalidState("repository already closed".into()))
    }

    /// Store statistics.
    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read().expect("store lock poisoned");
        let mut pages = 0;
        let mut keys = 0u64;
        let mut pending = 0;
        for node in inner.nodes.values() {
            pages += node.index.count();
            keys += node.index.header.keys as u64;
            pending += node.used();
        }
        StoreStats {
            nodes: inner.nodes.len(),
            pages,
            disk_keys: keys,
            pending_bytes: pending,
            active_transactions: self.mvcc.active(),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Transactions
    // --------------------------------------------------------------------------------------------

    /// Begins a transaction. Requires the store handle as `Arc`.
    pub fn begin(self: &Arc<Store>, ty: TxType) -> Transaction {
        let tsn = self.mvcc.begin(ty, None);
        Transaction {
            store: Arc::clone(self),
            tsn,
            done: false,
        }
    }

    // --------------------------------------------------------------------------------------------
    // Autocommit statements
    // --------------------------------------------------------------------------------------------

    /// Inserts or replaces a record (autocommit).
    pub fn set(self: &Arc<Store>, values: &[&[u8]]) -> Result<(), StoreError> {
        let rec = Record::build(&self.scheme, values, flags::NONE, 0)?;
        self.autocommit(rec)
    }

    /// Installs an upsert operand (autocommit).
    pub fn upsert(self: &Arc<Store>, values: &[&[u8]]) -> Result<(), StoreError> {
        if self.upsert_fn().is_none() {
            return Err(StoreError::InvalidState(
                "no upsert function bound to this store".into(),
            ));
        }
        let rec = Record::build(&self.scheme, values, flags::UPSERT, 0)?;
        self.autocommit(rec)
    }

    /// Deletes a key (autocommit tombstone).
    pub fn delete(self: &Arc<Store>, key_values: &[&[u8]]) -> Result<(), StoreError> {
        let mut rec = self.scheme.key_record(key_values)?;
        rec.set_flags(flags::DELETE);
        self.autocommit(rec)
    }

    /// Single-statement write: skips the intent protocol entirely when no
    /// read-write transaction is live.
    fn autocommit(self: &Arc<Store>, rec: Record) -> Result<(), StoreError> {
        self.shared()?.ensure_online()?;
        if self.mvcc.has_live_rw() {
            let tx = self.begin(TxType::ReadWrite);
            tx.set_record(rec)?;
            return match tx.commit()? {
                CommitOutcome::Committed => Ok(()),
                CommitOutcome::Lock(tx) => {
                    tx.rollback()?;
                    Err(StoreError::InvalidState(
                        "autocommit blocked by a concurrent transaction".into(),
                    ))
                }
                CommitOutcome::Rollback => Err(StoreError::InvalidState(
                    "autocommit lost a write-write conflict".into(),
                )),
            };
        }

        let ik = self.scheme.index_key(&rec);
        let shared = self.shared()?;
        let _commit = self.commit_lock.lock().expect("commit lock poisoned");
        self.append_and_install(&shared, vec![(ik, rec)])
    }

    /// The commit tail shared by autocommit and transactions: WAL append
    /// (stamping LSNs) then installation into the owning nodes' `i0`.
    ///
    /// Callers hold the commit lock, which is what makes WAL order equal
    /// commit order.
    fn append_and_install(
        &self,
        shared: &Arc<RepoShared>,
        writes: Vec<(Vec<u8>, Record)>,
    ) -> Result<(), StoreError> {
        let (keys, mut recs): (Vec<Vec<u8>>, Vec<Record>) = writes.into_iter().unzip();
        let lfsn = match shared.wal.append(self.store_id, &mut recs) {
            Ok(lfsn) => lfsn,
            Err(e) => {
                shared.fail("wal", e.to_string());
                return Err(e.into());
            }
        };

        let inner = self.inner.read().expect("store lock poisoned");
        for (ik, rec) in keys.into_iter().zip(recs) {
            let node = find_node(&inner.nodes, &ik);
            let mut ni = node.inner.write().expect("node lock poisoned");
            ni.i0.insert(
                ik,
                VersionedRecord {
                    rec: Arc::new(rec),
                    lfsn,
                },
            );
        }
        drop(inner);
        shared.wake();
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Snapshot point lookup at the current LSN.
    pub fn get(self: &Arc<Store>, key_values: &[&[u8]]) -> Result<Option<Row>, StoreError> {
        let vlsn = self.shared()?.seq.lsn();
        self.read_key(key_values, vlsn, None)
    }

    fn read_key(
        &self,
        key_values: &[&[u8]],
        vlsn: u64,
        tsn: Option<u64>,
    ) -> Result<Option<Row>, StoreError> {
        let probe = self.scheme.key_record(key_values)?;
        let ik = self.scheme.index_key(&probe);

        // The transaction's own pending write shadows committed state.
        if let Some(tsn) = tsn {
            if let Some(own) = self.mvcc.own_write(tsn, &ik) {
                if own.has_flag(flags::DELETE) {
                    return Ok(None);
                }
                if own.has_flag(flags::UPSERT) {
                    let upsert = self.upsert_fn().ok_or_else(|| {
                        StoreError::InvalidState("no upsert function bound to this store".into())
                    })?;
                    let base = self.read_committed(&probe, &ik, vlsn)?;
                    let base_rec = base.map(|r| (*r.rec).clone());
                    let folded = upsert(&self.scheme, base_rec.as_ref(), &own)
                        .map_err(MergeError::Upsert)?;
                    return Ok(Some(Row {
                        rec: Arc::new(folded),
                        scheme: Arc::clone(&self.scheme),
                    }));
                }
                return Ok(Some(Row {
                    rec: Arc::new(own),
                    scheme: Arc::clone(&self.scheme),
                }));
            }
            // Register the read for commit-time validation.
            self.mvcc.track_read(tsn, ik.clone(), probe.clone())?;
        }

        Ok(self.read_committed(&probe, &ik, vlsn)?.map(|e| Row {
            rec: e.rec,
            scheme: Arc::clone(&self.scheme),
        }))
    }

    /// Reads the committed state of one key at `vlsn`.
    fn read_committed(
        &self,
        probe: &Record,
        ik: &[u8],
        vlsn: u64,
    ) -> Result<Option<MergeEntry>, StoreError> {
        let (i0_chain, i1_chain, node) = {
            let inner = self.inner.read().expect("store lock poisoned");
            let node = Arc::clone(find_node(&inner.nodes, ik));
            let ni = node.inner.read().expect("node lock poisoned");
            (
                ni.i0.get(ik).cloned(),
                ni.i1.get(ik).cloned(),
                Arc::clone(&node),
            )
        };

        let disk = node.chain_for(&self.scheme, probe)?;

        let mut snapshot: Vec<(Vec<u8>, VersionChain)> = Vec::new();
        if let Some(c) = i0_chain {
            snapshot.push((ik.to_vec(), c));
        }
        if let Some(c) = i1_chain {
            snapshot.push((ik.to_vec(), c));
        }

        let disk_entries: Vec<Result<MergeEntry, MergeError>> = disk
            .into_iter()
            .map(|rec| {
                Ok(MergeEntry {
                    key: ik.to_vec(),
                    dup: rec.has_flag(flags::DUP),
                    lfsn: 0,
                    rec: Arc::new(rec),
                })
            })
            .collect();

        let mut sources: Vec<SourceIter<'_>> = vec![snapshot_source(&snapshot)];
        sources.push(Box::new(disk_entries.into_iter()));

        let merge = MergeIterator::new(sources, Direction::Asc)?;
        let mut reader = ReadIter::new(merge, &self.scheme, vlsn, self.upsert_fn());
        match reader.next() {
            Some(entry) => {
                let entry = entry?;
                Ok((entry.key == ik).then_some(entry))
            }
            None => Ok(None),
        }
    }

    /// Opens a range cursor at the current LSN.
    ///
    /// `key_values` is the probe; `None` starts at the low (or, for
    /// descending orders, the high) end of the keyspace.
    pub fn cursor(
        self: &Arc<Store>,
        order: Order,
        key_values: Option<&[&[u8]]>,
    ) -> Result<Cursor, StoreError> {
        let vlsn = self.shared()?.seq.lsn();
        let probe = key_values
            .map(|kv| self.scheme.key_record(kv))
            .transpose()?;
        let start_ik = probe.as_ref().map(|p| self.scheme.index_key(p));

        let first_node_key = {
            let inner = self.inner.read().expect("store lock poisoned");
            match (&start_ik, order.direction()) {
                (Some(ik), _) => Some(node_key_for(&inner.nodes, ik)),
                (None, Direction::Asc) => inner.nodes.keys().next().cloned(),
                (None, Direction::Desc) => inner.nodes.keys().next_back().cloned(),
            }
        };

        Ok(Cursor {
            store: Arc::clone(self),
            order,
            vlsn,
            probe,
            start_ik,
            next_node_key: first_node_key,
            buffer: std::collections::VecDeque::new(),
            last_ik: None,
        })
    }

    // --------------------------------------------------------------------------------------------
    // Planner integration
    // --------------------------------------------------------------------------------------------

    fn thresholds(&self, node_count: usize) -> Thresholds {
        let cfg = match self.repo.upgrade() {
            Some(shared) => shared.cfg.clone(),
            None => RepoConfig::new("."),
        };
        let per_node = (cfg.memory_limit / node_count.max(1)).min(cfg.node_size as usize);
        Thresholds {
            node_memory_cap: per_node.max(1),
            gc_ratio: cfg.gc_ratio,
            expire_period: cfg.expire_period,
        }
    }

    /// Picks the next due task for this store.
    pub(crate) fn plan(&self) -> Option<Task> {
        self.plan_filtered(None)
    }

    /// Picks the next due task of one specific kind; used by the
    /// synchronous admin hooks to drive a request to completion.
    fn plan_kind(&self, kind: TaskKind) -> Option<Task> {
        self.plan_filtered(Some(kind))
    }

    fn plan_filtered(&self, wanted: Option<TaskKind>) -> Option<Task> {
        let vlsn = self.mvcc.vlsn();
        let now = now_seconds();
        let inner = self.inner.read().expect("store lock poisoned");
        let th = self.thresholds(inner.nodes.len());
        let backup_target = inner.backup.as_ref().map(|(bsn, _)| *bsn);

        for node in inner.nodes.values() {
            if let Some(kind) = plan_node(
                node,
                &th,
                vlsn,
                now,
                inner.checkpoint_target,
                backup_target,
            ) {
                if wanted.is_none() || wanted == Some(kind) {
                    return Some(Task {
                        kind,
                        node: Arc::clone(node),
                    });
                }
            }
        }
        if wanted.is_none() || wanted == Some(TaskKind::NodeGc) {
            // A delayed node with only the list's reference is unreachable
            // by any reader.
            return inner
                .delayed
                .iter()
                .find(|n| Arc::strong_count(n) == 1)
                .map(|n| Task {
                    kind: TaskKind::NodeGc,
                    node: Arc::clone(n),
                });
        }
        None
    }

    /// Executes one planner task.
    pub(crate) fn execute(&self, task: Task) -> Result<(), StoreError> {
        match task.kind {
            TaskKind::Checkpoint
            | TaskKind::Compaction
            | TaskKind::Gc
            | TaskKind::Expire => self.compact_node(&task.node),
            TaskKind::Backup => self.backup_one(&task.node),
            TaskKind::NodeGc => self.node_gc(&task.node),
        }
    }

    fn backup_one(&self, node: &Arc<Node>) -> Result<(), StoreError> {
        let (bsn, staging) = {
            let inner = self.inner.read().expect("store lock poisoned");
            match &inner.backup {
                Some((bsn, dir)) => (*bsn, dir.clone()),
                None => return Ok(()),
            }
        };
        backup_node(node, &staging)?;
        node.inner.write().expect("node lock poisoned").backup_bsn = bsn;
        Ok(())
    }

    fn set_backup_target(&self, bsn: u64, staging: PathBuf) {
        self.inner.write().expect("store lock poisoned").backup = Some((bsn, staging));
    }

    fn clear_backup_target(&self) {
        self.inner.write().expect("store lock poisoned").backup = None;
    }

    fn node_gc(&self, node: &Arc<Node>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let Some(pos) = inner.delayed.iter().position(|n| Arc::ptr_eq(n, node)) else {
            return Ok(());
        };
        // One reference here, one in the list: no reader can resurface it.
        if Arc::strong_count(node) > 2 {
            return Ok(());
        }
        let node = inner.delayed.remove(pos);
        drop(inner);
        let path = node.path();
        fs::remove_file(&path)?;
        info!(id = node.id, path = %path.display(), "deferred node deleted");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Admin hooks
    // --------------------------------------------------------------------------------------------

    /// Drains every record at or below the current LSN to disk.
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        let shared = self.shared()?;
        shared.ensure_online()?;
        let target = shared.seq.lsn();
        self.inner.write().expect("store lock poisoned").checkpoint_target = Some(target);

        while let Some(task) = self.plan_kind(TaskKind::Checkpoint) {
            self.execute(task)?;
        }
        self.inner.write().expect("store lock poisoned").checkpoint_target = None;
        Ok(())
    }

    /// Compacts every node once, regardless of pressure.
    pub fn compact(&self) -> Result<(), StoreError> {
        self.shared()?.ensure_online()?;
        let nodes: Vec<Arc<Node>> = {
            let inner = self.inner.read().expect("store lock poisoned");
            inner.nodes.values().cloned().collect()
        };
        for node in nodes {
            self.compact_node(&node)?;
        }
        Ok(())
    }

    /// Rewrites nodes whose duplicate-version ratio crossed the GC
    /// threshold.
    pub fn gc(&self) -> Result<usize, StoreError> {
        self.shared()?.ensure_online()?;
        let mut n = 0;
        while let Some(task) = self.plan_kind(TaskKind::Gc) {
            self.execute(task)?;
            n += 1;
        }
        Ok(n)
    }

    /// Rewrites nodes holding records older than the expire period.
    pub fn expire(&self) -> Result<usize, StoreError> {
        self.shared()?.ensure_online()?;
        let mut n = 0;
        while let Some(task) = self.plan_kind(TaskKind::Expire) {
            self.execute(task)?;
            n += 1;
        }
        Ok(n)
    }

    /// Runs the deferred-delete sweep.
    pub fn node_gc_sweep(&self) -> Result<usize, StoreError> {
        let mut n = 0;
        while let Some(task) = self.plan_kind(TaskKind::NodeGc) {
            self.execute(task)?;
            n += 1;
        }
        Ok(n)
    }

    // --------------------------------------------------------------------------------------------
    // Compaction driver
    // --------------------------------------------------------------------------------------------

    /// The rebuild: rotate the delta, merge it with the pages, write the
    /// replacements through the seal protocol, swap atomically, and
    /// retire the old file.
    fn compact_node(&self, node: &Arc<Node>) -> Result<(), StoreError> {
        let shared = self.shared()?;

        // 1+2. Lock the node and rotate its delta.
        {
            let mut ni = node.inner.write().expect("node lock poisoned");
            if ni.state == NodeState::Locked {
                return Ok(());
            }
            ni.state = NodeState::Locked;
            debug_assert!(ni.i1.is_empty(), "rotation over a live shadow index");
            ni.i1 = std::mem::take(&mut ni.i0);
        }

        let result = self.compact_locked(&shared, node);
        if result.is_err() {
            // Put the drained delta back so nothing is lost, then unlock.
            let mut ni = node.inner.write().expect("node lock poisoned");
            let i1 = std::mem::take(&mut ni.i1);
            for (key, chain) in i1.snapshot() {
                for vr in chain.versions().iter().rev() {
                    ni.i0.insert(key.clone(), vr.clone());
                }
            }
            ni.state = NodeState::Live;
        }
        result
    }

    fn compact_locked(
        &self,
        shared: &Arc<RepoShared>,
        node: &Arc<Node>,
    ) -> Result<(), StoreError> {
        let cfg = &shared.cfg;
        let vlsn = self.mvcc.vlsn();
        let now = now_seconds();

        // 3. Snapshot the rotated delta and tally the WAL sweep credits:
        // every drained record is absorbed whether it survives or not.
        let snapshot = {
            let ni = node.inner.read().expect("node lock poisoned");
            ni.i1.snapshot()
        };
        let mut sweeps: HashMap<u64, u64> = HashMap::new();
        for (_, chain) in &snapshot {
            for vr in chain.versions() {
                if vr.lfsn != 0 {
                    *sweeps.entry(vr.lfsn).or_insert(0) += 1;
                }
            }
        }

        // 4+5. Drain the merged stream into sealed replacement files.
        let sources: Vec<SourceIter<'_>> = vec![
            snapshot_source(&snapshot),
            node_source(node, &self.scheme, Direction::Asc, None)?,
        ];
        let merge = MergeIterator::new(sources, Direction::Asc)?;
        let params = WriteParams {
            vlsn,
            now,
            expire_period: cfg.expire_period,
            page_size: cfg.page_size,
            node_size: cfg.node_size,
        };
        let seq = Arc::clone(&shared.seq);
        let sealed = match build_replacement_nodes(
            &self.scheme,
            merge,
            params,
            self.upsert_fn(),
            &self.dir,
            node.id,
            move || seq.next_nsn(),
            cfg.align,
            cfg.sync_on_seal,
        ) {
            Ok(sealed) => sealed,
            Err(e) => {
                if matches!(e, PlannerError::Io(_) | PlannerError::Node(_)) {
                    shared.fail("compaction", e.to_string());
                }
                return Err(e.into());
            }
        };

        // 6. Publish under the store lock.
        let (old_arc, new_nodes) = self.publish_rebuild(shared, node, sealed)?;

        // 7. Move the replaced file out of the live namespace before any
        //    seal is promoted: whatever instant a crash hits, either the
        //    parent or the seals are authoritative, never both as `.db`.
        self.retire_node(old_arc)?;

        // 8. Promote the published seals to live names.
        for n in &new_nodes {
            n.rename_to(&db_path(&self.dir, n.id))?;
        }

        // Credit the WAL and collect what became collectable.
        for (lfsn, n) in sweeps {
            shared.wal.sweep(lfsn, n);
        }
        let _ = shared.wal.gc();
        shared.wake();
        Ok(())
    }

    /// Swaps the old node for the sealed replacements under the store
    /// lock, redistributing any records written to the old node's `i0`
    /// while the rebuild ran.
    fn publish_rebuild(
        &self,
        shared: &Arc<RepoShared>,
        node: &Arc<Node>,
        sealed: Vec<SealedNode>,
    ) -> Result<(Arc<Node>, Vec<Arc<Node>>), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");

        let tree_key = inner
            .nodes
            .iter()
            .find(|(_, n)| Arc::ptr_eq(n, node))
            .map(|(k, _)| k.clone())
            .ok_or_else(|| {
                StoreError::InvalidState(format!("node {} vanished from the tree", node.id))
            })?;

        let mut new_nodes = Vec::with_capacity(sealed.len().max(1));
        if sealed.is_empty() {
            // Everything was dropped. The store keeps covering the range:
            // either neighbors absorb it, or a bootstrap node is born.
            inner.nodes.remove(&tree_key);
            if inner.nodes.is_empty() {
                let fresh = Arc::new(Node::create_initial(
                    &self.dir,
                    shared.seq.next_nsn(),
                    shared.cfg.sync_on_seal,
                )?);
                inner.nodes.insert(Vec::new(), Arc::clone(&fresh));
                new_nodes.push(fresh);
            } else if inner.nodes.keys().next().map(|k| !k.is_empty()) == Some(true) {
                // The removed node anchored the keyspace; rekey the new
                // lowest node to the sentinel.
                let (first_key, first_node) = inner
                    .nodes
                    .iter()
                    .next()
                    .map(|(k, n)| (k.clone(), Arc::clone(n)))
                    .expect("non-empty tree has a first node");
                inner.nodes.remove(&first_key);
                inner.nodes.insert(Vec::new(), first_node);
            }
        } else {
            inner.nodes.remove(&tree_key);
            for (i, s) in sealed.into_iter().enumerate() {
                let opened = Arc::new(Node::open(&s.path, s.id, node.id)?);
                let key = if i == 0 {
                    tree_key.clone()
                } else {
                    node_range_start(&self.scheme, &opened)?
                };
                inner.nodes.insert(key, Arc::clone(&opened));
                new_nodes.push(opened);
            }
        }

        // Redistribute writes that landed in the old i0 during the build.
        let late = {
            let mut ni = node.inner.write().expect("node lock poisoned");
            let late = std::mem::take(&mut ni.i0);
            ni.i1 = crate::memindex::MemIndex::new();
            late
        };
        for (key, chain) in late.snapshot() {
            let target = find_node(&inner.nodes, &key);
            let mut ti = target.inner.write().expect("node lock poisoned");
            for vr in chain.versions().iter().rev() {
                ti.i0.insert(key.clone(), vr.clone());
            }
        }

        let old_arc = Arc::clone(node);
        info!(
            store = %self.name,
            old = node.id,
            new = new_nodes.len(),
            "node rebuild published"
        );
        Ok((old_arc, new_nodes))
    }

    /// Renames the replaced file to `.gc` and either unlinks it now or
    /// parks it on the delayed-delete list until its last reader leaves.
    fn retire_node(&self, old: Arc<Node>) -> Result<(), StoreError> {
        let gc = gc_path(&self.dir, old.id);
        old.rename_to(&gc)?;
        let mut inner = self.inner.write().expect("store lock poisoned");
        // Two references: ours and the caller's stack frame dropping soon.
        if Arc::strong_count(&old) <= 2 {
            drop(inner);
            fs::remove_file(&gc)?;
            debug!(id = old.id, "replaced node unlinked immediately");
        } else {
            inner.delayed.push(old);
        }
        Ok(())
    }
}

/// Store statistics snapshot.
#[derive(Debug)]
pub struct StoreStats {
    /// Live nodes.
    pub nodes: usize,
    /// On-disk pages.
    pub pages: usize,
    /// Records in on-disk pages.
    pub disk_keys: u64,
    /// Bytes pending in the in-memory deltas.
    pub pending_bytes: usize,
    /// Active transactions.
    pub active_transactions: usize,
}

// ------------------------------------------------------------------------------------------------
// Transaction handle
// ------------------------------------------------------------------------------------------------

/// A transaction bound to one store.
///
/// Dropping an unfinished transaction rolls it back.
pub struct Transaction {
    store: Arc<Store>,
    tsn: u64,
    done: bool,
}

impl Transaction {
    /// Inserts or replaces a record.
    pub fn set(&self, values: &[&[u8]]) -> Result<(), StoreError> {
        let rec = Record::build(&self.store.scheme, values, flags::NONE, 0)?;
        self.set_record(rec)
    }

    /// Installs an upsert operand.
    pub fn upsert(&self, values: &[&[u8]]) -> Result<(), StoreError> {
        if self.store.upsert_fn().is_none() {
            return Err(StoreError::InvalidState(
                "no upsert function bound to this store".into(),
            ));
        }
        let rec = Record::build(&self.store.scheme, values, flags::UPSERT, 0)?;
        self.set_record(rec)
    }

    /// Deletes a key.
    pub fn delete(&self, key_values: &[&[u8]]) -> Result<(), StoreError> {
        let mut rec = self.store.scheme.key_record(key_values)?;
        rec.set_flags(flags::DELETE);
        self.set_record(rec)
    }

    fn set_record(&self, rec: Record) -> Result<(), StoreError> {
        self.store.shared()?.ensure_online()?;
        let ik = self.store.scheme.index_key(&rec);
        Ok(self.store.mvcc.set(self.tsn, ik, rec)?)
    }

    /// Reads a key at this transaction's snapshot, seeing its own
    /// uncommitted writes.
    pub fn get(&self, key_values: &[&[u8]]) -> Result<Option<Row>, StoreError> {
        let vlsn = self.store.mvcc.tx_vlsn(self.tsn)?;
        self.store.read_key(key_values, vlsn, Some(self.tsn))
    }

    /// Commits. Conflicts surface as [`CommitOutcome`] values; `Lock`
    /// hands the transaction back for a retry.
    pub fn commit(mut self) -> Result<CommitOutcome, StoreError> {
        self.store.shared()?.ensure_online()?;
        match self.store.mvcc.prepare(self.tsn)? {
            Decision::Lock => {
                if self.store.mvcc.is_deadlocked(self.tsn) {
                    self.store.mvcc.rollback(self.tsn)?;
                    self.done = true;
                    return Ok(CommitOutcome::Rollback);
                }
                return Ok(CommitOutcome::Lock(self));
            }
            Decision::Rollback => {
                self.store.mvcc.rollback(self.tsn)?;
                self.done = true;
                return Ok(CommitOutcome::Rollback);
            }
            Decision::Prepare => {}
        }

        // CSN assignment and WAL append share the commit critical
        // section, so WAL order is commit order.
        let shared = self.store.shared()?;
        let _commit = self
            .store
            .commit_lock
            .lock()
            .expect("commit lock poisoned");
        let (_csn, writes) = self.store.mvcc.commit(self.tsn)?;
        self.done = true;
        if !writes.is_empty() {
            self.store.append_and_install(&shared, writes)?;
        }
        Ok(CommitOutcome::Committed)
    }

    /// Rolls the transaction back.
    pub fn rollback(mut self) -> Result<(), StoreError> {
        self.store.mvcc.rollback(self.tsn)?;
        self.done = true;
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.store.mvcc.rollback(self.tsn);
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Cursor
// ------------------------------------------------------------------------------------------------

/// A snapshot range cursor.
///
/// Scans node by node in the configured order; each node's visible rows
/// are materialized while the node lock is held briefly, then yielded
/// without locks.
pub struct Cursor {
    store: Arc<Store>,
    order: Order,
    vlsn: u64,
    probe: Option<Record>,
    start_ik: Option<Vec<u8>>,
    next_node_key: Option<Vec<u8>>,
    buffer: std::collections::VecDeque<MergeEntry>,
    last_ik: Option<Vec<u8>>,
}

impl Cursor {
    /// Materializes the next node's visible rows into the buffer.
    fn fill(&mut self) -> Result<bool, StoreError> {
        let Some(node_key) = self.next_node_key.take() else {
            return Ok(false);
        };

        let (node, merged) = {
            let inner = self.store.inner.read().expect("store lock poisoned");
            // The tree may have changed under us (a split); fall back to
            // the node now covering this range start.
            let node = inner
                .nodes
                .get(&node_key)
                .cloned()
                .unwrap_or_else(|| Arc::clone(find_node(&inner.nodes, &node_key)));

            // Advance the node walk before releasing the store lock.
            self.next_node_key = match self.order.direction() {
                Direction::Asc => inner
                    .nodes
                    .range((Bound::Excluded(node_key.clone()), Bound::Unbounded))
                    .next()
                    .map(|(k, _)| k.clone()),
                Direction::Desc => inner
                    .nodes
                    .range((Bound::Unbounded, Bound::Excluded(node_key.clone())))
                    .next_back()
                    .map(|(k, _)| k.clone()),
            };

            // Fold i0 and i1 into one index so a key's versions form a
            // single LSN-descending chain regardless of direction.
            let ni = node.inner.read().expect("node lock poisoned");
            let mut merged = crate::memindex::MemIndex::new();
            for idx in [&ni.i0, &ni.i1] {
                for (key, chain) in idx.iter_from(None) {
                    for vr in chain.versions() {
                        merged.insert(key.clone(), vr.clone());
                    }
                }
            }
            drop(ni);
            (node, merged)
        };

        let dir = self.order.direction();
        let mut snapshot = merged.snapshot();
        if dir == Direction::Desc {
            snapshot.reverse();
        }

        let sources: Vec<SourceIter<'_>> = vec![
            snapshot_source(&snapshot),
            node_source(&node, &self.store.scheme, dir, self.probe.as_ref())?,
        ];
        let merge = MergeIterator::new(sources, dir)?;
        let reader = ReadIter::new(merge, &self.store.scheme, self.vlsn, self.store.upsert_fn());

        for entry in reader {
            let entry = entry?;
            if !self.in_range(&entry.key) {
                continue;
            }
            self.buffer.push_back(entry);
        }
        Ok(true)
    }

    /// Bound and duplicate filtering across node boundaries.
    fn in_range(&self, ik: &[u8]) -> bool {
        if let Some(start) = &self.start_ik {
            let ok = match self.order {
                Order::Gt => ik > start.as_slice(),
                Order::Gte => ik >= start.as_slice(),
                Order::Lt => ik < start.as_slice(),
                Order::Lte => ik <= start.as_slice(),
            };
            if !ok {
                return false;
            }
        }
        match (&self.last_ik, self.order.direction()) {
            (Some(last), Direction::Asc) => ik > last.as_slice(),
            (Some(last), Direction::Desc) => ik < last.as_slice(),
            (None, _) => true,
        }
    }
}

impl Iterator for Cursor {
    type Item = Result<Row, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.buffer.pop_front() {
                self.last_ik = Some(entry.key.clone());
                return Some(Ok(Row {
                    rec: entry.rec,
                    scheme: Arc::clone(&self.store.scheme),
                }));
            }
            match self.fill() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Node-tree helpers
// ------------------------------------------------------------------------------------------------

/// The node covering `ik`: the greatest range start at or below it.
fn find_node<'t>(nodes: &'t BTreeMap<Vec<u8>, Arc<Node>>, ik: &[u8]) -> &'t Arc<Node> {
    nodes
        .range::<[u8], _>((Bound::Unbounded, Bound::Included(ik)))
        .next_back()
        .map(|(_, n)| n)
        .or_else(|| nodes.values().next())
        .expect("store has no nodes")
}

fn node_key_for(nodes: &BTreeMap<Vec<u8>, Arc<Node>>, ik: &[u8]) -> Vec<u8> {
    nodes
        .range::<[u8], _>((Bound::Unbounded, Bound::Included(ik)))
        .next_back()
        .map(|(k, _)| k.clone())
        .unwrap_or_default()
}

/// A node's range-start key: the index key of its lowest record.
fn node_range_start(scheme: &Scheme, node: &Node) -> Result<Vec<u8>, StoreError> {
    match node.index.entries.first() {
        Some(entry) => {
            let rec = Record::from_bytes(scheme, entry.min_key.clone())?;
            Ok(scheme.index_key(&rec))
        }
        None => Ok(Vec::new()),
    }
}

// ------------------------------------------------------------------------------------------------
// Scheme file I/O
// ------------------------------------------------------------------------------------------------

/// Writes the store's scheme file:
/// `[storage version][store_id][payload len][payload][crc32]`.
fn write_scheme_file(dir: &Path, store_id: u32, scheme: &Scheme) -> Result<(), StoreError> {
    let payload = scheme.encode()?;
    let mut bytes = Vec::with_capacity(StorageVersion::SIZE + 8 + payload.len() + 4);
    bytes.extend_from_slice(&StorageVersion::CURRENT.encode());
    bytes.extend_from_slice(&store_id.to_le_bytes());
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&payload);
    let mut h = Crc32::new();
    h.update(&bytes);
    let crc = h.finalize();
    bytes.extend_from_slice(&crc.to_le_bytes());

    let path = dir.join(SCHEME_FILE);
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Reads and validates a scheme file written by [`write_scheme_file`].
fn read_scheme_file(dir: &Path) -> Result<(u32, Scheme), StoreError> {
    let path = dir.join(SCHEME_FILE);
    let mut bytes = Vec::new();
    File::open(&path)?.read_to_end(&mut bytes)?;
    if bytes.len() < StorageVersion::SIZE + 8 + 4 {
        return Err(StoreError::SchemeMismatch(format!(
            "scheme file {} is truncated",
            path.display()
        )));
    }

    let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let mut h = Crc32::new();
    h.update(body);
    if h.finalize() != u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]])
    {
        return Err(StoreError::SchemeMismatch(format!(
            "scheme file {} failed its checksum",
            path.display()
        )));
    }

    let version = StorageVersion::decode(&body[..StorageVersion::SIZE])
        .filter(StorageVersion::compatible)
        .ok_or_else(|| {
            StoreError::SchemeMismatch(format!(
                "scheme file {} has an incompatible storage version",
                path.display()
            ))
        })?;
    let _ = version;

    let store_id = u32::from_le_bytes([
        body[StorageVersion::SIZE],
        body[StorageVersion::SIZE + 1],
        body[StorageVersion::SIZE + 2],
        body[StorageVersion::SIZE + 3],
    ]);
    let len = u32::from_le_bytes([
        body[StorageVersion::SIZE + 4],
        body[StorageVersion::SIZE + 5],
        body[StorageVersion::SIZE + 6],
        body[StorageVersion::SIZE + 7],
    ]) as usize;
    let payload = &body[StorageVersion::SIZE + 8..];
    if payload.len() != len {
        return Err(StoreError::SchemeMismatch(format!(
            "scheme file {} payload length mismatch",
            path.display()
        )));
    }
    let scheme = Scheme::decode(payload)?;
    Ok((store_id, scheme))
}
