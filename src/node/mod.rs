//! Range-partitioned on-disk nodes.
//!
//! A node is one file holding sorted pages plus the trailing page index
//! (see [`crate::page`]), together with the node's in-memory delta: two
//! [`MemIndex`]es, `i0` taking live writes and `i1` holding a rotated-out
//! delta while a compaction drains it.
//!
//! ## File naming
//!
//! ```text
//! {nsn:020}.db                         live node
//! {parent:020}.{nsn:020}.db.seal       written + synced, not yet published
//! {parent:020}.{nsn:020}.db.incomplete rebuild in progress
//! {nsn:020}.db.gc                      deferred deletion
//! ```
//!
//! The suffix protocol is what makes compaction crash-atomic; recovery
//! disambiguates interrupted rebuilds purely from these names.
//!
//! ## Reading
//!
//! Node files are immutable once published, so reads go through a shared
//! `mmap` without locking. A reader who opened a node never observes the
//! file mutated; replacement happens by publishing new files and swapping
//! under the store lock.

#[cfg(test)]
mod tests;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, trace};

use crate::memindex::MemIndex;
use crate::page::{BuiltPage, IndexHeader, Page, PageError, PageIndex, PageIndexBuilder};
use crate::record::{Record, RecordError, Scheme, flags};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by node I/O and scans.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Page or trailer parsing / checksum failure.
    #[error("page error: {0}")]
    Page(#[from] PageError),

    /// Record-level failure.
    #[error("record error: {0}")]
    Record(#[from] RecordError),

    /// Structurally invalid node file.
    #[error("malformed node file: {0}")]
    Malformed(String),
}

// ------------------------------------------------------------------------------------------------
// File naming
// ------------------------------------------------------------------------------------------------

/// Classification of a node-related file inside a store directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFile {
    /// `{id}.db` — live node.
    Db {
        /// Node sequence number.
        id: u64,
    },
    /// `{parent}.{id}.db.seal` — complete but unpublished rebuild output.
    Seal {
        /// Node being rebuilt.
        parent: u64,
        /// Replacement node.
        id: u64,
    },
    /// `{parent}.{id}.db.incomplete` — rebuild output interrupted mid-write.
    Incomplete {
        /// Node being rebuilt.
        parent: u64,
        /// Replacement node.
        id: u64,
    },
    /// `{id}.db.gc` — deferred deletion that survived a crash.
    Gc {
        /// Node sequence number.
        id: u64,
    },
}

/// Path of a live node file.
pub fn db_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id:020}.db"))
}

/// Path of a sealed rebuild output.
pub fn seal_path(dir: &Path, parent: u64, id: u64) -> PathBuf {
    dir.join(format!("{parent:020}.{id:020}.db.seal"))
}

/// Path of an in-progress rebuild output.
pub fn incomplete_path(dir: &Path, parent: u64, id: u64) -> PathBuf {
    dir.join(format!("{parent:020}.{id:020}.db.incomplete"))
}

/// Path of a deferred-deletion marker.
pub fn gc_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id:020}.db.gc"))
}

/// Parses a store-directory file name into its node-file kind.
pub fn parse_file_name(name: &str) -> Option<NodeFile> {
    if let Some(stem) = name.strip_suffix(".db.gc") {
        return stem.parse().ok().map(|id| NodeFile::Gc { id });
    }
    if let Some(stem) = name.strip_suffix(".db.seal") {
        let (parent, id) = split_pair(stem)?;
        return Some(NodeFile::Seal { parent, id });
    }
    if let Some(stem) = name.strip_suffix(".db.incomplete") {
        let (parent, id) = split_pair(stem)?;
        return Some(NodeFile::Incomplete { parent, id });
    }
    if let Some(stem) = name.strip_suffix(".db") {
        return stem.parse().ok().map(|id| NodeFile::Db { id });
    }
    None
}

fn split_pair(stem: &str) -> Option<(u64, u64)> {
    let (a, b) = stem.split_once('.')?;
    Some((a.parse().ok()?, b.parse().ok()?))
}

// ------------------------------------------------------------------------------------------------
// Node
// ------------------------------------------------------------------------------------------------

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Serving reads and writes.
    Live,
    /// A rebuild task owns the node; the planner must skip it.
    Locked,
}

/// Mutable node state, guarded by the node lock.
#[derive(Debug)]
pub struct NodeInner {
    /// Primary in-memory delta, taking live writes.
    pub i0: MemIndex,
    /// Shadow delta drained by an in-flight rebuild.
    pub i1: MemIndex,
    /// Lifecycle state.
    pub state: NodeState,
    /// Last backup sequence number that captured this node.
    pub backup_bsn: u64,
}

/// One on-disk node plus its in-memory delta.
#[derive(Debug)]
pub struct Node {
    /// Node sequence number.
    pub id: u64,
    /// Parent node id; non-zero only while the file carries a seal name.
    pub id_parent: u64,
    /// Page index loaded at open.
    pub index: PageIndex,
    /// Mutable delta and lifecycle state.
    pub inner: RwLock<NodeInner>,
    path: Mutex<PathBuf>,
    mmap: Mmap,
}

impl Node {
    /// Opens a node file: reads and validates the trailer, loads the page
    /// index, and maps the body.
    pub fn open(path: &Path, id: u64, id_parent: u64) -> Result<Node, NodeError> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < IndexHeader::SIZE as u64 {
            return Err(NodeError::Malformed(format!(
                "{} is {len} bytes, shorter than the index header",
                path.display()
            )));
        }

        file.seek(SeekFrom::End(-(IndexHeader::SIZE as i64)))?;
        let mut trailer = [0u8; IndexHeader::SIZE];
        file.read_exact(&mut trailer)?;
        let header = IndexHeader::decode(&trailer)?;

        let mmap = unsafe { Mmap::map(&file)? };
        let start = header.offset as usize;
        let end = start + header.size as usize;
        if end > mmap.len() {
            return Err(NodeError::Malformed(format!(
                "page index {start}..{end} beyond file of {} bytes",
                mmap.len()
            )));
        }
        let index = PageIndex::parse(header, &mmap[start..end])?;

        debug!(
            id,
            pages = index.count(),
            keys = index.header.keys,
            path = %path.display(),
            "node opened"
        );

        Ok(Node {
            id,
            id_parent,
            index,
            inner: RwLock::new(NodeInner {
                i0: MemIndex::new(),
                i1: MemIndex::new(),
                state: NodeState::Live,
                backup_bsn: 0,
            }),
            path: Mutex::new(path.to_path_buf()),
            mmap,
        })
    }

    /// Creates and opens an empty bootstrap node at `{id}.db`.
    ///
    /// Every store holds at least one node; this is the node a fresh store
    /// (or a rebuild that dropped everything) starts from.
    pub fn create_initial(dir: &Path, id: u64, sync: bool) -> Result<Node, NodeError> {
        let path = db_path(dir, id);
        let builder = PageIndexBuilder::new();
        let (trailer, _) = builder.finish(0, 0);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(&trailer)?;
        if sync {
            file.sync_all()?;
        }
        drop(file);
        Self::open(&path, id, 0)
    }

    /// Current file path.
    pub fn path(&self) -> PathBuf {
        self.path.lock().expect("node path lock poisoned").clone()
    }

    /// Renames the backing file (seal promotion, gc marking).
    pub fn rename_to(&self, new_path: &Path) -> Result<(), NodeError> {
        let mut guard = self.path.lock().expect("node path lock poisoned");
        fs::rename(&*guard, new_path)?;
        *guard = new_path.to_path_buf();
        Ok(())
    }

    /// Bytes currently pending in the in-memory delta (i0 + i1).
    pub fn used(&self) -> usize {
        let inner = self.inner.read().expect("node lock poisoned");
        inner.i0.used() + inner.i1.used()
    }

    /// Parses page `i` out of the mapped file.
    pub fn page(&self, scheme: &Scheme, i: usize) -> Result<Page<'_>, NodeError> {
        let entry = self
            .index
            .entries
            .get(i)
            .ok_or_else(|| NodeError::Malformed(format!("page {i} out of range")))?;
        let start = entry.offset as usize;
        let end = start + entry.size as usize;
        if end > self.mmap.len() {
            return Err(NodeError::Malformed(format!(
                "page {i} spans {start}..{end} beyond file of {} bytes",
                self.mmap.len()
            )));
        }
        Ok(Page::parse(scheme, &self.mmap[start..end])?)
    }

    /// Collects every on-disk version of the probe's key, newest first.
    pub fn chain_for(&self, scheme: &Scheme, probe: &Record) -> Result<Vec<Record>, NodeError> {
        let mut out = Vec::new();
        let first = self.index.lower_bound(scheme, probe)?;
        for pi in first..self.index.count() {
            let min = Record::from_bytes(scheme, self.index.entries[pi].min_key.clone())?;
            if scheme.compare(&min, probe) == std::cmp::Ordering::Greater {
                break;
            }
            let page = self.page(scheme, pi)?;
            let lo = page.lower_bound(scheme, probe)?;
            let hi = page.upper_bound(scheme, probe)?;
            for i in lo..hi {
                out.push(page.rec(scheme, i)?);
            }
        }
        trace!(id = self.id, versions = out.len(), "node point lookup");
        Ok(out)
    }

    /// Streaming scan over the node's pages.
    pub fn scan<'n>(
        &'n self,
        scheme: &'n Scheme,
        dir: Direction,
        start: Option<&Record>,
    ) -> Result<NodeScan<'n>, NodeError> {
        NodeScan::new(self, scheme, dir, start)
    }
}

/// Scan direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Ascending key order.
    Asc,
    /// Descending key order; version chains still come out newest-first.
    Desc,
}

// ------------------------------------------------------------------------------------------------
// NodeScan
// ------------------------------------------------------------------------------------------------

/// Record emitted by a node scan: the order-preserving index key, the
/// decoded record, and whether it is a non-head chain position.
pub type ScanItem = (Vec<u8>, Record, bool);

/// Streaming iterator over a node's pages.
///
/// Within a page, equal-key runs are located by the `DUP` flag (run heads
/// have it clear). Descending scans walk runs in reverse while emitting
/// each run's versions in stored (LSN-descending) order, so consumers see
/// chains newest-first regardless of direction.
pub struct NodeScan<'n> {
    node: &'n Node,
    scheme: &'n Scheme,
    dir: Direction,
    /// Current page position.
    page_idx: isize,
    /// Parsed view of the current page, held until exhausted.
    page: Option<Page<'n>>,
    /// Record cursor inside the current page (ascending scans).
    asc_pos: usize,
    /// Pending `(next, end)` run windows, back-to-front (descending scans).
    desc_runs: Vec<(usize, usize)>,
    page_count: usize,
    /// Start bound, consumed when the first page is entered.
    start_probe: Option<Record>,
}

impl<'n> NodeScan<'n> {
    fn new(
        node: &'n Node,
        scheme: &'n Scheme,
        dir: Direction,
        start: Option<&Record>,
    ) -> Result<Self, NodeError> {
        let page_idx = match (dir, start) {
            (Direction::Asc, None) => 0isize,
            (Direction::Asc, Some(probe)) => node.index.lower_bound(scheme, probe)? as isize,
            (Direction::Desc, None) => node.index.count() as isize - 1,
            (Direction::Desc, Some(probe)) => node.index.upper_bound(scheme, probe)? as isize - 1,
        };
        Ok(Self {
            node,
            scheme,
            dir,
            page_idx,
            page: None,
            asc_pos: 0,
            desc_runs: Vec::new(),
            page_count: node.index.count(),
            start_probe: start.cloned(),
        })
    }

    /// Parses the current page and positions the record cursor. Returns
    /// `false` when the scan is exhausted.
    fn enter_page(&mut self) -> Result<bool, NodeError> {
        if self.page_idx < 0 || self.page_idx as usize >= self.page_count {
            return Ok(false);
        }
        let page = self.node.page(self.scheme, self.page_idx as usize)?;
        let probe = self.start_probe.take();
        match self.dir {
            Direction::Asc => {
                self.asc_pos = match &probe {
                    Some(p) => page.lower_bound(self.scheme, p)?,
                    None => 0,
                };
            }
            Direction::Desc => {
                // Runs cannot straddle the bound: equal keys are contiguous
                // and upper_bound lands past the whole run.
                let limit = match &probe {
                    Some(p) => page.upper_bound(self.scheme, p)?,
                    None => page.count(),
                };
                let mut heads = Vec::new();
                for i in 0..limit {
                    let bytes = page.rec_bytes(i)?;
                    if bytes[0] & flags::DUP == 0 {
                        heads.push(i);
                    }
                }
                self.desc_runs.clear();
                for (hi, &head) in heads.iter().enumerate() {
                    let end = heads.get(hi + 1).copied().unwrap_or(limit);
                    self.desc_runs.push((head, end));
                }
            }
        }
        self.page = Some(page);
        Ok(true)
    }

    fn emit(&self, i: usize) -> Result<ScanItem, NodeError> {
        let page = self
            .page
            .as_ref()
            .ok_or_else(|| NodeError::Malformed("scan has no current page".into()))?;
        let rec = page.rec(self.scheme, i)?;
        let dup = rec.has_flag(flags::DUP);
        Ok((self.scheme.index_key(&rec), rec, dup))
    }
}

impl Iterator for NodeScan<'_> {
    type Item = Result<ScanItem, NodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.page.is_none() {
                match self.enter_page() {
                    Ok(true) => {}
                    Ok(false) => return None,
                    Err(e) => return Some(Err(e)),
                }
            }
            match self.dir {
                Direction::Asc => {
                    let count = self.page.as_ref().map(|p| p.count()).unwrap_or(0);
                    if self.asc_pos < count {
                        let i = self.asc_pos;
                        self.asc_pos += 1;
                        return Some(self.emit(i));
                    }
                    self.page = None;
                    self.page_idx += 1;
                }
                Direction::Desc => {
                    if let Some(&(next, end)) = self.desc_runs.last() {
                        if next < end {
                            let last = self.desc_runs.len() - 1;
                            self.desc_runs[last] = (next + 1, end);
                            return Some(self.emit(next));
                        }
                        self.desc_runs.pop();
                        continue;
                    }
                    self.page = None;
                    self.page_idx -= 1;
                }
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// NodeWriter
// ------------------------------------------------------------------------------------------------

/// Writes a replacement node file through the `.incomplete` → `.seal`
/// protocol.
///
/// Dropping an unsealed writer removes the `.incomplete` file, so any
/// failure path during a rebuild cleans up after itself.
pub struct NodeWriter {
    file: Option<File>,
    path: PathBuf,
    dir: PathBuf,
    parent: u64,
    id: u64,
    index: PageIndexBuilder,
    offset: u64,
    sealed: bool,
}

impl NodeWriter {
    /// Creates `{parent}.{id}.db.incomplete` in `dir`.
    pub fn create(dir: &Path, parent: u64, id: u64) -> Result<NodeWriter, NodeError> {
        let path = incomplete_path(dir, parent, id);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(NodeWriter {
            file: Some(file),
            path,
            dir: dir.to_path_buf(),
            parent,
            id,
            index: PageIndexBuilder::new(),
            offset: 0,
            sealed: false,
        })
    }

    /// Appends one finished page.
    pub fn add_page(&mut self, page: BuiltPage) -> Result<(), NodeError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| NodeError::Malformed("writer already sealed".into()))?;
        file.write_all(&page.bytes)?;
        self.index.add(&page, self.offset);
        self.offset += page.bytes.len() as u64;
        Ok(())
    }

    /// Allocated node sequence number.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Pages written so far.
    pub fn page_count(&self) -> usize {
        self.index.count()
    }

    /// Stored page bytes written so far.
    pub fn total(&self) -> u64 {
        self.index.total()
    }

    /// Writes the trailer, optionally fsyncs, and renames to `.seal`.
    ///
    /// Returns the seal path and the in-memory page index for the node
    /// that will be opened from it.
    pub fn seal(mut self, align: u16, sync: bool) -> Result<(PathBuf, PageIndex), NodeError> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| NodeError::Malformed("writer already sealed".into()))?;
        let (trailer, index) = std::mem::take(&mut self.index).finish(self.offset, align);
        file.write_all(&trailer)?;
        if sync {
            file.sync_all()?;
        }
        drop(file);

        let sealed = seal_path(&self.dir, self.parent, self.id);
        fs::rename(&self.path, &sealed)?;
        self.sealed = true;
        debug!(
            parent = self.parent,
            id = self.id,
            pages = index.count(),
            path = %sealed.display(),
            "node sealed"
        );
        Ok((sealed, index))
    }
}

impl Drop for NodeWriter {
    fn drop(&mut self) {
        if !self.sealed {
            let _ = fs::remove_file(&self.path);
        }
    }
}
