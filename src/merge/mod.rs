//! Merge iterators — ordered N-way merge, read-time visibility filtering,
//! and the compaction output stream.
//!
//! Three layers build on each other:
//!
//! - [`MergeIterator`] — heap-based k-way merge over sorted sources
//!   (in-memory indexes, node page scans, a transaction's pending writes).
//!   Emits entries in `(key, LSN descending)` order for the configured
//!   direction and marks every non-extremum output as a duplicate of the
//!   winning key.
//! - [`ReadIter`] — wraps a merge and applies snapshot visibility: skips
//!   versions above the snapshot LSN, folds upsert chains through the
//!   user merge function, and drops tombstoned keys. Yields at most one
//!   record per key.
//! - [`WriteIter`] — wraps a merge for compaction: drops tombstones and
//!   superseded versions below the visible-LSN floor, keeps newer versions
//!   verbatim for active readers, materializes upsert folds, applies
//!   expiration, and signals page / node boundaries to the rebuild loop.
//!
//! Boundary signals fire between version chains, never inside one, so a
//! key's versions always land in a single page run and a single node.

#[cfg(test)]
mod tests;

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;

use thiserror::Error;

use crate::memindex::MemIndex;
use crate::node::{Direction, Node, NodeError};
use crate::record::{Record, RecordError, Scheme, flags};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced while merging record streams.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Failure reading a node source.
    #[error("node error: {0}")]
    Node(#[from] NodeError),

    /// Record-level failure.
    #[error("record error: {0}")]
    Record(#[from] RecordError),

    /// The user upsert function reported a failure.
    #[error("upsert function failed: {0}")]
    Upsert(String),
}

// ------------------------------------------------------------------------------------------------
// Shared types
// ------------------------------------------------------------------------------------------------

/// Cursor ordering for range queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Keys strictly greater than the probe, ascending.
    Gt,
    /// Keys greater than or equal to the probe, ascending.
    Gte,
    /// Keys strictly less than the probe, descending.
    Lt,
    /// Keys less than or equal to the probe, descending.
    Lte,
}

impl Order {
    /// Scan direction implied by the ordering.
    pub fn direction(self) -> Direction {
        match self {
            Order::Gt | Order::Gte => Direction::Asc,
            Order::Lt | Order::Lte => Direction::Desc,
        }
    }

    /// True when a key equal to the probe must be skipped.
    pub fn exclusive(self) -> bool {
        matches!(self, Order::Gt | Order::Lt)
    }
}

/// The user-supplied merge function for `UPSERT` records.
///
/// Called with the accumulated base (`None` when the chain has no base
/// value) and the next upsert operand, oldest operand first; returns the
/// merged record.
pub type UpsertFn =
    Arc<dyn Fn(&Scheme, Option<&Record>, &Record) -> Result<Record, String> + Send + Sync>;

/// One record flowing through a merge.
#[derive(Debug, Clone)]
pub struct MergeEntry {
    /// Order-preserving index key.
    pub key: Vec<u8>,
    /// The record.
    pub rec: Arc<Record>,
    /// WAL file back-link (zero for on-disk records).
    pub lfsn: u64,
    /// Non-head position within the merged version chain.
    pub dup: bool,
}

/// A sorted source feeding a merge.
pub type SourceIter<'a> = Box<dyn Iterator<Item = Result<MergeEntry, MergeError>> + 'a>;

/// Source over an in-memory index.
pub fn mem_source<'a>(
    idx: &'a MemIndex,
    dir: Direction,
    start: Option<&[u8]>,
) -> SourceIter<'a> {
    let start = start.map(<[u8]>::to_vec);
    let chains: Box<dyn Iterator<Item = (&'a Vec<u8>, &'a crate::memindex::VersionChain)> + 'a> =
        match dir {
            Direction::Asc => Box::new(idx.iter_from(start)),
            Direction::Desc => Box::new(idx.iter_from_rev(start)),
        };
    Box::new(chains.flat_map(|(key, chain)| {
        chain.versions().iter().enumerate().map(move |(i, vr)| {
            Ok(MergeEntry {
                key: key.clone(),
                rec: Arc::clone(&vr.rec),
                lfsn: vr.lfsn,
                dup: i > 0,
            })
        })
    }))
}

/// Source over a snapshot taken from an in-memory index (owned chains).
pub fn snapshot_source<'a>(
    snapshot: &'a [(Vec<u8>, crate::memindex::VersionChain)],
) -> SourceIter<'a> {
    Box::new(snapshot.iter().flat_map(|(key, chain)| {
        chain.versions().iter().enumerate().map(move |(i, vr)| {
            Ok(MergeEntry {
                key: key.clone(),
                rec: Arc::clone(&vr.rec),
                lfsn: vr.lfsn,
                dup: i > 0,
            })
        })
    }))
}

/// Source over a node's pages.
pub fn node_source<'a>(
    node: &'a Node,
    scheme: &'a Scheme,
    dir: Direction,
    start: Option<&Record>,
) -> Result<SourceIter<'a>, MergeError> {
    let scan = node.scan(scheme, dir, start)?;
    Ok(Box::new(scan.map(|item| {
        item.map(|(key, rec, dup)| MergeEntry {
            key,
            rec: Arc::new(rec),
            lfsn: 0,
            dup,
        })
        .map_err(MergeError::from)
    })))
}

// ------------------------------------------------------------------------------------------------
// MergeIterator — heap-based k-way merge
// ------------------------------------------------------------------------------------------------

struct HeapEntry {
    key: Vec<u8>,
    lsn: u64,
    src: usize,
    rec: Arc<Record>,
    lfsn: u64,
    dir: Direction,
}

impl HeapEntry {
    fn rank(&self, other: &Self) -> CmpOrdering {
        let key_ord = match self.dir {
            Direction::Asc => self.key.cmp(&other.key),
            Direction::Desc => other.key.cmp(&self.key),
        };
        key_ord
            .then_with(|| other.lsn.cmp(&self.lsn))
            .then_with(|| self.src.cmp(&other.src))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Min-heap: reverse so the extremum pops first.
        self.rank(other).reverse()
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.lsn == other.lsn && self.src == other.src
    }
}

impl Eq for HeapEntry {}

/// Heap-based merge over N sorted sources.
///
/// Ties on `(key, LSN)` across sources are broken by source index, so
/// callers list higher-priority sources first (pending transaction writes,
/// then `i0`, `i1`, then pages).
pub struct MergeIterator<'a> {
    sources: Vec<SourceIter<'a>>,
    heap: BinaryHeap<HeapEntry>,
    dir: Direction,
    last_key: Option<Vec<u8>>,
    failed: bool,
}

impl<'a> MergeIterator<'a> {
    /// Builds the merge, priming one entry per source.
    pub fn new(mut sources: Vec<SourceIter<'a>>, dir: Direction) -> Result<Self, MergeError> {
        let mut heap = BinaryHeap::new();
        for (idx, source) in sources.iter_mut().enumerate() {
            if let Some(first) = source.next() {
                let entry = first?;
                heap.push(HeapEntry {
                    key: entry.key,
                    lsn: entry.rec.lsn(),
                    src: idx,
                    rec: entry.rec,
                    lfsn: entry.lfsn,
                    dir,
                });
            }
        }
        Ok(Self {
            sources,
            heap,
            dir,
            last_key: None,
            failed: false,
        })
    }
}

impl Iterator for MergeIterator<'_> {
    type Item = Result<MergeEntry, MergeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let top = self.heap.pop()?;

        if let Some(next) = self.sources[top.src].next() {
            match next {
                Ok(entry) => self.heap.push(HeapEntry {
                    key: entry.key,
                    lsn: entry.rec.lsn(),
                    src: top.src,
                    rec: entry.rec,
                    lfsn: entry.lfsn,
                    dir: self.dir,
                }),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }

        let dup = self.last_key.as_deref() == Some(top.key.as_slice());
        if !dup {
            self.last_key = Some(top.key.clone());
        }
        Some(Ok(MergeEntry {
            key: top.key,
            rec: top.rec,
            lfsn: top.lfsn,
            dup,
        }))
    }
}

// ------------------------------------------------------------------------------------------------
// Key-group draining shared by ReadIter and WriteIter
// ------------------------------------------------------------------------------------------------

/// Pulls every entry of the next key group out of a peekable merge.
fn next_group(
    input: &mut std::iter::Peekable<MergeIterator<'_>>,
) -> Result<Option<Vec<MergeEntry>>, MergeError> {
    let first = match input.next() {
        None => return Ok(None),
        Some(entry) => entry?,
    };
    let mut group = vec![first];
    loop {
        match input.peek() {
            Some(Ok(entry)) if entry.key == group[0].key => {
                let entry = input.next().expect("peeked entry vanished")?;
                group.push(entry);
            }
            Some(Err(_)) => {
                // Surface the source failure.
                input.next().expect("peeked entry vanished")?;
                unreachable!("error entry must propagate");
            }
            _ => break,
        }
    }
    Ok(Some(group))
}

/// Folds an upsert chain starting at `group[start]`.
///
/// Accumulates `UPSERT` operands until a base version (or chain end), then
/// applies the user function oldest-operand-first. The folded record
/// carries the head operand's LSN.
fn fold_upserts(
    scheme: &Scheme,
    upsert: &UpsertFn,
    group: &[MergeEntry],
    start: usize,
) -> Result<Record, MergeError> {
    let head_lsn = group[start].rec.lsn();
    let mut operands: Vec<&MergeEntry> = Vec::new();
    let mut base: Option<Record> = None;
    for entry in &group[start..] {
        if entry.rec.has_flag(flags::UPSERT) {
            operands.push(entry);
        } else {
            if !entry.rec.has_flag(flags::DELETE) {
                base = Some((*entry.rec).clone());
            }
            break;
        }
    }

    let mut acc = base;
    for entry in operands.iter().rev() {
        let merged = upsert(scheme, acc.as_ref(), &entry.rec).map_err(MergeError::Upsert)?;
        acc = Some(merged);
    }
    let mut folded = acc.ok_or_else(|| MergeError::Upsert("fold produced no record".into()))?;
    folded.set_flags(flags::NONE);
    folded.set_lsn(head_lsn);
    Ok(folded)
}

// ------------------------------------------------------------------------------------------------
// ReadIter — snapshot visibility
// ------------------------------------------------------------------------------------------------

/// Visibility-filtering reader over a merged stream.
///
/// Yields at most one record per key: the newest version at or below the
/// snapshot LSN, with upsert chains folded and tombstoned keys dropped.
pub struct ReadIter<'a> {
    input: std::iter::Peekable<MergeIterator<'a>>,
    scheme: &'a Scheme,
    vlsn: u64,
    upsert: Option<UpsertFn>,
}

impl<'a> ReadIter<'a> {
    /// Wraps a merge with a snapshot LSN and optional upsert function.
    pub fn new(
        merge: MergeIterator<'a>,
        scheme: &'a Scheme,
        vlsn: u64,
        upsert: Option<UpsertFn>,
    ) -> Self {
        Self {
            input: merge.peekable(),
            scheme,
            vlsn,
            upsert,
        }
    }
}

impl Iterator for ReadIter<'_> {
    type Item = Result<MergeEntry, MergeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let group = match next_group(&mut self.input) {
                Ok(Some(g)) => g,
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            };

            // First version at or below the snapshot.
            let visible = group
                .iter()
                .position(|e| e.rec.lsn() <= self.vlsn && !e.rec.has_flag(flags::GET));
            let Some(pos) = visible else { continue };
            let head = &group[pos];

            if head.rec.has_flag(flags::DELETE) {
                continue;
            }

            if head.rec.has_flag(flags::UPSERT) {
                let Some(upsert) = &self.upsert else {
                    return Some(Err(MergeError::Upsert(
                        "no upsert function bound to this store".into(),
                    )));
                };
                let folded = match fold_upserts(self.scheme, upsert, &group, pos) {
                    Ok(r) => r,
                    Err(e) => return Some(Err(e)),
                };
                return Some(Ok(MergeEntry {
                    key: group[pos].key.clone(),
                    rec: Arc::new(folded),
                    lfsn: 0,
                    dup: false,
                }));
            }

            return Some(Ok(MergeEntry {
                key: head.key.clone(),
                rec: Arc::clone(&head.rec),
                lfsn: head.lfsn,
                dup: false,
            }));
        }
    }
}

// ------------------------------------------------------------------------------------------------
// WriteIter — compaction output stream
// ------------------------------------------------------------------------------------------------

/// One step of the compaction output stream.
#[derive(Debug)]
pub enum WriteStep {
    /// The next record, with its duplicate mark and WAL back-link.
    Rec(MergeEntry),
    /// Accumulated bytes crossed the page size: finalize the current page.
    EndPage,
    /// Accumulated bytes crossed the node size: finalize the current node.
    EndNode,
}

/// Parameters of a compaction output stream.
#[derive(Debug, Clone)]
pub struct WriteParams {
    /// Visible-LSN floor: versions at or below it are collapsed to one.
    pub vlsn: u64,
    /// Current wall-clock seconds, for expiration.
    pub now: u32,
    /// Drop records older than this many seconds; zero disables.
    pub expire_period: u32,
    /// Target uncompressed page size in bytes.
    pub page_size: usize,
    /// Target node size in bytes (split point).
    pub node_size: u64,
}

/// Compaction stream: filters a merged stream down to what the rebuilt
/// node(s) must retain and signals page / node boundaries.
pub struct WriteIter<'a> {
    input: std::iter::Peekable<MergeIterator<'a>>,
    scheme: &'a Scheme,
    params: WriteParams,
    upsert: Option<UpsertFn>,
    pending: VecDeque<MergeEntry>,
    page_acc: usize,
    node_acc: u64,
    emitted_any: bool,
}

impl<'a> WriteIter<'a> {
    /// Wraps a merge with rebuild parameters.
    pub fn new(
        merge: MergeIterator<'a>,
        scheme: &'a Scheme,
        params: WriteParams,
        upsert: Option<UpsertFn>,
    ) -> Self {
        Self {
            input: merge.peekable(),
            scheme,
            params,
            upsert,
            pending: VecDeque::new(),
            page_acc: 0,
            node_acc: 0,
            emitted_any: false,
        }
    }

    fn expired(&self, rec: &Record) -> bool {
        if self.params.expire_period == 0 {
            return false;
        }
        match self.scheme.timestamp_of(rec) {
            Some(ts) => ts < self.params.now.saturating_sub(self.params.expire_period),
            None => false,
        }
    }

    /// Filters one key group into the pending queue.
    fn refill(&mut self) -> Result<bool, MergeError> {
        while self.pending.is_empty() {
            let group = match next_group(&mut self.input)? {
                Some(g) => g,
                None => return Ok(false),
            };

            let mut kept: Vec<MergeEntry> = Vec::new();
            let mut last_lsn: Option<u64> = None;
            for (i, entry) in group.iter().enumerate() {
                if entry.rec.has_flag(flags::GET) {
                    continue;
                }
                // Identical (key, LSN) can reappear when WAL replay
                // conservatively re-installed an absorbed record.
                if last_lsn == Some(entry.rec.lsn()) {
                    continue;
                }
                if entry.rec.lsn() > self.params.vlsn {
                    if !self.expired(&entry.rec) {
                        last_lsn = Some(entry.rec.lsn());
                        kept.push(entry.clone());
                    }
                    continue;
                }

                // Newest version at or below the floor: the one survivor.
                if entry.rec.has_flag(flags::DELETE) {
                    // Spent tombstone: nothing younger needs it.
                } else if entry.rec.has_flag(flags::UPSERT) {
                    let Some(upsert) = &self.upsert else {
                        return Err(MergeError::Upsert(
                            "no upsert function bound to this store".into(),
                        ));
                    };
                    let folded = fold_upserts(self.scheme, upsert, &group, i)?;
                    if !self.expired(&folded) {
                        kept.push(MergeEntry {
                            key: entry.key.clone(),
                            rec: Arc::new(folded),
                            lfsn: entry.lfsn,
                            dup: false,
                        });
                    }
                } else if !self.expired(&entry.rec) {
                    kept.push(entry.clone());
                }
                break;
            }

            for (i, mut entry) in kept.into_iter().enumerate() {
                entry.dup = i > 0;
                self.pending.push_back(entry);
            }
        }
        Ok(true)
    }
}

impl Iterator for WriteIter<'_> {
    type Item = Result<WriteStep, MergeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pending.is_empty() {
            match self.refill() {
                Ok(true) => {
                    // Boundary checks run between version chains only.
                    if self.emitted_any {
                        if self.node_acc >= self.params.node_size {
                            self.node_acc = 0;
                            self.page_acc = 0;
                            return Some(Ok(WriteStep::EndNode));
                        }
                        if self.page_acc >= self.params.page_size {
                            self.page_acc = 0;
                            return Some(Ok(WriteStep::EndPage));
                        }
                    }
                }
                Ok(false) => return None,
                Err(e) => return Some(Err(e)),
            }
        }

        let entry = self.pending.pop_front()?;
        self.page_acc += entry.rec.size();
        self.node_acc += entry.rec.size() as u64;
        self.emitted_any = true;
        Some(Ok(WriteStep::Rec(entry)))
    }
}
