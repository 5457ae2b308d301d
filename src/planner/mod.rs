//! Planner — task selection and the node rebuild pipeline.
//!
//! The planner decides, per node, which maintenance task is due:
//!
//! | Task | Trigger |
//! |---|---|
//! | `Checkpoint` | a checkpoint target LSN covers the node's pending delta |
//! | `Compaction` | in-memory delta crossed the per-node memory cap |
//! | `Gc` | duplicate ratio crossed the threshold and the dups are droppable |
//! | `Expire` | the node holds records older than the expire period |
//! | `Backup` | the node has not been captured by the requested backup |
//! | `NodeGc` | a replaced node on the delayed-delete list lost its last pin |
//!
//! Only one task runs per node at a time (the node's `Locked` state); the
//! planner skips locked nodes and re-examines them on the next poll.
//!
//! [`build_replacement_nodes`] is the rebuild core shared by checkpoint
//! and every compaction flavor: it drains a [`WriteIter`] into one or more
//! node files through the `.incomplete` → `.seal` protocol. The store
//! swaps the sealed nodes in under its lock, finishes the rename dance,
//! and credits the WAL sweep counters from the drained delta (a record
//! dropped by the rebuild is just as absorbed as one written).

#[cfg(test)]
mod tests;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::merge::{MergeError, MergeIterator, UpsertFn, WriteIter, WriteParams, WriteStep};
use crate::node::{Node, NodeError, NodeState, NodeWriter};
use crate::page::{PageBuilder, PageIndex};
use crate::record::Scheme;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised while executing a planner task.
#[derive(Debug, Error)]
pub enum PlannerError {
    /// Node I/O failure.
    #[error("node error: {0}")]
    Node(#[from] NodeError),

    /// Merge or upsert failure while draining.
    #[error("merge error: {0}")]
    Merge(#[from] MergeError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ------------------------------------------------------------------------------------------------
// Tasks
// ------------------------------------------------------------------------------------------------

/// Kind of maintenance work the planner scheduled for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Drain the pending delta up to a captured target LSN.
    Checkpoint,
    /// Rewrite the node, merging its delta with its pages.
    Compaction,
    /// Compaction triggered by duplicate-version pressure.
    Gc,
    /// Compaction triggered by expired records.
    Expire,
    /// Copy the node file into the backup staging directory.
    Backup,
    /// Unlink a replaced node whose last reader released it.
    NodeGc,
}

/// A scheduled unit of work.
#[derive(Debug, Clone)]
pub struct Task {
    /// What to do.
    pub kind: TaskKind,
    /// The node to do it to.
    pub node: Arc<Node>,
}

/// Trigger thresholds, derived from the repository configuration.
#[derive(Debug, Clone)]
pub struct Thresholds {
    /// Per-node in-memory delta cap in bytes.
    pub node_memory_cap: usize,
    /// Duplicate ratio (`dupkeys / keys`) that triggers GC compaction.
    pub gc_ratio: f64,
    /// Expire period in seconds; zero disables expiration.
    pub expire_period: u32,
}

/// Picks the most urgent task for one node, or `None` when it is idle.
///
/// `checkpoint_target` and `backup_target` are the store-level pending
/// requests; `vlsn` is the visible-LSN floor and `now` wall-clock seconds.
pub fn plan_node(
    node: &Arc<Node>,
    th: &Thresholds,
    vlsn: u64,
    now: u32,
    checkpoint_target: Option<u64>,
    backup_target: Option<u64>,
) -> Option<TaskKind> {
    let inner = node.inner.read().expect("node lock poisoned");
    if inner.state == NodeState::Locked {
        return None;
    }

    if let Some(target) = checkpoint_target {
        let pending = inner.i0.lsnmin();
        if !inner.i0.is_empty() && pending <= target {
            return Some(TaskKind::Checkpoint);
        }
    }

    if let Some(target) = backup_target {
        if inner.backup_bsn < target {
            return Some(TaskKind::Backup);
        }
    }

    if inner.i0.used() + inner.i1.used() >= th.node_memory_cap {
        return Some(TaskKind::Compaction);
    }

    let header = &node.index.header;
    if header.keys > 0 {
        let ratio = header.dupkeys as f64 / header.keys as f64;
        if ratio >= th.gc_ratio && header.dupmin <= vlsn {
            return Some(TaskKind::Gc);
        }
    }

    if th.expire_period > 0
        && header.ts_min != u32::MAX
        && header.ts_min <= now.saturating_sub(th.expire_period)
    {
        return Some(TaskKind::Expire);
    }

    None
}

// ------------------------------------------------------------------------------------------------
// Rebuild pipeline
// ------------------------------------------------------------------------------------------------

/// A replacement node produced by a rebuild, sealed but unpublished.
#[derive(Debug)]
pub struct SealedNode {
    /// Allocated node sequence number.
    pub id: u64,
    /// `.seal` file path.
    pub path: PathBuf,
    /// Page index, avoiding a reread at open.
    pub index: PageIndex,
}

/// Drains a merged stream into one or more sealed node files.
///
/// Returns the sealed nodes in key order. Produces no nodes when the
/// stream drops everything; the caller synthesizes a bootstrap node if
/// the store would otherwise be empty. On any failure the `.incomplete`
/// outputs remove themselves.
#[allow(clippy::too_many_arguments)]
pub fn build_replacement_nodes(
    scheme: &Scheme,
    merge: MergeIterator<'_>,
    params: WriteParams,
    upsert: Option<UpsertFn>,
    dir: &Path,
    parent: u64,
    mut next_id: impl FnMut() -> u64,
    align: u16,
    sync: bool,
) -> Result<Vec<SealedNode>, PlannerError> {
    let page_size = params.page_size;
    let mut iter = WriteIter::new(merge, scheme, params, upsert);

    let mut sealed = Vec::new();
    let mut writer: Option<NodeWriter> = None;
    let mut page: Option<PageBuilder<'_>> = None;

    fn flush_page(
        writer: &mut Option<NodeWriter>,
        page: &mut Option<PageBuilder<'_>>,
    ) -> Result<(), PlannerError> {
        if let Some(builder) = page.take() {
            if !builder.is_empty() {
                let w = writer.as_mut().expect("page without an open node writer");
                w.add_page(builder.finish())?;
            }
        }
        Ok(())
    }

    while let Some(step) = iter.next() {
        match step? {
            WriteStep::Rec(entry) => {
                if writer.is_none() {
                    writer = Some(NodeWriter::create(dir, parent, next_id())?);
                }
                if page.is_none() {
                    page = Some(PageBuilder::new(scheme));
                }
                let builder = page.as_mut().expect("page builder just installed");
                builder.add(&entry.rec, entry.dup);
                // Page boundaries also arrive as explicit signals; this
                // guard bounds a single oversized chain.
                if builder.body_size() >= page_size * 4 {
                    flush_page(&mut writer, &mut page)?;
                }
            }
            WriteStep::EndPage => {
                flush_page(&mut writer, &mut page)?;
            }
            WriteStep::EndNode => {
                flush_page(&mut writer, &mut page)?;
                if let Some(w) = writer.take() {
                    if w.page_count() > 0 {
                        let id = w.id();
                        let (path, index) = w.seal(align, sync)?;
                        sealed.push(SealedNode { id, path, index });
                    }
                }
            }
        }
    }
    flush_page(&mut writer, &mut page)?;
    if let Some(w) = writer.take() {
        if w.page_count() > 0 {
            let id = w.id();
            let (path, index) = w.seal(align, sync)?;
            sealed.push(SealedNode { id, path, index });
        }
    }

    debug!(parent, nodes = sealed.len(), "rebuild stream drained");
    Ok(sealed)
}

// ------------------------------------------------------------------------------------------------
// Backup copy
// ------------------------------------------------------------------------------------------------

/// Copies a node file into the backup staging directory.
///
/// Backup I/O failures are plain errors: they stop the backup but do not
/// poison the engine.
pub fn backup_node(node: &Node, staging: &Path) -> Result<u64, PlannerError> {
    let src = node.path();
    let file_name = src
        .file_name()
        .ok_or_else(|| PlannerError::Io(std::io::Error::other("node path has no file name")))?;
    let dst = staging.join(file_name);
    let bytes = std::fs::copy(&src, &dst)?;
    info!(id = node.id, bytes, dst = %dst.display(), "node backed up");
    Ok(bytes)
}
