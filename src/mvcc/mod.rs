//! MVCC transaction manager — lifecycle, write intents, conflict and
//! deadlock detection.
//!
//! Each store owns one manager. A transaction is registered under its TSN
//! and carries a snapshot LSN (`vlsn`), a begin-time CSN, and a log of
//! write intents. Per key, intents form an arrival-ordered chain inside a
//! typed arena (`u32` ids in lieu of pointers); the whole structure is
//! observed under the manager's single lock.
//!
//! ## Conflict rules (first committer wins)
//!
//! At prepare, every intent is checked against its chain predecessors,
//! skipping read-only (`GET`) intents:
//!
//! - no predecessor → proceed;
//! - predecessor committed with a CSN above our begin CSN → a concurrent
//!   transaction committed the key first → `Rollback`;
//! - predecessor committed at or below our begin CSN → an older version →
//!   proceed;
//! - predecessor uncommitted → `Lock` (the caller retries or rolls back).
//!
//! Committing stamps a fresh CSN onto every intent, aborts other
//! transactions' pending read intents on the touched keys, and hands the
//! write set back to the caller for WAL append and index installation.
//! Committed intents stay chained until no active transaction began
//! before their commit, then a vacuum pass unlinks them.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, trace};

use crate::record::{Record, flags};
use crate::sequencer::Sequencer;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by transaction-manager operations.
#[derive(Debug, Error)]
pub enum TxError {
    /// The TSN is not registered (already ended, or never begun).
    #[error("unknown transaction {0}")]
    UnknownTx(u64),

    /// A second `UPSERT`, or an `UPSERT` over an existing intent, on the
    /// same key within one transaction.
    #[error("upsert may not overwrite an existing intent")]
    UpsertConflict,

    /// Operation not valid for the transaction's type or state.
    #[error("invalid transaction state: {0}")]
    InvalidState(String),
}

// ------------------------------------------------------------------------------------------------
// Public types
// ------------------------------------------------------------------------------------------------

/// Transaction type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxType {
    /// Snapshot reader; installs no intents.
    ReadOnly,
    /// Reader-writer with conflict detection.
    ReadWrite,
}

/// Transaction lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Accepting reads and writes.
    Ready,
    /// Prepare hit an uncommitted predecessor; retry later.
    Lock,
    /// Prepare succeeded; commit may proceed.
    Prepare,
    /// Committed.
    Commit,
    /// Rolled back.
    Rollback,
}

/// Outcome of a prepare pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// All intents clear; proceed to commit.
    Prepare,
    /// Blocked behind an uncommitted writer; retry or roll back.
    Lock,
    /// Write-write conflict or aborted read; must roll back.
    Rollback,
}

const NIL: u32 = u32::MAX;
const CSN_UNCOMMITTED: u64 = u64::MAX;

// ------------------------------------------------------------------------------------------------
// Internal structures
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct Intent {
    key: Vec<u8>,
    /// Owned record bytes; taken by commit for WAL append + installation.
    rec: Option<Record>,
    /// Read placeholder rather than a write.
    get: bool,
    tsn: u64,
    csn: u64,
    abort: bool,
    prev: u32,
    next: u32,
}

#[derive(Debug)]
enum Slot {
    Free,
    Used(Intent),
}

#[derive(Debug, Clone, Copy)]
struct ChainEnds {
    head: u32,
    tail: u32,
}

#[derive(Debug)]
struct Tx {
    ty: TxType,
    state: TxState,
    vlsn: u64,
    /// CSN captured at begin; conflict horizon.
    csn: u64,
    log: Vec<u32>,
}

#[derive(Debug, Default)]
struct TxInner {
    txs: BTreeMap<u64, Tx>,
    arena: Vec<Slot>,
    free: Vec<u32>,
    chains: BTreeMap<Vec<u8>, ChainEnds>,
    /// Committed intents awaiting vacuum.
    committed: Vec<u32>,
    csn: u64,
    rw_live: usize,
}

impl TxInner {
    fn intent(&self, id: u32) -> &Intent {
        match &self.arena[id as usize] {
            Slot::Used(i) => i,
            Slot::Free => unreachable!("dangling intent id {id}"),
        }
    }

    fn intent_mut(&mut self, id: u32) -> &mut Intent {
        match &mut self.arena[id as usize] {
            Slot::Used(i) => i,
            Slot::Free => unreachable!("dangling intent id {id}"),
        }
    }

    fn alloc(&mut self, intent: Intent) -> u32 {
        if let Some(id) = self.free.pop() {
            self.arena[id as usize] = Slot::Used(intent);
            id
        } else {
            self.arena.push(Slot::Used(intent));
            (self.arena.len() - 1) as u32
        }
    }

    /// Appends to the key's chain tail.
    fn push_tail(&mut self, key: Vec<u8>, mut intent: Intent) -> u32 {
        match self.chains.get(&key).copied() {
            Some(ends) => {
                intent.prev = ends.tail;
                let id = self.alloc(intent);
                self.intent_mut(ends.tail).next = id;
                self.chains.insert(
                    key,
                    ChainEnds {
                        head: ends.head,
                        tail: id,
                    },
                );
                id
            }
            None => {
                let id = self.alloc(intent);
                self.chains.insert(key, ChainEnds { head: id, tail: id });
                id
            }
        }
    }

    /// Unlinks an intent from its chain and frees the slot.
    fn unlink(&mut self, id: u32) {
        let (key, prev, next) = {
            let i = self.intent(id);
            (i.key.clone(), i.prev, i.next)
        };
        if prev != NIL {
            self.intent_mut(prev).next = next;
        }
        if next != NIL {
            self.intent_mut(next).prev = prev;
        }
        if let Some(ends) = self.chains.get(&key).copied() {
            let head = if ends.head == id { next } else { ends.head };
            let tail = if ends.tail == id { prev } else { ends.tail };
            if head == NIL {
                self.chains.remove(&key);
            } else {
                self.chains.insert(key, ChainEnds { head, tail });
            }
        }
        self.arena[id as usize] = Slot::Free;
        self.free.push(id);
    }

    /// The transaction's own intent on `key`, if any.
    fn own_intent(&self, tsn: u64, key: &[u8]) -> Option<u32> {
        let ends = self.chains.get(key)?;
        let mut id = ends.head;
        while id != NIL {
            let i = self.intent(id);
            if i.tsn == tsn {
                return Some(id);
            }
            id = i.next;
        }
        None
    }

    /// First write-intent predecessor in the chain.
    ///
    /// Read placeholders never conflict as predecessors: committed ones
    /// are stale snapshots, pending ones are aborted by the committing
    /// writer rather than waited on.
    fn conflict_predecessor(&self, id: u32) -> Option<u32> {
        let mut p = self.intent(id).prev;
        while p != NIL {
            let i = self.intent(p);
            if !i.get {
                return Some(p);
            }
            p = i.prev;
        }
        None
    }

    /// Unlinks committed intents no active transaction can still observe.
    fn vacuum(&mut self) {
        let horizon = self
            .txs
            .values()
            .map(|t| t.csn)
            .min()
            .unwrap_or(self.csn);
        let (stale, keep): (Vec<u32>, Vec<u32>) = self
            .committed
            .drain(..)
            .partition(|&id| match &self.arena[id as usize] {
                Slot::Used(i) => i.csn <= horizon,
                Slot::Free => true,
            });
        self.committed = keep;
        for id in stale {
            if matches!(self.arena[id as usize], Slot::Used(_)) {
                self.unlink(id);
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TxManager
// ------------------------------------------------------------------------------------------------

/// Per-store transaction manager.
pub struct TxManager {
    seq: Arc<Sequencer>,
    inner: Mutex<TxInner>,
}

impl TxManager {
    /// Creates a manager bound to the process sequencer.
    pub fn new(seq: Arc<Sequencer>) -> Self {
        Self {
            seq,
            inner: Mutex::new(TxInner::default()),
        }
    }

    /// Begins a transaction, snapshotting the current LSN (or a
    /// caller-supplied override, used by system replay).
    pub fn begin(&self, ty: TxType, vlsn_override: Option<u64>) -> u64 {
        let tsn = self.seq.next_tsn();
        let vlsn = vlsn_override.unwrap_or_else(|| self.seq.lsn());
        let mut inner = self.lock();
        let csn = inner.csn;
        if ty == TxType::ReadWrite {
            inner.rw_live += 1;
        }
        inner.txs.insert(
            tsn,
            Tx {
                ty,
                state: TxState::Ready,
                vlsn,
                csn,
                log: Vec::new(),
            },
        );
        trace!(tsn, vlsn, csn, ?ty, "transaction begun");
        tsn
    }

    /// Installs (or replaces) a write intent for `key`.
    ///
    /// A repeated write to the same key replaces the prior intent in
    /// place, except that an `UPSERT` may never overwrite an existing
    /// intent — at most one upsert per key per transaction.
    pub fn set(&self, tsn: u64, key: Vec<u8>, rec: Record) -> Result<(), TxError> {
        let mut inner = self.lock();
        let tx = inner.txs.get(&tsn).ok_or(TxError::UnknownTx(tsn))?;
        if tx.ty != TxType::ReadWrite {
            return Err(TxError::InvalidState(
                "write inside a read-only transaction".into(),
            ));
        }

        if let Some(id) = inner.own_intent(tsn, &key) {
            if rec.has_flag(flags::UPSERT) {
                return Err(TxError::UpsertConflict);
            }
            let intent = inner.intent_mut(id);
            intent.rec = Some(rec);
            intent.get = false;
            return Ok(());
        }

        let id = inner.push_tail(
            key.clone(),
            Intent {
                key,
                rec: Some(rec),
                get: false,
                tsn,
                csn: CSN_UNCOMMITTED,
                abort: false,
                prev: NIL,
                next: NIL,
            },
        );
        inner
            .txs
            .get_mut(&tsn)
            .ok_or(TxError::UnknownTx(tsn))?
            .log
            .push(id);
        Ok(())
    }

    /// Returns the transaction's own pending write on `key`, if it has
    /// one that is not a read placeholder.
    pub fn own_write(&self, tsn: u64, key: &[u8]) -> Option<Record> {
        let inner = self.lock();
        let id = inner.own_intent(tsn, key)?;
        let intent = inner.intent(id);
        if intent.get {
            return None;
        }
        intent.rec.clone()
    }

    /// Registers a read placeholder so commit can validate that no
    /// concurrent committed writer superseded this read.
    pub fn track_read(&self, tsn: u64, key: Vec<u8>, probe: Record) -> Result<(), TxError> {
        let mut inner = self.lock();
        let tx = inner.txs.get(&tsn).ok_or(TxError::UnknownTx(tsn))?;
        if tx.ty != TxType::ReadWrite {
            return Ok(());
        }
        if inner.own_intent(tsn, &key).is_some() {
            return Ok(());
        }
        let mut rec = probe;
        rec.add_flags(flags::GET);
        let id = inner.push_tail(
            key.clone(),
            Intent {
                key,
                rec: Some(rec),
                get: true,
                tsn,
                csn: CSN_UNCOMMITTED,
                abort: false,
                prev: NIL,
                next: NIL,
            },
        );
        inner
            .txs
            .get_mut(&tsn)
            .ok_or(TxError::UnknownTx(tsn))?
            .log
            .push(id);
        Ok(())
    }

    /// Checks every intent against its chain for conflicts.
    pub fn prepare(&self, tsn: u64) -> Result<Decision, TxError> {
        let mut inner = self.lock();
        let tx = inner.txs.get(&tsn).ok_or(TxError::UnknownTx(tsn))?;
        let begin_csn = tx.csn;
        let log = tx.log.clone();

        let mut decision = Decision::Prepare;
        for id in log {
            let intent = inner.intent(id);
            if intent.abort {
                decision = Decision::Rollback;
                break;
            }
            match inner.conflict_predecessor(id) {
                None => {}
                Some(p) => {
                    let pred = inner.intent(p);
                    if pred.csn == CSN_UNCOMMITTED {
                        decision = Decision::Lock;
                        // Keep scanning: a hard conflict still wins.
                    } else if pred.csn > begin_csn {
                        decision = Decision::Rollback;
                        break;
                    }
                }
            }
        }

        let tx = inner.txs.get_mut(&tsn).ok_or(TxError::UnknownTx(tsn))?;
        tx.state = match decision {
            Decision::Prepare => TxState::Prepare,
            Decision::Lock => TxState::Lock,
            Decision::Rollback => TxState::Rollback,
        };
        trace!(tsn, ?decision, "prepare");
        Ok(decision)
    }

    /// Commits a prepared transaction.
    ///
    /// Assigns a fresh CSN, stamps it on every intent, aborts other
    /// transactions' pending reads on the touched keys, and returns the
    /// write set in intent order for WAL append and installation.
    pub fn commit(&self, tsn: u64) -> Result<(u64, Vec<(Vec<u8>, Record)>), TxError> {
        let mut inner = self.lock();
        let tx = inner.txs.get(&tsn).ok_or(TxError::UnknownTx(tsn))?;
        if tx.state != TxState::Prepare {
            return Err(TxError::InvalidState(format!(
                "commit in state {:?}",
                tx.state
            )));
        }
        let log = tx.log.clone();
        let ty = tx.ty;

        inner.csn += 1;
        let csn = inner.csn;

        let mut writes = Vec::new();
        for id in log {
            // Abort readers still pending on this key: they would
            // otherwise validate against a superseded snapshot.
            let (key, is_get) = {
                let i = inner.intent(id);
                (i.key.clone(), i.get)
            };
            if !is_get {
                let mut cursor = inner.chains.get(&key).map(|e| e.head).unwrap_or(NIL);
                while cursor != NIL {
                    let other = inner.intent_mut(cursor);
                    let next = other.next;
                    if other.tsn != tsn && other.get && other.csn == CSN_UNCOMMITTED {
                        other.abort = true;
                    }
                    cursor = next;
                }
            }

            let intent = inner.intent_mut(id);
            intent.csn = csn;
            if let (false, Some(rec)) = (intent.get, intent.rec.take()) {
                writes.push((intent.key.clone(), rec));
            }
            inner.committed.push(id);
        }

        if let Some(tx) = inner.txs.get_mut(&tsn) {
            tx.state = TxState::Commit;
        }
        inner.txs.remove(&tsn);
        if ty == TxType::ReadWrite {
            inner.rw_live -= 1;
        }
        inner.vacuum();
        debug!(tsn, csn, writes = writes.len(), "transaction committed");
        Ok((csn, writes))
    }

    /// Rolls the transaction back, unlinking every intent.
    pub fn rollback(&self, tsn: u64) -> Result<(), TxError> {
        let mut inner = self.lock();
        let tx = inner.txs.remove(&tsn).ok_or(TxError::UnknownTx(tsn))?;
        for id in tx.log {
            inner.unlink(id);
        }
        if tx.ty == TxType::ReadWrite {
            inner.rw_live -= 1;
        }
        inner.vacuum();
        debug!(tsn, "transaction rolled back");
        Ok(())
    }

    /// Snapshot LSN of an active transaction.
    pub fn tx_vlsn(&self, tsn: u64) -> Result<u64, TxError> {
        self.lock()
            .txs
            .get(&tsn)
            .map(|t| t.vlsn)
            .ok_or(TxError::UnknownTx(tsn))
    }

    /// Visible-LSN floor: the oldest active snapshot, falling back to the
    /// current LSN. Compaction uses this as the safe-to-drop watermark.
    pub fn vlsn(&self) -> u64 {
        self.lock()
            .txs
            .values()
            .map(|t| t.vlsn)
            .min()
            .unwrap_or_else(|| self.seq.lsn())
    }

    /// True when any other read-write transaction is live (disables the
    /// single-statement fast path).
    pub fn has_live_rw(&self) -> bool {
        self.lock().rw_live > 0
    }

    /// Number of active transactions.
    pub fn active(&self) -> usize {
        self.lock().txs.len()
    }

    /// On-demand deadlock check: follows `intent → uncommitted
    /// predecessor → owning transaction → its intents` edges; a path back
    /// to the focal transaction is a cycle.
    pub fn is_deadlocked(&self, tsn: u64) -> bool {
        let inner = self.lock();
        let Some(tx) = inner.txs.get(&tsn) else {
            return false;
        };
        let mut visited = std::collections::BTreeSet::new();
        let mut stack: Vec<u64> = Vec::new();
        for &id in &tx.log {
            if let Some(p) = inner.conflict_predecessor(id) {
                let pred = inner.intent(p);
                if pred.csn == CSN_UNCOMMITTED {
                    stack.push(pred.tsn);
                }
            }
        }
        while let Some(owner) = stack.pop() {
            if owner == tsn {
                return true;
            }
            if !visited.insert(owner) {
                continue;
            }
            if let Some(tx) = inner.txs.get(&owner) {
                for &id in &tx.log {
                    if let Some(p) = inner.conflict_predecessor(id) {
                        let pred = inner.intent(p);
                        if pred.csn == CSN_UNCOMMITTED {
                            stack.push(pred.tsn);
                        }
                    }
                }
            }
        }
        false
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TxInner> {
        self.inner.lock().expect("MVCC lock poisoned")
    }
}
