//! Per-node in-memory index of pending writes.
//!
//! Every node carries two of these: `i0` receives live writes, `i1` holds
//! the rotated-out delta while a compaction drains it. The index maps an
//! order-preserving key (see [`Scheme::index_key`](crate::record::Scheme))
//! to a **version chain** — all pending versions of that key, newest first.
//!
//! ## Invariants
//!
//! - Chains are sorted strictly descending by LSN; inserting an LSN that is
//!   already present replaces that version in place.
//! - The head of a chain is the newest pending version; every non-head
//!   position is a duplicate and is reported as such to consumers (the
//!   `DUP` flag is stamped when the record is serialized into a page).
//! - `lsnmin` tracks the smallest LSN ever inserted and is the checkpoint
//!   trigger: once the visible-LSN floor passes it, the whole delta can be
//!   drained to disk.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::record::Record;

/// A pending record plus the WAL file it originated from.
///
/// The `Arc` is the version's refcount; `lfsn` is the back-link used by WAL
/// garbage collection (zero for records re-read from node files, which are
/// not WAL-accounted).
#[derive(Debug, Clone)]
pub struct VersionedRecord {
    /// The shared, immutable record bytes.
    pub rec: Arc<Record>,
    /// Sequence number of the WAL file holding this record, or zero.
    pub lfsn: u64,
}

/// All pending versions of one key, newest (highest LSN) first.
#[derive(Debug, Clone, Default)]
pub struct VersionChain {
    versions: Vec<VersionedRecord>,
}

impl VersionChain {
    /// Newest pending version.
    pub fn head(&self) -> Option<&VersionedRecord> {
        self.versions.first()
    }

    /// All versions, newest first.
    pub fn versions(&self) -> &[VersionedRecord] {
        &self.versions
    }

    /// Number of versions in the chain.
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// True when the chain holds no versions.
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

/// The mutable in-memory delta of a node.
#[derive(Debug, Default)]
pub struct MemIndex {
    tree: BTreeMap<Vec<u8>, VersionChain>,
    count: usize,
    used: usize,
    lsnmin: u64,
}

impl MemIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self {
            tree: BTreeMap::new(),
            count: 0,
            used: 0,
            lsnmin: u64::MAX,
        }
    }

    /// Inserts a version under `key`, keeping the chain LSN-descending.
    ///
    /// An insert with an LSN already present in the chain replaces that
    /// version in place, so no two chain entries ever share an LSN.
    pub fn insert(&mut self, key: Vec<u8>, vr: VersionedRecord) {
        let lsn = vr.rec.lsn();
        let size = entry_size(&key, &vr);
        let chain = self.tree.entry(key).or_default();

        match chain.versions.binary_search_by(|v| lsn.cmp(&v.rec.lsn())) {
            Ok(pos) => {
                // Same LSN: replace, adjusting the byte accounting.
                self.used -= vr_size(&chain.versions[pos]);
                self.used += vr_size(&vr);
                chain.versions[pos] = vr;
            }
            Err(pos) => {
                chain.versions.insert(pos, vr);
                self.count += 1;
                self.used += size;
            }
        }
        self.lsnmin = self.lsnmin.min(lsn);
    }

    /// Looks up the version chain for an exact key.
    pub fn get(&self, key: &[u8]) -> Option<&VersionChain> {
        self.tree.get(key)
    }

    /// Iterates chains in ascending key order starting at `from`
    /// (inclusive), or from the first key.
    pub fn iter_from<'a>(
        &'a self,
        from: Option<Vec<u8>>,
    ) -> impl Iterator<Item = (&'a Vec<u8>, &'a VersionChain)> + 'a {
        match from {
            Some(k) => self.tree.range(k..),
            None => self.tree.range::<Vec<u8>, _>(..),
        }
    }

    /// Iterates chains in descending key order starting at `from`
    /// (inclusive), or from the last key.
    pub fn iter_from_rev<'a>(
        &'a self,
        from: Option<Vec<u8>>,
    ) -> impl Iterator<Item = (&'a Vec<u8>, &'a VersionChain)> + 'a {
        match from {
            Some(k) => self.tree.range(..=k).rev(),
            None => self.tree.range::<Vec<u8>, _>(..).rev(),
        }
    }

    /// Clones the whole index into an owned snapshot (`Arc` clones only),
    /// so a compaction can drain it without holding the node lock.
    pub fn snapshot(&self) -> Vec<(Vec<u8>, VersionChain)> {
        self.tree
            .iter()
            .map(|(k, c)| (k.clone(), c.clone()))
            .collect()
    }

    /// Total number of versions.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Approximate heap footprint in bytes.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Smallest LSN ever inserted; `u64::MAX` while empty.
    pub fn lsnmin(&self) -> u64 {
        self.lsnmin
    }

    /// True when no versions are pending.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

fn vr_size(vr: &VersionedRecord) -> usize {
    std::mem::size_of::<VersionedRecord>() + vr.rec.size()
}

fn entry_size(key: &[u8], vr: &VersionedRecord) -> usize {
    key.len() + vr_size(vr)
}
