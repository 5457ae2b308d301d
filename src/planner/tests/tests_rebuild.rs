use std::sync::Arc;

use tempfile::TempDir;

use crate::memindex::MemIndex;
use crate::merge::{MergeIterator, WriteParams, mem_source};
use crate::node::{Direction, Node};
use crate::planner::build_replacement_nodes;
use crate::record::{FieldDesc, FieldKind, Record, Scheme, flags};

fn scheme() -> Scheme {
    Scheme::new(vec![
        FieldDesc::key("k", FieldKind::String, 0),
        FieldDesc::value("v", FieldKind::String),
    ])
    .unwrap()
}

fn filled_index(scheme: &Scheme, n: usize) -> MemIndex {
    let mut idx = MemIndex::new();
    for i in 0..n {
        let key = format!("key_{i:04}");
        let rec = Record::build(
            scheme,
            &[key.as_bytes(), b"payload"],
            flags::NONE,
            (i + 1) as u64,
        )
        .unwrap();
        let ik = scheme.index_key(&rec);
        idx.insert(
            ik,
            crate::memindex::VersionedRecord {
                rec: Arc::new(rec),
                lfsn: 3,
            },
        );
    }
    idx
}

fn params(node_size: u64) -> WriteParams {
    WriteParams {
        vlsn: u64::MAX,
        now: 0,
        expire_period: 0,
        page_size: 128,
        node_size,
    }
}

#[test]
fn test_single_replacement_node() {
    let tmp = TempDir::new().unwrap();
    let scheme = scheme();
    let idx = filled_index(&scheme, 10);

    let merge =
        MergeIterator::new(vec![mem_source(&idx, Direction::Asc, None)], Direction::Asc).unwrap();
    let mut next = 100u64;
    let sealed = build_replacement_nodes(
        &scheme,
        merge,
        params(1 << 30),
        None,
        tmp.path(),
        7,
        || {
            next += 1;
            next
        },
        0,
        true,
    )
    .unwrap();

    assert_eq!(sealed.len(), 1);
    assert_eq!(sealed[0].id, 101);
    assert_eq!(sealed[0].index.header.keys, 10);
    assert!(sealed[0].index.count() > 1, "page size 128 forces splits");

    // Sealed output opens as a node and serves every key.
    let node = Node::open(&sealed[0].path, sealed[0].id, 7).unwrap();
    for i in 0..10 {
        let key = format!("key_{i:04}");
        let probe = scheme.key_record(&[key.as_bytes()]).unwrap();
        assert_eq!(node.chain_for(&scheme, &probe).unwrap().len(), 1);
    }
}

#[test]
fn test_node_size_splits_output() {
    let tmp = TempDir::new().unwrap();
    let scheme = scheme();
    let idx = filled_index(&scheme, 20);

    let merge =
        MergeIterator::new(vec![mem_source(&idx, Direction::Asc, None)], Direction::Asc).unwrap();
    let mut next = 0u64;
    let sealed = build_replacement_nodes(
        &scheme,
        merge,
        params(256),
        None,
        tmp.path(),
        1,
        || {
            next += 1;
            next
        },
        0,
        true,
    )
    .unwrap();

    assert!(sealed.len() >= 2, "256-byte node budget must split");

    // Split preserves the record set, partitioned by disjoint key ranges.
    let total: u32 = sealed.iter().map(|s| s.index.header.keys).sum();
    assert_eq!(total, 20);
    for pair in sealed.windows(2) {
        let left_max = &pair[0].index.entries.last().unwrap().max_key;
        let right_min = &pair[1].index.entries.first().unwrap().min_key;
        let left = Record::from_bytes(&scheme, left_max.clone()).unwrap();
        let right = Record::from_bytes(&scheme, right_min.clone()).unwrap();
        assert_eq!(scheme.compare(&left, &right), std::cmp::Ordering::Less);
    }
}

#[test]
fn test_everything_dropped_produces_no_nodes() {
    let tmp = TempDir::new().unwrap();
    let scheme = scheme();
    let mut idx = MemIndex::new();
    let rec = Record::build(&scheme, &[b"gone", b""], flags::DELETE, 1).unwrap();
    let ik = scheme.index_key(&rec);
    idx.insert(
        ik,
        crate::memindex::VersionedRecord {
            rec: Arc::new(rec),
            lfsn: 1,
        },
    );

    let merge =
        MergeIterator::new(vec![mem_source(&idx, Direction::Asc, None)], Direction::Asc).unwrap();
    let sealed = build_replacement_nodes(
        &scheme,
        merge,
        params(1 << 30),
        None,
        tmp.path(),
        1,
        || 99,
        0,
        true,
    )
    .unwrap();

    assert!(sealed.is_empty());
    // No stray .incomplete files either.
    assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
}
