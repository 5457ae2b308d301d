use super::{concat_upsert, insert, scheme};
use crate::memindex::MemIndex;
use crate::merge::{MergeIterator, WriteIter, WriteParams, WriteStep, mem_source};
use crate::node::Direction;
use crate::record::{FieldDesc, FieldKind, Record, Scheme, flags};

fn params(vlsn: u64) -> WriteParams {
    WriteParams {
        vlsn,
        now: 1_000_000,
        expire_period: 0,
        page_size: 1 << 20,
        node_size: 1 << 30,
    }
}

fn drain(
    idx: &MemIndex,
    scheme: &Scheme,
    params: WriteParams,
    upsert: Option<crate::merge::UpsertFn>,
) -> Vec<WriteStep> {
    let merge =
        MergeIterator::new(vec![mem_source(idx, Direction::Asc, None)], Direction::Asc).unwrap();
    WriteIter::new(merge, scheme, params, upsert)
        .map(|r| r.unwrap())
        .collect()
}

fn recs(steps: &[WriteStep], scheme: &Scheme) -> Vec<(Vec<u8>, u64, bool)> {
    steps
        .iter()
        .filter_map(|s| match s {
            WriteStep::Rec(e) => Some((
                e.rec.field(scheme, 0).unwrap().to_vec(),
                e.rec.lsn(),
                e.dup,
            )),
            _ => None,
        })
        .collect()
}

#[test]
fn test_collapses_versions_below_floor() {
    let scheme = scheme();
    let mut idx = MemIndex::new();
    insert(&scheme, &mut idx, b"a", b"v3", flags::NONE, 3);
    insert(&scheme, &mut idx, b"a", b"v2", flags::NONE, 2);
    insert(&scheme, &mut idx, b"a", b"v1", flags::NONE, 1);

    let steps = drain(&idx, &scheme, params(u64::MAX), None);
    let got = recs(&steps, &scheme);
    assert_eq!(got, vec![(b"a".to_vec(), 3, false)]);
}

#[test]
fn test_keeps_versions_above_floor_verbatim() {
    let scheme = scheme();
    let mut idx = MemIndex::new();
    insert(&scheme, &mut idx, b"a", b"v9", flags::NONE, 9);
    insert(&scheme, &mut idx, b"a", b"v7", flags::NONE, 7);
    insert(&scheme, &mut idx, b"a", b"v2", flags::NONE, 2);
    insert(&scheme, &mut idx, b"a", b"v1", flags::NONE, 1);

    // Readers pinned at 5: keep 9 and 7 verbatim, collapse 2 and 1 to 2.
    let steps = drain(&idx, &scheme, params(5), None);
    let got = recs(&steps, &scheme);
    assert_eq!(
        got,
        vec![
            (b"a".to_vec(), 9, false),
            (b"a".to_vec(), 7, true),
            (b"a".to_vec(), 2, true),
        ]
    );
}

#[test]
fn test_drops_spent_tombstone_and_everything_below() {
    let scheme = scheme();
    let mut idx = MemIndex::new();
    insert(&scheme, &mut idx, b"a", b"", flags::DELETE, 5);
    insert(&scheme, &mut idx, b"a", b"v", flags::NONE, 2);
    insert(&scheme, &mut idx, b"b", b"w", flags::NONE, 3);

    let steps = drain(&idx, &scheme, params(u64::MAX), None);
    let got = recs(&steps, &scheme);
    assert_eq!(got, vec![(b"b".to_vec(), 3, false)]);
}

#[test]
fn test_retains_tombstone_above_floor() {
    let scheme = scheme();
    let mut idx = MemIndex::new();
    insert(&scheme, &mut idx, b"a", b"", flags::DELETE, 8);
    insert(&scheme, &mut idx, b"a", b"v", flags::NONE, 2);

    // A reader at 5 still needs v@2; the tombstone@8 is above the floor.
    let steps = drain(&idx, &scheme, params(5), None);
    let got = recs(&steps, &scheme);
    assert_eq!(got, vec![(b"a".to_vec(), 8, false), (b"a".to_vec(), 2, true)]);
}

#[test]
fn test_materializes_upsert_fold_below_floor() {
    let scheme = scheme();
    let mut idx = MemIndex::new();
    insert(&scheme, &mut idx, b"x", b"A", flags::NONE, 1);
    insert(&scheme, &mut idx, b"x", b"B", flags::UPSERT, 2);
    insert(&scheme, &mut idx, b"x", b"C", flags::UPSERT, 3);

    let steps = drain(&idx, &scheme, params(u64::MAX), Some(concat_upsert()));
    let got: Vec<(Vec<u8>, u64)> = steps
        .iter()
        .filter_map(|s| match s {
            WriteStep::Rec(e) => Some((e.rec.field(&scheme, 1).unwrap().to_vec(), e.rec.lsn())),
            _ => None,
        })
        .collect();
    assert_eq!(got, vec![(b"ABC".to_vec(), 3)]);
}

#[test]
fn test_expiration_drops_old_records() {
    let scheme = Scheme::new(vec![
        FieldDesc::key("k", FieldKind::String, 0),
        FieldDesc::value("v", FieldKind::String),
        FieldDesc {
            name: "ts".into(),
            kind: FieldKind::U32,
            order: crate::record::SortOrder::Asc,
            key: None,
            timestamp: true,
        },
    ])
    .unwrap();

    let mut idx = MemIndex::new();
    let mut put = |key: &[u8], ts: u32, lsn: u64| {
        let r = Record::build(
            &scheme,
            &[key, b"v", &ts.to_le_bytes()],
            flags::NONE,
            lsn,
        )
        .unwrap();
        let ik = scheme.index_key(&r);
        idx.insert(
            ik,
            crate::memindex::VersionedRecord {
                rec: std::sync::Arc::new(r),
                lfsn: 0,
            },
        );
    };
    put(b"old", 100, 1);
    put(b"fresh", 999_950, 2);

    let p = WriteParams {
        vlsn: u64::MAX,
        now: 1_000_000,
        expire_period: 100,
        page_size: 1 << 20,
        node_size: 1 << 30,
    };
    let merge =
        MergeIterator::new(vec![mem_source(&idx, Direction::Asc, None)], Direction::Asc).unwrap();
    let got: Vec<Vec<u8>> = WriteIter::new(merge, &scheme, p, None)
        .map(|r| r.unwrap())
        .filter_map(|s| match s {
            WriteStep::Rec(e) => Some(e.rec.field(&scheme, 0).unwrap().to_vec()),
            _ => None,
        })
        .collect();
    assert_eq!(got, vec![b"fresh".to_vec()]);
}

#[test]
fn test_page_and_node_boundaries_between_chains() {
    let scheme = scheme();
    let mut idx = MemIndex::new();
    // Each record ~40 bytes; page budget below one record forces a
    // boundary after every chain.
    for key in [&b"a"[..], b"b", b"c"] {
        insert(&scheme, &mut idx, key, b"0123456789", flags::NONE, 1);
    }

    let p = WriteParams {
        vlsn: u64::MAX,
        now: 0,
        expire_period: 0,
        page_size: 1,
        node_size: 1 << 30,
    };
    let merge =
        MergeIterator::new(vec![mem_source(&idx, Direction::Asc, None)], Direction::Asc).unwrap();
    let steps: Vec<WriteStep> = WriteIter::new(merge, &scheme, p, None)
        .map(|r| r.unwrap())
        .collect();

    // Rec, EndPage, Rec, EndPage, Rec — boundaries separate chains and
    // never lead or trail the stream.
    assert!(matches!(steps[0], WriteStep::Rec(_)));
    assert!(matches!(steps[1], WriteStep::EndPage));
    assert!(matches!(steps[2], WriteStep::Rec(_)));
    assert!(matches!(steps[3], WriteStep::EndPage));
    assert!(matches!(steps[4], WriteStep::Rec(_)));
    assert_eq!(steps.len(), 5);

    // Node boundary wins over page boundary.
    let p = WriteParams {
        vlsn: u64::MAX,
        now: 0,
        expire_period: 0,
        page_size: 1,
        node_size: 1,
    };
    let merge =
        MergeIterator::new(vec![mem_source(&idx, Direction::Asc, None)], Direction::Asc).unwrap();
    let steps: Vec<WriteStep> = WriteIter::new(merge, &scheme, p, None)
        .map(|r| r.unwrap())
        .collect();
    assert!(matches!(steps[1], WriteStep::EndNode));
}

#[test]
fn test_compaction_idempotence() {
    // A stream with nothing droppable passes through unchanged.
    let scheme = scheme();
    let mut idx = MemIndex::new();
    insert(&scheme, &mut idx, b"a", b"1", flags::NONE, 1);
    insert(&scheme, &mut idx, b"b", b"2", flags::NONE, 2);

    let steps = drain(&idx, &scheme, params(u64::MAX), None);
    let got = recs(&steps, &scheme);
    assert_eq!(got, vec![(b"a".to_vec(), 1, false), (b"b".to_vec(), 2, false)]);
}
