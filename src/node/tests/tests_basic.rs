use tempfile::TempDir;

use crate::node::{Node, NodeFile, NodeWriter, db_path, parse_file_name, seal_path};
use crate::page::PageBuilder;
use crate::record::{FieldDesc, FieldKind, Record, Scheme, flags};

fn scheme() -> Scheme {
    Scheme::new(vec![
        FieldDesc::key("k", FieldKind::String, 0),
        FieldDesc::value("v", FieldKind::String),
    ])
    .unwrap()
}

fn rec(scheme: &Scheme, key: &[u8], value: &[u8], lsn: u64) -> Record {
    Record::build(scheme, &[key, value], flags::NONE, lsn).unwrap()
}

/// Writes a node via the seal protocol and promotes it to `.db`.
fn write_node(dir: &std::path::Path, scheme: &Scheme, id: u64, pages: &[&[(&[u8], u64)]]) -> Node {
    let mut w = NodeWriter::create(dir, 0, id).unwrap();
    for page in pages {
        let mut b = PageBuilder::new(scheme);
        let mut prev_key: Option<&[u8]> = None;
        for &(key, lsn) in page.iter() {
            let dup = prev_key == Some(key);
            b.add(&rec(scheme, key, b"v", lsn), dup);
            prev_key = Some(key);
        }
        w.add_page(b.finish()).unwrap();
    }
    let (sealed, _) = w.seal(0, true).unwrap();
    let published = db_path(dir, id);
    std::fs::rename(&sealed, &published).unwrap();
    Node::open(&published, id, 0).unwrap()
}

#[test]
fn test_file_name_parsing() {
    assert_eq!(
        parse_file_name("00000000000000000007.db"),
        Some(NodeFile::Db { id: 7 })
    );
    assert_eq!(
        parse_file_name("00000000000000000003.00000000000000000009.db.seal"),
        Some(NodeFile::Seal { parent: 3, id: 9 })
    );
    assert_eq!(
        parse_file_name("00000000000000000003.00000000000000000009.db.incomplete"),
        Some(NodeFile::Incomplete { parent: 3, id: 9 })
    );
    assert_eq!(
        parse_file_name("00000000000000000004.db.gc"),
        Some(NodeFile::Gc { id: 4 })
    );
    assert_eq!(parse_file_name("scheme"), None);
    assert_eq!(parse_file_name("x.db"), None);
}

#[test]
fn test_initial_node_is_empty_but_valid() {
    let tmp = TempDir::new().unwrap();
    let node = Node::create_initial(tmp.path(), 1, true).unwrap();
    assert_eq!(node.index.count(), 0);
    assert_eq!(node.index.header.keys, 0);
    assert!(db_path(tmp.path(), 1).exists());

    // Reopen from disk.
    let reopened = Node::open(&db_path(tmp.path(), 1), 1, 0).unwrap();
    assert_eq!(reopened.index.count(), 0);
}

#[test]
fn test_write_open_and_point_lookup() {
    let tmp = TempDir::new().unwrap();
    let scheme = scheme();
    let node = write_node(
        tmp.path(),
        &scheme,
        2,
        &[
            &[(b"a", 5), (b"a", 2), (b"b", 3)],
            &[(b"c", 7), (b"d", 1)],
        ],
    );

    assert_eq!(node.index.count(), 2);
    assert_eq!(node.index.header.keys, 5);
    assert_eq!(node.index.header.lsn_max, 7);
    assert_eq!(node.index.header.dupkeys, 1);

    let probe = scheme.key_record(&[b"a"]).unwrap();
    let chain = node.chain_for(&scheme, &probe).unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[0].lsn(), 5);
    assert_eq!(chain[1].lsn(), 2);

    let probe = scheme.key_record(&[b"d"]).unwrap();
    let chain = node.chain_for(&scheme, &probe).unwrap();
    assert_eq!(chain.len(), 1);

    let probe = scheme.key_record(&[b"zz"]).unwrap();
    assert!(node.chain_for(&scheme, &probe).unwrap().is_empty());
}

#[test]
fn test_unsealed_writer_cleans_up_incomplete() {
    let tmp = TempDir::new().unwrap();
    let scheme = scheme();
    {
        let mut w = NodeWriter::create(tmp.path(), 1, 2).unwrap();
        let mut b = PageBuilder::new(&scheme);
        b.add(&rec(&scheme, b"a", b"v", 1), false);
        w.add_page(b.finish()).unwrap();
        // Dropped without seal: simulated failure path.
    }
    assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
}

#[test]
fn test_seal_file_is_openable_before_promotion() {
    let tmp = TempDir::new().unwrap();
    let scheme = scheme();
    let mut w = NodeWriter::create(tmp.path(), 1, 2).unwrap();
    let mut b = PageBuilder::new(&scheme);
    b.add(&rec(&scheme, b"a", b"v", 9), false);
    w.add_page(b.finish()).unwrap();
    let (sealed, index) = w.seal(0, true).unwrap();

    assert_eq!(sealed, seal_path(tmp.path(), 1, 2));
    assert_eq!(index.header.lsn_max, 9);
    let node = Node::open(&sealed, 2, 1).unwrap();
    assert_eq!(node.index.header.keys, 1);
}

#[test]
fn test_rename_tracks_path() {
    let tmp = TempDir::new().unwrap();
    let node = Node::create_initial(tmp.path(), 3, false).unwrap();
    let target = tmp.path().join("00000000000000000003.db.gc");
    node.rename_to(&target).unwrap();
    assert_eq!(node.path(), target);
    assert!(target.exists());
    assert!(!db_path(tmp.path(), 3).exists());
}

#[test]
fn test_truncated_file_rejected() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("00000000000000000009.db");
    std::fs::write(&path, b"too-short").unwrap();
    assert!(Node::open(&path, 9, 0).is_err());
}
