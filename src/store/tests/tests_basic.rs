use tempfile::TempDir;

use super::{init_tracing, kv_scheme, open_kv, test_config};
use crate::store::{Repo, Status, StoreError};

#[test]
fn test_open_creates_layout() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let (repo, _store) = open_kv(tmp.path());

    assert_eq!(repo.status(), Status::Online);
    assert!(tmp.path().join("log").is_dir());
    assert!(tmp.path().join("s").is_dir());
    assert!(tmp.path().join("s/scheme").is_file());
    // A fresh store holds one bootstrap node.
    assert_eq!(repo.stats().nodes, 1);
}

#[test]
fn test_set_get_delete() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let (_repo, store) = open_kv(tmp.path());

    store.set(&[b"a", b"1"]).unwrap();
    store.set(&[b"b", b"2"]).unwrap();

    let row = store.get(&[b"a"]).unwrap().unwrap();
    assert_eq!(row.field(1).unwrap(), b"1");
    assert_eq!(row.field_by_name("v").unwrap(), b"1");

    store.delete(&[b"a"]).unwrap();
    assert!(store.get(&[b"a"]).unwrap().is_none());
    assert!(store.get(&[b"b"]).unwrap().is_some());
    assert!(store.get(&[b"missing"]).unwrap().is_none());
}

#[test]
fn test_overwrite_returns_latest() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let (_repo, store) = open_kv(tmp.path());

    store.set(&[b"k", b"old"]).unwrap();
    store.set(&[b"k", b"new"]).unwrap();
    let row = store.get(&[b"k"]).unwrap().unwrap();
    assert_eq!(row.field(1).unwrap(), b"new");
    assert_eq!(row.lsn(), 2);
}

#[test]
fn test_autocommit_upsert_requires_function() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let (_repo, store) = open_kv(tmp.path());

    assert!(matches!(
        store.upsert(&[b"k", b"x"]),
        Err(StoreError::InvalidState(_))
    ));

    store.set_upsert(super::concat_upsert());
    store.upsert(&[b"k", b"x"]).unwrap();
    let row = store.get(&[b"k"]).unwrap().unwrap();
    assert_eq!(row.field(1).unwrap(), b"x");
}

#[test]
fn test_duplicate_store_name_rejected() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let (repo, _store) = open_kv(tmp.path());
    assert!(matches!(
        repo.create_store("s", kv_scheme()),
        Err(StoreError::InvalidState(_))
    ));
    assert!(matches!(
        repo.store("nope"),
        Err(StoreError::UnknownStore(_))
    ));
}

#[test]
fn test_stats_track_writes() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let (repo, store) = open_kv(tmp.path());

    for i in 0..10u32 {
        store
            .set(&[format!("k{i}").as_bytes(), b"value"])
            .unwrap();
    }
    let stats = store.stats();
    assert!(stats.pending_bytes > 0);
    assert_eq!(stats.disk_keys, 0);
    assert!(repo.stats().wal_files >= 1);
}

#[test]
fn test_close_is_idempotent() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let (repo, store) = open_kv(tmp.path());
    store.set(&[b"a", b"1"]).unwrap();
    repo.close().unwrap();
    repo.close().unwrap();
    // Writes after shutdown are rejected.
    assert!(store.set(&[b"b", b"2"]).is_err());
}

#[test]
fn test_background_workers_flush_under_pressure() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(tmp.path());
    cfg.workers = 2;
    cfg.memory_limit = 512; // tiny: every few writes trip the cap
    let repo = Repo::open(cfg).unwrap();
    let store = repo.create_store("s", kv_scheme()).unwrap();

    for i in 0..200u32 {
        store
            .set(&[format!("key_{i:04}").as_bytes(), b"payload-payload"])
            .unwrap();
    }

    // Wait for the workers to drain the deltas to disk.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        if store.stats().disk_keys > 0 || std::time::Instant::now() > deadline {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    assert!(store.stats().disk_keys > 0, "workers never flushed");

    // Every key is still readable.
    for i in 0..200u32 {
        assert!(
            store
                .get(&[format!("key_{i:04}").as_bytes()])
                .unwrap()
                .is_some(),
            "key_{i:04} lost"
        );
    }
    repo.close().unwrap();
}
