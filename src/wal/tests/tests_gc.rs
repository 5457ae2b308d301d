use tempfile::TempDir;

use super::{open, rec, scheme};

#[test]
fn test_incomplete_file_never_collected() {
    let tmp = TempDir::new().unwrap();
    let scheme = scheme();
    let (wal, _seq) = open(tmp.path(), 100);

    let mut recs = vec![rec(&scheme, b"a", b"1")];
    let lfsn = wal.append(1, &mut recs).unwrap();
    wal.sweep(lfsn, 1);

    // Tail file: complete flag unset, must survive even fully swept.
    assert_eq!(wal.gc().unwrap(), 0);
    assert_eq!(wal.file_count(), 1);
}

#[test]
fn test_complete_and_swept_file_is_unlinked() {
    let tmp = TempDir::new().unwrap();
    let scheme = scheme();
    let (wal, _seq) = open(tmp.path(), 2);

    // Two appends fill file 1 past the watermark and rotate.
    let mut lfsns = Vec::new();
    for i in 0..3u8 {
        let mut recs = vec![rec(&scheme, &[b'k', i], b"v")];
        lfsns.push(wal.append(1, &mut recs).unwrap());
    }
    assert_eq!(wal.file_count(), 2);
    assert_eq!(lfsns[0], 1);
    assert_eq!(lfsns[1], 1);

    // Only one of file 1's two records persisted: not collectable yet.
    wal.sweep(1, 1);
    assert_eq!(wal.gc().unwrap(), 0);

    wal.sweep(1, 1);
    assert_eq!(wal.gc().unwrap(), 1);
    assert_eq!(wal.file_count(), 1);
    assert!(!tmp.path().join("00000000000000000001.log").exists());
    assert!(tmp.path().join("00000000000000000002.log").exists());
}
