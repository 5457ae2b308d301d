use tempfile::TempDir;

use super::{open, rec, scheme};
use crate::record::Record;
use crate::wal::WalError;

#[test]
fn test_replay_round_trip() {
    let tmp = TempDir::new().unwrap();
    let scheme = scheme();
    {
        let (wal, _seq) = open(tmp.path(), 100);
        let mut a = vec![rec(&scheme, b"a", b"1")];
        wal.append(3, &mut a).unwrap();
        let mut batch = vec![rec(&scheme, b"b", b"2"), rec(&scheme, b"c", b"3")];
        wal.append(3, &mut batch).unwrap();
    }

    let (wal, _seq) = open(tmp.path(), 100);
    let mut seen = Vec::new();
    let n = wal
        .replay(|_lfsn, store_id, payload| {
            let r = Record::from_bytes(&scheme, payload.to_vec())
                .map_err(|e| WalError::Dispatch(e.to_string()))?;
            seen.push((
                store_id,
                r.field(&scheme, 0).unwrap().to_vec(),
                r.lsn(),
            ));
            Ok(())
        })
        .unwrap();

    assert_eq!(n, 3);
    assert_eq!(
        seen,
        vec![
            (3, b"a".to_vec(), 1),
            (3, b"b".to_vec(), 2),
            (3, b"c".to_vec(), 3),
        ]
    );
}

#[test]
fn test_replay_spans_rotated_files_in_order() {
    let tmp = TempDir::new().unwrap();
    let scheme = scheme();
    {
        let (wal, _seq) = open(tmp.path(), 2);
        for i in 0..5u8 {
            let mut recs = vec![rec(&scheme, &[b'k', i], b"v")];
            wal.append(1, &mut recs).unwrap();
        }
    }

    let (wal, _seq) = open(tmp.path(), 2);
    let mut lsns = Vec::new();
    wal.replay(|_, _, payload| {
        let r = Record::from_bytes(&scheme, payload.to_vec())
            .map_err(|e| WalError::Dispatch(e.to_string()))?;
        lsns.push(r.lsn());
        Ok(())
    })
    .unwrap();
    assert_eq!(lsns, vec![1, 2, 3, 4, 5]);
}

#[test]
fn test_truncated_tail_ends_replay_cleanly() {
    let tmp = TempDir::new().unwrap();
    let scheme = scheme();
    {
        let (wal, _seq) = open(tmp.path(), 100);
        let mut a = vec![rec(&scheme, b"a", b"1")];
        wal.append(1, &mut a).unwrap();
        let mut b = vec![rec(&scheme, b"b", b"2")];
        wal.append(1, &mut b).unwrap();
    }

    // Chop the last record in half: a crash footprint.
    let path = tmp.path().join("00000000000000000001.log");
    let len = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 5).unwrap();
    drop(file);

    let (wal, _seq) = open(tmp.path(), 100);
    let mut count = 0;
    let n = wal
        .replay(|_, _, _| {
            count += 1;
            Ok(())
        })
        .unwrap();
    assert_eq!(n, 1);
    assert_eq!(count, 1);
}

#[test]
fn test_mid_file_corruption_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let scheme = scheme();
    {
        let (wal, _seq) = open(tmp.path(), 100);
        let mut a = vec![rec(&scheme, b"aaaaaaaa", b"111111")];
        wal.append(1, &mut a).unwrap();
        let mut b = vec![rec(&scheme, b"b", b"2")];
        wal.append(1, &mut b).unwrap();
    }

    // Flip a byte inside the first record's payload.
    let path = tmp.path().join("00000000000000000001.log");
    let mut bytes = std::fs::read(&path).unwrap();
    let target = 12 + 13 + 4; // magic + header + a few payload bytes
    bytes[target] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let (wal, _seq) = open(tmp.path(), 100);
    let err = wal.replay(|_, _, _| Ok(())).unwrap_err();
    assert!(matches!(err, WalError::ChecksumMismatch { .. }));
}

#[test]
fn test_bad_magic_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let scheme = scheme();
    {
        let (wal, _seq) = open(tmp.path(), 100);
        let mut a = vec![rec(&scheme, b"a", b"1")];
        wal.append(1, &mut a).unwrap();
    }

    let path = tmp.path().join("00000000000000000001.log");
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[0] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let (wal, _seq) = open(tmp.path(), 100);
    assert!(matches!(
        wal.replay(|_, _, _| Ok(())),
        Err(WalError::BadVersion(_))
    ));
}

#[test]
fn test_replay_rebuilds_mark_counters() {
    let tmp = TempDir::new().unwrap();
    let scheme = scheme();
    {
        let (wal, _seq) = open(tmp.path(), 100);
        for i in 0..3u8 {
            let mut recs = vec![rec(&scheme, &[b'k', i], b"v")];
            wal.append(1, &mut recs).unwrap();
        }
    }

    let (wal, _seq) = open(tmp.path(), 100);
    wal.replay(|_, _, _| Ok(())).unwrap();
    // All three records must be swept before the file can be collected;
    // the file is also still the tail (not complete), so GC keeps it.
    wal.sweep(1, 2);
    assert_eq!(wal.gc().unwrap(), 0);
}
