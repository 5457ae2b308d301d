//! Write-ahead log — ordered log files with rotation, GC, and replay.
//!
//! The log directory holds an ordered sequence of files named by their
//! LFSN (`{lfsn:020}.log`). Each file starts with the 12-byte
//! storage-version magic and then holds a run of records.
//!
//! # On-disk record layout (little-endian)
//!
//! ```text
//! { crc:u32, store_id:u32, size:u32, flags:u8 }   13-byte header
//! size bytes of record payload
//! ```
//!
//! The CRC covers `store_id || size || flags || payload`. A multi-record
//! transaction is prefixed with a header record whose `flags = BEGIN`,
//! `store_id = 0`, and `size = record count` (no payload); readers consume
//! exactly that many following records as one atomic group.
//!
//! # Lifecycle
//!
//! - **Append** runs under the tail file's lock: LSNs are stamped from the
//!   sequencer immediately before the write, and a savepoint taken before
//!   the write lets a failed append truncate the file back to a clean
//!   state.
//! - **Rotation** publishes a fresh tail once the current file's record
//!   count crosses the configured watermark; the prior file is marked
//!   complete.
//! - **GC** uses a mark/sweep counter pair: `mark` counts appends, `sweep`
//!   counts records later persisted into node files by compaction. A
//!   complete file with `sweep == mark` holds nothing the nodes don't,
//!   and is unlinked.
//! - **Replay** maps each file in LFSN order, validates the magic and
//!   per-record CRCs, and hands `(store_id, payload)` groups to the
//!   recovery write path. A truncated tail record is the footprint of a
//!   crash mid-append and ends replay of that file; a CRC mismatch in the
//!   middle is corruption and fails recovery.

#[cfg(test)]
mod tests;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::record::{Record, flags};
use crate::sequencer::Sequencer;
use crate::version::StorageVersion;

/// Serialized record header size.
pub const RECORD_HEADER_SIZE: usize = 13;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A log file carries an unknown or incompatible magic.
    #[error("incompatible storage version in {0}")]
    BadVersion(PathBuf),

    /// A record failed its CRC in the middle of a file.
    #[error("checksum mismatch at offset {offset} of {path}")]
    ChecksumMismatch {
        /// Log file.
        path: PathBuf,
        /// Byte offset of the bad record header.
        offset: usize,
    },

    /// The replay dispatch callback rejected a record.
    #[error("replay dispatch failed: {0}")]
    Dispatch(String),

    /// Internal consistency error.
    #[error("internal WAL error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// WAL tuning knobs.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Log directory.
    pub dir: PathBuf,
    /// fsync after every append.
    pub sync_on_write: bool,
    /// fsync the outgoing file on rotation.
    pub sync_on_rotate: bool,
    /// Rotate once a file holds this many records.
    pub rotate_wm: u64,
}

// ------------------------------------------------------------------------------------------------
// LogFile
// ------------------------------------------------------------------------------------------------

/// One log file plus its GC accounting.
#[derive(Debug)]
pub struct LogFile {
    /// Log-file sequence number.
    pub lfsn: u64,
    path: PathBuf,
    file: Mutex<File>,
    /// Records appended to this file.
    mark: AtomicU64,
    /// Records since persisted into node files.
    sweep: AtomicU64,
    /// No further appends will land here.
    complete: AtomicBool,
}

impl LogFile {
    fn create(dir: &Path, lfsn: u64) -> Result<LogFile, WalError> {
        let path = log_path(dir, lfsn);
        // Read access too: replay maps through this same handle.
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(&StorageVersion::CURRENT.encode())?;
        file.sync_all()?;
        info!(lfsn, path = %path.display(), "WAL file created");
        Ok(LogFile {
            lfsn,
            path,
            file: Mutex::new(file),
            mark: AtomicU64::new(0),
            sweep: AtomicU64::new(0),
            complete: AtomicBool::new(false),
        })
    }

    fn open_existing(dir: &Path, lfsn: u64) -> Result<LogFile, WalError> {
        let path = log_path(dir, lfsn);
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.seek(SeekFrom::End(0))?;
        Ok(LogFile {
            lfsn,
            path,
            file: Mutex::new(file),
            mark: AtomicU64::new(0),
            sweep: AtomicU64::new(0),
            complete: AtomicBool::new(false),
        })
    }

    /// Records appended.
    pub fn mark(&self) -> u64 {
        self.mark.load(Ordering::Acquire)
    }

    /// Records persisted into nodes.
    pub fn sweep(&self) -> u64 {
        self.sweep.load(Ordering::Acquire)
    }

    /// Whether the file stopped taking appends.
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn log_path(dir: &Path, lfsn: u64) -> PathBuf {
    dir.join(format!("{lfsn:020}.log"))
}

fn parse_log_name(name: &str) -> Option<u64> {
    name.strip_suffix(".log")?.parse().ok()
}

// ------------------------------------------------------------------------------------------------
// Wal
// ------------------------------------------------------------------------------------------------

/// The WAL manager: an ordered set of log files with one mutable tail.
pub struct Wal {
    cfg: WalConfig,
    seq: Arc<Sequencer>,
    files: Mutex<Vec<Arc<LogFile>>>,
}

impl Wal {
    /// Opens the log directory, registering existing files in LFSN order
    /// and creating the first file when none exist.
    pub fn open(cfg: WalConfig, seq: Arc<Sequencer>) -> Result<Wal, WalError> {
        fs::create_dir_all(&cfg.dir)?;

        let mut lfsns = Vec::new();
        for entry in fs::read_dir(&cfg.dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(lfsn) = parse_log_name(name) {
                    lfsns.push(lfsn);
                }
            }
        }
        lfsns.sort_unstable();

        let mut files = Vec::with_capacity(lfsns.len());
        for &lfsn in &lfsns {
            seq.bump_lfsn(lfsn);
            files.push(Arc::new(LogFile::open_existing(&cfg.dir, lfsn)?));
        }
        // Every file but the tail is closed to appends.
        for f in files.iter().rev().skip(1) {
            f.complete.store(true, Ordering::Release);
        }
        if files.is_empty() {
            files.push(Arc::new(LogFile::create(&cfg.dir, seq.next_lfsn())?));
        }

        debug!(files = files.len(), dir = %cfg.dir.display(), "WAL opened");
        Ok(Wal {
            cfg,
            seq,
            files: Mutex::new(files),
        })
    }

    fn tail(&self) -> Arc<LogFile> {
        let files = self.files.lock().expect("WAL file list lock poisoned");
        Arc::clone(files.last().expect("WAL file list empty"))
    }

    /// Appends a transaction's records, stamping each record's LSN from
    /// the sequencer immediately before the write.
    ///
    /// Single-record transactions emit just the record; multi-record
    /// transactions are prefixed with a `BEGIN` header. On any write
    /// failure the file is truncated back to its savepoint and the error
    /// is surfaced.
    pub fn append(&self, store_id: u32, recs: &mut [Record]) -> Result<u64, WalError> {
        if recs.is_empty() {
            return Err(WalError::Internal("empty transaction append".into()));
        }
        // A tail fetched before a rotation may already be complete once
        // its lock is acquired; retry on the fresh tail rather than race
        // the file's collection.
        let tail = loop {
            let candidate = self.tail();
            let still_tail = {
                let _guard = candidate.file.lock().expect("WAL file lock poisoned");
                !candidate.is_complete()
            };
            if still_tail {
                break candidate;
            }
        };

        let mut guard = tail.file.lock().expect("WAL file lock poisoned");
        let savepoint = guard.metadata()?.len();

        let mut buf = Vec::new();
        if recs.len() > 1 {
            encode_header(&mut buf, 0, recs.len() as u32, flags::BEGIN, &[]);
        }
        for rec in recs.iter_mut() {
            rec.set_lsn(self.seq.next_lsn());
            encode_header(
                &mut buf,
                store_id,
                rec.size() as u32,
                rec.flags(),
                rec.as_bytes(),
            );
            buf.extend_from_slice(rec.as_bytes());
        }

        let result = guard
            .write_all(&buf)
            .and_then(|_| if self.cfg.sync_on_write { guard.sync_all() } else { Ok(()) });
        if let Err(e) = result {
            warn!(lfsn = tail.lfsn, error = %e, "WAL append failed, truncating to savepoint");
            let _ = guard.set_len(savepoint);
            let _ = guard.seek(SeekFrom::Start(savepoint));
            return Err(WalError::Io(e));
        }
        // The mark moves under the file lock so GC's recheck can't miss
        // an in-flight append.
        tail.mark.fetch_add(recs.len() as u64, Ordering::AcqRel);
        drop(guard);

        trace!(
            lfsn = tail.lfsn,
            records = recs.len(),
            bytes = buf.len(),
            "WAL append"
        );

        if tail.mark() >= self.cfg.rotate_wm {
            self.rotate(&tail)?;
        }
        Ok(tail.lfsn)
    }

    /// Publishes a fresh tail file and marks `prior` complete.
    fn rotate(&self, prior: &Arc<LogFile>) -> Result<(), WalError> {
        let mut files = self.files.lock().expect("WAL file list lock poisoned");
        // Another appender may have rotated first.
        if files.last().map(|f| f.lfsn) != Some(prior.lfsn) {
            return Ok(());
        }
        if self.cfg.sync_on_rotate {
            prior
                .file
                .lock()
                .expect("WAL file lock poisoned")
                .sync_all()?;
        }
        let next = LogFile::create(&self.cfg.dir, self.seq.next_lfsn())?;
        prior.complete.store(true, Ordering::Release);
        info!(from = prior.lfsn, to = next.lfsn, "WAL rotated");
        files.push(Arc::new(next));
        Ok(())
    }

    /// Credits `n` persisted records to file `lfsn`.
    pub fn sweep(&self, lfsn: u64, n: u64) {
        let files = self.files.lock().expect("WAL file list lock poisoned");
        if let Some(f) = files.iter().find(|f| f.lfsn == lfsn) {
            f.sweep.fetch_add(n, Ordering::AcqRel);
        }
    }

    /// Unlinks complete files whose records are all persisted.
    ///
    /// Returns the number of files removed.
    pub fn gc(&self) -> Result<usize, WalError> {
        let mut files = self.files.lock().expect("WAL file list lock poisoned");
        let before = files.len();
        let mut kept = Vec::with_capacity(files.len());
        for f in files.drain(..) {
            // Recheck under the file lock: an in-flight append bumps the
            // mark before releasing it.
            let collectable = f.is_complete() && {
                let _guard = f.file.lock().expect("WAL file lock poisoned");
                f.sweep() >= f.mark()
            };
            if collectable {
                info!(lfsn = f.lfsn, path = %f.path.display(), "WAL file collected");
                fs::remove_file(&f.path)?;
            } else {
                kept.push(f);
            }
        }
        *files = kept;
        Ok(before - files.len())
    }

    /// Number of live log files.
    pub fn file_count(&self) -> usize {
        self.files.lock().expect("WAL file list lock poisoned").len()
    }

    /// Replays every file in LFSN order.
    ///
    /// `dispatch` receives `(lfsn, store_id, payload)` for each data
    /// record — the originating file's LFSN is the back-link installed on
    /// replayed records so sweep accounting keeps working. `BEGIN` groups
    /// are delivered as consecutive calls. Per-file mark counters are
    /// rebuilt from the replayed record counts so GC accounting survives
    /// restarts. Returns the number of records dispatched.
    pub fn replay<F>(&self, mut dispatch: F) -> Result<u64, WalError>
    where
        F: FnMut(u64, u32, &[u8]) -> Result<(), WalError>,
    {
        let files: Vec<Arc<LogFile>> = {
            let guard = self.files.lock().expect("WAL file list lock poisoned");
            guard.clone()
        };

        let mut dispatched = 0u64;
        for log in files {
            let count = self.replay_file(&log, &mut dispatch)?;
            log.mark.store(count, Ordering::Release);
            dispatched += count;
        }
        Ok(dispatched)
    }

    fn replay_file<F>(&self, log: &LogFile, dispatch: &mut F) -> Result<u64, WalError>
    where
        F: FnMut(u64, u32, &[u8]) -> Result<(), WalError>,
    {
        let guard = log.file.lock().expect("WAL file lock poisoned");
        let len = guard.metadata()?.len();
        if len < StorageVersion::SIZE as u64 {
            warn!(lfsn = log.lfsn, len, "WAL file shorter than magic, skipping");
            return Ok(0);
        }
        let mmap = unsafe { Mmap::map(&*guard)? };
        drop(guard);

        let version = StorageVersion::decode(&mmap[..StorageVersion::SIZE])
            .filter(StorageVersion::compatible)
            .ok_or_else(|| WalError::BadVersion(log.path.clone()))?;
        let _ = version;

        let mut offset = StorageVersion::SIZE;
        let mut count = 0u64;
        while offset < mmap.len() {
            let Some((header, payload)) = read_record(&mmap, offset) else {
                // Truncated tail: the footprint of a crash mid-append.
                warn!(
                    lfsn = log.lfsn,
                    offset, "WAL replay stopped at truncated tail record"
                );
                break;
            };
            if !header.crc_ok(payload) {
                return Err(WalError::ChecksumMismatch {
                    path: log.path.clone(),
                    offset,
                });
            }
            offset += RECORD_HEADER_SIZE + payload.len();

            if header.flags & flags::BEGIN != 0 {
                // Transaction group header; the batch follows.
                let batch = header.size as u64;
                let mut consumed = 0u64;
                while consumed < batch {
                    let Some((h, p)) = read_record(&mmap, offset) else {
                        warn!(
                            lfsn = log.lfsn,
                            offset, "WAL replay stopped inside a truncated batch"
                        );
                        return Ok(count);
                    };
                    if !h.crc_ok(p) {
                        return Err(WalError::ChecksumMismatch {
                            path: log.path.clone(),
                            offset,
                        });
                    }
                    dispatch(log.lfsn, h.store_id, p)?;
                    offset += RECORD_HEADER_SIZE + p.len();
                    consumed += 1;
                    count += 1;
                }
            } else {
                dispatch(log.lfsn, header.store_id, payload)?;
                count += 1;
            }
        }
        debug!(lfsn = log.lfsn, records = count, "WAL file replayed");
        Ok(count)
    }
}

// ------------------------------------------------------------------------------------------------
// Record header codec
// ------------------------------------------------------------------------------------------------

struct RecordHeader {
    crc: u32,
    store_id: u32,
    size: u32,
    flags: u8,
}

impl RecordHeader {
    fn crc_ok(&self, payload: &[u8]) -> bool {
        record_crc(self.store_id, self.size, self.flags, payload) == self.crc
    }
}

fn record_crc(store_id: u32, size: u32, rec_flags: u8, payload: &[u8]) -> u32 {
    let mut h = Crc32::new();
    h.update(&store_id.to_le_bytes());
    h.update(&size.to_le_bytes());
    h.update(&[rec_flags]);
    h.update(payload);
    h.finalize()
}

fn encode_header(buf: &mut Vec<u8>, store_id: u32, size: u32, rec_flags: u8, payload: &[u8]) {
    let crc = record_crc(store_id, size, rec_flags, payload);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(&store_id.to_le_bytes());
    buf.extend_from_slice(&size.to_le_bytes());
    buf.push(rec_flags);
}

/// Reads one record at `offset`; `None` when the file ends mid-record.
///
/// A `BEGIN` header owns no payload regardless of its `size` field (which
/// holds the batch record count).
fn read_record(mmap: &[u8], offset: usize) -> Option<(RecordHeader, &[u8])> {
    if offset + RECORD_HEADER_SIZE > mmap.len() {
        return None;
    }
    let h = &mmap[offset..offset + RECORD_HEADER_SIZE];
    let header = RecordHeader {
        crc: u32::from_le_bytes([h[0], h[1], h[2], h[3]]),
        store_id: u32::from_le_bytes([h[4], h[5], h[6], h[7]]),
        size: u32::from_le_bytes([h[8], h[9], h[10], h[11]]),
        flags: h[12],
    };
    let payload_len = if header.flags & flags::BEGIN != 0 {
        0
    } else {
        header.size as usize
    };
    let start = offset + RECORD_HEADER_SIZE;
    if start + payload_len > mmap.len() {
        return None;
    }
    Some((header, &mmap[start..start + payload_len]))
}
