//! Process-wide monotonic counter group.
//!
//! All engine-wide sequence numbers live behind one lock: LSN (per record),
//! TSN (per transaction), NSN (per node), BSN (per backup), DSN (per
//! store), LFSN (per WAL file). Recovery bumps each counter past the
//! maximum it observed on disk, which is what keeps them strictly monotone
//! across restarts.

use std::sync::Mutex;

#[derive(Debug, Default)]
struct Counters {
    lsn: u64,
    tsn: u64,
    nsn: u64,
    bsn: u64,
    dsn: u64,
    lfsn: u64,
}

/// The shared counter group.
#[derive(Debug, Default)]
pub struct Sequencer {
    inner: Mutex<Counters>,
}

macro_rules! counter {
    ($next:ident, $peek:ident, $bump:ident, $field:ident) => {
        /// Allocates the next value of this counter.
        pub fn $next(&self) -> u64 {
            let mut c = self.inner.lock().expect("sequencer lock poisoned");
            c.$field += 1;
            c.$field
        }

        /// Reads the last allocated value without advancing.
        pub fn $peek(&self) -> u64 {
            self.inner.lock().expect("sequencer lock poisoned").$field
        }

        /// Raises the counter to at least `v`.
        pub fn $bump(&self, v: u64) {
            let mut c = self.inner.lock().expect("sequencer lock poisoned");
            if c.$field < v {
                c.$field = v;
            }
        }
    };
}

impl Sequencer {
    /// Creates a zeroed counter group.
    pub fn new() -> Self {
        Self::default()
    }

    counter!(next_lsn, lsn, bump_lsn, lsn);
    counter!(next_tsn, tsn, bump_tsn, tsn);
    counter!(next_nsn, nsn, bump_nsn, nsn);
    counter!(next_bsn, bsn, bump_bsn, bsn);
    counter!(next_dsn, dsn, bump_dsn, dsn);
    counter!(next_lfsn, lfsn, bump_lfsn, lfsn);
}

#[cfg(test)]
mod tests {
    use super::Sequencer;

    #[test]
    fn test_counters_are_independent_and_monotone() {
        let seq = Sequencer::new();
        assert_eq!(seq.next_lsn(), 1);
        assert_eq!(seq.next_lsn(), 2);
        assert_eq!(seq.next_tsn(), 1);
        assert_eq!(seq.lsn(), 2);
        assert_eq!(seq.tsn(), 1);
        assert_eq!(seq.nsn(), 0);
    }

    #[test]
    fn test_bump_only_raises() {
        let seq = Sequencer::new();
        seq.bump_lsn(10);
        assert_eq!(seq.lsn(), 10);
        seq.bump_lsn(5);
        assert_eq!(seq.lsn(), 10);
        assert_eq!(seq.next_lsn(), 11);
    }

    #[test]
    fn test_shared_across_threads() {
        use std::sync::Arc;
        let seq = Arc::new(Sequencer::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let seq = Arc::clone(&seq);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    seq.next_lsn();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(seq.lsn(), 4000);
    }
}
