mod tests_gc;
mod tests_replay;

use std::path::Path;
use std::sync::Arc;

use crate::record::{FieldDesc, FieldKind, Record, Scheme, flags};
use crate::sequencer::Sequencer;
use crate::wal::{Wal, WalConfig};

pub(super) fn scheme() -> Scheme {
    Scheme::new(vec![
        FieldDesc::key("k", FieldKind::String, 0),
        FieldDesc::value("v", FieldKind::String),
    ])
    .unwrap()
}

pub(super) fn open(dir: &Path, rotate_wm: u64) -> (Wal, Arc<Sequencer>) {
    let seq = Arc::new(Sequencer::new());
    let wal = Wal::open(
        WalConfig {
            dir: dir.to_path_buf(),
            sync_on_write: true,
            sync_on_rotate: false,
            rotate_wm,
        },
        Arc::clone(&seq),
    )
    .unwrap();
    (wal, seq)
}

pub(super) fn rec(scheme: &Scheme, key: &[u8], value: &[u8]) -> Record {
    Record::build(scheme, &[key, value], flags::NONE, 0).unwrap()
}
