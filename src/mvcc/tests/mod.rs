
use std::sync::Arc;

use crate::mvcc::TxManager;
use crate::record::{FieldDesc, FieldKind, Record, Scheme, flags};
use crate::sequencer::Sequencer;

pub(super) fn scheme() -> Scheme {
    Scheme::new(vec![
        FieldDesc::key("k", FieldKind::String, 0),
        FieldDesc::value("v", FieldKind::String),
    ])
    .unwrap()
}

pub(super) fn manager() -> (TxManager, Arc<Sequencer>) {
    let seq = Arc::new(Sequencer::new());
    (TxManager::new(Arc::clone(&seq)), seq)
}

pub(super) fn rec(scheme: &Scheme, key: &[u8], value: &[u8], rec_flags: u8) -> Record {
    Record::build(scheme, &[key, value], rec_flags, 0).unwrap()
}

pub(super) fn ik(scheme: &Scheme, key: &[u8]) -> Vec<u8> {
    let probe = scheme.key_record(&[key]).unwrap();
    scheme.index_key(&probe)
}
