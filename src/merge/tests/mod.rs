mod tests_write;

use std::sync::Arc;

use crate::memindex::{MemIndex, VersionedRecord};
use crate::record::{FieldDesc, FieldKind, Record, Scheme, flags};

pub(super) fn scheme() -> Scheme {
    Scheme::new(vec![
        FieldDesc::key("k", FieldKind::String, 0),
        FieldDesc::value("v", FieldKind::String),
    ])
    .unwrap()
}

pub(super) fn rec(scheme: &Scheme, key: &[u8], value: &[u8], rec_flags: u8, lsn: u64) -> Record {
    Record::build(scheme, &[key, value], rec_flags, lsn).unwrap()
}

pub(super) fn insert(
    scheme: &Scheme,
    idx: &mut MemIndex,
    key: &[u8],
    value: &[u8],
    rec_flags: u8,
    lsn: u64,
) {
    let r = rec(scheme, key, value, rec_flags, lsn);
    let ik = scheme.index_key(&r);
    idx.insert(
        ik,
        VersionedRecord {
            rec: Arc::new(r),
            lfsn: 0,
        },
    );
}

pub(super) fn concat_upsert() -> crate::merge::UpsertFn {
    Arc::new(|scheme, base, operand| {
        let mut v = match base {
            Some(b) => b
                .field(scheme, 1)
                .map_err(|e| e.to_string())?
                .to_vec(),
            None => Vec::new(),
        };
        v.extend_from_slice(operand.field(scheme, 1).map_err(|e| e.to_string())?);
        let key = operand.field(scheme, 0).map_err(|e| e.to_string())?;
        Record::build(scheme, &[key, &v], flags::NONE, 0).map_err(|e| e.to_string())
    })
}
