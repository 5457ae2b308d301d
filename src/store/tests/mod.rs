mod tests_basic;

use std::path::Path;
use std::sync::Arc;

use crate::merge::UpsertFn;
use crate::record::{FieldDesc, FieldKind, Record, Scheme, flags};
use crate::store::{Repo, RepoConfig};

pub(super) fn init_tracing() {
    use tracing_subscriber::fmt::Subscriber;
    let _ = Subscriber::builder()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Small, fully-synchronous config: no background workers, tiny pages.
/// Crashes are simulated by dropping the repository, so per-commit fsync
/// is skipped for speed.
pub(super) fn test_config(path: &Path) -> RepoConfig {
    let mut cfg = RepoConfig::new(path);
    cfg.workers = 0;
    cfg.page_size = 256;
    cfg.node_size = 1 << 20;
    cfg.rotate_wm = 64;
    cfg.sync_on_write = false;
    cfg
}

pub(super) fn kv_scheme() -> Scheme {
    Scheme::new(vec![
        FieldDesc::key("k", FieldKind::String, 0),
        FieldDesc::value("v", FieldKind::String),
    ])
    .unwrap()
}

pub(super) fn open_kv(path: &Path) -> (Repo, Arc<crate::store::Store>) {
    let repo = Repo::open(test_config(path)).unwrap();
    let store = match repo.store("s") {
        Ok(s) => s,
        Err(_) => repo.create_store("s", kv_scheme()).unwrap(),
    };
    (repo, store)
}

/// `concat(a, b) = a || b` over the value field.
pub(super) fn concat_upsert() -> UpsertFn {
    Arc::new(|scheme, base, operand| {
        let mut v = match base {
            Some(b) => b.field(scheme, 1).map_err(|e| e.to_string())?.to_vec(),
            None => Vec::new(),
        };
        v.extend_from_slice(operand.field(scheme, 1).map_err(|e| e.to_string())?);
        let key = operand.field(scheme, 0).map_err(|e| e.to_string())?;
        Record::build(scheme, &[key, &v], flags::NONE, 0).map_err(|e| e.to_string())
    })
}
