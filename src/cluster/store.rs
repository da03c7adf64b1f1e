//! The Config Store: atomic read/update of the per-node JSON cluster
//! configuration, with versioned upgrades.
//!
//! `update` is serialised by the Node Lock at a higher layer (the
//! coordinator holds the lock for the duration of a command), so this type
//! does not itself need cross-process synchronisation — it only needs to
//! guarantee that no partial write is ever observable, which it gets from
//! the write-to-temp-then-rename pattern the teacher crate uses for its own
//! durable snapshots.

use crate::cluster::node::{ClusterConfig, CURRENT_VERSION};
use crate::error::{McVirtError, Result};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Migration functions are numbered and applied in order; each must be
/// idempotent so that re-running `upgrade()` on an already-current file is
/// a no-op.
type Migration = fn(&mut serde_json::Value);

/// Ordered list of `(from_version, migration_fn)`. `migrate_v1_to_v2` adds
/// the `networks` map and `audit_log` fields that version 1 documents
/// predate.
const MIGRATIONS: &[(u32, Migration)] = &[(1, migrate_v1_to_v2)];

fn migrate_v1_to_v2(doc: &mut serde_json::Value) {
    if let Some(obj) = doc.as_object_mut() {
        obj.entry("networks")
            .or_insert_with(|| serde_json::json!({}));
        obj.entry("audit_log")
            .or_insert_with(|| serde_json::json!([]));
        obj.insert("version".to_string(), serde_json::json!(2));
    }
}

/// File-backed JSON document holding one node's view of the cluster
/// configuration. Cheap to clone (wraps an `Arc<RwLock<_>>`); every clone
/// shares the same backing file and in-memory cache.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    cache: Arc<RwLock<ClusterConfig>>,
}

impl ConfigStore {
    /// Opens (creating if absent) the config file at `path`, running any
    /// pending migrations. A fresh file is created directly at
    /// `CURRENT_VERSION` using `hostname`/`cluster_ip` as seed values.
    pub fn open(path: impl AsRef<Path>, hostname: &str, cluster_ip: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let config = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let mut doc: serde_json::Value = serde_json::from_str(&raw)?;
            Self::run_migrations(&mut doc)?;
            serde_json::from_value(doc)?
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let fresh = ClusterConfig::fresh(hostname, cluster_ip);
            let store = ConfigStore {
                path: path.clone(),
                cache: Arc::new(RwLock::new(fresh.clone())),
            };
            store.write_atomic(&fresh)?;
            return Ok(store);
        };
        Ok(ConfigStore {
            path,
            cache: Arc::new(RwLock::new(config)),
        })
    }

    /// Runs every migration whose recorded `from_version` is >= the
    /// document's current version, in ascending order, until the document
    /// reaches `CURRENT_VERSION`.
    fn run_migrations(doc: &mut serde_json::Value) -> Result<()> {
        let mut version = doc
            .get("version")
            .and_then(|v| v.as_u64())
            .unwrap_or(1) as u32;
        while version < CURRENT_VERSION {
            let Some((_, migration)) = MIGRATIONS.iter().find(|(from, _)| *from == version) else {
                break;
            };
            migration(doc);
            let new_version = doc
                .get("version")
                .and_then(|v| v.as_u64())
                .unwrap_or((version + 1) as u64) as u32;
            debug!(from = version, to = new_version, "ran config migration");
            version = new_version;
        }
        Ok(())
    }

    /// Returns a cheap clone of the current in-memory configuration,
    /// without taking any lock beyond the read guard — used for read-only
    /// queries that must not pay the cost of the Node Lock.
    pub fn snapshot(&self) -> ClusterConfig {
        self.cache.read().clone()
    }

    pub fn read(&self) -> ClusterConfig {
        self.snapshot()
    }

    /// Applies `f` to an in-memory copy of the configuration, persists the
    /// result atomically, appends an audit entry, and updates the cache.
    /// Callers are expected to hold the Node Lock for the duration of this
    /// call; `ConfigStore` itself performs no cross-process locking.
    pub fn update<F>(&self, audit_message: impl Into<String>, f: F) -> Result<ClusterConfig>
    where
        F: FnOnce(&mut ClusterConfig) -> Result<()>,
    {
        let mut next = self.cache.read().clone();
        f(&mut next)?;
        next.push_audit(audit_message);
        self.write_atomic(&next)?;
        *self.cache.write() = next.clone();
        Ok(next)
    }

    fn write_atomic(&self, config: &ClusterConfig) -> Result<()> {
        let serialized = serde_json::to_string_pretty(config)?;
        let tmp_path = self.path.with_extension(format!(
            "tmp.{}",
            rand::random::<u32>()
        ));
        std::fs::write(&tmp_path, serialized)?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            McVirtError::Internal(format!(
                "failed to atomically replace config at {}: {e}",
                self.path.display()
            ))
        })?;
        info!(path = %self.path.display(), "wrote cluster config");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fresh_store_starts_at_current_version() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path().join("config.json"), "alpha", "10.0.0.1").unwrap();
        assert_eq!(store.read().version, CURRENT_VERSION);
        assert_eq!(store.read().hostname, "alpha");
    }

    #[test]
    fn update_persists_and_is_visible_on_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::open(&path, "alpha", "10.0.0.1").unwrap();
        store
            .update("add node beta", |cfg| {
                cfg.nodes.insert(
                    "beta".to_string(),
                    crate::cluster::node::Node {
                        name: "beta".to_string(),
                        ip_address: "10.0.0.2".to_string(),
                        public_key: "ssh-ed25519 AAAA".to_string(),
                    },
                );
                Ok(())
            })
            .unwrap();

        let reopened = ConfigStore::open(&path, "alpha", "10.0.0.1").unwrap();
        assert!(reopened.read().nodes.contains_key("beta"));
        assert_eq!(reopened.read().audit_log.len(), 1);
    }

    #[test]
    fn update_rolls_back_on_validation_error() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path().join("config.json"), "alpha", "10.0.0.1").unwrap();
        let result = store.update("bad update", |_cfg| {
            Err(McVirtError::Internal("boom".to_string()))
        });
        assert!(result.is_err());
        assert!(store.read().audit_log.is_empty());
    }

    #[test]
    fn migration_from_v1_adds_networks_and_audit_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let v1_doc = serde_json::json!({
            "version": 1,
            "hostname": "alpha",
            "cluster_ip": "10.0.0.1",
            "nodes": {},
            "vm_storage_vg": "mcvirt_vg",
            "drbd": {"enabled": false, "secret": "", "sync_rate": "10M", "protocol": "C"},
        });
        std::fs::write(&path, serde_json::to_string(&v1_doc).unwrap()).unwrap();

        let store = ConfigStore::open(&path, "alpha", "10.0.0.1").unwrap();
        assert_eq!(store.read().version, CURRENT_VERSION);
        assert!(store.read().networks.is_empty());
        assert!(store.read().audit_log.is_empty());
    }

    #[test]
    fn audit_log_is_capped() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path().join("config.json"), "alpha", "10.0.0.1").unwrap();
        for i in 0..(crate::cluster::node::AUDIT_LOG_CAP + 10) {
            store.update(format!("entry {i}"), |_| Ok(())).unwrap();
        }
        assert_eq!(
            store.read().audit_log.len(),
            crate::cluster::node::AUDIT_LOG_CAP
        );
    }
}
