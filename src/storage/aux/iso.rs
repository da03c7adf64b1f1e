//! ISO management: attach/detach/list/delete against files already present
//! under the node's ISO storage directory. Download/copy-from-URL is an
//! explicit Non-goal; `add` only registers a file already on disk.

use crate::cluster::store::ConfigStore;
use crate::error::{McVirtError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iso {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Clone)]
pub struct IsoStore {
    dir: PathBuf,
}

impl IsoStore {
    pub fn new(storage_root: PathBuf, hostname: String) -> Self {
        IsoStore {
            dir: storage_root.join(hostname).join("iso"),
        }
    }

    pub fn list(&self) -> Result<Vec<Iso>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut isos = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                isos.push(Iso {
                    name: entry.file_name().to_string_lossy().to_string(),
                    path: entry.path(),
                });
            }
        }
        isos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(isos)
    }

    /// Registers a file already present at `source_path` as ISO `name` by
    /// moving it into the ISO storage directory. Fails if an ISO of that
    /// name already exists.
    pub fn add(&self, name: &str, source_path: &std::path::Path) -> Result<Iso> {
        std::fs::create_dir_all(&self.dir)?;
        let dest = self.dir.join(name);
        if dest.exists() {
            return Err(McVirtError::IsoAlreadyExists(name.to_string()));
        }
        std::fs::rename(source_path, &dest)?;
        Ok(Iso {
            name: name.to_string(),
            path: dest,
        })
    }

    /// Deletes ISO `name`, blocked while `in_use(name, config_store)`
    /// reports a VM using it.
    pub fn delete(&self, name: &str, config_store: &ConfigStore) -> Result<()> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Err(McVirtError::IsoMissing(name.to_string()));
        }
        if let Some(vm_name) = self.in_use(name, config_store)? {
            return Err(McVirtError::IsoInUse(name.to_string(), vm_name));
        }
        std::fs::remove_file(path)?;
        Ok(())
    }

    /// Resolves the Open Question from the original source's `inUse`:
    /// returns the name of the VM whose disk drive's currently attached
    /// ISO path matches `name`, scanning every VM this node hosts.
    pub fn in_use(&self, name: &str, config_store: &ConfigStore) -> Result<Option<String>> {
        let snapshot = config_store.snapshot();
        let vm_dir = self
            .dir
            .parent()
            .map(|p| p.join("vm"))
            .unwrap_or_default();
        if !vm_dir.exists() {
            return Ok(None);
        }
        let candidate_path = self.dir.join(name);
        for entry in std::fs::read_dir(&vm_dir)? {
            let entry = entry?;
            let config_path = entry.path().join("config.json");
            if !config_path.exists() {
                continue;
            }
            let raw = std::fs::read_to_string(&config_path)?;
            let config: crate::vm::model::VmConfig = serde_json::from_str(&raw)?;
            if let Some(attached) = &config.attached_iso {
                if PathBuf::from(attached) == candidate_path {
                    return Ok(Some(config.name));
                }
            }
        }
        let _ = snapshot;
        Ok(None)
    }
}

pub mod handlers {
    use super::*;
    use crate::dispatcher::context::WorkerContext;
    use serde_json::Value;

    pub async fn list(ctx: &WorkerContext) -> Result<Value> {
        Ok(serde_json::to_value(ctx.services.iso_store.list()?)?)
    }

    pub async fn add(args: Value, ctx: &WorkerContext) -> Result<Value> {
        let name = args
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| McVirtError::Internal("missing argument 'name'".to_string()))?;
        let source_path = args
            .get("source_path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| McVirtError::Internal("missing argument 'source_path'".to_string()))?;
        let iso = ctx
            .services
            .iso_store
            .add(name, std::path::Path::new(source_path))?;
        Ok(serde_json::to_value(iso)?)
    }

    pub async fn delete(args: Value, ctx: &WorkerContext) -> Result<Value> {
        let name = args
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| McVirtError::Internal("missing argument 'name'".to_string()))?;
        ctx.services
            .iso_store
            .delete(name, &ctx.services.config_store)?;
        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn add_then_list_then_delete() {
        let dir = tempdir().unwrap();
        let store = IsoStore::new(dir.path().to_path_buf(), "alpha".to_string());
        let source = dir.path().join("ubuntu.iso");
        std::fs::write(&source, b"fake iso contents").unwrap();

        store.add("ubuntu.iso", &source).unwrap();
        assert_eq!(store.list().unwrap().len(), 1);

        let config_store =
            ConfigStore::open(dir.path().join("cfg.json"), "alpha", "10.0.0.1").unwrap();
        store.delete("ubuntu.iso", &config_store).unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn duplicate_add_rejected() {
        let dir = tempdir().unwrap();
        let store = IsoStore::new(dir.path().to_path_buf(), "alpha".to_string());
        let source1 = dir.path().join("a.iso");
        std::fs::write(&source1, b"1").unwrap();
        store.add("shared.iso", &source1).unwrap();

        let source2 = dir.path().join("b.iso");
        std::fs::write(&source2, b"2").unwrap();
        assert!(store.add("shared.iso", &source2).is_err());
    }
}
