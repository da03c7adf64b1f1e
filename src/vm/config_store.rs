//! Per-VM JSON configuration file: `<storage_root>/<hostname>/vm/<name>/config.json`.

use crate::error::{McVirtError, Result};
use crate::util::write_atomic_json;
use crate::vm::model::VmConfig;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct VmConfigStore {
    dir: PathBuf,
}

impl VmConfigStore {
    pub fn new(storage_root: impl AsRef<Path>, hostname: &str, vm_name: &str) -> Self {
        VmConfigStore {
            dir: storage_root.as_ref().join(hostname).join("vm").join(vm_name),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join("config.json")
    }

    pub fn exists(&self) -> bool {
        self.config_path().exists()
    }

    pub fn create_dir(&self) -> Result<()> {
        if self.dir.exists() {
            return Err(McVirtError::VMExists(
                self.dir
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default(),
            ));
        }
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    pub fn remove_dir(&self) -> Result<()> {
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }

    pub fn write(&self, config: &VmConfig) -> Result<()> {
        write_atomic_json(&self.config_path(), config)
    }

    pub fn read(&self) -> Result<VmConfig> {
        let raw = std::fs::read_to_string(self.config_path())?;
        Ok(serde_json::from_str(&raw)?)
    }
}
