//! Process-wide configuration: a `config.toml` (or the path given via
//! `--config`) resolved once at startup into a typed [`AppConfig`].
//! Unset fields fall back to the literal defaults the original tooling
//! hard-codes, so a bare invocation against `/var/lib/mcvirt` works with no
//! config file at all.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_node_lock_path() -> PathBuf {
    PathBuf::from("/var/run/lock/mcvirt")
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("/var/lib/mcvirt")
}

fn default_vm_storage_vg() -> String {
    "mcvirt_vg".to_string()
}

fn default_known_hosts_path() -> PathBuf {
    PathBuf::from("/var/lib/mcvirt/known_hosts")
}

fn default_private_key_path() -> PathBuf {
    PathBuf::from("/root/.ssh/id_rsa")
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_lock_timeout_ms() -> u64 {
    crate::lock::DEFAULT_LOCK_TIMEOUT_MS
}

fn default_drbd_socket_path() -> PathBuf {
    PathBuf::from("/var/run/mcvirt/drbd.sock")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_worker_command() -> String {
    "mcvirtd --worker".to_string()
}

/// Typed view of `config.toml`. Every field has a default mirroring the
/// original's literal paths, so a partially-specified file only overrides
/// what it names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_node_lock_path")]
    pub node_lock_path: PathBuf,
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    #[serde(default = "default_vm_storage_vg")]
    pub vm_storage_vg: String,
    #[serde(default = "default_known_hosts_path")]
    pub known_hosts_path: PathBuf,
    #[serde(default = "default_private_key_path")]
    pub private_key_path: PathBuf,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_drbd_socket_path")]
    pub drbd_socket_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// The command a `RemoteChannel` runs on the remote end of the SSH
    /// session to start its worker/dispatcher loop.
    #[serde(default = "default_worker_command")]
    pub worker_command: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            host: default_host(),
            ssh_port: default_ssh_port(),
            node_lock_path: default_node_lock_path(),
            storage_root: default_storage_root(),
            vm_storage_vg: default_vm_storage_vg(),
            known_hosts_path: default_known_hosts_path(),
            private_key_path: default_private_key_path(),
            connect_timeout_ms: default_connect_timeout_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            drbd_socket_path: default_drbd_socket_path(),
            log_level: default_log_level(),
            worker_command: default_worker_command(),
        }
    }
}

impl AppConfig {
    /// Loads `path` if it exists, applying defaults for any field the file
    /// omits; returns the all-defaults config when `path` is absent.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(AppConfig::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: AppConfig = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    /// A config rooted entirely under `dir`, for tests: every on-disk path
    /// (node lock, storage root, known hosts) is confined to the temp
    /// directory instead of the real `/var/lib/mcvirt`.
    pub fn for_test(dir: &Path) -> Self {
        AppConfig {
            node_lock_path: dir.join("node.lock"),
            storage_root: dir.join("storage"),
            known_hosts_path: dir.join("known_hosts"),
            private_key_path: dir.join("id_rsa"),
            drbd_socket_path: dir.join("drbd.sock"),
            ..AppConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let cfg = AppConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(cfg.vm_storage_vg, "mcvirt_vg");
        assert_eq!(cfg.ssh_port, 22);
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "vm_storage_vg = \"custom_vg\"\n").unwrap();
        let cfg = AppConfig::load(&path).unwrap();
        assert_eq!(cfg.vm_storage_vg, "custom_vg");
        assert_eq!(cfg.ssh_port, 22);
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn for_test_confines_paths_under_dir() {
        let dir = tempdir().unwrap();
        let cfg = AppConfig::for_test(dir.path());
        assert!(cfg.storage_root.starts_with(dir.path()));
        assert!(cfg.node_lock_path.starts_with(dir.path()));
    }
}
