//! Node-local known-hosts file: one `hostname ssh-ed25519 base64key` line
//! per trusted peer.
//!
//! Loaded by default on every connect; a one-shot `save_hostkey` mode (used
//! only by the add-node handshake) accepts whatever key the peer presents
//! and appends it once the handshake completes.

use crate::error::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone)]
pub struct KnownHosts {
    path: PathBuf,
    entries: HashMap<String, String>,
}

impl KnownHosts {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut entries = HashMap::new();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            for line in raw.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((host, rest)) = line.split_once(' ') {
                    entries.insert(host.to_string(), rest.to_string());
                }
            }
        }
        Ok(KnownHosts { path, entries })
    }

    /// Returns `true` if `host` has a recorded key matching `key_line`
    /// (`"ssh-ed25519 base64key"`).
    pub fn verify(&self, host: &str, key_line: &str) -> bool {
        self.entries.get(host).map(|k| k.as_str()) == Some(key_line)
    }

    pub fn is_known(&self, host: &str) -> bool {
        self.entries.contains_key(host)
    }

    /// Appends (or replaces) the entry for `host`, persisting the file.
    /// Used only by the add-node handshake's `save_hostkey` mode.
    pub fn trust(&mut self, host: &str, key_line: &str) -> Result<()> {
        self.entries.insert(host.to_string(), key_line.to_string());
        self.persist()?;
        info!(%host, "persisted new host key");
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut buf = String::new();
        for (host, key) in &self.entries {
            buf.push_str(host);
            buf.push(' ');
            buf.push_str(key);
            buf.push('\n');
        }
        std::fs::write(&self.path, buf)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn unknown_host_is_not_verified() {
        let dir = tempdir().unwrap();
        let kh = KnownHosts::load(dir.path().join("known_hosts")).unwrap();
        assert!(!kh.is_known("beta"));
        assert!(!kh.verify("beta", "ssh-ed25519 AAAA"));
    }

    #[test]
    fn trust_then_verify_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let mut kh = KnownHosts::load(&path).unwrap();
        kh.trust("beta", "ssh-ed25519 AAAA").unwrap();
        assert!(kh.verify("beta", "ssh-ed25519 AAAA"));

        let reloaded = KnownHosts::load(&path).unwrap();
        assert!(reloaded.verify("beta", "ssh-ed25519 AAAA"));
    }
}
