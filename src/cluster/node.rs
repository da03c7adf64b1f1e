//! Cluster membership data model: `Node` and `ClusterConfig`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A cluster member identified by a stable hostname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub ip_address: String,
    pub public_key: String,
}

/// DRBD global configuration, present only once `drbd.enable` has succeeded
/// on every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrbdGlobalConfig {
    pub enabled: bool,
    pub secret: String,
    pub sync_rate: String,
    pub protocol: String,
}

impl Default for DrbdGlobalConfig {
    fn default() -> Self {
        DrbdGlobalConfig {
            enabled: false,
            secret: String::new(),
            sync_rate: "10M".to_string(),
            protocol: "C".to_string(),
        }
    }
}

/// A single node-local libvirt network definition, referenced by NIC attach
/// operations via `nics: {mac: network_name}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    pub physical_interface: String,
}

/// One audit entry recorded by `ConfigStore::update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub message: String,
}

/// Maximum number of audit entries retained in the on-disk config; oldest
/// evicted first once the bound is hit.
pub const AUDIT_LOG_CAP: usize = 200;

/// The current on-disk schema version. `ConfigStore::upgrade` runs ordered
/// migrations from whatever version is found on disk up to this one.
pub const CURRENT_VERSION: u32 = 2;

/// Per-node cluster-wide configuration document: `{version, cluster: {nodes,
/// cluster_ip}, vm_storage_vg, drbd}`, plus the bounded audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub version: u32,
    pub hostname: String,
    pub cluster_ip: String,
    pub nodes: BTreeMap<String, Node>,
    pub vm_storage_vg: String,
    pub drbd: DrbdGlobalConfig,
    pub networks: BTreeMap<String, Network>,
    #[serde(default)]
    pub audit_log: Vec<AuditEntry>,
}

impl ClusterConfig {
    /// A fresh configuration for a brand-new node, starting at the current
    /// schema version directly (no migrations needed).
    pub fn fresh(hostname: impl Into<String>, cluster_ip: impl Into<String>) -> Self {
        ClusterConfig {
            version: CURRENT_VERSION,
            hostname: hostname.into(),
            cluster_ip: cluster_ip.into(),
            nodes: BTreeMap::new(),
            vm_storage_vg: "mcvirt_vg".to_string(),
            drbd: DrbdGlobalConfig::default(),
            networks: BTreeMap::new(),
            audit_log: Vec::new(),
        }
    }

    /// The set of peer node names (excluding the local hostname).
    pub fn peer_names(&self) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|n| n.as_str() != self.hostname)
            .cloned()
            .collect()
    }

    pub fn push_audit(&mut self, message: impl Into<String>) {
        self.audit_log.push(AuditEntry {
            timestamp: chrono::Utc::now(),
            message: message.into(),
        });
        while self.audit_log.len() > AUDIT_LOG_CAP {
            self.audit_log.remove(0);
        }
    }
}
