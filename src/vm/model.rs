//! Data model for virtual machines and their disks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum number of disks a single VM may have (target devices
/// `sda`..`sdd`).
pub const MAX_DISKS: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskType {
    LocalLv,
    Drbd,
}

/// One virtual disk attached to a VM. `id` is the 1..=4 slot; `drbd` fields
/// are populated only when `disk_type == Drbd`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disk {
    pub id: u8,
    pub disk_type: DiskType,
    pub size_mb: u64,
    pub resource_name: Option<String>,
    pub minor: Option<u32>,
    pub port: Option<u16>,
}

impl Disk {
    /// libvirt target device name: disk 1 -> `sda`, 2 -> `sdb`, etc.
    pub fn target_device(&self) -> String {
        format!("sd{}", (b'a' + self.id - 1) as char)
    }

    /// LVM logical volume path for this disk under `vg`.
    pub fn lv_path(&self, vg: &str, vm_name: &str) -> String {
        format!("/dev/{vg}/mcvirt_vm-{vm_name}-disk-{}", self.id)
    }
}

/// `resource_name = mcvirt_vm-<vm>-disk-<id>`, unique via the `(vm, id)`
/// invariant.
pub fn drbd_resource_name(vm_name: &str, disk_id: u8) -> String {
    format!("mcvirt_vm-{vm_name}-disk-{disk_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Unlocked,
    Locked,
}

/// Per-VM JSON config: `{disks, network_interfaces, available_nodes, node,
/// lock_state}`. `node` is `None` when the VM is unregistered anywhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    pub name: String,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub disks: Vec<Disk>,
    /// MAC address -> network name.
    pub network_interfaces: BTreeMap<String, String>,
    pub available_nodes: Vec<String>,
    pub node: Option<String>,
    pub lock_state: LockState,
    pub boot_order: Vec<String>,
    pub attached_iso: Option<String>,
}

impl VmConfig {
    pub fn new(
        name: impl Into<String>,
        cpu_cores: u32,
        memory_mb: u64,
        available_nodes: Vec<String>,
        hostname: &str,
    ) -> Self {
        VmConfig {
            name: name.into(),
            cpu_cores,
            memory_mb,
            disks: Vec::new(),
            network_interfaces: BTreeMap::new(),
            available_nodes,
            node: Some(hostname.to_string()),
            lock_state: LockState::Unlocked,
            boot_order: vec!["hd".to_string()],
            attached_iso: None,
        }
    }

    pub fn is_registered_locally(&self, hostname: &str) -> bool {
        self.node.as_deref() == Some(hostname)
    }

    pub fn next_disk_id(&self) -> Option<u8> {
        let used: std::collections::HashSet<u8> = self.disks.iter().map(|d| d.id).collect();
        (1..=MAX_DISKS).find(|id| !used.contains(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_device_naming() {
        let d = Disk {
            id: 1,
            disk_type: DiskType::LocalLv,
            size_mb: 1024,
            resource_name: None,
            minor: None,
            port: None,
        };
        assert_eq!(d.target_device(), "sda");
        let d4 = Disk { id: 4, ..d };
        assert_eq!(d4.target_device(), "sdd");
    }

    #[test]
    fn fifth_disk_rejected() {
        let mut cfg = VmConfig::new("web", 1, 512, vec!["alpha".into()], "alpha");
        for id in 1..=MAX_DISKS {
            cfg.disks.push(Disk {
                id,
                disk_type: DiskType::LocalLv,
                size_mb: 1024,
                resource_name: None,
                minor: None,
                port: None,
            });
        }
        assert_eq!(cfg.next_disk_id(), None);
    }
}
