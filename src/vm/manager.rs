//! VM Manager: create/register/unregister/start/stop, owning libvirt XML
//! edits and the per-VM JSON config.

use crate::cluster::store::ConfigStore;
use crate::error::{McVirtError, Result};
use crate::libvirt_client::{DomainState, LibvirtClient};
use crate::system;
use crate::util::validate_name;
use crate::vm::config_store::VmConfigStore;
use crate::vm::model::{Disk, DiskType, LockState, VmConfig, MAX_DISKS};
use crate::vm::xml::render_domain_xml;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct VmManager {
    hostname: String,
    storage_root: PathBuf,
    config_store: ConfigStore,
    libvirt: Arc<dyn LibvirtClient>,
}

/// Read-only VM summary returned by `get_info`/`list_vms`, analogous to the
/// original's table-rendered `listVms`/`getInfo` output re-expressed as
/// structured data (table rendering itself is the CLI's job, out of scope
/// here).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VmInfo {
    pub name: String,
    pub state: String,
    pub node: Option<String>,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub disks: Vec<Disk>,
    pub network_interfaces: BTreeMap<String, String>,
    pub available_nodes: Vec<String>,
}

impl VmManager {
    pub fn new(
        hostname: String,
        storage_root: PathBuf,
        config_store: ConfigStore,
        libvirt: Arc<dyn LibvirtClient>,
    ) -> Self {
        VmManager {
            hostname,
            storage_root,
            config_store,
            libvirt,
        }
    }

    fn vm_store(&self, name: &str) -> VmConfigStore {
        VmConfigStore::new(&self.storage_root, &self.hostname, name)
    }

    fn vg(&self) -> String {
        self.config_store.snapshot().vm_storage_vg
    }

    /// Creates a new VM: validates the name, rejects a pre-existing
    /// libvirt domain or storage directory, writes a fresh per-VM config,
    /// and defines the (disk-less) domain. Any failure after the storage
    /// directory is created is compensated by removing it.
    pub async fn create(
        &self,
        name: &str,
        cpu_cores: u32,
        memory_mb: u64,
        available_nodes: Vec<String>,
    ) -> Result<VmConfig> {
        validate_name(name)?;
        if self.libvirt.domain_exists(name).await? {
            return Err(McVirtError::VMExists(name.to_string()));
        }
        let store = self.vm_store(name);
        store.create_dir()?;

        let config = VmConfig::new(name, cpu_cores, memory_mb, available_nodes, &self.hostname);
        if let Err(e) = store.write(&config) {
            let _ = store.remove_dir();
            return Err(e);
        }

        let xml = match render_domain_xml(&config, &self.vg()) {
            Ok(xml) => xml,
            Err(e) => {
                let _ = store.remove_dir();
                return Err(e);
            }
        };
        if let Err(e) = self.libvirt.define_xml(name, xml).await {
            let _ = store.remove_dir();
            return Err(e);
        }

        self.config_store.update(format!("created VM {name}"), |cfg| {
            cfg.push_audit(format!("vm-create {name}"));
            Ok(())
        })?;

        info!(vm = name, "VM created");
        Ok(config)
    }

    /// Deletes a VM: forbidden while running. Each disk is torn down by its
    /// own driver (DRBD resources are torn down by the caller, who owns the
    /// `DrbdDriver` handle, before calling this — see the coordinator's
    /// delete-VM compensation table), the domain is undefined, and the
    /// storage directory is optionally removed.
    pub async fn delete(&self, name: &str, remove_data: bool) -> Result<()> {
        if let Ok(DomainState::Running) = self.libvirt.state(name).await {
            return Err(McVirtError::VMRunning(name.to_string()));
        }
        let store = self.vm_store(name);
        if !store.exists() {
            return Err(McVirtError::VMMissing(name.to_string()));
        }
        self.libvirt.undefine(name).await?;
        if remove_data {
            store.remove_dir()?;
        }
        self.config_store
            .update(format!("deleted VM {name}"), |cfg| {
                cfg.push_audit(format!("vm-delete {name} remove_data={remove_data}"));
                Ok(())
            })?;
        info!(vm = name, remove_data, "VM deleted");
        Ok(())
    }

    /// Defines the libvirt domain on the current node and sets
    /// `current_node = hostname`.
    pub async fn register(&self, name: &str) -> Result<()> {
        let store = self.vm_store(name);
        let mut config = store.read()?;
        if !config.available_nodes.iter().any(|n| n == &self.hostname) {
            return Err(McVirtError::PermissionDenied(format!(
                "{} is not an available node for {name}",
                self.hostname
            )));
        }
        let xml = render_domain_xml(&config, &self.vg())?;
        self.libvirt.define_xml(name, xml).await?;
        config.node = Some(self.hostname.clone());
        store.write(&config)?;
        Ok(())
    }

    /// Undefines the libvirt domain on the current node and sets
    /// `current_node = null`.
    pub async fn unregister(&self, name: &str) -> Result<()> {
        if let Ok(DomainState::Running) = self.libvirt.state(name).await {
            return Err(McVirtError::VMRunning(name.to_string()));
        }
        let store = self.vm_store(name);
        let mut config = store.read()?;
        self.libvirt.undefine(name).await?;
        config.node = None;
        store.write(&config)?;
        Ok(())
    }

    /// A pure peer notification fixing `current_node` on a node that did
    /// not itself perform the register/unregister, reflecting a transfer
    /// initiated elsewhere.
    pub fn set_node(&self, name: &str, node: Option<String>) -> Result<()> {
        let store = self.vm_store(name);
        let mut config = store.read()?;
        if let Some(ref n) = node {
            if !config.available_nodes.iter().any(|a| a == n) {
                return Err(McVirtError::Internal(format!(
                    "{n} is not in available_nodes for {name}"
                )));
            }
        }
        config.node = node;
        store.write(&config)
    }

    /// Requires `CHANGE_VM_POWER_STATE`; rejects if already running.
    /// Local-only — does not fan out.
    pub async fn start(&self, name: &str) -> Result<()> {
        self.libvirt.start(name).await
    }

    /// Rejects if already stopped. Local-only — does not fan out.
    pub async fn stop(&self, name: &str) -> Result<()> {
        self.libvirt.stop(name).await
    }

    pub async fn get_state(&self, name: &str) -> Result<DomainState> {
        self.libvirt.state(name).await
    }

    pub async fn get_info(&self, name: &str) -> Result<VmInfo> {
        let config = self.vm_store(name).read()?;
        let state = self
            .libvirt
            .state(name)
            .await
            .map(|s| format!("{s:?}"))
            .unwrap_or_else(|_| "unregistered".to_string());
        Ok(VmInfo {
            name: config.name,
            state,
            node: config.node,
            cpu_cores: config.cpu_cores,
            memory_mb: config.memory_mb,
            disks: config.disks,
            network_interfaces: config.network_interfaces,
            available_nodes: config.available_nodes,
        })
    }

    /// Read-only query over every VM this node knows about (its own
    /// storage directory listing), not gated by the Node Lock.
    pub fn list_vm_names(&self) -> Result<Vec<String>> {
        let vm_dir = self.storage_root.join(&self.hostname).join("vm");
        if !vm_dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(vm_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// `editConfig`: mutates the in-memory `VmConfig` via `f`, persists it,
    /// and re-renders + redefines the domain XML from the new state. Every
    /// device-edit operation in this module is built on top of this
    /// primitive, which is idempotent given the same target state because
    /// rendering is a pure function of `VmConfig`.
    async fn edit_config<F>(&self, name: &str, f: F) -> Result<VmConfig>
    where
        F: FnOnce(&mut VmConfig) -> Result<()>,
    {
        let store = self.vm_store(name);
        let mut config = store.read()?;
        f(&mut config)?;
        let xml = render_domain_xml(&config, &self.vg())?;
        self.libvirt.define_xml(name, xml).await?;
        store.write(&config)?;
        Ok(config)
    }

    /// Allocates the next free disk slot (1..=4) and attaches it as
    /// `local_lv`, creating the backing logical volume. Rejects a 5th
    /// disk. Replicated (`drbd`) disks are attached by the DRBD driver,
    /// which calls `attach_drbd_disk` once the resource is `in_sync`.
    pub async fn attach_local_disk(&self, name: &str, size_mb: u64) -> Result<Disk> {
        let vg = self.vg();
        let vm_name = name.to_string();
        let config = self.vm_store(name).read()?;
        let Some(disk_id) = config.next_disk_id() else {
            return Err(McVirtError::DiskExists(MAX_DISKS + 1));
        };
        let lv_name = format!("mcvirt_vm-{vm_name}-disk-{disk_id}");
        system::lvcreate(&vg, &lv_name, size_mb).await?;

        let disk = Disk {
            id: disk_id,
            disk_type: DiskType::LocalLv,
            size_mb,
            resource_name: None,
            minor: None,
            port: None,
        };
        if let Err(e) = self
            .edit_config(name, |cfg| {
                cfg.disks.push(disk.clone());
                Ok(())
            })
            .await
        {
            let _ = system::lvremove(&vg, &lv_name).await;
            return Err(e);
        }
        Ok(disk)
    }

    /// Attaches an already-provisioned replicated disk once its DRBD
    /// resource has reached a usable state; called by the DRBD driver, not
    /// directly by the dispatcher table.
    pub fn attach_drbd_disk(&self, name: &str, disk: Disk) -> Result<()> {
        let store = self.vm_store(name);
        let mut config = store.read()?;
        config.disks.push(disk);
        store.write(&config)
    }

    pub async fn detach_disk(&self, name: &str, disk_id: u8) -> Result<Disk> {
        let vg = self.vg();
        let store = self.vm_store(name);
        let mut config = store.read()?;
        let pos = config
            .disks
            .iter()
            .position(|d| d.id == disk_id)
            .ok_or(McVirtError::DiskMissing(disk_id))?;
        let disk = config.disks.remove(pos);
        store.write(&config)?;
        self.edit_config(name, |_| Ok(())).await?;
        if disk.disk_type == DiskType::LocalLv {
            let lv_name = format!("mcvirt_vm-{name}-disk-{disk_id}");
            system::lvremove(&vg, &lv_name).await?;
        }
        Ok(disk)
    }

    pub async fn attach_nic(&self, name: &str, mac: String, network: String) -> Result<()> {
        self.edit_config(name, |cfg| {
            cfg.network_interfaces.insert(mac, network);
            Ok(())
        })
        .await
        .map(|_| ())
    }

    pub async fn detach_nic(&self, name: &str, mac: &str) -> Result<()> {
        self.edit_config(name, |cfg| {
            cfg.network_interfaces
                .remove(mac)
                .map(|_| ())
                .ok_or_else(|| McVirtError::Internal(format!("no such NIC {mac}")))
        })
        .await
        .map(|_| ())
    }

    pub async fn set_boot_order(&self, name: &str, order: Vec<String>) -> Result<()> {
        self.edit_config(name, |cfg| {
            cfg.boot_order = order;
            Ok(())
        })
        .await
        .map(|_| ())
    }

    pub async fn update_ram(&self, name: &str, memory_mb: u64) -> Result<()> {
        self.edit_config(name, |cfg| {
            cfg.memory_mb = memory_mb;
            Ok(())
        })
        .await
        .map(|_| ())
    }

    pub async fn update_cpu(&self, name: &str, cpu_cores: u32) -> Result<()> {
        self.edit_config(name, |cfg| {
            cfg.cpu_cores = cpu_cores;
            Ok(())
        })
        .await
        .map(|_| ())
    }

    pub async fn attach_iso(&self, name: &str, iso_path: String) -> Result<()> {
        self.edit_config(name, |cfg| {
            cfg.attached_iso = Some(iso_path);
            Ok(())
        })
        .await
        .map(|_| ())
    }

    pub async fn detach_iso(&self, name: &str) -> Result<()> {
        self.edit_config(name, |cfg| {
            cfg.attached_iso = None;
            Ok(())
        })
        .await
        .map(|_| ())
    }

    pub fn read_config(&self, name: &str) -> Result<VmConfig> {
        self.vm_store(name).read()
    }

    pub fn set_lock_state(&self, name: &str, state: LockState) -> Result<()> {
        let store = self.vm_store(name);
        let mut config = store.read()?;
        config.lock_state = state;
        store.write(&config)
    }
}
