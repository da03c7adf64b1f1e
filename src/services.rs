//! `Services` is the one bag of collaborator handles a node process builds
//! at startup and hands out to both the Coordinator (local effects) and the
//! Dispatcher (remote effects for fanned-out actions). This is the explicit
//! capability-record replacement for the original source's process-wide
//! module state and late imports: every component here is constructed with
//! handles to the collaborators it needs, and there is no global registry.

use crate::auth::Auth;
use crate::cluster::store::ConfigStore;
use crate::config::AppConfig;
use crate::libvirt_client::LibvirtClient;
use crate::lock::NodeLock;
use crate::storage::aux::iso::IsoStore;
use crate::storage::aux::network::NetworkStore;
use crate::storage::drbd::driver::DrbdDriver;
use crate::vm::manager::VmManager;
use std::sync::Arc;

/// Everything a node process needs to execute local effects, whether the
/// call came from the local user (Coordinator) or a peer (Dispatcher).
pub struct Services {
    pub hostname: String,
    pub app_config: AppConfig,
    pub config_store: ConfigStore,
    pub node_lock: NodeLock,
    pub libvirt: Arc<dyn LibvirtClient>,
    pub vm_manager: VmManager,
    pub drbd: DrbdDriver,
    pub iso_store: IsoStore,
    pub network_store: NetworkStore,
    pub auth: Auth,
}

impl Services {
    pub fn new(
        hostname: String,
        app_config: AppConfig,
        config_store: ConfigStore,
        libvirt: Arc<dyn LibvirtClient>,
    ) -> Self {
        let node_lock = NodeLock::new(app_config.node_lock_path.clone());
        let vm_manager = VmManager::new(
            hostname.clone(),
            app_config.storage_root.clone(),
            config_store.clone(),
            libvirt.clone(),
        );
        let drbd = DrbdDriver::new(
            hostname.clone(),
            app_config.storage_root.clone(),
            app_config.vm_storage_vg.clone(),
            config_store.clone(),
            node_lock.clone(),
        );
        let iso_store = IsoStore::new(app_config.storage_root.clone(), hostname.clone());
        let network_store = NetworkStore::new(config_store.clone());
        Services {
            hostname,
            app_config,
            config_store,
            node_lock,
            libvirt,
            vm_manager,
            drbd,
            iso_store,
            network_store,
            auth: Auth::default(),
        }
    }
}
