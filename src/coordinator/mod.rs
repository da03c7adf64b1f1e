//! The Cluster Coordinator: fan-out of mutating operations to every known
//! peer under a cluster-wide lock, with best-effort compensating rollback
//! on partial failure.
//!
//! For any mutating operation the steps are, in order:
//! 1. validate caller permission (`Auth`);
//! 2. acquire the Node Lock locally;
//! 3. acquire the Node Lock on every other known peer, hostname-sorted,
//!    reusing a cached `RemoteChannel` (a peer failure aborts with
//!    `NodeUnreachable` unless `ignore_failed_nodes` was set, in which case
//!    it is recorded and skipped);
//! 4. execute the local effect;
//! 5. replay the equivalent action on every peer that is still held locked;
//! 6. on any peer failure, run the operation's compensating rollback,
//!    release every lock, and surface `ClusterInconsistency`;
//! 7. release every peer lock (reverse order) then the local lock.
//!
//! This file holds the generic fan-out primitive plus the node-membership
//! and VM/auxiliary operations built on it; the replicated-disk attach flow
//! (a multi-step checkpointed lockstep rather than a single fanned-out
//! action) lives in `coordinator::drbd_flow`.

pub mod drbd_flow;

use crate::auth::Capability;
use crate::cluster::node::Node;
use crate::error::{McVirtError, Result};
use crate::lock::{NodeLockGuard, DEFAULT_LOCK_TIMEOUT_MS};
use crate::metrics;
use crate::remote::channel::RemoteChannel;
use crate::remote::pool::ChannelPool;
use crate::services::Services;
use crate::vm::model::Disk;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Locks held for the duration of one coordinator command: the local guard
/// plus every peer channel that successfully answered `mcvirt-obtainLock`,
/// in the order they were acquired (hostname-sorted).
struct AcquiredLocks {
    local: Option<NodeLockGuard>,
    peers: Vec<(String, Arc<RemoteChannel>)>,
}

impl AcquiredLocks {
    /// Releases peer locks in reverse order, then the local lock, matching
    /// the mandated teardown ordering on every exit path.
    async fn release(mut self) {
        while let Some((name, channel)) = self.peers.pop() {
            if let Err(e) = channel.run_remote_command("mcvirt-releaseLock", Value::Null).await {
                warn!(node = %name, error = %e, "failed to release peer lock");
            }
        }
        self.local.take();
    }
}

pub struct Coordinator {
    hostname: String,
    services: Arc<Services>,
    pool: Arc<ChannelPool>,
}

impl Coordinator {
    pub fn new(hostname: String, services: Arc<Services>, pool: Arc<ChannelPool>) -> Self {
        Coordinator {
            hostname,
            services,
            pool,
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Acquires the local lock, then every peer's lock in hostname-sorted
    /// order. `ignore_failed_nodes` controls whether an unreachable peer
    /// aborts the whole operation or is merely recorded and skipped.
    async fn acquire_locks(&self, ignore_failed_nodes: bool) -> Result<(AcquiredLocks, Vec<String>)> {
        let local = self.services.node_lock.acquire_default()?;
        let mut acquired = AcquiredLocks {
            local: Some(local),
            peers: Vec::new(),
        };
        let mut failed_nodes = Vec::new();

        let config = self.services.config_store.snapshot();
        let mut peer_names = config.peer_names();
        peer_names.sort();

        for peer_name in peer_names {
            let node = config
                .nodes
                .get(&peer_name)
                .cloned()
                .expect("peer_names() only returns names present in nodes");
            let outcome = self.obtain_peer_lock(&node).await;
            match outcome {
                Ok(channel) => acquired.peers.push((peer_name, channel)),
                Err(e) if ignore_failed_nodes => {
                    warn!(node = %peer_name, error = %e, "peer unreachable, ignoring");
                    failed_nodes.push(peer_name);
                }
                Err(e) => {
                    acquired.release().await;
                    return Err(e);
                }
            }
        }
        Ok((acquired, failed_nodes))
    }

    /// §4.8 pre-migration check: registering here makes this node the
    /// destination, so if the VM has an ISO attached its file must already
    /// be present in this node's own ISO storage (each node's copy of the
    /// per-VM config is kept current by `attach_iso`'s fanout, so reading
    /// it locally is sufficient — no remote `iso-getIsos` round trip needed
    /// when the destination is the local node).
    async fn check_iso_present_on_destination(&self, name: &str) -> Result<()> {
        let config = self.services.vm_manager.read_config(name)?;
        let Some(attached) = config.attached_iso else {
            return Ok(());
        };
        let iso_name = std::path::Path::new(&attached)
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or(attached);
        let present = self
            .services
            .iso_store
            .list()?
            .iter()
            .any(|iso| iso.name == iso_name);
        if present {
            Ok(())
        } else {
            Err(McVirtError::IsoNotPresentOnDestination(iso_name, self.hostname.clone()))
        }
    }

    async fn obtain_peer_lock(&self, node: &Node) -> Result<Arc<RemoteChannel>> {
        let channel = self.pool.get_or_connect(node).await?;
        channel
            .run_remote_command(
                "mcvirt-obtainLock",
                serde_json::json!({ "timeout": DEFAULT_LOCK_TIMEOUT_MS }),
            )
            .await?;
        Ok(channel)
    }

    /// The generic fan-out primitive: runs `local_effect`, then replays
    /// `action`/`remote_args` on every peer lock held in `locks`. On a peer
    /// failure, runs `rollback` for best-effort local compensation before
    /// releasing every lock and surfacing `ClusterInconsistency`.
    async fn fanout<T, Fut, RFut>(
        &self,
        action: &str,
        remote_args: Value,
        ignore_failed_nodes: bool,
        local_effect: impl FnOnce() -> Fut,
        rollback: impl FnOnce() -> RFut,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
        RFut: Future<Output = ()>,
    {
        let started = Instant::now();
        let result = self
            .fanout_inner(action, remote_args, ignore_failed_nodes, local_effect, rollback)
            .await;
        metrics::record_op(action, started.elapsed().as_secs_f64(), result.is_ok());
        result
    }

    async fn fanout_inner<T, Fut, RFut>(
        &self,
        action: &str,
        remote_args: Value,
        ignore_failed_nodes: bool,
        local_effect: impl FnOnce() -> Fut,
        rollback: impl FnOnce() -> RFut,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
        RFut: Future<Output = ()>,
    {
        let (locks, failed_nodes) = self.acquire_locks(ignore_failed_nodes).await?;

        let value = match local_effect().await {
            Ok(v) => v,
            Err(e) => {
                locks.release().await;
                return Err(e);
            }
        };

        for (peer_name, channel) in &locks.peers {
            if let Err(e) = channel.run_remote_command(action, remote_args.clone()).await {
                warn!(node = %peer_name, %action, error = %e, "peer fanout failed, rolling back");
                rollback().await;
                locks.release().await;
                return Err(McVirtError::ClusterInconsistency {
                    node: peer_name.clone(),
                    step: action.to_string(),
                    message: e.to_string(),
                });
            }
        }

        if !failed_nodes.is_empty() {
            info!(?failed_nodes, %action, "completed with ignored unreachable peers");
        }
        locks.release().await;
        Ok(value)
    }

    async fn noop_rollback() {}

    // ---- Node membership -------------------------------------------------

    /// Handshakes with a brand-new peer over a one-shot password-
    /// authenticated channel (saving its host key), seeds it with the
    /// current cluster membership, then fans the new node's record out to
    /// every existing peer under lock. A simplification from the original:
    /// the new node's public key is supplied by the operator (e.g. copied
    /// out of band) rather than retrieved over this channel.
    pub async fn add_node(
        &self,
        username: Option<&str>,
        node: Node,
        password: String,
        ignore_failed_nodes: bool,
    ) -> Result<()> {
        self.services
            .auth
            .assert_permission(username, Capability::ManageCluster)?;
        crate::util::validate_name(&node.name)?;
        crate::util::validate_ip_address(&node.ip_address)?;
        if self.services.config_store.snapshot().nodes.contains_key(&node.name) {
            return Err(McVirtError::NodeExists(node.name));
        }

        let handshake = self.pool.connect_for_handshake(&node, password).await?;
        let mut seed_nodes = self.services.config_store.snapshot().nodes;
        seed_nodes.insert(self.hostname.clone(), self_node(&self.services, &self.hostname));
        seed_nodes.insert(node.name.clone(), node.clone());
        let bootstrap_result = handshake
            .run_remote_command("node-bootstrap", serde_json::to_value(&seed_nodes)?)
            .await;
        handshake.close().await;
        bootstrap_result?;

        let node_for_local = node.clone();
        let node_name = node.name.clone();
        self.fanout(
            "node-addNode",
            serde_json::to_value(&node)?,
            ignore_failed_nodes,
            || async {
                self.services
                    .config_store
                    .update(format!("add node {node_name}"), |cfg| {
                        cfg.nodes.insert(node_for_local.name.clone(), node_for_local.clone());
                        Ok(())
                    })?;
                Ok(())
            },
            Self::noop_rollback,
        )
        .await
    }

    pub async fn remove_node(
        &self,
        username: Option<&str>,
        node_name: &str,
        ignore_failed_nodes: bool,
    ) -> Result<()> {
        self.services
            .auth
            .assert_permission(username, Capability::ManageCluster)?;
        if !self.services.config_store.snapshot().nodes.contains_key(node_name) {
            return Err(McVirtError::NodeMissing(node_name.to_string()));
        }
        let name = node_name.to_string();
        self.fanout(
            "node-removeNode",
            serde_json::json!({ "name": node_name }),
            ignore_failed_nodes,
            || async {
                self.services
                    .config_store
                    .update(format!("remove node {name}"), |cfg| {
                        cfg.nodes.remove(&name);
                        Ok(())
                    })?;
                Ok(())
            },
            Self::noop_rollback,
        )
        .await
    }

    // ---- VM lifecycle ------------------------------------------------------

    pub async fn create_vm(
        &self,
        username: Option<&str>,
        name: &str,
        cpu_cores: u32,
        memory_mb: u64,
        available_nodes: Vec<String>,
        ignore_failed_nodes: bool,
    ) -> Result<()> {
        self.services
            .auth
            .assert_permission(username, Capability::ManageVm)?;
        let name_owned = name.to_string();
        let nodes_owned = available_nodes.clone();
        self.fanout(
            "vm-create",
            serde_json::json!({
                "name": name,
                "cpu_cores": cpu_cores,
                "memory_mb": memory_mb,
                "available_nodes": available_nodes,
            }),
            ignore_failed_nodes,
            || async {
                self.services
                    .vm_manager
                    .create(&name_owned, cpu_cores, memory_mb, nodes_owned)
                    .await?;
                Ok(())
            },
            || async {
                let _ = self.services.vm_manager.delete(name, true).await;
            },
        )
        .await
    }

    pub async fn delete_vm(
        &self,
        username: Option<&str>,
        name: &str,
        remove_data: bool,
        ignore_failed_nodes: bool,
    ) -> Result<()> {
        self.services
            .auth
            .assert_permission(username, Capability::ManageVm)?;
        let name_owned = name.to_string();
        self.fanout(
            "vm-delete",
            serde_json::json!({ "name": name, "remove_data": remove_data }),
            ignore_failed_nodes,
            || async { self.services.vm_manager.delete(&name_owned, remove_data).await },
            Self::noop_rollback,
        )
        .await
    }

    pub async fn register_vm(&self, username: Option<&str>, name: &str, ignore_failed_nodes: bool) -> Result<()> {
        self.services
            .auth
            .assert_permission(username, Capability::ManageVm)?;
        self.check_iso_present_on_destination(name).await?;
        let name_owned = name.to_string();
        let hostname = self.hostname.clone();
        self.fanout(
            "vm-setNode",
            serde_json::json!({ "name": name, "node": hostname }),
            ignore_failed_nodes,
            || async { self.services.vm_manager.register(&name_owned).await },
            Self::noop_rollback,
        )
        .await
    }

    pub async fn unregister_vm(&self, username: Option<&str>, name: &str, ignore_failed_nodes: bool) -> Result<()> {
        self.services
            .auth
            .assert_permission(username, Capability::ManageVm)?;
        let name_owned = name.to_string();
        self.fanout(
            "vm-setNode",
            serde_json::json!({ "name": name, "node": Value::Null }),
            ignore_failed_nodes,
            || async { self.services.vm_manager.unregister(&name_owned).await },
            Self::noop_rollback,
        )
        .await
    }

    /// Local-only: power state changes do not fan out (§4.6).
    pub async fn start_vm(&self, username: Option<&str>, name: &str) -> Result<()> {
        self.services
            .auth
            .assert_permission(username, Capability::ChangeVmPowerState)?;
        self.services.vm_manager.start(name).await
    }

    pub async fn stop_vm(&self, username: Option<&str>, name: &str) -> Result<()> {
        self.services
            .auth
            .assert_permission(username, Capability::ChangeVmPowerState)?;
        self.services.vm_manager.stop(name).await
    }

    pub async fn attach_local_disk(
        &self,
        username: Option<&str>,
        name: &str,
        size_mb: u64,
        ignore_failed_nodes: bool,
    ) -> Result<Disk> {
        self.services
            .auth
            .assert_permission(username, Capability::ManageVm)?;
        let name_owned = name.to_string();
        self.fanout(
            "disk-attach",
            serde_json::json!({ "name": name, "size_mb": size_mb }),
            ignore_failed_nodes,
            || async { self.services.vm_manager.attach_local_disk(&name_owned, size_mb).await },
            Self::noop_rollback,
        )
        .await
    }

    pub async fn detach_disk(
        &self,
        username: Option<&str>,
        name: &str,
        disk_id: u8,
        ignore_failed_nodes: bool,
    ) -> Result<Disk> {
        self.services
            .auth
            .assert_permission(username, Capability::ManageVm)?;
        let name_owned = name.to_string();
        self.fanout(
            "disk-detach",
            serde_json::json!({ "name": name, "disk_id": disk_id }),
            ignore_failed_nodes,
            || async { self.services.vm_manager.detach_disk(&name_owned, disk_id).await },
            Self::noop_rollback,
        )
        .await
    }

    pub async fn attach_nic(
        &self,
        username: Option<&str>,
        name: &str,
        mac: String,
        network: String,
        ignore_failed_nodes: bool,
    ) -> Result<()> {
        self.services
            .auth
            .assert_permission(username, Capability::ManageVm)?;
        let name_owned = name.to_string();
        let mac_owned = mac.clone();
        let network_owned = network.clone();
        self.fanout(
            "nic-attach",
            serde_json::json!({ "name": name, "mac": mac, "network": network }),
            ignore_failed_nodes,
            || async {
                self.services
                    .vm_manager
                    .attach_nic(&name_owned, mac_owned, network_owned)
                    .await
            },
            Self::noop_rollback,
        )
        .await
    }

    pub async fn detach_nic(
        &self,
        username: Option<&str>,
        name: &str,
        mac: &str,
        ignore_failed_nodes: bool,
    ) -> Result<()> {
        self.services
            .auth
            .assert_permission(username, Capability::ManageVm)?;
        let name_owned = name.to_string();
        let mac_owned = mac.to_string();
        self.fanout(
            "nic-detach",
            serde_json::json!({ "name": name, "mac": mac }),
            ignore_failed_nodes,
            || async { self.services.vm_manager.detach_nic(&name_owned, &mac_owned).await },
            Self::noop_rollback,
        )
        .await
    }

    pub async fn set_boot_order(
        &self,
        username: Option<&str>,
        name: &str,
        order: Vec<String>,
        ignore_failed_nodes: bool,
    ) -> Result<()> {
        self.services
            .auth
            .assert_permission(username, Capability::ManageVm)?;
        let name_owned = name.to_string();
        let order_owned = order.clone();
        self.fanout(
            "vm-setBootOrder",
            serde_json::json!({ "name": name, "order": order }),
            ignore_failed_nodes,
            || async { self.services.vm_manager.set_boot_order(&name_owned, order_owned).await },
            Self::noop_rollback,
        )
        .await
    }

    pub async fn update_ram(
        &self,
        username: Option<&str>,
        name: &str,
        memory_mb: u64,
        ignore_failed_nodes: bool,
    ) -> Result<()> {
        self.services
            .auth
            .assert_permission(username, Capability::ManageVm)?;
        let name_owned = name.to_string();
        self.fanout(
            "vm-updateRam",
            serde_json::json!({ "name": name, "memory_mb": memory_mb }),
            ignore_failed_nodes,
            || async { self.services.vm_manager.update_ram(&name_owned, memory_mb).await },
            Self::noop_rollback,
        )
        .await
    }

    pub async fn update_cpu(
        &self,
        username: Option<&str>,
        name: &str,
        cpu_cores: u32,
        ignore_failed_nodes: bool,
    ) -> Result<()> {
        self.services
            .auth
            .assert_permission(username, Capability::ManageVm)?;
        let name_owned = name.to_string();
        self.fanout(
            "vm-updateCpu",
            serde_json::json!({ "name": name, "cpu_cores": cpu_cores }),
            ignore_failed_nodes,
            || async { self.services.vm_manager.update_cpu(&name_owned, cpu_cores).await },
            Self::noop_rollback,
        )
        .await
    }

    pub async fn attach_iso(
        &self,
        username: Option<&str>,
        name: &str,
        iso_path: String,
        ignore_failed_nodes: bool,
    ) -> Result<()> {
        self.services
            .auth
            .assert_permission(username, Capability::ManageIso)?;
        let name_owned = name.to_string();
        let iso_path_owned = iso_path.clone();
        self.fanout(
            "vm-attachIso",
            serde_json::json!({ "name": name, "iso_path": iso_path }),
            ignore_failed_nodes,
            || async { self.services.vm_manager.attach_iso(&name_owned, iso_path_owned).await },
            Self::noop_rollback,
        )
        .await
    }

    pub async fn detach_iso(
        &self,
        username: Option<&str>,
        name: &str,
        ignore_failed_nodes: bool,
    ) -> Result<()> {
        self.services
            .auth
            .assert_permission(username, Capability::ManageIso)?;
        let name_owned = name.to_string();
        self.fanout(
            "vm-detachIso",
            serde_json::json!({ "name": name }),
            ignore_failed_nodes,
            || async { self.services.vm_manager.detach_iso(&name_owned).await },
            Self::noop_rollback,
        )
        .await
    }

    // ---- Auxiliary device edits --------------------------------------------

    pub async fn create_network(
        &self,
        username: Option<&str>,
        name: &str,
        physical_interface: &str,
        ignore_failed_nodes: bool,
    ) -> Result<()> {
        self.services
            .auth
            .assert_permission(username, Capability::ManageNetwork)?;
        let name_owned = name.to_string();
        let iface_owned = physical_interface.to_string();
        self.fanout(
            "network-create",
            serde_json::json!({ "name": name, "physical_interface": physical_interface }),
            ignore_failed_nodes,
            || async { self.services.network_store.create(&name_owned, &iface_owned) },
            Self::noop_rollback,
        )
        .await
    }

    pub async fn delete_network(
        &self,
        username: Option<&str>,
        name: &str,
        ignore_failed_nodes: bool,
    ) -> Result<()> {
        self.services
            .auth
            .assert_permission(username, Capability::ManageNetwork)?;
        let name_owned = name.to_string();
        self.fanout(
            "network-delete",
            serde_json::json!({ "name": name }),
            ignore_failed_nodes,
            || async { self.services.network_store.delete(&name_owned) },
            Self::noop_rollback,
        )
        .await
    }

    pub async fn set_volume_group(
        &self,
        username: Option<&str>,
        vg_name: &str,
        ignore_failed_nodes: bool,
    ) -> Result<()> {
        self.services
            .auth
            .assert_permission(username, Capability::ManageCluster)?;
        let vg_owned = vg_name.to_string();
        self.fanout(
            "node-setStorageVolumeGroup",
            serde_json::json!({ "vg_name": vg_name }),
            ignore_failed_nodes,
            || async {
                crate::storage::aux::node_settings::apply_volume_group(
                    &self.services.config_store,
                    &vg_owned,
                )
            },
            Self::noop_rollback,
        )
        .await
    }

    pub async fn set_cluster_ip(
        &self,
        username: Option<&str>,
        ip_address: &str,
        ignore_failed_nodes: bool,
    ) -> Result<()> {
        self.services
            .auth
            .assert_permission(username, Capability::ManageCluster)?;
        let ip_owned = ip_address.to_string();
        self.fanout(
            "node-setClusterIpAddress",
            serde_json::json!({ "ip_address": ip_address }),
            ignore_failed_nodes,
            || async {
                crate::storage::aux::node_settings::apply_cluster_ip(&self.services.config_store, &ip_owned)
            },
            Self::noop_rollback,
        )
        .await
    }

    /// Hand-rolled rather than built on the generic `fanout` helper: the
    /// secret that goes out in `remote_args` is only known once the local
    /// effect (which generates it when none is supplied) has run under the
    /// lock, and `fanout` evaluates `remote_args` before calling
    /// `local_effect` (see `coordinator::drbd_flow` for the same pattern).
    pub async fn enable_drbd(
        &self,
        username: Option<&str>,
        ignore_failed_nodes: bool,
    ) -> Result<String> {
        self.services
            .auth
            .assert_permission(username, Capability::ManageDrbd)?;

        let started = Instant::now();
        let result = self.enable_drbd_inner(ignore_failed_nodes).await;
        metrics::record_op("node-drbd-enable", started.elapsed().as_secs_f64(), result.is_ok());
        result
    }

    async fn enable_drbd_inner(&self, ignore_failed_nodes: bool) -> Result<String> {
        let (locks, failed_nodes) = self.acquire_locks(ignore_failed_nodes).await?;

        let secret = match self.services.drbd.enable(None, true).await {
            Ok(secret) => secret,
            Err(e) => {
                locks.release().await;
                return Err(e);
            }
        };

        let remote_args = serde_json::json!({ "secret": secret, "initialise_nodes": false });
        for (peer_name, channel) in &locks.peers {
            if let Err(e) = channel
                .run_remote_command("node-drbd-enable", remote_args.clone())
                .await
            {
                warn!(node = %peer_name, action = "node-drbd-enable", error = %e, "peer fanout failed, rolling back");
                locks.release().await;
                return Err(McVirtError::ClusterInconsistency {
                    node: peer_name.clone(),
                    step: "node-drbd-enable".to_string(),
                    message: e.to_string(),
                });
            }
        }

        if !failed_nodes.is_empty() {
            info!(?failed_nodes, action = "node-drbd-enable", "completed with ignored unreachable peers");
        }
        locks.release().await;
        Ok(secret)
    }
}

fn self_node(services: &Services, hostname: &str) -> Node {
    services
        .config_store
        .snapshot()
        .nodes
        .get(hostname)
        .cloned()
        .unwrap_or(Node {
            name: hostname.to_string(),
            ip_address: services.config_store.snapshot().cluster_ip,
            public_key: String::new(),
        })
}
