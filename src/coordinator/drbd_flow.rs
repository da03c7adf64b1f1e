//! The replicated block device attach flow: the one coordinator operation
//! that is not a single fanned-out action but a checkpointed lockstep
//! across exactly `CLUSTER_SIZE` (2) peers, advancing the DRBD lifecycle
//! state machine one step at a time on both sides before moving on, so a
//! failure at any step leaves the resource in a recoverable earlier state
//! rather than half-connected (§4.7, distilled spec §4.7).

use super::Coordinator;
use crate::auth::Capability;
use crate::error::{McVirtError, Result};
use crate::metrics;
use crate::remote::channel::RemoteChannel;
use crate::vm::model::{drbd_resource_name, Disk, DiskType};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

impl Coordinator {
    /// Allocates a replicated disk for `vm_name`, walking it through
    /// `createLV -> generateConfig -> initialiseMetaData -> drbdUp ->
    /// drbdConnect` on both the local node and the VM's single DRBD peer,
    /// then records the resulting `Disk` in the VM's config on both sides.
    /// Requires `available_nodes` to contain exactly two nodes: this one
    /// and the peer.
    pub async fn attach_drbd_disk(
        &self,
        username: Option<&str>,
        vm_name: &str,
        size_mb: u64,
    ) -> Result<Disk> {
        let started = Instant::now();
        let result = self.attach_drbd_disk_inner(username, vm_name, size_mb).await;
        metrics::record_op("disk-attach-drbd", started.elapsed().as_secs_f64(), result.is_ok());
        result
    }

    async fn attach_drbd_disk_inner(&self, username: Option<&str>, vm_name: &str, size_mb: u64) -> Result<Disk> {
        self.services
            .auth
            .assert_permission(username, Capability::ManageDrbd)?;
        if !self.services.config_store.snapshot().drbd.enabled {
            return Err(McVirtError::DRBDNotEnabledOnNode(self.hostname.clone()));
        }

        let vm_config = self.services.vm_manager.read_config(vm_name)?;
        if vm_config.available_nodes.len() != crate::storage::drbd::CLUSTER_SIZE {
            return Err(McVirtError::Internal(format!(
                "replicated disk requires exactly {} available_nodes, got {}",
                crate::storage::drbd::CLUSTER_SIZE,
                vm_config.available_nodes.len()
            )));
        }
        if !vm_config.available_nodes.iter().any(|n| n == &self.hostname) {
            return Err(McVirtError::Internal(format!(
                "{} is not one of {vm_name}'s available_nodes",
                self.hostname
            )));
        }
        let peer_name = vm_config
            .available_nodes
            .iter()
            .find(|n| *n != &self.hostname)
            .cloned()
            .ok_or_else(|| McVirtError::Internal("no DRBD peer in available_nodes".to_string()))?;

        let (locks, _failed) = self.acquire_locks(false).await?;
        let peer_channel = locks
            .peers
            .iter()
            .find(|(name, _)| name == &peer_name)
            .map(|(_, channel)| channel.clone())
            .ok_or_else(|| McVirtError::NodeUnreachable(peer_name.clone()));
        let peer_channel = match peer_channel {
            Ok(c) => c,
            Err(e) => {
                locks.release().await;
                return Err(e);
            }
        };

        let config_snapshot = self.services.config_store.snapshot();
        let local_node = config_snapshot
            .nodes
            .get(&self.hostname)
            .cloned()
            .ok_or_else(|| McVirtError::Internal("local node missing from cluster config".to_string()))?;
        let peer_node = config_snapshot
            .nodes
            .get(&peer_name)
            .cloned()
            .ok_or_else(|| McVirtError::NodeMissing(peer_name.clone()));
        let peer_node = match peer_node {
            Ok(n) => n,
            Err(e) => {
                locks.release().await;
                return Err(e);
            }
        };

        let disk_id = match vm_config
            .next_disk_id()
            .ok_or_else(|| McVirtError::DiskExists(crate::vm::model::MAX_DISKS + 1))
        {
            Ok(id) => id,
            Err(e) => {
                locks.release().await;
                return Err(e);
            }
        };
        let resource_name = drbd_resource_name(vm_name, disk_id);

        let result = self
            .run_attach_steps(
                &peer_channel,
                &peer_name,
                &resource_name,
                vm_name,
                disk_id,
                size_mb,
                &local_node.ip_address,
                &peer_node.ip_address,
            )
            .await;

        match result {
            Ok((minor, port)) => {
                locks.release().await;
                Ok(Disk {
                    id: disk_id,
                    disk_type: DiskType::Drbd,
                    size_mb,
                    resource_name: Some(resource_name),
                    minor: Some(minor),
                    port: Some(port),
                })
            }
            Err(e) => {
                warn!(resource = %resource_name, peer = %peer_name, error = %e, "DRBD attach failed, tearing down");
                self.teardown_both(&peer_channel, &resource_name).await;
                locks.release().await;
                Err(McVirtError::ClusterInconsistency {
                    node: peer_name,
                    step: "attachDrbdDisk".to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_attach_steps(
        &self,
        peer: &Arc<RemoteChannel>,
        peer_name: &str,
        resource_name: &str,
        vm_name: &str,
        disk_id: u8,
        size_mb: u64,
        local_ip: &str,
        peer_ip: &str,
    ) -> Result<(u32, u16)> {
        let local_minors = self.services.drbd.used_minors()?;
        let local_ports = self.services.drbd.used_ports()?;
        let peer_minors: Vec<u32> = serde_json::from_value(
            peer.run_remote_command("drbd-getUsedMinors", Value::Null).await?,
        )?;
        let peer_ports: Vec<u16> = serde_json::from_value(
            peer.run_remote_command("drbd-getUsedPorts", Value::Null).await?,
        )?;
        let _ = (local_minors, local_ports);
        let (minor, port) = self
            .services
            .drbd
            .allocate_identity(&peer_minors, &peer_ports)?;

        self.services.drbd.new_resource(vm_name, disk_id, minor, port)?;
        peer.run_remote_command(
            "drbd-newResource",
            serde_json::json!({ "vm_name": vm_name, "disk_id": disk_id, "minor": minor, "port": port }),
        )
        .await?;
        info!(resource = resource_name, minor, port, "allocated DRBD identity");

        self.services.drbd.create_lv(resource_name, size_mb).await?;
        peer.run_remote_command(
            "drbd-createLv",
            serde_json::json!({ "resource_name": resource_name, "size_mb": size_mb }),
        )
        .await?;

        self.services.drbd.generate_resource_config(
            resource_name,
            vm_name,
            local_ip,
            peer_name,
            peer_ip,
        )?;
        peer.run_remote_command(
            "drbd-generateConfig",
            serde_json::json!({
                "resource_name": resource_name,
                "vm_name": vm_name,
                "local_ip": peer_ip,
                "peer_host": self.hostname,
                "peer_ip": local_ip,
            }),
        )
        .await?;

        self.services.drbd.initialise_metadata(resource_name).await?;
        peer.run_remote_command(
            "drbd-initialiseMetaData",
            serde_json::json!({ "resource_name": resource_name }),
        )
        .await?;

        self.services.drbd.drbd_up(resource_name).await?;
        peer.run_remote_command("drbd-up", serde_json::json!({ "resource_name": resource_name }))
            .await?;

        self.services.drbd.drbd_connect(resource_name).await?;
        peer.run_remote_command(
            "drbd-connect",
            serde_json::json!({ "resource_name": resource_name }),
        )
        .await?;

        let disk = Disk {
            id: disk_id,
            disk_type: DiskType::Drbd,
            size_mb,
            resource_name: Some(resource_name.to_string()),
            minor: Some(minor),
            port: Some(port),
        };
        self.services.vm_manager.attach_drbd_disk(vm_name, disk.clone())?;
        peer.run_remote_command(
            "disk-attachDrbd",
            serde_json::json!({ "name": vm_name, "disk": disk }),
        )
        .await?;

        Ok((minor, port))
    }

    /// Best-effort teardown from whatever state the resource reached,
    /// on both the local node and the peer. Each teardown step is
    /// idempotent, so calling it on a resource that never advanced past
    /// `absent` (e.g. allocation failed before `createLV`) is a no-op.
    async fn teardown_both(&self, peer: &Arc<RemoteChannel>, resource_name: &str) {
        let _ = self.services.drbd.drbd_disconnect(resource_name).await;
        let _ = self.services.drbd.drbd_down(resource_name).await;
        let _ = self.services.drbd.remove_resource_config(resource_name);
        let _ = self.services.drbd.remove_lv(resource_name).await;

        for action in [
            "drbd-disconnect",
            "drbd-down",
            "drbd-removeConfig",
            "drbd-removeLv",
        ] {
            let _ = peer
                .run_remote_command(action, serde_json::json!({ "resource_name": resource_name }))
                .await;
        }
    }
}
