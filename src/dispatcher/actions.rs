//! The static action table: the union of every handler name a peer may
//! invoke over the wire protocol. Expressed as a match rather than a
//! `HashMap` of function pointers because each handler's arguments and
//! return value are individually (de)serialized from/ to `serde_json::Value`
//! — the match gives the compiler a chance to check each arm's argument
//! shape against its handler signature.

use crate::dispatcher::context::WorkerContext;
use crate::error::{McVirtError, Result};
use serde_json::Value;
use std::time::Duration;

/// Looks up `action` and invokes its handler with `arguments`. Unknown
/// actions produce `UnknownRemoteCommand`.
pub async fn dispatch(action: &str, arguments: Value, ctx: &WorkerContext) -> Result<Value> {
    match action {
        "checkStatus" => check_status(ctx).await,
        "mcvirt-obtainLock" => obtain_lock(arguments, ctx).await,
        "mcvirt-releaseLock" => release_lock(ctx).await,

        "addHostKey" => add_host_key(arguments, ctx).await,

        "vm-create" => crate::vm::handlers::create(arguments, ctx).await,
        "vm-delete" => crate::vm::handlers::delete(arguments, ctx).await,
        "vm-register" => crate::vm::handlers::register(arguments, ctx).await,
        "vm-unregister" => crate::vm::handlers::unregister(arguments, ctx).await,
        "vm-setNode" => crate::vm::handlers::set_node(arguments, ctx).await,
        "vm-start" => crate::vm::handlers::start(arguments, ctx).await,
        "vm-stop" => crate::vm::handlers::stop(arguments, ctx).await,
        "vm-getInfo" => crate::vm::handlers::get_info(arguments, ctx).await,
        "vm-listVms" => crate::vm::handlers::list_vms(ctx).await,
        "vm-setBootOrder" => crate::vm::handlers::set_boot_order(arguments, ctx).await,
        "vm-updateRam" => crate::vm::handlers::update_ram(arguments, ctx).await,
        "vm-updateCpu" => crate::vm::handlers::update_cpu(arguments, ctx).await,

        "vm-attachIso" => crate::vm::handlers::attach_iso(arguments, ctx).await,
        "vm-detachIso" => crate::vm::handlers::detach_iso(arguments, ctx).await,

        "disk-attach" => crate::vm::handlers::attach_disk(arguments, ctx).await,
        "disk-attachDrbd" => crate::vm::handlers::attach_drbd(arguments, ctx).await,
        "disk-detach" => crate::vm::handlers::detach_disk(arguments, ctx).await,
        "nic-attach" => crate::vm::handlers::attach_nic(arguments, ctx).await,
        "nic-detach" => crate::vm::handlers::detach_nic(arguments, ctx).await,

        "drbd-getUsedMinors" => crate::storage::drbd::handlers::get_used_minors(ctx).await,
        "drbd-getUsedPorts" => crate::storage::drbd::handlers::get_used_ports(ctx).await,
        "drbd-newResource" => crate::storage::drbd::handlers::new_resource(arguments, ctx).await,
        "drbd-createLv" => crate::storage::drbd::handlers::create_lv(arguments, ctx).await,
        "drbd-generateConfig" => crate::storage::drbd::handlers::generate_config(arguments, ctx).await,
        "drbd-initialiseMetaData" => {
            crate::storage::drbd::handlers::initialise_metadata(arguments, ctx).await
        }
        "drbd-up" => crate::storage::drbd::handlers::drbd_up(arguments, ctx).await,
        "drbd-connect" => crate::storage::drbd::handlers::drbd_connect(arguments, ctx).await,
        "drbd-setSyncState" => crate::storage::drbd::handlers::set_sync_state(arguments, ctx).await,
        "drbd-disconnect" => crate::storage::drbd::handlers::drbd_disconnect(arguments, ctx).await,
        "drbd-down" => crate::storage::drbd::handlers::drbd_down(arguments, ctx).await,
        "drbd-removeConfig" => crate::storage::drbd::handlers::remove_config(arguments, ctx).await,
        "drbd-removeLv" => crate::storage::drbd::handlers::remove_lv(arguments, ctx).await,
        "drbd-list" => crate::storage::drbd::handlers::list(ctx).await,
        "node-drbd-enable" => crate::storage::drbd::handlers::enable(arguments, ctx).await,

        "iso-getIsos" => crate::storage::aux::iso::handlers::list(ctx).await,
        "iso-add" => crate::storage::aux::iso::handlers::add(arguments, ctx).await,
        "iso-delete" => crate::storage::aux::iso::handlers::delete(arguments, ctx).await,

        "network-create" => crate::storage::aux::network::handlers::create(arguments, ctx).await,
        "network-delete" => crate::storage::aux::network::handlers::delete(arguments, ctx).await,
        "network-list" => crate::storage::aux::network::handlers::list(ctx).await,
        "network-getConfig" => crate::storage::aux::network::handlers::get_config(arguments, ctx).await,

        "node-setStorageVolumeGroup" => {
            crate::storage::aux::node_settings::set_volume_group(arguments, ctx).await
        }
        "node-setClusterIpAddress" => {
            crate::storage::aux::node_settings::set_cluster_ip(arguments, ctx).await
        }
        "node-addNode" => crate::cluster::handlers::add_node(arguments, ctx).await,
        "node-removeNode" => crate::cluster::handlers::remove_node(arguments, ctx).await,
        "node-bootstrap" => crate::cluster::handlers::bootstrap(arguments, ctx).await,

        other => Err(McVirtError::UnknownRemoteCommand(other.to_string())),
    }
}

/// `checkStatus`: `["0"]` means "ready, unlocked"; anything else signals
/// `RemoteLocked` to the caller.
async fn check_status(ctx: &WorkerContext) -> Result<Value> {
    if ctx.services.node_lock.is_locked() {
        Ok(serde_json::json!(["1"]))
    } else {
        Ok(crate::remote::protocol::check_status_ready())
    }
}

async fn obtain_lock(arguments: Value, ctx: &WorkerContext) -> Result<Value> {
    let timeout_ms = arguments
        .get("timeout")
        .and_then(|v| v.as_u64())
        .unwrap_or(crate::lock::DEFAULT_LOCK_TIMEOUT_MS);
    let mut guard_slot = ctx.lock_guard.lock().await;
    if guard_slot.is_some() {
        return Err(McVirtError::AlreadyRunning);
    }
    let guard = ctx
        .services
        .node_lock
        .acquire(Duration::from_millis(timeout_ms))?;
    *guard_slot = Some(guard);
    Ok(Value::Null)
}

async fn release_lock(ctx: &WorkerContext) -> Result<Value> {
    let mut guard_slot = ctx.lock_guard.lock().await;
    *guard_slot = None;
    Ok(Value::Null)
}

async fn add_host_key(arguments: Value, _ctx: &WorkerContext) -> Result<Value> {
    // A pure peer notification: the caller already verified/saved the key
    // locally during the add-node handshake; peers merely acknowledge.
    let _ = arguments;
    Ok(Value::Null)
}
