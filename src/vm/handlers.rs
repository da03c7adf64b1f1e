//! Dispatcher-facing wrappers: decode `serde_json::Value` arguments, call
//! into `VmManager`, and re-encode the result. These are exactly the
//! handlers the action table in `dispatcher::actions` invokes for remote
//! peer requests; the Coordinator calls the same `VmManager` methods
//! directly for the local effect rather than going through this layer.

use crate::dispatcher::context::WorkerContext;
use crate::error::{McVirtError, Result};
use crate::vm::model::Disk;
use serde_json::Value;

fn arg_str(args: &Value, key: &str) -> Result<String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| McVirtError::Internal(format!("missing argument '{key}'")))
}

fn arg_u64(args: &Value, key: &str) -> Result<u64> {
    args.get(key)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| McVirtError::Internal(format!("missing argument '{key}'")))
}

pub async fn create(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let name = arg_str(&args, "name")?;
    let cpu = arg_u64(&args, "cpu_cores")? as u32;
    let memory_mb = arg_u64(&args, "memory_mb")?;
    let available_nodes: Vec<String> = serde_json::from_value(
        args.get("available_nodes")
            .cloned()
            .unwrap_or(Value::Array(vec![])),
    )?;
    let config = ctx
        .services
        .vm_manager
        .create(&name, cpu, memory_mb, available_nodes)
        .await?;
    Ok(serde_json::to_value(config)?)
}

pub async fn delete(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let name = arg_str(&args, "name")?;
    let remove_data = args
        .get("remove_data")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    ctx.services.vm_manager.delete(&name, remove_data).await?;
    Ok(Value::Null)
}

pub async fn register(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let name = arg_str(&args, "name")?;
    ctx.services.vm_manager.register(&name).await?;
    Ok(Value::Null)
}

pub async fn unregister(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let name = arg_str(&args, "name")?;
    ctx.services.vm_manager.unregister(&name).await?;
    Ok(Value::Null)
}

pub async fn set_node(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let name = arg_str(&args, "name")?;
    let node = args
        .get("node")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    ctx.services.vm_manager.set_node(&name, node)?;
    Ok(Value::Null)
}

pub async fn start(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let name = arg_str(&args, "name")?;
    ctx.services.vm_manager.start(&name).await?;
    Ok(Value::Null)
}

pub async fn stop(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let name = arg_str(&args, "name")?;
    ctx.services.vm_manager.stop(&name).await?;
    Ok(Value::Null)
}

pub async fn get_info(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let name = arg_str(&args, "name")?;
    let info = ctx.services.vm_manager.get_info(&name).await?;
    Ok(serde_json::to_value(info)?)
}

pub async fn list_vms(ctx: &WorkerContext) -> Result<Value> {
    let names = ctx.services.vm_manager.list_vm_names()?;
    Ok(serde_json::to_value(names)?)
}

pub async fn set_boot_order(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let name = arg_str(&args, "name")?;
    let order: Vec<String> = serde_json::from_value(
        args.get("order").cloned().unwrap_or(Value::Array(vec![])),
    )?;
    ctx.services.vm_manager.set_boot_order(&name, order).await?;
    Ok(Value::Null)
}

pub async fn update_ram(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let name = arg_str(&args, "name")?;
    let memory_mb = arg_u64(&args, "memory_mb")?;
    ctx.services.vm_manager.update_ram(&name, memory_mb).await?;
    Ok(Value::Null)
}

pub async fn update_cpu(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let name = arg_str(&args, "name")?;
    let cpu = arg_u64(&args, "cpu_cores")? as u32;
    ctx.services.vm_manager.update_cpu(&name, cpu).await?;
    Ok(Value::Null)
}

pub async fn attach_disk(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let name = arg_str(&args, "name")?;
    let size_mb = arg_u64(&args, "size_mb")?;
    let disk: Disk = ctx.services.vm_manager.attach_local_disk(&name, size_mb).await?;
    Ok(serde_json::to_value(disk)?)
}

pub async fn detach_disk(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let name = arg_str(&args, "name")?;
    let disk_id = arg_u64(&args, "disk_id")? as u8;
    let disk = ctx.services.vm_manager.detach_disk(&name, disk_id).await?;
    Ok(serde_json::to_value(disk)?)
}

/// Records an already-provisioned replicated disk in the VM's config,
/// called on both peers by the Coordinator once the DRBD resource behind
/// it has reached `in_sync`, rather than via the local-disk `attachDisk`
/// path which also creates a logical volume.
pub async fn attach_drbd(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let name = arg_str(&args, "name")?;
    let disk: Disk = serde_json::from_value(
        args.get("disk")
            .cloned()
            .ok_or_else(|| McVirtError::Internal("missing argument 'disk'".to_string()))?,
    )?;
    ctx.services.vm_manager.attach_drbd_disk(&name, disk)?;
    Ok(Value::Null)
}

pub async fn attach_iso(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let name = arg_str(&args, "name")?;
    let iso_path = arg_str(&args, "iso_path")?;
    ctx.services.vm_manager.attach_iso(&name, iso_path).await?;
    Ok(Value::Null)
}

pub async fn detach_iso(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let name = arg_str(&args, "name")?;
    ctx.services.vm_manager.detach_iso(&name).await?;
    Ok(Value::Null)
}

pub async fn attach_nic(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let name = arg_str(&args, "name")?;
    let mac = arg_str(&args, "mac")?;
    let network = arg_str(&args, "network")?;
    ctx.services.vm_manager.attach_nic(&name, mac, network).await?;
    Ok(Value::Null)
}

pub async fn detach_nic(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let name = arg_str(&args, "name")?;
    let mac = arg_str(&args, "mac")?;
    ctx.services.vm_manager.detach_nic(&name, &mac).await?;
    Ok(Value::Null)
}
