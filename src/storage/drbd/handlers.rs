//! Dispatcher-facing wrappers over `DrbdDriver`.

use crate::dispatcher::context::WorkerContext;
use crate::error::{McVirtError, Result};
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

pub async fn get_used_minors(ctx: &WorkerContext) -> Result<Value> {
    Ok(serde_json::to_value(ctx.services.drbd.used_minors()?)?)
}

pub async fn get_used_ports(ctx: &WorkerContext) -> Result<Value> {
    Ok(serde_json::to_value(ctx.services.drbd.used_ports()?)?)
}

pub async fn new_resource(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let vm_name = arg_str(&args, "vm_name")?;
    let disk_id = arg_u64(&args, "disk_id")? as u8;
    let minor = arg_u64(&args, "minor")? as u32;
    let port = arg_u64(&args, "port")? as u16;
    let record = ctx
        .services
        .drbd
        .new_resource(&vm_name, disk_id, minor, port)?;
    Ok(serde_json::to_value(record)?)
}

pub async fn create_lv(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let resource = arg_str(&args, "resource_name")?;
    let size_mb = arg_u64(&args, "size_mb")?;
    ctx.services.drbd.create_lv(&resource, size_mb).await?;
    Ok(Value::Null)
}

pub async fn generate_config(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let resource = arg_str(&args, "resource_name")?;
    let vm_name = arg_str(&args, "vm_name")?;
    let local_ip = arg_str(&args, "local_ip")?;
    let peer_host = arg_str(&args, "peer_host")?;
    let peer_ip = arg_str(&args, "peer_ip")?;
    ctx.services
        .drbd
        .generate_resource_config(&resource, &vm_name, &local_ip, &peer_host, &peer_ip)?;
    Ok(Value::Null)
}

pub async fn initialise_metadata(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let resource = arg_str(&args, "resource_name")?;
    ctx.services.drbd.initialise_metadata(&resource).await?;
    Ok(Value::Null)
}

pub async fn drbd_up(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let resource = arg_str(&args, "resource_name")?;
    ctx.services.drbd.drbd_up(&resource).await?;
    Ok(Value::Null)
}

pub async fn drbd_connect(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let resource = arg_str(&args, "resource_name")?;
    ctx.services.drbd.drbd_connect(&resource).await?;
    Ok(Value::Null)
}

pub async fn set_sync_state(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let resource = arg_str(&args, "resource_name")?;
    let in_sync = args
        .get("in_sync")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| McVirtError::Internal("missing argument 'in_sync'".to_string()))?;
    let update_remote = args
        .get("update_remote")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    ctx.services
        .drbd
        .set_sync_state(&resource, in_sync, update_remote)?;
    Ok(Value::Null)
}

pub async fn drbd_disconnect(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let resource = arg_str(&args, "resource_name")?;
    ctx.services.drbd.drbd_disconnect(&resource).await?;
    Ok(Value::Null)
}

pub async fn drbd_down(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let resource = arg_str(&args, "resource_name")?;
    ctx.services.drbd.drbd_down(&resource).await?;
    Ok(Value::Null)
}

pub async fn remove_config(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let resource = arg_str(&args, "resource_name")?;
    ctx.services.drbd.remove_resource_config(&resource)?;
    Ok(Value::Null)
}

pub async fn remove_lv(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let resource = arg_str(&args, "resource_name")?;
    ctx.services.drbd.remove_lv(&resource).await?;
    Ok(Value::Null)
}

pub async fn list(ctx: &WorkerContext) -> Result<Value> {
    Ok(serde_json::to_value(ctx.services.drbd.list_records()?)?)
}

pub async fn enable(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let secret = args
        .get("secret")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let initialise_nodes = args
        .get("initialise_nodes")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let secret = ctx.services.drbd.enable(secret, initialise_nodes).await?;
    Ok(serde_json::json!({ "secret": secret }))
}
