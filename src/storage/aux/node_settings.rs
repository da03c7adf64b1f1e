//! `Node.setStorageVolumeGroup` / `Node.setClusterIpAddress`: in-scope
//! Config Store mutations with the same input validation the original
//! performs before accepting either value.

use crate::cluster::store::ConfigStore;
use crate::dispatcher::context::WorkerContext;
use crate::error::{McVirtError, Result};
use crate::util::{validate_ip_address, validate_volume_group_name};
use serde_json::Value;

fn arg_str(args: &Value, key: &str) -> Result<String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| McVirtError::Internal(format!("missing argument '{key}'")))
}

pub fn apply_volume_group(store: &ConfigStore, vg_name: &str) -> Result<()> {
    validate_volume_group_name(vg_name)?;
    store.update(format!("set volume group {vg_name}"), |cfg| {
        cfg.vm_storage_vg = vg_name.to_string();
        Ok(())
    })?;
    Ok(())
}

pub fn apply_cluster_ip(store: &ConfigStore, ip_address: &str) -> Result<()> {
    validate_ip_address(ip_address)?;
    store.update(format!("set cluster ip {ip_address}"), |cfg| {
        cfg.cluster_ip = ip_address.to_string();
        Ok(())
    })?;
    Ok(())
}

pub async fn set_volume_group(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let vg_name = arg_str(&args, "vg_name")?;
    apply_volume_group(&ctx.services.config_store, &vg_name)?;
    Ok(Value::Null)
}

pub async fn set_cluster_ip(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let ip_address = arg_str(&args, "ip_address")?;
    apply_cluster_ip(&ctx.services.config_store, &ip_address)?;
    Ok(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn set_volume_group_validates() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path().join("cfg.json"), "alpha", "10.0.0.1").unwrap();
        assert!(apply_volume_group(&store, "bad vg").is_err());
        apply_volume_group(&store, "other_vg").unwrap();
        assert_eq!(store.read().vm_storage_vg, "other_vg");
    }

    #[test]
    fn set_cluster_ip_validates() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path().join("cfg.json"), "alpha", "10.0.0.1").unwrap();
        assert!(apply_cluster_ip(&store, "not-an-ip").is_err());
        apply_cluster_ip(&store, "10.0.0.9").unwrap();
        assert_eq!(store.read().cluster_ip, "10.0.0.9");
    }
}
