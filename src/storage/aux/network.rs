//! Node-local libvirt network registry: create/delete/list/get-config,
//! fanned out like any other mutating Coordinator op. Feeds the `nics`
//! attribute's `network_name` values.

use crate::cluster::node::Network;
use crate::cluster::store::ConfigStore;
use crate::error::{McVirtError, Result};
use crate::util::validate_name;

#[derive(Clone)]
pub struct NetworkStore {
    config_store: ConfigStore,
}

impl NetworkStore {
    pub fn new(config_store: ConfigStore) -> Self {
        NetworkStore { config_store }
    }

    pub fn create(&self, name: &str, physical_interface: &str) -> Result<()> {
        validate_name(name)?;
        if self.config_store.read().networks.contains_key(name) {
            return Err(McVirtError::NetworkExists(name.to_string()));
        }
        self.config_store
            .update(format!("create network {name}"), |cfg| {
                cfg.networks.insert(
                    name.to_string(),
                    Network {
                        name: name.to_string(),
                        physical_interface: physical_interface.to_string(),
                    },
                );
                Ok(())
            })?;
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        if !self.config_store.read().networks.contains_key(name) {
            return Err(McVirtError::NetworkMissing(name.to_string()));
        }
        self.config_store
            .update(format!("delete network {name}"), |cfg| {
                cfg.networks.remove(name);
                Ok(())
            })?;
        Ok(())
    }

    pub fn list(&self) -> Vec<Network> {
        self.config_store.read().networks.into_values().collect()
    }

    pub fn get_config(&self, name: &str) -> Result<Network> {
        self.config_store
            .read()
            .networks
            .get(name)
            .cloned()
            .ok_or_else(|| McVirtError::NetworkMissing(name.to_string()))
    }
}

pub mod handlers {
    use super::*;
    use crate::dispatcher::context::WorkerContext;
    use serde_json::Value;

    fn arg_str(args: &Value, key: &str) -> Result<String> {
        args.get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| McVirtError::Internal(format!("missing argument '{key}'")))
    }

    pub async fn create(args: Value, ctx: &WorkerContext) -> Result<Value> {
        let name = arg_str(&args, "name")?;
        let physical_interface = arg_str(&args, "physical_interface")?;
        ctx.services.network_store.create(&name, &physical_interface)?;
        Ok(Value::Null)
    }

    pub async fn delete(args: Value, ctx: &WorkerContext) -> Result<Value> {
        let name = arg_str(&args, "name")?;
        ctx.services.network_store.delete(&name)?;
        Ok(Value::Null)
    }

    pub async fn list(ctx: &WorkerContext) -> Result<Value> {
        Ok(serde_json::to_value(ctx.services.network_store.list())?)
    }

    pub async fn get_config(args: Value, ctx: &WorkerContext) -> Result<Value> {
        let name = arg_str(&args, "name")?;
        Ok(serde_json::to_value(
            ctx.services.network_store.get_config(&name)?,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_list_then_delete() {
        let dir = tempdir().unwrap();
        let config_store =
            ConfigStore::open(dir.path().join("cfg.json"), "alpha", "10.0.0.1").unwrap();
        let store = NetworkStore::new(config_store);

        store.create("lan", "eth0").unwrap();
        assert_eq!(store.list().len(), 1);
        assert_eq!(store.get_config("lan").unwrap().physical_interface, "eth0");

        store.delete("lan").unwrap();
        assert!(store.list().is_empty());
    }

    #[test]
    fn duplicate_create_rejected() {
        let dir = tempdir().unwrap();
        let config_store =
            ConfigStore::open(dir.path().join("cfg.json"), "alpha", "10.0.0.1").unwrap();
        let store = NetworkStore::new(config_store);
        store.create("lan", "eth0").unwrap();
        assert!(store.create("lan", "eth1").is_err());
    }

    #[test]
    fn delete_missing_rejected() {
        let dir = tempdir().unwrap();
        let config_store =
            ConfigStore::open(dir.path().join("cfg.json"), "alpha", "10.0.0.1").unwrap();
        let store = NetworkStore::new(config_store);
        assert!(store.delete("nope").is_err());
    }
}
