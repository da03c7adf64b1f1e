//! Dispatcher-facing wrappers for the peer-notification side of cluster
//! membership changes: a peer receiving `node-addNode`/`node-removeNode`/
//! `node-bootstrap` only needs to update its own Config Store, since the
//! Coordinator on the originating node already did permission checks and
//! lock acquisition before fanning these out.

use crate::cluster::node::Node;
use crate::dispatcher::context::WorkerContext;
use crate::error::{McVirtError, Result};
use serde_json::Value;
use std::collections::BTreeMap;

pub async fn add_node(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let node: Node = serde_json::from_value(args)?;
    ctx.services
        .config_store
        .update(format!("add node {} (peer notification)", node.name), |cfg| {
            cfg.nodes.insert(node.name.clone(), node.clone());
            Ok(())
        })?;
    Ok(Value::Null)
}

pub async fn remove_node(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let name = args
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| McVirtError::Internal("missing argument 'name'".to_string()))?;
    ctx.services
        .config_store
        .update(format!("remove node {name} (peer notification)"), |cfg| {
            cfg.nodes.remove(name);
            Ok(())
        })?;
    Ok(Value::Null)
}

/// Seeds a freshly added node's Config Store with the full node map during
/// the add-node handshake, so the new member starts from the same cluster
/// membership view as the node that invited it.
pub async fn bootstrap(args: Value, ctx: &WorkerContext) -> Result<Value> {
    let nodes: BTreeMap<String, Node> = serde_json::from_value(args)?;
    ctx.services
        .config_store
        .update("bootstrap cluster membership from add-node handshake", |cfg| {
            cfg.nodes = nodes.clone();
            Ok(())
        })?;
    Ok(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::store::ConfigStore;
    use crate::services::Services;
    use std::sync::Arc;

    fn test_services(dir: &std::path::Path) -> Arc<Services> {
        let config_store =
            ConfigStore::open(dir.join("cfg.json"), "alpha", "10.0.0.1").unwrap();
        let libvirt: Arc<dyn crate::libvirt_client::LibvirtClient> =
            crate::libvirt_client::MockLibvirtClient::new();
        Arc::new(Services::new(
            "alpha".to_string(),
            crate::config::AppConfig::for_test(dir),
            config_store,
            libvirt,
        ))
    }

    #[tokio::test]
    async fn add_then_remove_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let services = test_services(dir.path());
        let ctx = WorkerContext::new(services.clone());

        let node = Node {
            name: "beta".to_string(),
            ip_address: "10.0.0.2".to_string(),
            public_key: "ssh-ed25519 AAAA".to_string(),
        };
        add_node(serde_json::to_value(&node).unwrap(), &ctx)
            .await
            .unwrap();
        assert!(services.config_store.snapshot().nodes.contains_key("beta"));

        remove_node(serde_json::json!({"name": "beta"}), &ctx)
            .await
            .unwrap();
        assert!(!services.config_store.snapshot().nodes.contains_key("beta"));
    }
}
