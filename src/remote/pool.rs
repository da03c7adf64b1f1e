//! Caches one `RemoteChannel` per peer so the Coordinator reuses an
//! existing authenticated connection instead of reconnecting on every
//! fanned-out action.

use crate::cluster::node::Node;
use crate::error::{McVirtError, Result};
use crate::remote::channel::{Auth, HostKeyPolicy, RemoteChannel};
use crate::remote::known_hosts::KnownHosts;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct ChannelPool {
    channels: Mutex<HashMap<String, Arc<RemoteChannel>>>,
    known_hosts: Arc<std::sync::Mutex<KnownHosts>>,
    private_key_path: PathBuf,
    worker_command: String,
}

impl ChannelPool {
    pub fn new(
        known_hosts: Arc<std::sync::Mutex<KnownHosts>>,
        private_key_path: PathBuf,
        worker_command: impl Into<String>,
    ) -> Self {
        ChannelPool {
            channels: Mutex::new(HashMap::new()),
            known_hosts,
            private_key_path,
            worker_command: worker_command.into(),
        }
    }

    /// Returns the cached channel for `node`, connecting (with key auth)
    /// and caching a new one if absent or if the cached one is dead.
    pub async fn get_or_connect(&self, node: &Node) -> Result<Arc<RemoteChannel>> {
        let mut guard = self.channels.lock().await;
        if let Some(existing) = guard.get(&node.name) {
            if !existing.is_dead() {
                return Ok(existing.clone());
            }
            guard.remove(&node.name);
        }
        let channel = RemoteChannel::connect(
            node,
            Auth::PrivateKey(self.private_key_path.clone()),
            self.known_hosts.clone(),
            HostKeyPolicy::Verify,
            &self.worker_command,
        )
        .await?;
        let channel = Arc::new(channel);
        guard.insert(node.name.clone(), channel.clone());
        Ok(channel)
    }

    /// One-shot password-authenticated, host-key-saving channel used only
    /// by the add-node handshake; never cached.
    pub async fn connect_for_handshake(
        &self,
        node: &Node,
        password: String,
    ) -> Result<RemoteChannel> {
        RemoteChannel::connect(
            node,
            Auth::Password(password),
            self.known_hosts.clone(),
            HostKeyPolicy::SaveOnFirstConnect,
            &self.worker_command,
        )
        .await
    }

    pub async fn evict(&self, node_name: &str) {
        self.channels.lock().await.remove(node_name);
    }

    pub async fn get_cached(&self, node_name: &str) -> Result<Arc<RemoteChannel>> {
        self.channels
            .lock()
            .await
            .get(node_name)
            .cloned()
            .ok_or_else(|| McVirtError::NodeUnreachable(node_name.to_string()))
    }
}
