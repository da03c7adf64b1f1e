//! The Remote Channel: one persistent authenticated SSH transport per peer,
//! carrying a request/response stream to that peer's Dispatcher worker.
//!
//! Concurrency contract: strictly request/response, at most one request in
//! flight per channel — enforced here with a `tokio::sync::Mutex` around
//! the `russh::Channel` itself (the object that both sends channel data and
//! delivers incoming `ChannelMsg`s), matching the teacher crate's use of
//! async mutexes to serialise access to a single shared connection (see
//! `connection::session`). On the first command after connect, the channel
//! sends `checkStatus` and fails with `RemoteLocked` unless the reply is
//! `["0"]`. Any malformed reply or non-zero exit marks the channel dead and
//! raises `RemoteCommandFailed`.

use crate::cluster::node::Node;
use crate::error::{McVirtError, Result};
use crate::remote::known_hosts::KnownHosts;
use crate::remote::protocol::{WireRequest, WireResponse, is_check_status_ready};
use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{Channel, ChannelMsg, Disconnect};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Authentication mode for a peer connection. Password auth is intended
/// only for the one-time add-node handshake; steady-state coordinator
/// traffic always uses `PrivateKey`.
#[derive(Debug, Clone)]
pub enum Auth {
    Password(String),
    PrivateKey(PathBuf),
}

/// Whether host-key verification consults the known-hosts file (the
/// default) or auto-accepts and persists whatever key the peer presents
/// (used only by the add-node handshake).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyPolicy {
    Verify,
    SaveOnFirstConnect,
}

struct VerifyingHandler {
    host: String,
    known_hosts: Arc<std::sync::Mutex<KnownHosts>>,
    policy: HostKeyPolicy,
}

#[async_trait]
impl client::Handler for VerifyingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let key_line = format!(
            "{} {}",
            server_public_key.name(),
            russh_keys::key::PublicKey::public_key_base64(server_public_key)
        );
        match self.policy {
            HostKeyPolicy::SaveOnFirstConnect => {
                let mut guard = self.known_hosts.lock().unwrap();
                let _ = guard.trust(&self.host, &key_line);
                Ok(true)
            }
            HostKeyPolicy::Verify => {
                let guard = self.known_hosts.lock().unwrap();
                Ok(guard.verify(&self.host, &key_line))
            }
        }
    }
}

/// A connected, authenticated channel to exactly one peer's Dispatcher
/// worker process. `handle` is kept alive to carry the connection and
/// issue `disconnect`; all request/response traffic goes through `channel`,
/// the object that actually delivers incoming `ChannelMsg`s — the `Mutex`
/// around it is what limits the channel to one in-flight request.
pub struct RemoteChannel {
    node_name: String,
    handle: Handle<VerifyingHandler>,
    channel: Mutex<Channel<client::Msg>>,
    dead: AtomicBool,
}

impl RemoteChannel {
    /// Connects to `node`, launches the remote worker process over an SSH
    /// exec channel, authenticates per `auth`, and performs the mandatory
    /// `checkStatus` handshake.
    pub async fn connect(
        node: &Node,
        auth: Auth,
        known_hosts: Arc<std::sync::Mutex<KnownHosts>>,
        policy: HostKeyPolicy,
        worker_command: &str,
    ) -> Result<Self> {
        let config = Arc::new(client::Config {
            connection_timeout: Some(CONNECT_TIMEOUT),
            ..Default::default()
        });
        let handler = VerifyingHandler {
            host: node.name.clone(),
            known_hosts,
            policy,
        };

        let addr = format!("{}:22", node.ip_address);
        let mut handle = tokio::time::timeout(CONNECT_TIMEOUT, client::connect(config, addr, handler))
            .await
            .map_err(|_| McVirtError::NodeUnreachable(node.name.clone()))?
            .map_err(|e| McVirtError::NodeUnreachable(format!("{}: {e}", node.name)))?;

        let authenticated = match auth {
            Auth::Password(password) => handle
                .authenticate_password("mcvirt", password)
                .await
                .map_err(|e| McVirtError::NodeAuthFailed(format!("{}: {e}", node.name)))?,
            Auth::PrivateKey(path) => {
                let key_pair = russh_keys::load_secret_key(&path, None)
                    .map_err(|e| McVirtError::NodeAuthFailed(format!("{}: {e}", node.name)))?;
                handle
                    .authenticate_publickey("mcvirt", Arc::new(key_pair))
                    .await
                    .map_err(|e| McVirtError::NodeAuthFailed(format!("{}: {e}", node.name)))?
            }
        };
        if !authenticated {
            return Err(McVirtError::NodeAuthFailed(node.name.clone()));
        }

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| McVirtError::NodeUnreachable(format!("{}: {e}", node.name)))?;
        channel
            .exec(true, worker_command)
            .await
            .map_err(|e| McVirtError::NodeUnreachable(format!("{}: {e}", node.name)))?;

        let remote = RemoteChannel {
            node_name: node.name.clone(),
            handle,
            channel: Mutex::new(channel),
            dead: AtomicBool::new(false),
        };

        let status = remote.call_raw("checkStatus", Value::Null).await?;
        if !is_check_status_ready(&status) {
            remote.dead.store(true, Ordering::SeqCst);
            return Err(McVirtError::RemoteLocked);
        }

        Ok(remote)
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Invokes a named remote action with arguments, blocking until a full
    /// response line is read back.
    pub async fn run_remote_command(&self, action: &str, arguments: Value) -> Result<Value> {
        if self.is_dead() {
            return Err(McVirtError::NodeUnreachable(self.node_name.clone()));
        }
        self.call_raw(action, arguments).await
    }

    async fn call_raw(&self, action: &str, arguments: Value) -> Result<Value> {
        let mut channel = self.channel.lock().await;
        let request = WireRequest::new(action, arguments);
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');

        channel
            .data(&line[..])
            .await
            .map_err(|e| self.mark_dead_and_wrap(action, e.to_string()))?;

        let mut buf = Vec::new();
        loop {
            let Some(msg) = channel.wait().await else {
                return Err(self.mark_dead_and_wrap(action, "connection closed".to_string()));
            };
            match msg {
                ChannelMsg::Data { data } => {
                    buf.extend_from_slice(&data);
                    if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                        let line = &buf[..pos];
                        let response: WireResponse = serde_json::from_slice(line)
                            .map_err(|e| self.mark_dead_and_wrap(action, e.to_string()))?;
                        return response.into_result();
                    }
                }
                ChannelMsg::ExitStatus { exit_status } if exit_status != 0 => {
                    self.dead.store(true, Ordering::SeqCst);
                    return Err(McVirtError::RemoteCommandFailed {
                        node: self.node_name.clone(),
                        command: action.to_string(),
                        exit_code: exit_status as i32,
                        stderr: String::from_utf8_lossy(&buf).to_string(),
                    });
                }
                ChannelMsg::Eof | ChannelMsg::Close => {
                    return Err(self.mark_dead_and_wrap(action, "channel closed early".to_string()));
                }
                _ => {}
            }
        }
    }

    fn mark_dead_and_wrap(&self, action: &str, message: String) -> McVirtError {
        self.dead.store(true, Ordering::SeqCst);
        warn!(node = %self.node_name, %action, %message, "remote channel failed, marking dead");
        McVirtError::RemoteCommandFailed {
            node: self.node_name.clone(),
            command: action.to_string(),
            exit_code: -1,
            stderr: message,
        }
    }

    /// Sends the `close` sentinel so the remote worker exits cleanly, then
    /// tears down the SSH connection. No response is expected for `close`.
    pub async fn close(self) {
        let request = WireRequest::new(WireRequest::CLOSE, Value::Null);
        if let Ok(mut line) = serde_json::to_vec(&request) {
            line.push(b'\n');
            let mut channel = self.channel.lock().await;
            let _ = channel.data(&line[..]).await;
        }
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
        debug!(node = %self.node_name, "closed remote channel");
    }
}
