//! Defines the primary error type for the cluster management layer.
//!
//! Every error kind here is a distinct, user-surfaced category (see the
//! error handling design). Errors raised inside a dispatcher handler are
//! JSON-encoded as `{"kind": "...", "message": "..."}`, decoded by the
//! Remote Channel on the caller's side, and re-raised locally as the same
//! kind so a fanned-out failure on a peer reads identically to a local one.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// The main error enum for the crate, covering lock contention, transport
/// failures, dispatcher/coordinator faults, VM and storage validation, and
/// DRBD/ISO specific conditions.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum McVirtError {
    #[error("An instance of mcvirt is already running")]
    AlreadyRunning,

    #[error("Remote node's lock is held by another process")]
    RemoteLocked,

    #[error("Could not reach node {0}")]
    NodeUnreachable(String),

    #[error("Authentication to node {0} failed")]
    NodeAuthFailed(String),

    #[error("Unknown remote command: {0}")]
    UnknownRemoteCommand(String),

    #[error("Remote command '{command}' failed on {node} (exit {exit_code}): {stderr}")]
    RemoteCommandFailed {
        node: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid name '{0}': must match [A-Za-z0-9-]+")]
    InvalidName(String),

    #[error("Invalid volume group name '{0}'")]
    InvalidVolumeGroupName(String),

    #[error("Invalid IP address '{0}'")]
    InvalidIPAddress(String),

    #[error("VM '{0}' already exists")]
    VMExists(String),

    #[error("VM '{0}' does not exist")]
    VMMissing(String),

    #[error("Disk {0} already exists")]
    DiskExists(u8),

    #[error("Disk {0} does not exist")]
    DiskMissing(u8),

    #[error("VM '{0}' is running")]
    VMRunning(String),

    #[error("VM '{0}' is not running")]
    VMNotRunning(String),

    #[error("DRBD is not installed on this node")]
    DRBDNotInstalled,

    #[error("DRBD has already been enabled on this node")]
    DRBDAlreadyEnabled,

    #[error("DRBD is not enabled on node {0}")]
    DRBDNotEnabledOnNode(String),

    #[error("ISO '{0}' does not exist")]
    IsoMissing(String),

    #[error("ISO '{0}' is in use by VM '{1}'")]
    IsoInUse(String, String),

    #[error("ISO '{0}' already exists")]
    IsoAlreadyExists(String),

    #[error("ISO '{0}' is not present on destination node {1}")]
    IsoNotPresentOnDestination(String, String),

    #[error("Cluster inconsistency: peer {node} failed during step '{step}': {message}")]
    ClusterInconsistency {
        node: String,
        step: String,
        message: String,
    },

    #[error("Node '{0}' is not a known cluster member")]
    NodeMissing(String),

    #[error("Node '{0}' is already a cluster member")]
    NodeExists(String),

    #[error("Network '{0}' does not exist")]
    NetworkMissing(String),

    #[error("Network '{0}' already exists")]
    NetworkExists(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("(De)serialization error: {0}")]
    Serde(String),

    #[error("Template rendering error: {0}")]
    Template(String),

    #[error("Libvirt error: {0}")]
    Libvirt(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, McVirtError>;

impl From<std::io::Error> for McVirtError {
    fn from(e: std::io::Error) -> Self {
        McVirtError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for McVirtError {
    fn from(e: serde_json::Error) -> Self {
        McVirtError::Serde(e.to_string())
    }
}

impl From<tera::Error> for McVirtError {
    fn from(e: tera::Error) -> Self {
        McVirtError::Template(e.to_string())
    }
}

/// A shared-ownership wrapper used where an error must be cloned across
/// fanout bookkeeping (e.g. recorded once per failed peer, surfaced once to
/// the caller).
pub type SharedError = Arc<McVirtError>;

/// Envelope used to carry an error kind across the wire protocol's
/// newline-delimited JSON stream, matching the Dispatcher/Remote Channel
/// contract: `{"kind": "...", "message": "...", "detail": {...}}`.
/// `message` is always the rendered `Display` text, used verbatim for
/// single-field/unit variants; `detail` carries the structured fields a
/// multi-field variant needs to reconstruct exactly rather than lossily
/// re-parsing them back out of the rendered message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl From<&McVirtError> for WireError {
    fn from(err: &McVirtError) -> Self {
        let kind = match err {
            McVirtError::AlreadyRunning => "AlreadyRunning",
            McVirtError::RemoteLocked => "RemoteLocked",
            McVirtError::NodeUnreachable(_) => "NodeUnreachable",
            McVirtError::NodeAuthFailed(_) => "NodeAuthFailed",
            McVirtError::UnknownRemoteCommand(_) => "UnknownRemoteCommand",
            McVirtError::RemoteCommandFailed { .. } => "RemoteCommandFailed",
            McVirtError::PermissionDenied(_) => "PermissionDenied",
            McVirtError::InvalidName(_) => "InvalidName",
            McVirtError::InvalidVolumeGroupName(_) => "InvalidVolumeGroupName",
            McVirtError::InvalidIPAddress(_) => "InvalidIPAddress",
            McVirtError::VMExists(_) => "VMExists",
            McVirtError::VMMissing(_) => "VMMissing",
            McVirtError::DiskExists(_) => "DiskExists",
            McVirtError::DiskMissing(_) => "DiskMissing",
            McVirtError::VMRunning(_) => "VMRunning",
            McVirtError::VMNotRunning(_) => "VMNotRunning",
            McVirtError::DRBDNotInstalled => "DRBDNotInstalled",
            McVirtError::DRBDAlreadyEnabled => "DRBDAlreadyEnabled",
            McVirtError::DRBDNotEnabledOnNode(_) => "DRBDNotEnabledOnNode",
            McVirtError::IsoMissing(_) => "IsoMissing",
            McVirtError::IsoInUse(_, _) => "IsoInUse",
            McVirtError::IsoAlreadyExists(_) => "IsoAlreadyExists",
            McVirtError::IsoNotPresentOnDestination(_, _) => "IsoNotPresentOnDestination",
            McVirtError::ClusterInconsistency { .. } => "ClusterInconsistency",
            McVirtError::NodeMissing(_) => "NodeMissing",
            McVirtError::NodeExists(_) => "NodeExists",
            McVirtError::NetworkMissing(_) => "NetworkMissing",
            McVirtError::NetworkExists(_) => "NetworkExists",
            McVirtError::Io(_) => "Io",
            McVirtError::Serde(_) => "Serde",
            McVirtError::Template(_) => "Template",
            McVirtError::Libvirt(_) => "Libvirt",
            McVirtError::Internal(_) => "Internal",
        };
        let detail = match err {
            McVirtError::DiskExists(id) | McVirtError::DiskMissing(id) => {
                Some(serde_json::json!({ "disk_id": id }))
            }
            McVirtError::IsoInUse(iso_name, vm_name) => {
                Some(serde_json::json!({ "iso_name": iso_name, "vm_name": vm_name }))
            }
            McVirtError::IsoNotPresentOnDestination(iso_name, node) => {
                Some(serde_json::json!({ "iso_name": iso_name, "node": node }))
            }
            McVirtError::RemoteCommandFailed {
                node,
                command,
                exit_code,
                stderr,
            } => Some(serde_json::json!({
                "node": node,
                "command": command,
                "exit_code": exit_code,
                "stderr": stderr,
            })),
            McVirtError::ClusterInconsistency { node, step, message } => Some(serde_json::json!({
                "node": node,
                "step": step,
                "message": message,
            })),
            _ => None,
        };
        WireError {
            kind: kind.to_string(),
            message: err.to_string(),
            detail,
        }
    }
}

impl WireError {
    fn detail_str(&self, field: &str) -> String {
        self.detail
            .as_ref()
            .and_then(|d| d.get(field))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    }

    fn detail_u8(&self, field: &str) -> u8 {
        self.detail
            .as_ref()
            .and_then(|d| d.get(field))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u8
    }

    fn detail_i32(&self, field: &str) -> i32 {
        self.detail
            .as_ref()
            .and_then(|d| d.get(field))
            .and_then(|v| v.as_i64())
            .unwrap_or(0) as i32
    }
}

impl From<WireError> for McVirtError {
    fn from(wire: WireError) -> Self {
        match wire.kind.as_str() {
            "AlreadyRunning" => McVirtError::AlreadyRunning,
            "RemoteLocked" => McVirtError::RemoteLocked,
            "NodeUnreachable" => McVirtError::NodeUnreachable(wire.message),
            "NodeAuthFailed" => McVirtError::NodeAuthFailed(wire.message),
            "UnknownRemoteCommand" => McVirtError::UnknownRemoteCommand(wire.message),
            "RemoteCommandFailed" => McVirtError::RemoteCommandFailed {
                node: wire.detail_str("node"),
                command: wire.detail_str("command"),
                exit_code: wire.detail_i32("exit_code"),
                stderr: wire.detail_str("stderr"),
            },
            "PermissionDenied" => McVirtError::PermissionDenied(wire.message),
            "InvalidName" => McVirtError::InvalidName(wire.message),
            "InvalidVolumeGroupName" => McVirtError::InvalidVolumeGroupName(wire.message),
            "InvalidIPAddress" => McVirtError::InvalidIPAddress(wire.message),
            "VMExists" => McVirtError::VMExists(wire.message),
            "VMMissing" => McVirtError::VMMissing(wire.message),
            "DiskExists" => McVirtError::DiskExists(wire.detail_u8("disk_id")),
            "DiskMissing" => McVirtError::DiskMissing(wire.detail_u8("disk_id")),
            "VMRunning" => McVirtError::VMRunning(wire.message),
            "VMNotRunning" => McVirtError::VMNotRunning(wire.message),
            "DRBDNotInstalled" => McVirtError::DRBDNotInstalled,
            "DRBDAlreadyEnabled" => McVirtError::DRBDAlreadyEnabled,
            "DRBDNotEnabledOnNode" => McVirtError::DRBDNotEnabledOnNode(wire.message),
            "IsoMissing" => McVirtError::IsoMissing(wire.message),
            "IsoInUse" => McVirtError::IsoInUse(wire.detail_str("iso_name"), wire.detail_str("vm_name")),
            "IsoAlreadyExists" => McVirtError::IsoAlreadyExists(wire.message),
            "IsoNotPresentOnDestination" => {
                McVirtError::IsoNotPresentOnDestination(wire.detail_str("iso_name"), wire.detail_str("node"))
            }
            "ClusterInconsistency" => McVirtError::ClusterInconsistency {
                node: wire.detail_str("node"),
                step: wire.detail_str("step"),
                message: wire.detail_str("message"),
            },
            "NodeMissing" => McVirtError::NodeMissing(wire.message),
            "NodeExists" => McVirtError::NodeExists(wire.message),
            "NetworkMissing" => McVirtError::NetworkMissing(wire.message),
            "NetworkExists" => McVirtError::NetworkExists(wire.message),
            other => McVirtError::Internal(format!("{other}: {}", wire.message)),
        }
    }
}
