//! The per-resource DRBD lifecycle state machine and observed runtime
//! state.
//!
//! ```text
//! absent --createLV--> lv_ready --generateConfig--> defined
//!                                      |
//!                       initialiseMetaData --> metadata_ready
//!                                      |
//!                                  drbdUp --> up
//!                                      |
//!                               drbdConnect --> connected
//!                                      |
//!                           (initial full sync) --> syncing --> in_sync
//! ```
//!
//! Terminal teardown path from any state:
//! `drbdDisconnect -> drbdDown -> removeDrbdConfig -> removeLV`. Every
//! transition is a single idempotent action, checkpointed so a failure
//! leaves the resource in a recoverable earlier state rather than a
//! half-connected one.

use crate::error::{McVirtError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Absent,
    LvReady,
    Defined,
    MetadataReady,
    Up,
    Connected,
    Syncing,
    InSync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    StandAlone,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskState {
    Diskless,
    Inconsistent,
    UpToDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    InSync,
    OutOfSync,
}

/// Per-node runtime record for one replicated resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrbdResourceRecord {
    pub resource_name: String,
    pub vm_name: String,
    pub disk_id: u8,
    pub minor: u32,
    pub port: u16,
    pub lifecycle: Lifecycle,
    pub role: Role,
    pub connection_state: ConnectionState,
    pub disk_state: DiskState,
    pub sync_state: SyncState,
}

impl DrbdResourceRecord {
    pub fn new(resource_name: String, vm_name: String, disk_id: u8, minor: u32, port: u16) -> Self {
        DrbdResourceRecord {
            resource_name,
            vm_name,
            disk_id,
            minor,
            port,
            lifecycle: Lifecycle::Absent,
            role: Role::Secondary,
            connection_state: ConnectionState::StandAlone,
            disk_state: DiskState::Diskless,
            sync_state: SyncState::InSync,
        }
    }

    /// Applies the named forward transition, idempotently: calling the
    /// action that produces the state the record is already in is a no-op
    /// rather than an error, matching the "calling either twice in a row
    /// ... does not change observable state" property.
    pub fn advance(&mut self, action: &str) -> Result<()> {
        use Lifecycle::*;
        let next = match (self.lifecycle, action) {
            (Absent, "createLV") => LvReady,
            (LvReady, "createLV") => LvReady,

            (LvReady, "generateConfig") => Defined,
            (Defined, "generateConfig") => Defined,

            (Defined, "initialiseMetaData") => MetadataReady,
            (MetadataReady, "initialiseMetaData") => MetadataReady,

            (MetadataReady, "drbdUp") => Up,
            (Up, "drbdUp") => Up,

            (Up, "drbdConnect") => {
                self.connection_state = ConnectionState::Connected;
                Connected
            }
            (Connected, "drbdConnect") => Connected,

            (Connected, "beginSync") => {
                self.disk_state = DiskState::Inconsistent;
                Syncing
            }
            (Syncing, "beginSync") => Syncing,

            (Syncing, "completeSync") => {
                self.disk_state = DiskState::UpToDate;
                self.sync_state = SyncState::InSync;
                InSync
            }
            (InSync, "completeSync") => InSync,

            (current, other) => {
                return Err(McVirtError::Internal(format!(
                    "invalid DRBD transition '{other}' from state {current:?} for resource {}",
                    self.resource_name
                )));
            }
        };
        self.lifecycle = next;
        Ok(())
    }

    /// Applies the named teardown transition, reachable from any state.
    /// Each step is idempotent and moves strictly backward, so a crash
    /// mid-teardown leaves the resource in a recoverable earlier state.
    pub fn teardown(&mut self, action: &str) -> Result<()> {
        use Lifecycle::*;
        match action {
            "drbdDisconnect" => {
                self.connection_state = ConnectionState::StandAlone;
                if matches!(self.lifecycle, Connected | Syncing | InSync) {
                    self.lifecycle = Up;
                }
            }
            "drbdDown" => {
                if matches!(self.lifecycle, Up | Connected | Syncing | InSync) {
                    self.lifecycle = MetadataReady;
                }
                self.disk_state = DiskState::Diskless;
            }
            "removeDrbdConfig" => {
                if matches!(self.lifecycle, MetadataReady | Up | Connected | Syncing | InSync) {
                    self.lifecycle = LvReady;
                }
            }
            "removeLV" => {
                self.lifecycle = Absent;
            }
            other => {
                return Err(McVirtError::Internal(format!(
                    "unknown teardown action '{other}'"
                )));
            }
        }
        Ok(())
    }

    pub fn set_sync_state(&mut self, in_sync: bool) {
        self.sync_state = if in_sync {
            SyncState::InSync
        } else {
            SyncState::OutOfSync
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> DrbdResourceRecord {
        DrbdResourceRecord::new("mcvirt_vm-web-disk-1".to_string(), "web".to_string(), 1, 1, 7789)
    }

    #[test]
    fn full_lifecycle_reaches_in_sync() {
        let mut r = fresh();
        for action in [
            "createLV",
            "generateConfig",
            "initialiseMetaData",
            "drbdUp",
            "drbdConnect",
            "beginSync",
            "completeSync",
        ] {
            r.advance(action).unwrap();
        }
        assert_eq!(r.lifecycle, Lifecycle::InSync);
        assert_eq!(r.sync_state, SyncState::InSync);
    }

    #[test]
    fn drbd_up_down_is_idempotent() {
        let mut r = fresh();
        r.advance("createLV").unwrap();
        r.advance("generateConfig").unwrap();
        r.advance("initialiseMetaData").unwrap();
        r.advance("drbdUp").unwrap();
        let before = r.lifecycle;
        r.advance("drbdUp").unwrap();
        assert_eq!(r.lifecycle, before);

        r.teardown("drbdDown").unwrap();
        let after_first_down = r.lifecycle;
        r.teardown("drbdDown").unwrap();
        assert_eq!(r.lifecycle, after_first_down);
    }

    #[test]
    fn invalid_transition_rejected() {
        let mut r = fresh();
        assert!(r.advance("drbdConnect").is_err());
    }

    #[test]
    fn teardown_from_any_state_reaches_absent() {
        let mut r = fresh();
        for action in ["createLV", "generateConfig"] {
            r.advance(action).unwrap();
        }
        for action in ["drbdDisconnect", "drbdDown", "removeDrbdConfig", "removeLV"] {
            r.teardown(action).unwrap();
        }
        assert_eq!(r.lifecycle, Lifecycle::Absent);
    }
}
