//! Auth: the capability check hook. The distilled spec treats permissions
//! as "an external collaborator, interface only"; this is that interface —
//! a small fixed permission table gating each mutating operation, grounded
//! in the original `auth.py`'s `PERMISSIONS` enum and `assertPermission`.

use crate::error::{McVirtError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    ManageCluster,
    ManageVm,
    ChangeVmPowerState,
    ManageDrbd,
    CanIgnoreDrbd,
    ManageIso,
    ManageNetwork,
}

/// The caller identity a coordinator operation runs as. `username: None`
/// means "local superuser" (e.g. a worker acting on the coordinator's
/// behalf) and is granted every capability, matching the original's
/// `username=None` unittest bypass.
#[derive(Debug, Clone, Default)]
pub struct Auth {
    superusers: Vec<String>,
}

impl Auth {
    pub fn with_superusers(superusers: Vec<String>) -> Self {
        Auth { superusers }
    }

    /// Returns `Ok(())` if `username` may exercise `capability`,
    /// `PermissionDenied` otherwise. `None` (no caller identity attached,
    /// e.g. a peer-to-peer fanout action) is always permitted: fanned-out
    /// actions were already authorized on the node that originated them.
    pub fn assert_permission(&self, username: Option<&str>, capability: Capability) -> Result<()> {
        match username {
            None => Ok(()),
            Some(name) if self.superusers.iter().any(|s| s == name) => Ok(()),
            Some(name) => Err(McVirtError::PermissionDenied(format!(
                "{name} lacks {capability:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superuser_permitted() {
        let auth = Auth::with_superusers(vec!["admin".to_string()]);
        assert!(
            auth.assert_permission(Some("admin"), Capability::ManageVm)
                .is_ok()
        );
    }

    #[test]
    fn non_superuser_denied() {
        let auth = Auth::with_superusers(vec!["admin".to_string()]);
        assert!(
            auth.assert_permission(Some("guest"), Capability::ManageVm)
                .is_err()
        );
    }

    #[test]
    fn no_identity_permitted() {
        let auth = Auth::default();
        assert!(auth.assert_permission(None, Capability::ManageVm).is_ok());
    }
}
