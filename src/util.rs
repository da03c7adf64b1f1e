//! Small cross-cutting helpers shared by the Config Store and per-VM config.

use crate::error::{McVirtError, Result};
use serde::Serialize;
use std::path::Path;

/// Serialises `value` as pretty JSON and atomically replaces the file at
/// `path` via write-to-temp-then-rename, so no reader ever observes a
/// partially written document.
pub fn write_atomic_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let serialized = serde_json::to_string_pretty(value)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension(format!("tmp.{}", rand::random::<u32>()));
    std::fs::write(&tmp_path, serialized)?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        McVirtError::Internal(format!(
            "failed to atomically replace {}: {e}",
            path.display()
        ))
    })
}

/// Validates a VM/resource name against `[A-Za-z0-9-]+`.
pub fn validate_name(name: &str) -> Result<()> {
    if !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        Ok(())
    } else {
        Err(McVirtError::InvalidName(name.to_string()))
    }
}

/// Validates an LVM volume group name: alphanumeric plus `-`, `_`, `.`.
pub fn validate_volume_group_name(name: &str) -> Result<()> {
    if !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        Ok(())
    } else {
        Err(McVirtError::InvalidVolumeGroupName(name.to_string()))
    }
}

/// Validates a dotted-quad IPv4 address (the cluster does not speak IPv6).
pub fn validate_ip_address(ip: &str) -> Result<()> {
    let parts: Vec<&str> = ip.split('.').collect();
    let valid = parts.len() == 4
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.parse::<u8>().is_ok());
    if valid {
        Ok(())
    } else {
        Err(McVirtError::InvalidIPAddress(ip.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(validate_name("web-01").is_ok());
        assert!(validate_name("web_01").is_err());
        assert!(validate_name("").is_err());
    }

    #[test]
    fn ip_validation() {
        assert!(validate_ip_address("10.0.0.1").is_ok());
        assert!(validate_ip_address("10.0.0.1.5").is_err());
        assert!(validate_ip_address("10.0.0.256").is_err());
        assert!(validate_ip_address("not-an-ip").is_err());
    }

    #[test]
    fn vg_name_validation() {
        assert!(validate_volume_group_name("mcvirt_vg-01").is_ok());
        assert!(validate_volume_group_name("bad vg").is_err());
    }
}
