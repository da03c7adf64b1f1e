//! Thin wrapper around external-process invocations: `lvcreate`, `lvremove`,
//! `lvchange`, `lvextend`, `drbdadm`. Grounded in the original's
//! `mcvirt.system.System.runCommand` helper; re-expressed here as an async
//! function so callers can simply `.await` it from a Tokio task rather than
//! blocking the executor, matching how the teacher crate isolates blocking
//! syscalls onto `spawn_blocking`/async equivalents.

use crate::error::{McVirtError, Result};
use tokio::process::Command;
use tracing::{debug, warn};

async fn run(program: &str, args: &[&str]) -> Result<String> {
    debug!(program, ?args, "running external command");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| McVirtError::Internal(format!("failed to spawn {program}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        warn!(program, ?args, code = ?output.status.code(), %stderr, "external command failed");
        return Err(McVirtError::Internal(format!(
            "{program} {args:?} failed (exit {:?}): {stderr}",
            output.status.code()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

pub async fn lvcreate(vg: &str, lv_name: &str, size_mb: u64) -> Result<()> {
    run(
        "lvcreate",
        &["-L", &format!("{size_mb}M"), "-n", lv_name, vg],
    )
    .await
    .map(|_| ())
}

pub async fn lvremove(vg: &str, lv_name: &str) -> Result<()> {
    run("lvremove", &["-f", &format!("{vg}/{lv_name}")])
        .await
        .map(|_| ())
}

pub async fn lvextend(vg: &str, lv_name: &str, new_size_mb: u64) -> Result<()> {
    run(
        "lvextend",
        &["-L", &format!("{new_size_mb}M"), &format!("{vg}/{lv_name}")],
    )
    .await
    .map(|_| ())
}

pub const DRBDADM: &str = "/sbin/drbdadm";

pub async fn drbdadm(args: &[&str]) -> Result<String> {
    run(DRBDADM, args).await
}

pub fn drbdadm_installed() -> bool {
    std::path::Path::new(DRBDADM).is_file()
}
