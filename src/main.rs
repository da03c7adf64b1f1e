//! `mcvirtd` entry point. This binary plays one of two roles depending on
//! how it is invoked:
//!
//! - `mcvirtd --worker [--config path]`: the peer-facing role. Exec'd by a
//!   remote node's Remote Channel over SSH, with stdin/stdout wired to the
//!   SSH session; runs the Dispatcher loop until the peer closes the
//!   channel or sends the close sentinel.
//! - any other invocation: prints usage. The interactive admin surface
//!   (issuing Coordinator operations from a CLI) is out of scope here —
//!   see §1 Non-goals; this binary only implements the node-to-node half
//!   of the protocol.

use anyhow::{Context, Result};
use mcvirtd::config::AppConfig;
use mcvirtd::dispatcher;
use mcvirtd::dispatcher::context::WorkerContext;
use mcvirtd::libvirt_client::MockLibvirtClient;
use mcvirtd::services::Services;
use std::env;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(std::path::PathBuf::from)
        .or_else(|| env::var("MCVIRT_CONFIG").ok().map(std::path::PathBuf::from))
        .unwrap_or_else(|| std::path::PathBuf::from("config.toml"));

    let config = AppConfig::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    init_logging(&config);

    if args.iter().any(|a| a == "--version") {
        println!("mcvirtd {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    if !args.iter().any(|a| a == "--worker") {
        eprintln!("usage: mcvirtd --worker [--config path]");
        eprintln!("mcvirtd is invoked by a peer's Remote Channel over SSH; it is not a standalone daemon.");
        std::process::exit(1);
    }

    run_worker(config).await
}

fn init_logging(config: &AppConfig) {
    let filter = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .compact()
        .init();
}

/// Builds this node's `Services` and runs the Dispatcher loop over
/// stdin/stdout, matching the exec-channel contract `RemoteChannel`
/// expects on the other end.
async fn run_worker(config: AppConfig) -> Result<()> {
    let hostname = hostname_or_default();
    info!(%hostname, "starting mcvirtd worker");

    let config_store_path = config.storage_root.join(&hostname).join("config.json");
    if let Some(parent) = config_store_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating storage root {}", parent.display()))?;
    }
    let config_store =
        mcvirtd::cluster::store::ConfigStore::open(&config_store_path, &hostname, &config.host)
            .context("opening Config Store")?;

    // `qemu` is off by default so this binary builds and runs end to end on
    // hosts without libvirt-dev; swap in `libvirt_client::real::RealLibvirtClient`
    // under the `qemu` feature for a real hypervisor connection.
    let libvirt: Arc<dyn mcvirtd::libvirt_client::LibvirtClient> = MockLibvirtClient::new();

    let services = Arc::new(Services::new(hostname, config, config_store, libvirt));

    tokio::spawn(mcvirtd::storage::drbd::socket::run(
        services.app_config.drbd_socket_path.clone(),
        services.drbd.clone(),
    ));

    let ctx = Arc::new(WorkerContext::new(services));

    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    dispatcher::run(stdin, stdout, ctx).await;
    mcvirtd::metrics::log_summary();
    Ok(())
}

/// `$HOSTNAME`, then `/etc/hostname`, then `"localhost"` — deliberately not
/// pulling in a hostname crate for what is a one-shot startup lookup.
fn hostname_or_default() -> String {
    if let Ok(h) = env::var("HOSTNAME") {
        if !h.is_empty() {
            return h;
        }
    }
    if let Ok(contents) = std::fs::read_to_string("/etc/hostname") {
        let trimmed = contents.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    "localhost".to_string()
}
