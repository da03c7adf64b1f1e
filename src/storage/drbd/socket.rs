//! The DRBD Socket: a Unix domain socket an out-of-band host-side script
//! connects to and sends a resource name whenever DRBD reports an
//! out-of-sync event. A single accept loop handles one connection at a
//! time; the socket file is removed and recreated on start.

use crate::storage::drbd::driver::DrbdDriver;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tokio::net::UnixListener;
use tracing::{debug, error, info, warn};

const MAX_MESSAGE_BYTES: usize = 1024;

/// Runs the accept loop forever, marking the named resource's `sync_state`
/// out of sync on every message received. Intended to be spawned as a
/// single background task per node process; its only shared state is the
/// `DrbdDriver` handle, which itself serialises writes through the Config
/// Store's atomic-write primitive.
pub async fn run(socket_path: PathBuf, driver: DrbdDriver) {
    if let Err(e) = prepare_socket_path(&socket_path) {
        error!(path = %socket_path.display(), error = %e, "failed to prepare DRBD socket path");
        return;
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(e) => {
            error!(path = %socket_path.display(), error = %e, "failed to bind DRBD socket");
            return;
        }
    };
    info!(path = %socket_path.display(), "DRBD out-of-sync listener started");

    loop {
        let (mut stream, _addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "DRBD socket accept failed");
                continue;
            }
        };

        let mut buf = vec![0u8; MAX_MESSAGE_BYTES];
        let resource_name = match stream.read(&mut buf).await {
            Ok(0) => continue,
            Ok(n) => String::from_utf8_lossy(&buf[..n]).trim().to_string(),
            Err(e) => {
                warn!(error = %e, "DRBD socket read failed");
                continue;
            }
        };

        if resource_name.is_empty() {
            continue;
        }

        match driver.set_sync_state(&resource_name, false, false) {
            Ok(()) => debug!(resource = %resource_name, "marked resource out of sync"),
            Err(e) => warn!(resource = %resource_name, error = %e, "failed to mark resource out of sync"),
        }
    }
}

fn prepare_socket_path(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
