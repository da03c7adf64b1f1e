//! Per-connection state the Dispatcher loop threads through every handler
//! call: the shared `Services` plus the lock guard this worker obtains on
//! its *first* mutating call (never implicitly, and never re-entrantly).

use crate::lock::NodeLockGuard;
use crate::services::Services;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct WorkerContext {
    pub services: Arc<Services>,
    /// `Some` once `mcvirt-obtainLock` has succeeded for this connection;
    /// released (dropped) on `mcvirt-releaseLock` or when the connection
    /// tears down.
    pub lock_guard: Mutex<Option<NodeLockGuard>>,
}

impl WorkerContext {
    pub fn new(services: Arc<Services>) -> Self {
        WorkerContext {
            services,
            lock_guard: Mutex::new(None),
        }
    }
}
