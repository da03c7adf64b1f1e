//! The DRBD storage driver: resource identity allocation, config
//! generation, state machine, sync-state tracking, and the out-of-sync
//! socket listener.

pub mod driver;
pub mod handlers;
pub mod socket;
pub mod state;

pub use driver::{DrbdDriver, CLUSTER_SIZE, INITIAL_MINOR_ID, INITIAL_PORT};
pub use state::DrbdResourceRecord;
