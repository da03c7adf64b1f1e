//! Auxiliary node-local stores that sit alongside the DRBD driver: ISO
//! management, the network registry, and node-wide setting mutations.

pub mod iso;
pub mod network;
pub mod node_settings;

pub use iso::IsoStore;
pub use network::NetworkStore;
