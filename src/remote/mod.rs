//! The Remote Channel: one authenticated SSH transport per peer, the
//! newline-delimited JSON wire protocol it speaks, and known-hosts
//! handling.

pub mod channel;
pub mod known_hosts;
pub mod pool;
pub mod protocol;

pub use channel::{Auth, HostKeyPolicy, RemoteChannel, CONNECT_TIMEOUT};
pub use known_hosts::KnownHosts;
pub use pool::ChannelPool;
pub use protocol::{WireRequest, WireResponse};
