//! Storage subsystems: the DRBD replicated block device driver and the
//! node-local auxiliary stores (ISO, network registry, node settings).

pub mod aux;
pub mod drbd;
