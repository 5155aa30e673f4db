//! The network-facing boundary: one live platform connection per account.

pub mod memory;
pub mod port;
pub mod types;
