//! Core domain + application logic for the account pool.
//!
//! This crate is framework-agnostic. The messaging platform lives behind the
//! `PlatformClient` port, implemented in adapter crates (and by
//! `platform::memory::MemoryPlatform` for tests).

pub mod config;
pub mod domain;
pub mod errors;
pub mod join;
pub mod logging;
pub mod manager;
pub mod platform;
mod pool;
pub mod store;
pub mod watcher;

pub use errors::{Error, Result};
