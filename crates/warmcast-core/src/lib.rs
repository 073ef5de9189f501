//! Core of the warmcast broadcaster.
//!
//! Batched delivery (scheduler, dispatcher, per-recipient worker) and abuse
//! control for inbound submissions. Framework-agnostic: storage and the
//! outbound transport live behind ports implemented in adapter crates.

pub mod config;
pub mod delivery;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod ports;
pub mod scheduler;
pub mod security;
pub mod store;
pub mod transport;
pub mod trigger;
pub mod utils;

pub use errors::{Error, Result};
