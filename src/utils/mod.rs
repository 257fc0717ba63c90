// src/utils/mod.rs
//! Common utilities: configuration and error types

pub mod config;
pub mod errors;

pub use config::{DiscoveryConfig, SocketConfig, TraceConfig};
pub use errors::{DiscoveryError, Result};
