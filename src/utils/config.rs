// src/utils/config.rs
//! Layered configuration: defaults, optional `test-discovery.toml`, then
//! `TEST_DISCOVERY__*` environment variables.

use crate::recording::TraceVersion;
use crate::utils::errors::{DiscoveryError, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Default config file name, looked up in the working directory
pub const CONFIG_FILE: &str = "test-discovery";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "TEST_DISCOVERY";

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub socket: SocketConfig,

    #[serde(default)]
    pub trace: TraceConfig,
}

/// Socket transport settings
#[derive(Debug, Clone, Deserialize)]
pub struct SocketConfig {
    /// Listener host
    #[serde(default = "default_host")]
    pub host: String,

    /// Listener port; no default
    #[serde(default)]
    pub port: Option<u16>,

    /// Buffers the producer may queue before blocking
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// SO_SNDBUF for the connection
    #[serde(default = "default_send_buffer_size")]
    pub send_buffer_size: u32,

    /// Length of each of the two shutdown wait windows
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            queue_capacity: default_queue_capacity(),
            send_buffer_size: default_send_buffer_size(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl SocketConfig {
    /// Config pointing at `host:port` with all other settings defaulted
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: Some(port),
            ..Default::default()
        }
    }

    /// The configured port, or an error when it was never set
    pub fn require_port(&self) -> Result<u16> {
        self.port.ok_or_else(|| {
            DiscoveryError::ConfigError("socket.port is required".to_string())
        })
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Trace file settings
#[derive(Debug, Clone, Deserialize)]
pub struct TraceConfig {
    /// Output path; `None` disables the file listener
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Framing version byte (1 = deferred footer, 2 = incremental)
    #[serde(default = "default_trace_version")]
    pub version: u8,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            path: None,
            version: default_trace_version(),
        }
    }
}

impl TraceConfig {
    pub fn trace_version(&self) -> Result<TraceVersion> {
        TraceVersion::from_byte(self.version).ok_or_else(|| {
            DiscoveryError::ConfigError(format!("unsupported trace version {}", self.version))
        })
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_queue_capacity() -> usize {
    10
}

fn default_send_buffer_size() -> u32 {
    16 * 1024
}

fn default_shutdown_timeout_secs() -> u64 {
    60
}

fn default_trace_version() -> u8 {
    1
}

impl DiscoveryConfig {
    /// Load configuration from the default file and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(CONFIG_FILE)
    }

    /// Load configuration from `file` (optional, extension inferred) and the environment
    pub fn load_from(file: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(file).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| DiscoveryError::ConfigError(format!("Failed to load config: {}", e)))?;

        let config: DiscoveryConfig = settings
            .try_deserialize()
            .map_err(|e| DiscoveryError::ConfigError(format!("Invalid config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the transports cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.socket.queue_capacity == 0 {
            return Err(DiscoveryError::ConfigError(
                "socket.queue_capacity must be at least 1".to_string(),
            ));
        }
        self.trace.trace_version()?;
        Ok(())
    }
}
