// src/utils/errors.rs
//! Error types shared by the recording, transport and merge layers

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Errors raised while collecting or exporting discovery data
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The producer handed over malformed input (marker/name mismatch,
    /// merge of different counter kinds). Signals a bug upstream.
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// Writing encoded bytes to a sink failed
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// The socket transport died; the session cannot continue
    #[error("Transport failed: {0}")]
    TransportFailed(String),

    /// A trace or wire stream could not be parsed
    #[error("Malformed trace: {0}")]
    MalformedTrace(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Data was submitted after the session was finished
    #[error("Session already closed")]
    SessionClosed,
}

impl DiscoveryError {
    /// Whether the error ends the current session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DiscoveryError::TransportFailed(_) | DiscoveryError::SessionClosed
        )
    }
}
