//! Error types for tandem

use thiserror::Error;

use crate::types::DeviceStatus;

/// Result type alias using the tandem Error
pub type Result<T> = std::result::Result<T, Error>;

/// tandem error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid script: {0}")]
    InvalidScript(String),

    #[error("Unknown device alias: {alias}")]
    UnknownDevice { alias: String },

    #[error("Connection to device {alias} failed: {message}")]
    Connection { alias: String, message: String },

    #[error("Device {alias} is not ready (status: {status})")]
    DeviceNotReady { alias: String, status: DeviceStatus },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Operation timeout: {operation} after {millis}ms")]
    Timeout { operation: String, millis: u64 },

    #[error("Device kind not yet implemented: {0}")]
    NotImplemented(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error came out of connection establishment
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection { .. } | Error::NotImplemented(_))
    }
}
