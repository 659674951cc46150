//! Domain-specific error types following panic-free policy.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while decoding a frame payload.
///
/// A corrupt payload only invalidates the message it arrived in; callers
/// drop the message and keep reading.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The payload does not describe a valid frame.
    #[error("Malformed frame payload: {reason}")]
    MalformedPayload { reason: String },
}

impl CodecError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            reason: reason.into(),
        }
    }
}

/// Errors raised while loading or validating a [`ServerConfig`](crate::ServerConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The server executable does not exist or is not a regular file.
    #[error("Server executable not found: {}", path.display())]
    ExecutableNotFound { path: PathBuf },

    /// A required asset path is missing or unreadable.
    #[error("Invalid {field} {}: {reason}", path.display())]
    InvalidPath {
        field: &'static str,
        path: PathBuf,
        reason: String,
    },

    /// A scalar field has an invalid value.
    #[error("Invalid {field}: {value} (expected {expected})")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        expected: &'static str,
    },

    /// Failed to read a configuration file.
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse a TOML configuration document.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
