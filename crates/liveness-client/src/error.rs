//! Error types for the liveness client.
//!
//! Errors are grouped by the layer that raises them: launching the server
//! process, connecting to its socket, moving messages over that socket, and
//! the session facade that ties the three together.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use liveness_core::ConfigError;
use liveness_protocol::WireError;
use thiserror::Error;

/// Errors raised while launching the detector server process.
#[derive(Error, Debug)]
pub enum LaunchError {
    /// The configured executable does not exist.
    #[error("Server executable not found: {}", path.display())]
    ExecutableNotFound { path: PathBuf },

    /// Any other configuration problem found before spawning.
    #[error("Invalid server configuration: {0}")]
    InvalidConfig(#[source] ConfigError),

    /// Another live process already answers on the socket path.
    #[error("Socket {} is already in use by another server", path.display())]
    AddressInUse { path: PathBuf },

    /// The OS refused to start the process.
    #[error("Failed to spawn {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The process exited before it started listening.
    #[error("Server exited during startup (exit code: {code:?})")]
    ExitedDuringStartup { code: Option<i32> },

    /// The socket never appeared within the startup window.
    #[error("Server did not start listening within {timeout:?}")]
    StartupTimeout { timeout: Duration },
}

impl From<ConfigError> for LaunchError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::ExecutableNotFound { path } => Self::ExecutableNotFound { path },
            other => Self::InvalidConfig(other),
        }
    }
}

/// Errors raised while connecting to the server socket.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// No connection could be established before the deadline.
    #[error("Timed out connecting to {} after {attempts} attempts ({timeout:?})", path.display())]
    Timeout {
        path: PathBuf,
        attempts: u32,
        timeout: Duration,
    },
}

/// Errors raised by an established connection.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The peer closed the connection.
    #[error("Connection closed by server")]
    Closed,

    /// A write did not complete in time.
    #[error("Write timed out after {timeout:?}")]
    WriteTimeout { timeout: Duration },

    /// The byte stream lost its framing and cannot be resynchronised.
    #[error("Unrecoverable protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

impl TransportError {
    /// True if this error means the peer went away.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected => Self::Closed,
            _ => Self::Io(err),
        }
    }
}

impl From<WireError> for TransportError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Io(io) => io.into(),
            other => Self::Protocol(other.to_string()),
        }
    }
}

/// Errors surfaced by [`LivenessSession`](crate::LivenessSession).
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session is not in the `Ready` state, or was torn down while
    /// the call was waiting.
    #[error("Detector server is not running")]
    NotRunning,

    #[error("Failed to launch server: {0}")]
    Launch(#[from] LaunchError),

    #[error("Failed to connect to server: {0}")]
    Connect(#[from] ConnectError),

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The message would exceed the wire size limit. Nothing was sent and
    /// the session is unaffected.
    #[error("Message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
