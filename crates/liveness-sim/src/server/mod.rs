//! Unix socket server for the simulated detector.
//!
//! The server:
//! - Binds the socket the client was told about, replacing a stale file
//! - Serves one client at a time, in accept order
//! - Supports graceful shutdown via CancellationToken
//! - Removes the socket file on shutdown, but not on a simulated crash
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Connection errors end that connection only

mod connection;

pub use connection::{invert, ConnectionError, ConnectionHandler, SessionEnd, SimOptions};

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::gestures::Gesture;

/// Errors that prevent the server from running.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to set up socket at {}: {error}", path.display())]
    SocketSetup { path: PathBuf, error: String },
}

/// Why [`SimServer::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// Shutdown was requested; the socket has been removed.
    Shutdown,
    /// The crash knob fired; the socket was left behind.
    Crashed,
}

/// Simulated detector server.
pub struct SimServer {
    socket_path: PathBuf,
    options: SimOptions,
    challenge: Vec<Gesture>,
    cancel_token: CancellationToken,
}

impl SimServer {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        options: SimOptions,
        challenge: Vec<Gesture>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            options,
            challenge,
            cancel_token,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Listens until cancelled or until a simulated crash.
    pub async fn run(&self) -> Result<ServeOutcome, ServerError> {
        let listener = self.bind()?;
        info!(socket = %self.socket_path.display(), "Simulated detector listening");

        let mut connection_number = 0u64;
        let outcome = loop {
            let accepted = tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break ServeOutcome::Shutdown;
                }
                accepted = listener.accept() => accepted,
            };

            let stream = match accepted {
                Ok((stream, _addr)) => stream,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    continue;
                }
            };

            connection_number += 1;
            let (reader, writer) = stream.into_split();
            let handler = ConnectionHandler::new(
                reader,
                writer,
                self.options.clone(),
                self.challenge.clone(),
                self.cancel_token.clone(),
                connection_number,
            );

            match handler.run().await {
                SessionEnd::Disconnected => {}
                SessionEnd::Cancelled => break ServeOutcome::Shutdown,
                SessionEnd::Crashed => return Ok(ServeOutcome::Crashed),
            }
        };

        self.cleanup();
        Ok(outcome)
    }

    fn bind(&self) -> Result<UnixListener, ServerError> {
        let setup_error = |e: std::io::Error| ServerError::SocketSetup {
            path: self.socket_path.clone(),
            error: e.to_string(),
        };

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(setup_error)?;
        }
        UnixListener::bind(&self.socket_path).map_err(setup_error)
    }

    fn cleanup(&self) {
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "Failed to remove socket file"
                );
            }
        }
        info!("Server cleanup complete");
    }
}
