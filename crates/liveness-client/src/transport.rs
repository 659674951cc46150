//! Socket transport to the detector server.
//!
//! [`connect`] dials the server's Unix socket with exponential backoff.
//! The resulting [`Connection`] splits into a [`ConnectionReader`], owned by
//! the session's listener task, and a [`ConnectionWriter`] shared by every
//! caller. The writer serialises whole messages so concurrent senders never
//! interleave bytes.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use liveness_protocol::{FramingError, WireCodec, WireMessage};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::error::{ConnectError, TransportError};

// ============================================================================
// Configuration
// ============================================================================

/// Retry and timeout settings for the server connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Overall deadline for establishing the connection.
    pub timeout: Duration,

    /// Delay before the first retry.
    pub retry_initial_delay: Duration,

    /// Upper bound on the delay between retries.
    pub retry_max_delay: Duration,

    /// Multiplier for exponential backoff.
    pub retry_multiplier: f64,

    /// Deadline for writing a single message.
    pub write_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retry_initial_delay: Duration::from_millis(10),
            retry_max_delay: Duration::from_millis(250),
            retry_multiplier: 2.0,
            write_timeout: Duration::from_secs(5),
        }
    }
}

// ============================================================================
// Connect
// ============================================================================

/// Connects to the server socket at `path`, retrying until `options.timeout`.
pub async fn connect(path: &Path, options: &ConnectOptions) -> Result<Connection, ConnectError> {
    let deadline = Instant::now() + options.timeout;
    let mut delay = options.retry_initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt = attempt.saturating_add(1);

        match UnixStream::connect(path).await {
            Ok(stream) => {
                debug!(attempt, socket_path = %path.display(), "Connected to detector server");
                return Ok(Connection {
                    stream,
                    path: path.to_path_buf(),
                });
            }
            Err(e) => {
                debug!(attempt, error = %e, "Connection attempt failed");
            }
        }

        let now = Instant::now();
        if now >= deadline {
            warn!(
                attempt,
                socket_path = %path.display(),
                "Giving up connecting to detector server"
            );
            return Err(ConnectError::Timeout {
                path: path.to_path_buf(),
                attempts: attempt,
                timeout: options.timeout,
            });
        }

        sleep(delay.min(deadline - now)).await;
        let next_delay_ms = (delay.as_millis() as f64 * options.retry_multiplier) as u64;
        delay = Duration::from_millis(next_delay_ms).min(options.retry_max_delay);
    }
}

// ============================================================================
// Connection
// ============================================================================

/// An established, not yet split, server connection.
#[derive(Debug)]
pub struct Connection {
    stream: UnixStream,
    path: PathBuf,
}

impl Connection {
    /// Socket path this connection was made to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Splits into independently owned read and write halves.
    pub fn into_split(self, write_timeout: Duration) -> (ConnectionReader, ConnectionWriter) {
        let (read, write) = self.stream.into_split();
        let reader = ConnectionReader {
            inner: FramedRead::new(read, WireCodec::new()),
        };
        let writer = ConnectionWriter {
            inner: Mutex::new(FramedWrite::new(write, WireCodec::new())),
            write_timeout,
        };
        (reader, writer)
    }
}

/// Receiving half of a connection.
#[derive(Debug)]
pub struct ConnectionReader {
    inner: FramedRead<OwnedReadHalf, WireCodec>,
}

impl ConnectionReader {
    /// Waits for the next message.
    ///
    /// The outer `Result` reports connection-level failures, after which the
    /// reader is unusable. The inner one reports a single undecodable
    /// message that has already been skipped.
    ///
    /// Cancel safe: partially received bytes stay buffered.
    pub async fn receive(&mut self) -> Result<Result<WireMessage, FramingError>, TransportError> {
        match self.inner.next().await {
            Some(Ok(message)) => Ok(message),
            Some(Err(e)) => Err(e.into()),
            None => Err(TransportError::Closed),
        }
    }
}

/// Sending half of a connection, safe to share between tasks.
#[derive(Debug)]
pub struct ConnectionWriter {
    inner: Mutex<FramedWrite<OwnedWriteHalf, WireCodec>>,
    write_timeout: Duration,
}

impl ConnectionWriter {
    /// Writes one whole message and flushes it.
    pub async fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        let tag = message.tag();
        let mut sink = self.inner.lock().await;
        match timeout(self.write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {
                debug!(?tag, "Sent message");
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransportError::WriteTimeout {
                timeout: self.write_timeout,
            }),
        }
    }

    /// Flushes and shuts down the write side. Errors are ignored.
    pub async fn close(&self) {
        let mut sink = self.inner.lock().await;
        if let Ok(Err(e)) = timeout(self.write_timeout, sink.close()).await {
            debug!(error = %e, "Error closing connection");
        }
    }
}
