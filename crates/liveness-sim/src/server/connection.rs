//! Per-client handler for the simulated detector.
//!
//! The handler answers every frame request with the inverted frame and
//! walks the subject through the gesture challenge:
//! - Every `frames_per_gesture` frames the current gesture counts as done,
//!   announced with a text notification and a capture prompt
//! - Once every gesture is done the subject is reported alive
//! - Control commands are echoed back as text notifications
//!
//! [`SimOptions`] adds misbehaviour on demand (reordering, delays, drops,
//! corrupt messages, crashes) so clients can be tested against it.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use liveness_core::{Frame, PixelFormat};
use liveness_protocol::{encode, ControlKind, Seq, WireCodec, WireError, WireMessage};
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::sleep;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gestures::Gesture;

// ============================================================================
// Options
// ============================================================================

/// Simulation knobs.
#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Frames needed to complete one gesture.
    pub frames_per_gesture: u64,

    /// Swap each consecutive pair of frame responses.
    pub reorder_pairs: bool,

    /// Hold the response to this sequence number for `delay`.
    pub delay_seq: Option<Seq>,

    /// How long to hold the response selected by `delay_seq`.
    pub delay: Duration,

    /// Never answer this sequence number.
    pub drop_seq: Option<Seq>,

    /// After this many responses, send one batch of malformed messages.
    pub corrupt_after: Option<u64>,

    /// Exit abruptly on receiving this many frames.
    pub crash_after: Option<u64>,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            frames_per_gesture: 1,
            reorder_pairs: false,
            delay_seq: None,
            delay: Duration::from_millis(200),
            drop_seq: None,
            corrupt_after: None,
            crash_after: None,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// How a client connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client hung up or the stream broke.
    Disconnected,
    /// Shutdown was requested.
    Cancelled,
    /// The crash knob fired; the process should die without cleanup.
    Crashed,
}

/// Errors that end a client connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Connection Handler
// ============================================================================

/// Serves one client until it disconnects.
pub struct ConnectionHandler {
    reader: FramedRead<OwnedReadHalf, WireCodec>,
    writer: FramedWrite<OwnedWriteHalf, WireCodec>,
    options: SimOptions,
    challenge: Vec<Gesture>,
    cancel_token: CancellationToken,
    connection_number: u64,

    frames_seen: u64,
    responses_sent: u64,
    gestures_done: usize,
    corrupted: bool,
    held: Option<WireMessage>,
}

impl ConnectionHandler {
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        options: SimOptions,
        challenge: Vec<Gesture>,
        cancel_token: CancellationToken,
        connection_number: u64,
    ) -> Self {
        Self {
            reader: FramedRead::new(reader, WireCodec::new()),
            writer: FramedWrite::new(writer, WireCodec::new()),
            options,
            challenge,
            cancel_token,
            connection_number,
            frames_seen: 0,
            responses_sent: 0,
            gestures_done: 0,
            corrupted: false,
            held: None,
        }
    }

    /// Runs until the client leaves, shutdown is requested, or the crash
    /// knob fires.
    pub async fn run(mut self) -> SessionEnd {
        info!(connection = self.connection_number, "Client connected");

        let end = match self.serve().await {
            Ok(end) => end,
            Err(e) => {
                debug!(connection = self.connection_number, error = %e, "Connection closed");
                SessionEnd::Disconnected
            }
        };

        info!(connection = self.connection_number, ?end, "Client session ended");
        end
    }

    async fn serve(&mut self) -> Result<SessionEnd, ConnectionError> {
        if let Some(first) = self.challenge.first() {
            let prompt = format!("Please perform: {}", first.label);
            self.writer.send(WireMessage::text(prompt)).await?;
        }

        loop {
            let next = tokio::select! {
                _ = self.cancel_token.cancelled() => return Ok(SessionEnd::Cancelled),
                next = self.reader.next() => next,
            };

            let message = match next {
                None => return Ok(SessionEnd::Disconnected),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Err(e))) => {
                    warn!(error = %e, "Dropping malformed message from client");
                    continue;
                }
                Some(Ok(Ok(message))) => message,
            };

            match message {
                WireMessage::FrameRequest { seq, frame } => {
                    if let Some(end) = self.handle_frame(seq, frame).await? {
                        return Ok(end);
                    }
                }
                WireMessage::ControlCommand { kind, text } => {
                    let prefix = match kind {
                        ControlKind::OverwriteText => "overwrite",
                        ControlKind::WarningText => "warning",
                    };
                    debug!(prefix, text = %text, "Control command");
                    self.writer.send(WireMessage::text(format!("[{prefix}] {text}"))).await?;
                }
                other => {
                    warn!(tag = ?other.tag(), "Ignoring unexpected message from client");
                }
            }
        }
    }

    async fn handle_frame(&mut self, seq: Seq, frame: Frame) -> Result<Option<SessionEnd>, ConnectionError> {
        self.frames_seen += 1;
        debug!(seq, frame = self.frames_seen, "Frame received");

        if self.options.crash_after == Some(self.frames_seen) {
            warn!(seq, "Simulating crash");
            return Ok(Some(SessionEnd::Crashed));
        }

        if self.options.drop_seq == Some(seq) {
            debug!(seq, "Dropping response");
        } else {
            if self.options.delay_seq == Some(seq) {
                debug!(seq, delay_ms = self.options.delay.as_millis() as u64, "Delaying response");
                sleep(self.options.delay).await;
            }
            let response = WireMessage::frame_response(seq, Some(invert(frame)));
            self.respond(response).await?;
        }

        self.advance_challenge().await?;
        Ok(None)
    }

    async fn respond(&mut self, response: WireMessage) -> Result<(), ConnectionError> {
        if self.options.reorder_pairs {
            match self.held.take() {
                None => {
                    self.held = Some(response);
                    return Ok(());
                }
                Some(earlier) => {
                    self.writer.send(response).await?;
                    self.writer.send(earlier).await?;
                    self.responses_sent += 2;
                }
            }
        } else {
            self.writer.send(response).await?;
            self.responses_sent += 1;
        }

        if !self.corrupted && self.options.corrupt_after.is_some_and(|n| self.responses_sent >= n) {
            self.corrupted = true;
            self.send_corrupt_batch().await?;
        }
        Ok(())
    }

    /// Writes an unknown-tag message and a truncated frame response, then a
    /// valid notification so the client can tell it kept reading.
    async fn send_corrupt_batch(&mut self) -> Result<(), ConnectionError> {
        warn!("Sending corrupt messages");
        SinkExt::flush(&mut self.writer).await?;

        let stream = self.writer.get_mut();
        stream.write_all(&[0, 0, 0, 3, 0x7f, 0xde, 0xad]).await?;

        let mut truncated = encode(&WireMessage::frame_response(
            Seq::MAX,
            Some(Frame::filled(4, 4, PixelFormat::Gray8, 0).map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
            })?),
        ));
        // Drop the last pixels but keep the length prefix consistent
        truncated.truncate(truncated.len().saturating_sub(3));
        let body_len = u32::try_from(truncated.len().saturating_sub(4)).unwrap_or(0);
        if let Some(prefix) = truncated.get_mut(..4) {
            prefix.copy_from_slice(&body_len.to_be_bytes());
        }
        stream.write_all(&truncated).await?;
        stream.flush().await?;

        self.writer.send(WireMessage::text("corruption sent")).await?;
        Ok(())
    }

    async fn advance_challenge(&mut self) -> Result<(), ConnectionError> {
        let per_gesture = self.options.frames_per_gesture.max(1);
        if self.frames_seen % per_gesture != 0 {
            return Ok(());
        }
        let Some(gesture) = self.challenge.get(self.gestures_done).cloned() else {
            return Ok(());
        };

        self.gestures_done += 1;
        info!(gesture = %gesture.name, done = self.gestures_done, "Gesture detected");
        self.writer
            .send(WireMessage::text(format!("gesture {} detected", gesture.label)))
            .await?;
        self.writer.send(WireMessage::capture_prompt(true)).await?;

        if self.gestures_done == self.challenge.len() {
            info!("Challenge complete, subject is alive");
            self.writer.send(WireMessage::alive(true)).await?;
        } else if let Some(next) = self.challenge.get(self.gestures_done) {
            self.writer
                .send(WireMessage::text(format!("Please perform: {}", next.label)))
                .await?;
        }
        Ok(())
    }
}

/// Inverts the colour channels of `frame`, leaving alpha untouched.
pub fn invert(mut frame: Frame) -> Frame {
    let has_alpha = matches!(frame.format(), PixelFormat::Bgra8 | PixelFormat::Rgba8);
    let data = frame.data_mut();
    if has_alpha {
        for pixel in data.chunks_exact_mut(4) {
            for channel in pixel.iter_mut().take(3) {
                *channel = 255 - *channel;
            }
        }
    } else {
        for byte in data.iter_mut() {
            *byte = 255 - *byte;
        }
    }
    frame
}
