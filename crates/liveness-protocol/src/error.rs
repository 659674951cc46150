//! Protocol error types.

use std::io;

use liveness_core::CodecError;
use thiserror::Error;

/// A single message could not be interpreted.
///
/// These errors are scoped to one message: its bytes have already been
/// consumed from the stream, so the reader can drop it and carry on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("Truncated message: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Unknown message tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("Message too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Frame(#[from] CodecError),
}

/// The byte stream itself is unusable.
///
/// Unlike [`FramingError`], these cannot be skipped: once a length prefix
/// is bogus the message boundaries are lost.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Declared message size {size} exceeds maximum {max}")]
    Oversized { size: usize, max: usize },

    #[error("Zero-length message")]
    EmptyFrame,
}
