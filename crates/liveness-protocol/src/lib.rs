//! Liveness Protocol - Wire protocol for detector server communication
//!
//! This crate provides the message types exchanged between the liveness
//! client and the detector server, and the length-prefixed framing that
//! carries them over a single Unix socket.

pub mod error;
pub mod framing;
pub mod message;

pub use error::{FramingError, WireError};
pub use framing::{decode, decode_body, encode, encode_body, WireCodec, LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE};
pub use message::{ControlKind, MessageTag, Seq, WireMessage};
