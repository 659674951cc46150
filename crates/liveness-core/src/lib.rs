//! Liveness Core - Shared types for the liveness detector client
//!
//! This crate provides the domain types shared between the wire protocol,
//! the client library and the simulated detector server:
//! - [`Frame`] and the frame codec ([`encode_frame`] / [`decode_frame`])
//! - [`ServerConfig`], the detector server's startup configuration
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod config;
pub mod error;
pub mod frame;

// Re-exports for convenience
pub use config::{unique_socket_path, ServerConfig, DEFAULT_LANGUAGE, DEFAULT_NUM_GESTURES};
pub use error::{CodecError, ConfigError, ConfigResult};
pub use frame::{decode_frame, encode_frame, encode_frame_into, Frame, PixelFormat, FRAME_HEADER_SIZE};
