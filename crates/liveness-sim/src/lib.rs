//! Liveness Sim - Simulated detector server
//!
//! A stand-in for the native liveness detector that speaks the same socket
//! protocol. It lets the client be exercised end to end without a camera
//! pipeline or model:
//! - `gestures` - Loads the gesture challenge from `*.json` definitions
//! - `server` - Unix socket server answering frames and pushing notifications
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    SimServer    │
//! │  (UnixListener) │
//! └───────┬─────────┘
//!         │ accept(), one client at a time
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│   SimOptions    │
//! │  frames, texts  │     │ (misbehaviour)  │
//! └─────────────────┘     └─────────────────┘
//! ```

pub mod gestures;
pub mod server;

pub use gestures::{Gesture, GestureError, GestureSet};
pub use server::{ServeOutcome, ServerError, SimOptions, SimServer};
