//! Liveness Client - Supervises the detector server and talks to it
//!
//! This crate is what an application links against. [`LivenessSession`]
//! owns the whole conversation with one detector server:
//! - [`supervisor`] launches and stops the server process
//! - [`transport`] connects to its Unix socket and moves framed messages
//! - [`pending`] matches frame responses to the requests that caused them
//! - [`dispatcher`] routes unsolicited notifications to callbacks
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod dispatcher;
pub mod error;
pub mod pending;
pub mod session;
pub mod supervisor;
pub mod transport;

pub use dispatcher::{CallbackRegistry, Notification, NotificationKind};
pub use error::{ConnectError, LaunchError, Result, SessionError, TransportError};
pub use pending::PendingRequests;
pub use session::{LivenessSession, SessionOptions, SessionState, DEFAULT_FRAME_TIMEOUT};
pub use supervisor::{LaunchOptions, ProcessState, ServerProcess};
pub use transport::{connect, ConnectOptions, Connection, ConnectionReader, ConnectionWriter};

// Shared domain types, so applications need only this crate
pub use liveness_core::{Frame, PixelFormat, ServerConfig};
