//! Routing of server notifications to application callbacks.
//!
//! The listener task hands every notification to [`CallbackRegistry::dispatch`].
//! Handlers run synchronously on that task, one at a time, in arrival order.
//! A notification with no registered handler is dropped.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use liveness_protocol::WireMessage;
use tracing::{debug, error};

/// The kinds of notification a handler can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Text,
    Alive,
    TakePicture,
}

/// A server notification as seen by application code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Status text to show the user.
    Text(String),
    /// Liveness verdict.
    Alive(bool),
    /// The server wants the current frame captured.
    TakePicture(bool),
}

impl Notification {
    pub fn kind(&self) -> NotificationKind {
        match self {
            Self::Text(_) => NotificationKind::Text,
            Self::Alive(_) => NotificationKind::Alive,
            Self::TakePicture(_) => NotificationKind::TakePicture,
        }
    }
}

impl TryFrom<WireMessage> for Notification {
    type Error = WireMessage;

    /// Converts notification messages; hands anything else back unchanged.
    fn try_from(message: WireMessage) -> Result<Self, Self::Error> {
        match message {
            WireMessage::TextNotification { text } => Ok(Self::Text(text)),
            WireMessage::AliveNotification { alive } => Ok(Self::Alive(alive)),
            WireMessage::CapturePrompt { take_picture } => Ok(Self::TakePicture(take_picture)),
            other => Err(other),
        }
    }
}

type Handler = Arc<dyn Fn(&Notification) + Send + Sync>;

/// One handler per [`NotificationKind`]; registering again replaces it.
#[derive(Default)]
pub struct CallbackRegistry {
    handlers: RwLock<HashMap<NotificationKind, Handler>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `handler` for `kind`, replacing any previous one.
    pub fn register<F>(&self, kind: NotificationKind, handler: F)
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        handlers.insert(kind, Arc::new(handler));
    }

    /// Removes the handler for `kind`. Returns whether one was installed.
    pub fn unregister(&self, kind: NotificationKind) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        handlers.remove(&kind).is_some()
    }

    pub fn is_registered(&self, kind: NotificationKind) -> bool {
        let handlers = self.handlers.read().unwrap_or_else(|p| p.into_inner());
        handlers.contains_key(&kind)
    }

    /// Handler for status text.
    pub fn set_string_callback<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.register(NotificationKind::Text, move |n| {
            if let Notification::Text(text) = n {
                callback(text);
            }
        });
    }

    /// Handler for the liveness verdict.
    pub fn set_report_alive_callback<F>(&self, callback: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.register(NotificationKind::Alive, move |n| {
            if let Notification::Alive(alive) = n {
                callback(*alive);
            }
        });
    }

    /// Handler for capture prompts.
    pub fn set_take_picture_callback<F>(&self, callback: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.register(NotificationKind::TakePicture, move |n| {
            if let Notification::TakePicture(take) = n {
                callback(*take);
            }
        });
    }

    /// Runs the handler for `notification`, if any.
    ///
    /// The lock is released before the handler runs, so a handler may
    /// re-register callbacks. A panicking handler is logged and contained.
    /// Returns `true` if a handler ran to completion.
    pub fn dispatch(&self, notification: &Notification) -> bool {
        let kind = notification.kind();
        let handler = {
            let handlers = self.handlers.read().unwrap_or_else(|p| p.into_inner());
            handlers.get(&kind).cloned()
        };

        let Some(handler) = handler else {
            debug!(?kind, "No callback registered, dropping notification");
            return false;
        };

        match catch_unwind(AssertUnwindSafe(|| handler(notification))) {
            Ok(()) => true,
            Err(_) => {
                error!(?kind, "Notification callback panicked");
                false
            }
        }
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(|p| p.into_inner());
        let kinds: Vec<_> = handlers.keys().collect();
        f.debug_struct("CallbackRegistry").field("registered", &kinds).finish()
    }
}
