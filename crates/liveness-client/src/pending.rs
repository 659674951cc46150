//! In-flight frame requests awaiting a response.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use liveness_core::Frame;
use liveness_protocol::Seq;
use tokio::sync::oneshot;

/// What a waiting caller eventually receives: the processed frame, or
/// `None` if the server answered without one.
pub type Reply = Option<Frame>;

/// Table of outstanding requests keyed by sequence number.
///
/// Each entry is completed at most once. Dropping an entry's sender (via
/// [`cancel`](Self::cancel) or [`fail_all`](Self::fail_all)) wakes its
/// waiter with a `RecvError`.
#[derive(Debug, Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Mutex<HashMap<Seq, oneshot::Sender<Reply>>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `seq` and returns the receiver its response will land on.
    pub fn register(&self, seq: Seq) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(seq, tx);
        rx
    }

    /// Delivers a response. Returns `false` if nobody is waiting for `seq`,
    /// either because it was never sent or because its waiter gave up.
    pub fn complete(&self, seq: Seq, reply: Reply) -> bool {
        let Some(tx) = self.lock().remove(&seq) else {
            return false;
        };
        tx.send(reply).is_ok()
    }

    /// Forgets `seq`; a response arriving later is treated as stale.
    pub fn cancel(&self, seq: Seq) -> bool {
        self.lock().remove(&seq).is_some()
    }

    /// Drops every entry, waking all waiters. Returns how many were woken.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Seq, oneshot::Sender<Reply>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
