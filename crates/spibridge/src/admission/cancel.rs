//! External cancellation of a queued operation.
//!
//! Cancelling never removes a ticket from the queue. It marks the session's
//! current token and wakes the waiters; the queued caller records the
//! cancellation and fails once its ticket reaches the head.

use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

use super::AdmissionQueue;

/// Cloneable handle that cancels a session's pending or next admission.
///
/// A cancellation applies to one operation: once that operation settles,
/// whatever its outcome, the session re-arms with a fresh token and existing
/// handles keep working.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    slot: Arc<Mutex<CancellationToken>>,
    queue: Arc<AdmissionQueue>,
}

impl CancelHandle {
    pub fn new(queue: Arc<AdmissionQueue>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(CancellationToken::new())),
            queue,
        }
    }

    pub fn cancel(&self) {
        self.token().cancel();
        self.queue.interrupt();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token().is_cancelled()
    }

    /// Token the next admission waits with.
    pub fn token(&self) -> CancellationToken {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace a cancelled token so later operations are not failed by it.
    pub(crate) fn rearm(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_cancelled() {
            *slot = CancellationToken::new();
        }
    }
}
