//! Execution guard around calls into the backing device.
//!
//! Admission already serializes callers; the guard is a second lock that every
//! backing call goes through, so no code path reaches the device with admission
//! alone.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::admission::AdmissionPermit;

#[derive(Debug, Default)]
pub struct ExecutionGuard {
    lock: Mutex<()>,
}

impl ExecutionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `op` under the guard. Requires a live admission permit.
    pub fn run<T>(&self, permit: &AdmissionPermit<'_>, op: impl FnOnce() -> T) -> T {
        let _held = self.acquire();
        tracing::trace!(ticket = %permit.ticket(), caller = %permit.caller(), "executing");
        op()
    }

    fn acquire(&self) -> MutexGuard<'_, ()> {
        // A panic inside a previous `op` poisons the lock but leaves nothing to repair.
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True while some caller is executing.
    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}
