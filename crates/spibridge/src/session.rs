//! Caller sessions on a virtual endpoint.
//!
//! Each read/write/control takes one ticket, runs under the execution guard
//! once admitted, and retires the ticket whether the device call succeeded or
//! not. `&mut self` keeps at most one ticket in flight per session.
//!
//! A cancellation targets the operation in flight, or the next one when the
//! session is idle. Once that operation settles the session re-arms its token.

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::admission::{CallerId, CancelHandle};
use crate::backing::{BackingResource, Readiness};
use crate::bridge::Bridge;
use crate::error::{BridgeError, Result};

pub struct Session {
    bridge: Arc<Bridge>,
    endpoint: usize,
    caller: CallerId,
    backing: Option<Box<dyn BackingResource>>,
    cancel: CancelHandle,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.endpoint)
            .field("caller", &self.caller)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        bridge: Arc<Bridge>,
        endpoint: usize,
        caller: CallerId,
        backing: Box<dyn BackingResource>,
    ) -> Self {
        let cancel = CancelHandle::new(Arc::clone(bridge.queue()));
        Self {
            bridge,
            endpoint,
            caller,
            backing: Some(backing),
            cancel,
        }
    }

    pub fn endpoint(&self) -> usize {
        self.endpoint
    }

    pub fn caller(&self) -> CallerId {
        self.caller
    }

    pub fn is_open(&self) -> bool {
        self.backing.is_some()
    }

    /// Handle that cancels this session's in-flight (or next) operation.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Read at most `max_len` bytes from the backing device.
    pub fn read(&mut self, max_len: usize) -> Result<Vec<u8>> {
        self.admitted(|backing| backing.read(max_len))?
            .map_err(BridgeError::Upstream)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.admitted(|backing| backing.write(buf))?
            .map_err(BridgeError::Upstream)
    }

    pub fn control(&mut self, code: u32, arg: u64) -> Result<u64> {
        self.admitted(|backing| backing.control(code, arg))?
            .map_err(|e| BridgeError::from_control(code, e))
    }

    /// Readiness of the backing device. Not subject to admission.
    pub fn poll(&self) -> Result<Readiness> {
        self.backing
            .as_deref()
            .map(|backing| backing.poll())
            .ok_or(BridgeError::NotReady)
    }

    /// Release any ownership grant, then the backing handle. Idempotent.
    pub fn close(&mut self) {
        let Some(backing) = self.backing.take() else {
            return;
        };
        self.bridge.queue().release_ownership(self.caller);
        drop(backing);
        self.bridge.registry().session_closed();
        tracing::debug!(endpoint = self.endpoint, caller = %self.caller, "Session closed");
    }

    /// Wait for admission, then run `op` under the execution guard. The outer
    /// error is an admission failure; the inner one comes from the device.
    fn admitted<T>(
        &mut self,
        op: impl FnOnce(&mut dyn BackingResource) -> io::Result<T>,
    ) -> Result<io::Result<T>> {
        let backing = self.backing.as_deref_mut().ok_or(BridgeError::NotReady)?;
        let queue = self.bridge.queue();
        let token = self.cancel.token();

        let outcome = match queue.admit(self.caller, Some(&token)) {
            Ok(permit) => Ok(self.bridge.guard().run(&permit, || op(backing))),
            Err(e) => {
                tracing::debug!(endpoint = self.endpoint, caller = %self.caller, error = %e, "Admission failed");
                Err(e)
            }
        };

        // A cancel aimed at this operation must not outlive it.
        self.cancel.rearm();
        outcome
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
