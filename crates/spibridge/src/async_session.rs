//! Async adapter over [`Session`].
//!
//! Admission blocks the calling thread, so every call is moved to tokio's
//! blocking pool rather than parking a runtime worker.

use std::sync::{Arc, Mutex, PoisonError};

use crate::admission::CancelHandle;
use crate::backing::AccessMode;
use crate::bridge::Bridge;
use crate::error::{BridgeError, Result};
use crate::session::Session;

#[derive(Debug, Clone)]
pub struct AsyncSession {
    inner: Arc<Mutex<Session>>,
    cancel: CancelHandle,
}

impl AsyncSession {
    pub fn new(session: Session) -> Self {
        let cancel = session.cancel_handle();
        Self {
            inner: Arc::new(Mutex::new(session)),
            cancel,
        }
    }

    /// Open `index` on the blocking pool (device opens may block).
    pub async fn open(bridge: Arc<Bridge>, index: usize, mode: AccessMode) -> Result<Self> {
        let session = tokio::task::spawn_blocking(move || bridge.open_with(index, mode))
            .await
            .map_err(|e| BridgeError::Internal(format!("open task failed: {e}")))??;
        Ok(Self::new(session))
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Session) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut session = inner.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut session)
        })
        .await
        .map_err(|e| BridgeError::Internal(format!("session task failed: {e}")))?
    }

    pub async fn read(&self, max_len: usize) -> Result<Vec<u8>> {
        self.blocking(move |s| s.read(max_len)).await
    }

    pub async fn write(&self, buf: Vec<u8>) -> Result<usize> {
        self.blocking(move |s| s.write(&buf)).await
    }

    pub async fn control(&self, code: u32, arg: u64) -> Result<u64> {
        self.blocking(move |s| s.control(code, arg)).await
    }

    pub async fn close(&self) -> Result<()> {
        self.blocking(|s| {
            s.close();
            Ok(())
        })
        .await
    }
}
