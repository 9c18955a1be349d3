//! Endpoint table and backing resolution.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

use crate::admission::CallerId;
use crate::backing::{AccessMode, BackingFactory, BackingResource};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};

/// One virtual endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub index: usize,
    pub name: String,
    pub target: PathBuf,
}

/// Maps endpoints to backing targets and opens handles on them.
pub struct SessionRegistry {
    endpoints: Vec<Endpoint>,
    factory: Arc<dyn BackingFactory>,
    next_caller: AtomicU64,
    open_sessions: AtomicUsize,
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("endpoints", &self.endpoints.len())
            .field("open_sessions", &self.open_sessions())
            .finish_non_exhaustive()
    }
}

/// A successfully opened backing handle and the identity it was issued to.
pub(crate) struct Resolved {
    pub caller: CallerId,
    pub backing: Box<dyn BackingResource>,
}

impl SessionRegistry {
    /// Build the endpoint table. `config` must already be validated.
    pub fn new(config: &BridgeConfig, factory: Arc<dyn BackingFactory>) -> Result<Self> {
        let endpoints = (0..config.endpoint_count)
            .map(|index| {
                let target = config.backing_target(index).ok_or_else(|| {
                    BridgeError::invalid_config(format!("no backing target for endpoint {index}"))
                })?;
                Ok(Endpoint {
                    index,
                    name: config.endpoint_name(index),
                    target: target.to_path_buf(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            endpoints,
            factory,
            next_caller: AtomicU64::new(1),
            open_sessions: AtomicUsize::new(0),
        })
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn endpoint(&self, index: usize) -> Result<&Endpoint> {
        self.endpoints
            .get(index)
            .ok_or_else(|| BridgeError::NotFound(index.to_string()))
    }

    pub fn find(&self, name: &str) -> Result<&Endpoint> {
        self.endpoints
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| BridgeError::NotFound(name.to_string()))
    }

    /// Open the backing for `index` and issue a fresh caller identity.
    pub(crate) fn resolve(&self, index: usize, mode: AccessMode) -> Result<Resolved> {
        let endpoint = self.endpoint(index)?;
        let backing = self.open_target(&endpoint.target, mode)?;
        let caller = CallerId::new(self.next_caller.fetch_add(1, Ordering::Relaxed));
        self.open_sessions.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(endpoint = %endpoint.name, %caller, "Session opened");
        Ok(Resolved { caller, backing })
    }

    fn open_target(&self, target: &Path, mode: AccessMode) -> Result<Box<dyn BackingResource>> {
        self.factory.open(target, mode).map_err(|e| {
            tracing::warn!(target = %target.display(), error = %e, "Failed to open backing device");
            BridgeError::Upstream(e)
        })
    }

    pub(crate) fn session_closed(&self) {
        self.open_sessions.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::Acquire)
    }
}
