//! The bridge: one admission queue, execution guard, and endpoint table per
//! backing device, shared by every session opened through it.

use std::sync::Arc;

use crate::admission::{AdmissionQueue, QueueSnapshot};
use crate::backing::{AccessMode, BackingFactory, FileFactory};
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::guard::ExecutionGuard;
use crate::registry::{Endpoint, SessionRegistry};
use crate::session::Session;

#[derive(Debug)]
pub struct Bridge {
    config: BridgeConfig,
    queue: Arc<AdmissionQueue>,
    guard: ExecutionGuard,
    registry: SessionRegistry,
}

impl Bridge {
    /// Validate `config` and build a bridge whose endpoints open through `factory`.
    pub fn new(config: BridgeConfig, factory: impl BackingFactory) -> Result<Arc<Self>> {
        config.validate()?;

        let queue = AdmissionQueue::new(config.admission_timeout(), config.ownership_hold())
            .with_debug(config.debug_logging);
        let registry = SessionRegistry::new(&config, Arc::new(factory))?;

        tracing::info!(
            backing = ?config.backing_targets,
            endpoints = config.endpoint_count,
            timeout_ms = config.admission_timeout_ms,
            hold_ms = config.ownership_hold_ms,
            first = %config.endpoint_name(0),
            last = %config.endpoint_name(config.endpoint_count - 1),
            "Bridge ready"
        );

        Ok(Arc::new(Self {
            config,
            queue: Arc::new(queue),
            guard: ExecutionGuard::new(),
            registry,
        }))
    }

    /// Bridge over real device nodes.
    pub fn with_devices(config: BridgeConfig) -> Result<Arc<Self>> {
        Self::new(config, FileFactory)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        self.registry.endpoints()
    }

    pub fn open_sessions(&self) -> usize {
        self.registry.open_sessions()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.queue.snapshot()
    }

    /// Open endpoint `index` read-write.
    pub fn open(self: &Arc<Self>, index: usize) -> Result<Session> {
        self.open_with(index, AccessMode::ReadWrite)
    }

    pub fn open_with(self: &Arc<Self>, index: usize, mode: AccessMode) -> Result<Session> {
        let resolved = self.registry.resolve(index, mode)?;
        Ok(Session::new(
            Arc::clone(self),
            index,
            resolved.caller,
            resolved.backing,
        ))
    }

    pub fn open_by_name(self: &Arc<Self>, name: &str, mode: AccessMode) -> Result<Session> {
        let index = self.registry.find(name)?.index;
        self.open_with(index, mode)
    }

    pub(crate) fn queue(&self) -> &Arc<AdmissionQueue> {
        &self.queue
    }

    pub(crate) fn guard(&self) -> &ExecutionGuard {
        &self.guard
    }

    pub(crate) fn registry(&self) -> &SessionRegistry {
        &self.registry
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        tracing::info!(served = self.queue.snapshot().serving, "Bridge shut down");
    }
}
