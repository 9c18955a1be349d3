//! spibridge: many virtual SPI endpoints, one backing device.
//!
//! Callers open sessions on numbered endpoints. Every read, write, and control
//! request waits its turn in a strict FIFO ticket queue, then runs alone
//! against the shared backing device. An optional ownership window lets the
//! most recent caller issue follow-up requests before anyone else is served.

pub mod admission;
mod async_session;
pub mod backing;
mod bridge;
pub mod config;
pub mod error;
mod guard;
mod registry;
mod session;

pub use admission::{
    AdmissionPermit, AdmissionQueue, CallerId, CancelHandle, OwnershipAffinity, QueueSnapshot,
    Ticket,
};
pub use async_session::AsyncSession;
pub use backing::{AccessMode, BackingFactory, BackingResource, Readiness};
pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use guard::ExecutionGuard;
pub use registry::{Endpoint, SessionRegistry};
pub use session::Session;
