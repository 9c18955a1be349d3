//! Backing device abstraction.
//!
//! Once admission is granted the bridge forwards raw read/write/control calls
//! to a [`BackingResource`] unchanged. Factories resolve a target path to an
//! open handle at session open.

pub mod file;
pub mod memory;
pub mod spi;

use std::fmt;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub use file::{FileBacking, FileFactory};
pub use memory::{MemoryBacking, MemoryBus, MemoryFactory, Transfer, TransferKind};

/// Largest single read a backing performs; larger requests return a short read.
pub const MAX_TRANSFER: usize = 64 * 1024;

/// Access requested when opening an endpoint, forwarded to the backing open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    #[default]
    ReadWrite,
}

impl AccessMode {
    pub fn readable(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

/// Poll result for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    /// Reported by backings with no readiness notion of their own.
    pub const READ_WRITE: Self = Self {
        readable: true,
        writable: true,
    };
}

/// An open handle on the shared device.
///
/// Errors are passed through to the caller unchanged, except that
/// `io::ErrorKind::Unsupported` (or ENOTTY) from `control` is reported as
/// an unsupported request.
pub trait BackingResource: Send + fmt::Debug {
    /// Read at most `max_len` bytes. May return fewer, never more than
    /// [`MAX_TRANSFER`] at once.
    fn read(&mut self, max_len: usize) -> io::Result<Vec<u8>>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn control(&mut self, _code: u32, _arg: u64) -> io::Result<u64> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    fn poll(&self) -> Readiness {
        Readiness::READ_WRITE
    }
}

/// Opens backing handles for resolved targets.
pub trait BackingFactory: Send + Sync + 'static {
    fn open(&self, target: &Path, mode: AccessMode) -> io::Result<Box<dyn BackingResource>>;
}
