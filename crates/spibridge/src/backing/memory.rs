//! In-process loopback device.
//!
//! A [`MemoryBus`] stands in for one physical SPI device: it records every
//! transfer in arrival order, serves reads from a receive queue, emulates the
//! spidev mode/bits/speed registers, and tracks how many operations were ever
//! in progress at once so callers can check that nothing overlapped.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;

use super::spi::SpiRequest;
use super::{AccessMode, BackingFactory, BackingResource, MAX_TRANSFER, Readiness};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Read,
    Write,
    Control,
}

/// One operation as seen by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transfer {
    pub kind: TransferKind,
    /// Label of the handle that issued it.
    pub handle: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
struct BusState {
    transfers: Vec<Transfer>,
    rx: VecDeque<u8>,
    mode: u8,
    bits_per_word: u8,
    max_speed_hz: u32,
    fail_next: Option<io::ErrorKind>,
    latency: Duration,
    active: usize,
    max_active: usize,
}

impl Default for BusState {
    fn default() -> Self {
        Self {
            transfers: Vec::new(),
            rx: VecDeque::new(),
            mode: 0,
            bits_per_word: 8,
            max_speed_hz: 500_000,
            fail_next: None,
            latency: Duration::ZERO,
            active: 0,
            max_active: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a handle on this bus labelled `label`.
    pub fn handle(&self, label: impl Into<String>, mode: AccessMode) -> MemoryBacking {
        MemoryBacking {
            bus: self.clone(),
            label: label.into(),
            mode,
        }
    }

    /// Queue bytes for subsequent reads.
    pub fn feed(&self, bytes: &[u8]) {
        self.lock().rx.extend(bytes.iter().copied());
    }

    /// Fail the next operation with `kind`.
    pub fn fail_next(&self, kind: io::ErrorKind) {
        self.lock().fail_next = Some(kind);
    }

    /// Hold each operation for `latency`, widening the window in which an
    /// overlapping operation would be observed.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        self.lock().transfers.clone()
    }

    /// All written bytes, concatenated in arrival order.
    pub fn written(&self) -> Vec<u8> {
        self.lock()
            .transfers
            .iter()
            .filter(|t| t.kind == TransferKind::Write)
            .flat_map(|t| t.bytes.iter().copied())
            .collect()
    }

    /// Highest number of operations ever in progress at the same time.
    pub fn max_concurrency(&self) -> usize {
        self.lock().max_active
    }

    fn begin(&self) -> io::Result<Duration> {
        let mut state = self.lock();
        if let Some(kind) = state.fail_next.take() {
            return Err(io::Error::new(kind, "injected device fault"));
        }
        state.active += 1;
        state.max_active = state.max_active.max(state.active);
        Ok(state.latency)
    }

    fn finish(&self, transfer: Transfer) {
        let mut state = self.lock();
        state.active -= 1;
        state.transfers.push(transfer);
    }

    /// Run `op` as one device operation. The latency sleep happens outside the
    /// bus lock so overlapping callers would be counted.
    fn operate<T>(
        &self,
        label: &str,
        kind: TransferKind,
        op: impl FnOnce(&mut BusState) -> io::Result<(T, Vec<u8>)>,
    ) -> io::Result<T> {
        let latency = self.begin()?;
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        let result = op(&mut self.lock());
        match result {
            Ok((value, bytes)) => {
                self.finish(Transfer {
                    kind,
                    handle: label.to_string(),
                    bytes,
                });
                Ok(value)
            }
            Err(e) => {
                self.lock().active -= 1;
                Err(e)
            }
        }
    }
}

/// Handle on a [`MemoryBus`].
#[derive(Debug)]
pub struct MemoryBacking {
    bus: MemoryBus,
    label: String,
    mode: AccessMode,
}

impl MemoryBacking {
    pub fn label(&self) -> &str {
        &self.label
    }
}

fn bad_access() -> io::Error {
    io::Error::new(io::ErrorKind::PermissionDenied, "handle not opened for this access")
}

impl BackingResource for MemoryBacking {
    fn read(&mut self, max_len: usize) -> io::Result<Vec<u8>> {
        if !self.mode.readable() {
            return Err(bad_access());
        }
        self.bus.operate(&self.label, TransferKind::Read, |state| {
            let n = max_len.min(state.rx.len()).min(MAX_TRANSFER);
            let bytes: Vec<u8> = state.rx.drain(..n).collect();
            Ok((bytes.clone(), bytes))
        })
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.mode.writable() {
            return Err(bad_access());
        }
        self.bus.operate(&self.label, TransferKind::Write, |_| {
            Ok((buf.len(), buf.to_vec()))
        })
    }

    fn control(&mut self, code: u32, arg: u64) -> io::Result<u64> {
        let request = SpiRequest::decode(code, arg)
            .ok_or_else(|| io::Error::from(io::ErrorKind::Unsupported))?;
        self.bus.operate(&self.label, TransferKind::Control, |state| {
            let value = match request {
                SpiRequest::ReadMode => u64::from(state.mode),
                SpiRequest::ReadBitsPerWord => u64::from(state.bits_per_word),
                SpiRequest::ReadMaxSpeedHz => u64::from(state.max_speed_hz),
                SpiRequest::WriteMode(mode) => {
                    state.mode = mode;
                    0
                }
                SpiRequest::WriteBitsPerWord(bits) => {
                    state.bits_per_word = bits;
                    0
                }
                SpiRequest::WriteMaxSpeedHz(hz) => {
                    state.max_speed_hz = hz;
                    0
                }
            };
            Ok((value, code.to_le_bytes().to_vec()))
        })
    }

    fn poll(&self) -> Readiness {
        Readiness {
            readable: self.mode.readable() && !self.bus.lock().rx.is_empty(),
            writable: self.mode.writable(),
        }
    }
}

/// Resolves target paths to in-process buses.
#[derive(Debug, Clone, Default)]
pub struct MemoryFactory {
    buses: HashMap<PathBuf, MemoryBus>,
}

impl MemoryFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with one bus reachable at `target`.
    pub fn single(target: impl Into<PathBuf>, bus: MemoryBus) -> Self {
        Self::new().with_bus(target, bus)
    }

    pub fn with_bus(mut self, target: impl Into<PathBuf>, bus: MemoryBus) -> Self {
        self.buses.insert(target.into(), bus);
        self
    }
}

impl BackingFactory for MemoryFactory {
    fn open(&self, target: &Path, mode: AccessMode) -> io::Result<Box<dyn BackingResource>> {
        let bus = self.buses.get(target).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no loopback device at {}", target.display()),
            )
        })?;
        Ok(Box::new(bus.handle(target.display().to_string(), mode)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_writes_and_serves_reads() {
        let bus = MemoryBus::new();
        bus.feed(b"\x01\x02\x03");
        let mut handle = bus.handle("a", AccessMode::ReadWrite);

        assert_eq!(handle.write(b"\xaa\xbb").unwrap(), 2);
        assert_eq!(handle.read(2).unwrap(), vec![1, 2]);
        assert_eq!(handle.read(8).unwrap(), vec![3]);
        assert!(handle.read(8).unwrap().is_empty());

        assert_eq!(bus.written(), vec![0xaa, 0xbb]);
        let kinds: Vec<_> = bus.transfers().iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TransferKind::Write,
                TransferKind::Read,
                TransferKind::Read,
                TransferKind::Read
            ]
        );
        assert_eq!(bus.max_concurrency(), 1);
    }

    #[test]
    fn emulates_spi_registers() {
        let bus = MemoryBus::new();
        let mut handle = bus.handle("a", AccessMode::ReadWrite);

        let set = SpiRequest::WriteMaxSpeedHz(1_000_000);
        assert_eq!(handle.control(set.code(), set.arg()).unwrap(), 0);
        assert_eq!(
            handle.control(SpiRequest::ReadMaxSpeedHz.code(), 0).unwrap(),
            1_000_000
        );
        assert_eq!(
            handle.control(SpiRequest::ReadBitsPerWord.code(), 0).unwrap(),
            8
        );
        assert_eq!(
            handle.control(0x55, 0).unwrap_err().kind(),
            io::ErrorKind::Unsupported
        );
    }

    #[test]
    fn injected_fault_is_one_shot() {
        let bus = MemoryBus::new();
        let mut handle = bus.handle("a", AccessMode::ReadWrite);
        bus.fail_next(io::ErrorKind::BrokenPipe);

        assert_eq!(
            handle.write(b"x").unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
        assert_eq!(handle.write(b"x").unwrap(), 1);
    }

    #[test]
    fn access_mode_is_enforced() {
        let bus = MemoryBus::new();
        let mut reader = bus.handle("r", AccessMode::ReadOnly);
        assert_eq!(
            reader.write(b"x").unwrap_err().kind(),
            io::ErrorKind::PermissionDenied
        );
        assert_eq!(
            reader.poll(),
            Readiness {
                readable: false,
                writable: false
            }
        );
        bus.feed(b"z");
        assert!(reader.poll().readable);
    }

    #[test]
    fn factory_resolves_known_targets() {
        let factory = MemoryFactory::single("/dev/loop-spi", MemoryBus::new());
        assert!(factory.open(Path::new("/dev/loop-spi"), AccessMode::ReadWrite).is_ok());
        let err = factory
            .open(Path::new("/dev/other"), AccessMode::ReadWrite)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
