//! spidev control requests.
//!
//! Codes are the Linux `SPI_IOC_{RD,WR}_*` ioctl numbers, so a caller can pass
//! the same request it would issue against `/dev/spidevB.C` directly.

use std::mem::size_of;

pub const SPI_IOC_MAGIC: u8 = b'k';

const NR_MODE: u8 = 1;
const NR_BITS_PER_WORD: u8 = 3;
const NR_MAX_SPEED_HZ: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiRequest {
    ReadMode,
    WriteMode(u8),
    ReadBitsPerWord,
    WriteBitsPerWord(u8),
    ReadMaxSpeedHz,
    WriteMaxSpeedHz(u32),
}

impl SpiRequest {
    pub fn code(self) -> u32 {
        match self {
            Self::ReadMode => read_code(NR_MODE, size_of::<u8>()),
            Self::WriteMode(_) => write_code(NR_MODE, size_of::<u8>()),
            Self::ReadBitsPerWord => read_code(NR_BITS_PER_WORD, size_of::<u8>()),
            Self::WriteBitsPerWord(_) => write_code(NR_BITS_PER_WORD, size_of::<u8>()),
            Self::ReadMaxSpeedHz => read_code(NR_MAX_SPEED_HZ, size_of::<u32>()),
            Self::WriteMaxSpeedHz(_) => write_code(NR_MAX_SPEED_HZ, size_of::<u32>()),
        }
    }

    pub fn arg(self) -> u64 {
        match self {
            Self::WriteMode(v) | Self::WriteBitsPerWord(v) => u64::from(v),
            Self::WriteMaxSpeedHz(v) => u64::from(v),
            Self::ReadMode | Self::ReadBitsPerWord | Self::ReadMaxSpeedHz => 0,
        }
    }

    /// Decode a raw `(code, arg)` pair. Returns `None` for unknown codes or
    /// arguments that do not fit the request's width.
    pub fn decode(code: u32, arg: u64) -> Option<Self> {
        let candidates = [
            Self::ReadMode,
            Self::WriteMode(0),
            Self::ReadBitsPerWord,
            Self::WriteBitsPerWord(0),
            Self::ReadMaxSpeedHz,
            Self::WriteMaxSpeedHz(0),
        ];
        let template = candidates.into_iter().find(|r| r.code() == code)?;
        Some(match template {
            Self::WriteMode(_) => Self::WriteMode(u8::try_from(arg).ok()?),
            Self::WriteBitsPerWord(_) => Self::WriteBitsPerWord(u8::try_from(arg).ok()?),
            Self::WriteMaxSpeedHz(_) => Self::WriteMaxSpeedHz(u32::try_from(arg).ok()?),
            read => read,
        })
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn read_code(nr: u8, size: usize) -> u32 {
    nix::request_code_read!(SPI_IOC_MAGIC, nr, size) as u32
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn write_code(nr: u8, size: usize) -> u32 {
    nix::request_code_write!(SPI_IOC_MAGIC, nr, size) as u32
}

// asm-generic _IOC layout, used where the platform has no spidev.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn read_code(nr: u8, size: usize) -> u32 {
    (2 << 30) | ((size as u32) << 16) | (u32::from(SPI_IOC_MAGIC) << 8) | u32::from(nr)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn write_code(nr: u8, size: usize) -> u32 {
    (1 << 30) | ((size as u32) << 16) | (u32::from(SPI_IOC_MAGIC) << 8) | u32::from(nr)
}
