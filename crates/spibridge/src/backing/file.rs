//! Backing device opened from a filesystem path (normally `/dev/spidevB.C`).

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use super::spi::SpiRequest;
use super::{AccessMode, BackingFactory, BackingResource, MAX_TRANSFER};

#[derive(Debug)]
pub struct FileBacking {
    path: PathBuf,
    file: File,
}

impl FileBacking {
    /// Open an existing device node or file. Never creates the target.
    pub fn open(path: &Path, mode: AccessMode) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(mode.readable())
            .write(mode.writable())
            .open(path)?;
        tracing::debug!(path = %path.display(), ?mode, "Opened backing device");
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BackingResource for FileBacking {
    fn read(&mut self, max_len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; max_len.min(MAX_TRANSFER)];
        let n = self.file.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn control(&mut self, code: u32, arg: u64) -> io::Result<u64> {
        let request = SpiRequest::decode(code, arg)
            .ok_or_else(|| io::Error::from(io::ErrorKind::Unsupported))?;
        spi_control(&self.file, request)
    }
}

impl Drop for FileBacking {
    fn drop(&mut self) {
        tracing::debug!(path = %self.path.display(), "Closed backing device");
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod ioctl {
    use super::super::spi::SPI_IOC_MAGIC;

    nix::ioctl_read!(read_mode, SPI_IOC_MAGIC, 1, u8);
    nix::ioctl_write_ptr!(write_mode, SPI_IOC_MAGIC, 1, u8);
    nix::ioctl_read!(read_bits_per_word, SPI_IOC_MAGIC, 3, u8);
    nix::ioctl_write_ptr!(write_bits_per_word, SPI_IOC_MAGIC, 3, u8);
    nix::ioctl_read!(read_max_speed_hz, SPI_IOC_MAGIC, 4, u32);
    nix::ioctl_write_ptr!(write_max_speed_hz, SPI_IOC_MAGIC, 4, u32);
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn spi_control(file: &File, request: SpiRequest) -> io::Result<u64> {
    use std::os::fd::AsRawFd;

    let fd = file.as_raw_fd();
    // SAFETY: `fd` is owned by `file`, which outlives the call, and every
    // pointer refers to a local of exactly the size the request declares.
    let result = unsafe {
        match request {
            SpiRequest::ReadMode => {
                let mut mode = 0u8;
                ioctl::read_mode(fd, &mut mode).map(|_| u64::from(mode))
            }
            SpiRequest::WriteMode(mode) => ioctl::write_mode(fd, &mode).map(|_| 0),
            SpiRequest::ReadBitsPerWord => {
                let mut bits = 0u8;
                ioctl::read_bits_per_word(fd, &mut bits).map(|_| u64::from(bits))
            }
            SpiRequest::WriteBitsPerWord(bits) => {
                ioctl::write_bits_per_word(fd, &bits).map(|_| 0)
            }
            SpiRequest::ReadMaxSpeedHz => {
                let mut hz = 0u32;
                ioctl::read_max_speed_hz(fd, &mut hz).map(|_| u64::from(hz))
            }
            SpiRequest::WriteMaxSpeedHz(hz) => ioctl::write_max_speed_hz(fd, &hz).map(|_| 0),
        }
    };
    result.map_err(io::Error::from)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn spi_control(_file: &File, _request: SpiRequest) -> io::Result<u64> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

/// Opens [`FileBacking`] handles.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileFactory;

impl BackingFactory for FileFactory {
    fn open(&self, target: &Path, mode: AccessMode) -> io::Result<Box<dyn BackingResource>> {
        Ok(Box::new(FileBacking::open(target, mode)?))
    }
}
