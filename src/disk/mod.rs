//! Block level view of a mass storage unit and of the partition on it.

pub mod block;
pub mod partition;

use std::io::{self, Read, Seek, SeekFrom, Write};

use thiserror::Error;

use crate::usb::{BulkPipe, TransportError};
pub use block::BlockDevice;
pub use partition::{FatType, Partition, PartitionError};

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("device is not open")]
    Closed,

    #[error("device is read-only")]
    ReadOnly,

    #[error("{len} bytes at offset {offset} lie outside the device")]
    InvalidOffset { offset: u64, len: usize },

    #[error("unexpected block length {block_length}")]
    UnexpectedCapacity { block_length: u32 },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<DeviceError> for io::Error {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::ReadOnly => io::Error::new(io::ErrorKind::PermissionDenied, e),
            DeviceError::InvalidOffset { .. } => io::Error::new(io::ErrorKind::InvalidInput, e),
            DeviceError::Transport(TransportError::Timeout(_)) => {
                io::Error::new(io::ErrorKind::TimedOut, e)
            }
            other => io::Error::other(other),
        }
    }
}

/// A [`BlockDevice`] restricted to one partition, addressed from the partition's
/// first byte.
///
/// Keeps a cursor so it can back a filesystem driver through
/// [`Read`], [`Write`] and [`Seek`]. The last sector read is cached, filesystem
/// drivers tend to read allocation tables a few bytes at a time.
pub struct LogicalDisk<P> {
    device: BlockDevice<P>,
    partition: Partition,
    position: u64,
    cache: Option<(u64, Vec<u8>)>,
}

impl<P: BulkPipe> LogicalDisk<P> {
    pub fn new(device: BlockDevice<P>, partition: Partition) -> Self {
        Self {
            device,
            partition,
            position: 0,
            cache: None,
        }
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    pub fn device(&self) -> &BlockDevice<P> {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut BlockDevice<P> {
        self.cache = None;
        &mut self.device
    }

    /// Length of the partition in bytes.
    pub fn len(&self) -> u64 {
        self.partition.count * u64::from(self.device.sector_size())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn base(&self) -> u64 {
        self.partition.offset * u64::from(self.device.sector_size())
    }

    /// Bytes between the cursor and the end of the partition, capped at `want`.
    fn available(&self, want: usize) -> usize {
        let left = self.len().saturating_sub(self.position);
        usize::try_from(left).map_or(want, |left| left.min(want))
    }

    fn read_cached(&mut self, buf: &mut [u8]) -> Result<(), DeviceError> {
        let sector_size = u64::from(self.device.sector_size());
        let absolute = self.base() + self.position;
        let sector = absolute / sector_size;
        let within = (absolute % sector_size) as usize;
        if within + buf.len() > sector_size as usize {
            return self.device.read(absolute, buf);
        }
        if !matches!(&self.cache, Some((cached, _)) if *cached == sector) {
            let mut data = vec![0u8; sector_size as usize];
            self.device.read(sector * sector_size, &mut data)?;
            self.cache = Some((sector, data));
        }
        if let Some((_, data)) = &self.cache {
            buf.copy_from_slice(&data[within..within + buf.len()]);
        }
        Ok(())
    }
}

impl<P: BulkPipe> Read for LogicalDisk<P> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.available(buf.len());
        if n == 0 {
            return Ok(0);
        }
        self.read_cached(&mut buf[..n])?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<P: BulkPipe> Write for LogicalDisk<P> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.available(buf.len());
        if n == 0 {
            return Ok(0);
        }
        self.cache = None;
        self.device.write(self.base() + self.position, &buf[..n])?;
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<P: BulkPipe> Seek for LogicalDisk<P> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.len().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        match target {
            Some(target) if target <= self.len() => {
                self.position = target;
                Ok(target)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek outside the partition",
            )),
        }
    }
}
