//! Byte-addressed access to a sector-addressed device.

use tracing::{debug, info};

use super::DeviceError;
use super::partition::{self, Partition, PartitionError};
use crate::scsi::ScsiDevice;
use crate::usb::BulkPipe;

/// Upper bound for a single READ(10)/WRITE(10) data phase.
pub const CHUNK_BYTES: usize = 0x4000;

const DEFAULT_SECTOR_SIZE: u32 = 512;

/// A mass storage unit seen as a flat run of bytes.
///
/// Constructed closed: [`BlockDevice::init`] queries the capacity and classifies the
/// boot sector, after which reads and writes at any byte offset are translated into
/// whole-sector transfers of at most [`CHUNK_BYTES`] each.
pub struct BlockDevice<P> {
    scsi: ScsiDevice<P>,
    sector_size: u32,
    sector_count: u64,
    open: bool,
    read_only: bool,
    partition: Option<Partition>,
}

impl<P: BulkPipe> BlockDevice<P> {
    pub fn new(scsi: ScsiDevice<P>) -> Self {
        Self {
            scsi,
            sector_size: DEFAULT_SECTOR_SIZE,
            sector_count: 0,
            open: false,
            read_only: true,
            partition: None,
        }
    }

    /// Query the capacity, open the device and locate the FAT partition.
    #[tracing::instrument(skip_all)]
    pub fn init(&mut self) -> Result<Partition, PartitionError> {
        let capacity = self
            .scsi
            .read_capacity()
            .map_err(|e| PartitionError::IoFailure(e.into()))?;
        let block_length = capacity.block_length;
        if block_length == 0 || block_length as usize > CHUNK_BYTES {
            return Err(PartitionError::IoFailure(
                DeviceError::UnexpectedCapacity { block_length },
            ));
        }
        self.sector_size = block_length;
        self.sector_count = capacity.block_count();
        self.open = true;
        info!(
            "{} sectors of {} bytes ({} MiB)",
            self.sector_count,
            self.sector_size,
            self.size() >> 20
        );

        let mut boot_sector = vec![0u8; self.sector_size as usize];
        if let Err(e) = self.read(0, &mut boot_sector) {
            self.open = false;
            return Err(PartitionError::IoFailure(e));
        }
        let partition = partition::locate(&boot_sector, self.sector_count);
        self.partition = Some(partition);
        Ok(partition)
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    /// Size of the whole unit in bytes.
    pub fn size(&self) -> u64 {
        self.sector_count * u64::from(self.sector_size)
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    /// The partition found by [`BlockDevice::init`].
    pub fn partition(&self) -> Option<Partition> {
        self.partition
    }

    pub fn close(&mut self) {
        self.open = false;
    }

    pub fn scsi_mut(&mut self) -> &mut ScsiDevice<P> {
        &mut self.scsi
    }

    /// Fill `buf` with the bytes starting at `offset`.
    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        let (first, sectors, within) = self.span(offset, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }
        let sector_size = self.sector_size as usize;
        if within == 0 && buf.len() % sector_size == 0 {
            return self.read_sectors(first, buf);
        }
        let mut sectors_buf = vec![0u8; sectors as usize * sector_size];
        self.read_sectors(first, &mut sectors_buf)?;
        buf.copy_from_slice(&sectors_buf[within..within + buf.len()]);
        Ok(())
    }

    /// Store `data` starting at `offset`.
    ///
    /// Sectors only partly covered by `data` are read first so the bytes around it survive.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let (first, sectors, within) = self.span(offset, data.len())?;
        if self.read_only {
            return Err(DeviceError::ReadOnly);
        }
        if data.is_empty() {
            return Ok(());
        }
        let sector_size = self.sector_size as usize;
        if within == 0 && data.len() % sector_size == 0 {
            return self.write_sectors(first, data);
        }
        let mut sectors_buf = vec![0u8; sectors as usize * sector_size];
        self.read_sectors(first, &mut sectors_buf)?;
        sectors_buf[within..within + data.len()].copy_from_slice(data);
        self.write_sectors(first, &sectors_buf)
    }

    /// First sector, sector count and offset inside the first sector of a byte range.
    fn span(&self, offset: u64, len: usize) -> Result<(u64, u64, usize), DeviceError> {
        if !self.open {
            return Err(DeviceError::Closed);
        }
        let sector_size = u64::from(self.sector_size);
        let end = offset.checked_add(len as u64);
        if end.is_none_or(|end| end > self.size()) {
            return Err(DeviceError::InvalidOffset { offset, len });
        }
        let first = offset / sector_size;
        let within = offset % sector_size;
        let sectors = (within + len as u64).div_ceil(sector_size);
        Ok((first, sectors, within as usize))
    }

    fn chunk_sectors(&self) -> usize {
        (CHUNK_BYTES / self.sector_size as usize).max(1)
    }

    fn read_sectors(&mut self, first: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        let sector_size = self.sector_size as usize;
        let chunk_bytes = self.chunk_sectors() * sector_size;
        let mut lba = first;
        for chunk in buf.chunks_mut(chunk_bytes) {
            let blocks = chunk.len() / sector_size;
            debug!("READ(10) {blocks} sectors at {lba}");
            self.scsi
                .read_blocks(lba_u32(lba, chunk.len())?, blocks as u16, chunk)?;
            lba += blocks as u64;
        }
        Ok(())
    }

    fn write_sectors(&mut self, first: u64, data: &[u8]) -> Result<(), DeviceError> {
        let sector_size = self.sector_size as usize;
        let chunk_bytes = self.chunk_sectors() * sector_size;
        let mut lba = first;
        for chunk in data.chunks(chunk_bytes) {
            let blocks = chunk.len() / sector_size;
            debug!("WRITE(10) {blocks} sectors at {lba}");
            self.scsi
                .write_blocks(lba_u32(lba, chunk.len())?, blocks as u16, chunk)?;
            lba += blocks as u64;
        }
        Ok(())
    }
}

/// READ(10) and WRITE(10) address 32 bits worth of sectors.
fn lba_u32(lba: u64, len: usize) -> Result<u32, DeviceError> {
    u32::try_from(lba).map_err(|_| DeviceError::InvalidOffset { offset: lba, len })
}
