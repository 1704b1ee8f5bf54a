//! Locating the FAT region of a disk from its first sector.
//!
//! A disk either starts with a volume boot record ("superfloppy", the filesystem
//! begins at sector 0 and spans the whole device) or with a master boot record whose
//! partition table names where the filesystem lives.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;
use tracing::{info, warn};

use super::DeviceError;

/// Offset of the OEM name in a volume boot record.
const WATERMARK_OFFSET: usize = 0x03;
const WATERMARK_LEN: usize = 5;

/// First of the four MBR partition entries.
const PARTITION_TABLE_OFFSET: usize = 0x1be;
const PARTITION_ENTRY_SIZE: usize = 16;
const PARTITION_ENTRIES: usize = 4;

const ENTRY_TYPE: usize = 0x04;
const ENTRY_FIRST_SECTOR: usize = 0x08;
const ENTRY_SECTOR_COUNT: usize = 0x0c;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
    Unsupported,
}

impl FatType {
    /// Translate an MBR partition type code.
    pub fn from_partition_type(code: u8) -> Self {
        match code {
            0x01 => FatType::Fat12,
            0x04 | 0x06 | 0x0e => FatType::Fat16,
            0x0b | 0x0c => FatType::Fat32,
            _ => FatType::Unsupported,
        }
    }
}

#[derive(Error, Debug)]
pub enum PartitionError {
    #[error("failed to read the boot sector: {0}")]
    IoFailure(#[source] DeviceError),

    #[error("unsupported filesystem ({0:?})")]
    Unsupported(FatType),
}

/// Where the filesystem lives, in sectors of the underlying device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    pub fat_type: FatType,
    pub offset: u64,
    pub count: u64,
}

impl Partition {
    /// The whole device, read as a single FAT volume.
    pub fn whole_device(fat_type: FatType, total_sectors: u64) -> Self {
        Self {
            fat_type,
            offset: 0,
            count: total_sectors,
        }
    }
}

enum Watermark {
    Floppy,
    Ntfs,
    None,
}

fn watermark(boot_sector: &[u8]) -> Watermark {
    let Some(mark) = boot_sector.get(WATERMARK_OFFSET..WATERMARK_OFFSET + WATERMARK_LEN) else {
        return Watermark::None;
    };
    if mark.starts_with(b"NTFS") {
        return Watermark::Ntfs;
    }
    // "MSDOS", "MSWIN", "IBM  ", "FRDOS", "mkdosfs" truncates to "mkdos"
    let dos = &mark[2..5];
    if mark.starts_with(b"IBM")
        || mark.starts_with(b"MS")
        || dos.eq_ignore_ascii_case(b"DOS")
    {
        Watermark::Floppy
    } else {
        Watermark::None
    }
}

/// Whether sector 0 carries a plausible FAT BIOS parameter block.
///
/// Formatters that write their own OEM name (mkfs.fat writes "mkfs.fat") still leave a
/// jump instruction, a sane geometry and the filesystem type label behind.
fn has_fat_bpb(boot_sector: &[u8]) -> bool {
    if boot_sector.len() < 0x5a {
        return false;
    }
    let jump = boot_sector[0] == 0xeb || boot_sector[0] == 0xe9;
    let bytes_per_sector = LittleEndian::read_u16(&boot_sector[0x0b..0x0d]);
    let sectors_per_cluster = boot_sector[0x0d];
    let label = boot_sector[0x36..0x39] == *b"FAT" || boot_sector[0x52..0x55] == *b"FAT";
    jump && matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096)
        && sectors_per_cluster.is_power_of_two()
        && label
}

/// Classify sector 0 and pick the partition to mount.
///
/// An unsupported filesystem is not an error here; callers check
/// [`Partition::fat_type`] before mounting.
pub fn locate(boot_sector: &[u8], total_sectors: u64) -> Partition {
    match watermark(boot_sector) {
        Watermark::Ntfs => {
            warn!("boot sector carries an NTFS watermark");
            return Partition::whole_device(FatType::Unsupported, total_sectors);
        }
        Watermark::Floppy => {
            info!("superfloppy, FAT volume spans the whole device");
            return Partition::whole_device(FatType::Fat32, total_sectors);
        }
        Watermark::None if has_fat_bpb(boot_sector) => {
            info!("superfloppy (BPB without a known OEM name)");
            return Partition::whole_device(FatType::Fat32, total_sectors);
        }
        Watermark::None => {}
    }

    let entry = |index: usize| {
        let start = PARTITION_TABLE_OFFSET + index * PARTITION_ENTRY_SIZE;
        boot_sector.get(start..start + PARTITION_ENTRY_SIZE)
    };

    let chosen = (0..PARTITION_ENTRIES).find_map(|index| {
        let e = entry(index)?;
        let fat_type = FatType::from_partition_type(e[ENTRY_TYPE]);
        (fat_type != FatType::Unsupported).then_some((index, e, fat_type))
    });
    let (index, e, fat_type) = match chosen {
        Some(found) => found,
        None => {
            warn!("no FAT partition in the MBR, falling back to entry 0");
            match entry(0) {
                Some(e) => (0, e, FatType::Unsupported),
                None => return Partition::whole_device(FatType::Unsupported, total_sectors),
            }
        }
    };

    let offset = u64::from(LittleEndian::read_u32(
        &e[ENTRY_FIRST_SECTOR..ENTRY_FIRST_SECTOR + 4],
    ));
    let count = u64::from(LittleEndian::read_u32(
        &e[ENTRY_SECTOR_COUNT..ENTRY_SECTOR_COUNT + 4],
    ));
    if offset > total_sectors || count > total_sectors {
        warn!(
            offset,
            count, total_sectors, "partition {index} lies outside the device, using the whole device"
        );
        return Partition::whole_device(fat_type, total_sectors);
    }
    info!("partition {index}: {fat_type:?}, {count} sectors at {offset}");
    Partition {
        fat_type,
        offset,
        count,
    }
}
