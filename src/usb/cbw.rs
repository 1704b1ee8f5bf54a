//! Command Block and Command Status Wrappers, the framing of every BOT exchange.

use byteorder::{ByteOrder, LittleEndian};

use super::TransportError;
use crate::scsi::command::CommandBlock;

/// `dCBWSignature`, "USBC" on the wire. BOT section 5.1.
pub const CBW_SIGNATURE: u32 = 0x43425355;
/// `dCSWSignature`, "USBS" on the wire. BOT section 5.2.
pub const CSW_SIGNATURE: u32 = 0x53425355;

pub const CBW_SIZE: usize = 31;
pub const CSW_SIZE: usize = 13;

/// Largest command block a CBW can carry (`CBWCB`).
pub const MAX_CDB_SIZE: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CBWDirection {
    /// host to device
    DataOut,
    /// device to host
    DataIn,
    /// No data phase. The device ignores the direction bit when the transfer length is zero.
    NonDirectional,
}

impl CBWDirection {
    /// `bmCBWFlags`: bit 7 set means Data-In, every other bit is reserved.
    pub fn flags(self) -> u8 {
        match self {
            CBWDirection::DataIn => 0x80,
            CBWDirection::DataOut | CBWDirection::NonDirectional => 0x00,
        }
    }
}

/// The 31 byte little endian envelope around a SCSI command, BOT section 5.1.
///
/// Every field is a byte or a byte array, so the struct has no padding and can be
/// handed to the bulk OUT endpoint as is.
#[repr(C, packed)]
pub struct CommandBlockWrapper {
    /// always [`CBW_SIGNATURE`]
    signature: [u8; 4],
    /// `dCBWTag`, echoed back by the device in the matching CSW. See [`TagGenerator`].
    tag: [u8; 4],
    /// `dCBWDataTransferLength`: bytes the host expects to move in the data phase.
    /// Zero means there is no data phase.
    data_transfer_length: [u8; 4],
    /// `bmCBWFlags`
    flags: u8,
    /// `bCBWLUN`. Only unit 0 is ever addressed.
    lun: u8,
    /// `bCBWCBLength`, 1 through 16
    command_block_length: u8,
    /// `CBWCB`, zero padded past `command_block_length`
    command: [u8; MAX_CDB_SIZE],
}

impl CommandBlockWrapper {
    /// Creates a new [`CommandBlockWrapper`].
    pub fn new(command: &CommandBlock, data_transfer_length: u32, lun: u8, tag: u32) -> Self {
        Self {
            signature: CBW_SIGNATURE.to_le_bytes(),
            tag: tag.to_le_bytes(),
            data_transfer_length: data_transfer_length.to_le_bytes(),
            flags: command.direction.flags(),
            lun,
            command_block_length: command.len() as u8,
            command: command.get(),
        }
    }

    pub fn tag(&self) -> u32 {
        u32::from_le_bytes(self.tag)
    }

    /// The wire bytes, exactly [`CBW_SIZE`] of them.
    pub fn as_slice(&'_ self) -> &[u8] {
        const {
            assert!(
                std::mem::size_of::<CommandBlockWrapper>() == CBW_SIZE,
                "CommandBlockWrapper not 31 bytes in size"
            );
        };
        // SAFETY: the const assertion above
        // guarantees that the size is as we expected, every field is a byte
        // or byte array so there is no padding or alignment to worry about,
        // and we know the lifetime of `self` is valid.
        let slice: &'_ [u8] = unsafe {
            let ptr = self as *const CommandBlockWrapper as *const u8;
            std::slice::from_raw_parts(ptr, CBW_SIZE)
        };
        slice
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandStatus {
    Passed = 0,
    Failed = 1,
    PhaseError = 2,
}

/// The device's verdict on one command, BOT section 5.2.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CommandStatusWrapper {
    /// `dCSWTag`, must equal the `dCBWTag` of the command it answers
    pub tag: u32,
    /// `dCSWDataResidue`: expected minus actually processed bytes
    pub data_residue: u32,
    /// `bCSWStatus`, values above 2 are reserved
    pub status: CommandStatus,
}

impl CommandStatusWrapper {
    /// Decode a command status wrapper from the provided slice.
    ///
    /// This function validates the length, the `signature` and the status byte; it does not
    /// look at the tag.
    pub fn from_slice(buf: &[u8]) -> Result<CommandStatusWrapper, TransportError> {
        if buf.len() != CSW_SIZE {
            return Err(TransportError::ShortRead {
                expected: CSW_SIZE,
                actual: buf.len(),
            });
        }
        let signature = LittleEndian::read_u32(&buf[0..4]);
        if signature != CSW_SIGNATURE {
            return Err(TransportError::BadSignature(signature));
        }
        let status = match buf[12] {
            0 => CommandStatus::Passed,
            1 => CommandStatus::Failed,
            2 => CommandStatus::PhaseError,
            other => return Err(TransportError::InvalidStatus(other)),
        };
        Ok(CommandStatusWrapper {
            tag: LittleEndian::read_u32(&buf[4..8]),
            data_residue: LittleEndian::read_u32(&buf[8..12]),
            status,
        })
    }

    /// Serialize into the 13 byte wire format. Devices produce these; the host only needs it
    /// for emulation.
    pub fn to_bytes(&self) -> [u8; CSW_SIZE] {
        let mut buf = [0u8; CSW_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], CSW_SIGNATURE);
        LittleEndian::write_u32(&mut buf[4..8], self.tag);
        LittleEndian::write_u32(&mut buf[8..12], self.data_residue);
        buf[12] = self.status as u8;
        buf
    }
}

/// Hands out CBW tags, one per command.
#[derive(Debug)]
pub struct TagGenerator(u32);

impl TagGenerator {
    pub fn new() -> TagGenerator {
        // easy to spot in a hex dump
        Self(123)
    }

    /// Start counting from an arbitrary value.
    pub fn starting_at(tag: u32) -> TagGenerator {
        Self(tag)
    }

    /// Returns a u32 that's one more than the previously returned value, wrapping at `u32::MAX`.
    pub fn tag(&mut self) -> u32 {
        let output = self.0;
        self.0 = self.0.wrapping_add(1);
        output
    }
}

impl Default for TagGenerator {
    fn default() -> Self {
        Self::new()
    }
}
