//! Representations for SCSI commands.
//!
//! This module uses the term "command descriptor" to describe a struct and implementation specific
//! details behind a CDB, and uses the term "command block" to describe a "black box" containing
//! a valid CDB.
//!
//! Commands are exposed as a function that returns a [`CommandBlock`]. These functions wrap
//! the more granular [`X6CommandDescriptor`] and [`X10CommandDescriptor`] structs.

use super::command_descriptor::*;
use crate::usb::cbw::{CBWDirection, MAX_CDB_SIZE};

/// Number of bytes requested from REQUEST SENSE; the fixed format sense data is 18 bytes.
pub const REQUEST_SENSE_LENGTH: u8 = 0x12;
/// READ CAPACITY(10) always answers with 8 bytes.
pub const READ_CAPACITY_LENGTH: u32 = 8;

/// A serialized command block ready to be submitted
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandBlock {
    command: [u8; MAX_CDB_SIZE],
    len: usize,
    pub direction: CBWDirection,
}

impl CommandBlock {
    pub fn new(descriptor: &impl CommandDescriptor, direction: CBWDirection) -> Self {
        let bytes = descriptor.as_slice();
        let mut command = [0u8; MAX_CDB_SIZE];
        command[..bytes.len()].copy_from_slice(bytes);
        Self {
            command,
            len: bytes.len(),
            direction,
        }
    }

    /// Returns the length of the underlying command block.
    ///
    /// Will always be at most 16 bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn opcode(&self) -> u8 {
        self.command[0]
    }

    /// The meaningful bytes of the command block.
    pub fn as_bytes(&self) -> &[u8] {
        &self.command[..self.len]
    }

    /// Returns a valid command block, prepared as described by USB Mass
    /// Storage Class - Bulk Only Transport section 5.1 (CBWCB).
    pub fn get(&self) -> [u8; MAX_CDB_SIZE] {
        self.command
    }
}

/// "The REQUEST SENSE command requests that the device server transfer sense data
/// to the application client."
///
/// The allocation length sits at offset 4. Defined in SPC-2 7.20
pub fn request_sense() -> CommandBlock {
    CommandBlock::new(
        &X6CommandDescriptor {
            operation_code: OpCode::RequestSense,
            logical_block_address: [0, 0, 0],
            misc_len: REQUEST_SENSE_LENGTH,
            control: 0,
        },
        CBWDirection::DataIn,
    )
}

/// "The `READ CAPACITY` command provides a means for the application client
/// to request information regarding the capacity of the block device."
///
/// The 10 byte variant takes no parameters. SBC-2 5.1.10
pub fn read_capacity() -> CommandBlock {
    CommandBlock::new(
        &X10CommandDescriptor::blank(OpCode::ReadCapacity),
        CBWDirection::DataIn,
    )
}

/// READ(10): read `blocks` logical blocks starting at `lba`. SBC-2 5.1.6
pub fn read10(lba: u32, blocks: u16) -> CommandBlock {
    let mut cdb = X10CommandDescriptor::blank(OpCode::Read10);
    cdb.set_block_range(lba, blocks);
    CommandBlock::new(&cdb, CBWDirection::DataIn)
}

/// WRITE(10): write `blocks` logical blocks starting at `lba`. SBC-2 5.1.20
pub fn write10(lba: u32, blocks: u16) -> CommandBlock {
    let mut cdb = X10CommandDescriptor::blank(OpCode::Write10);
    cdb.set_block_range(lba, blocks);
    CommandBlock::new(&cdb, CBWDirection::DataOut)
}

/// A READ(10)/WRITE(10) command kept around between transfers.
///
/// The opcode and direction are fixed when it is built, only the block range
/// changes from one transfer to the next.
pub struct BlockTransferCommand {
    descriptor: X10CommandDescriptor,
    direction: CBWDirection,
}

impl BlockTransferCommand {
    pub fn read() -> Self {
        Self {
            descriptor: X10CommandDescriptor::blank(OpCode::Read10),
            direction: CBWDirection::DataIn,
        }
    }

    pub fn write() -> Self {
        Self {
            descriptor: X10CommandDescriptor::blank(OpCode::Write10),
            direction: CBWDirection::DataOut,
        }
    }

    /// Point the command at a new block range and serialize it.
    pub fn prepare(&mut self, lba: u32, blocks: u16) -> CommandBlock {
        self.descriptor.set_block_range(lba, blocks);
        CommandBlock::new(&self.descriptor, self.direction)
    }
}
