//! SCSI protocol and format implementation as described in:
//! - SCSI Primary Commands – 2 (SPC-2):
//!   <https://www.rockbox.org/wiki/pub/Main/DataSheets/spc2r20.pdf>
//!   This is an older version of the SCSI specification.
//!   It has enough information to describe almost every command we need to know,
//!   except for some information specific to block devices, which is described in the next SCSI
//!   specification linked below.
//! - SCSI Block Commands – 2 (SBC-2)
//!   <https://raw.githubusercontent.com/carmark/papers/master/storage/scsi/sbc2r16.pdf>
//!   This is an older version of the SCSI block commands specification. It contains information
//!   about commands specific to block devices.
//!
//! USB floppy drives speak UFI, whose READ CAPACITY, READ(10), WRITE(10) and REQUEST SENSE
//! share opcodes and field offsets with the SCSI commands used here.

pub mod command;
pub mod command_descriptor;
pub mod response;

use tracing::{debug, warn};

use crate::usb::{
    BulkOnlyTransport, BulkPipe, READ_DATA_TIMEOUT, SHORT_DATA_TIMEOUT, TransportError,
    WRITE_DATA_TIMEOUT,
};
use command::BlockTransferCommand;
use response::{ReadCapacity, SenseData};

/// An abstraction over an underlying USB
/// mass storage device.
///
/// Every method is one command: CBW, data phase, CSW.
pub struct ScsiDevice<P> {
    transport: BulkOnlyTransport<P>,
    read_command: BlockTransferCommand,
    write_command: BlockTransferCommand,
    block_length: u32,
}

impl<P: BulkPipe> ScsiDevice<P> {
    pub fn new(transport: BulkOnlyTransport<P>) -> Self {
        Self {
            transport,
            read_command: BlockTransferCommand::read(),
            write_command: BlockTransferCommand::write(),
            // UFI and most flash media, until READ CAPACITY says otherwise
            block_length: 512,
        }
    }

    pub fn transport(&self) -> &BulkOnlyTransport<P> {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut BulkOnlyTransport<P> {
        &mut self.transport
    }

    /// Block length used to size data phases.
    pub fn block_length(&self) -> u32 {
        self.block_length
    }

    /// Issue READ CAPACITY and remember the reported block length.
    pub fn read_capacity(&mut self) -> Result<ReadCapacity, TransportError> {
        debug!("submitting READ CAPACITY");
        let mut buf = [0u8; command::READ_CAPACITY_LENGTH as usize];
        let received = self.run_in(&command::read_capacity(), &mut buf, SHORT_DATA_TIMEOUT)?;
        let capacity = ReadCapacity::parse(&buf[..received])?;
        debug!(
            "READ CAPACITY: last block {}, block length {}",
            capacity.last_lba, capacity.block_length
        );
        if capacity.block_length > 0 {
            self.block_length = capacity.block_length;
        }
        Ok(capacity)
    }

    /// Issue REQUEST SENSE for the error condition of the previous command.
    pub fn request_sense(&mut self) -> Result<SenseData, TransportError> {
        debug!("submitting REQUEST SENSE");
        let mut buf = [0u8; command::REQUEST_SENSE_LENGTH as usize];
        let received =
            self.transport
                .execute_in(&command::request_sense(), &mut buf, SHORT_DATA_TIMEOUT)?;
        SenseData::parse(&buf[..received])
    }

    /// READ(10) `blocks` blocks at `lba` into `buf`, which must hold them exactly.
    pub fn read_blocks(
        &mut self,
        lba: u32,
        blocks: u16,
        buf: &mut [u8],
    ) -> Result<(), TransportError> {
        let expected = usize::from(blocks) * self.block_length as usize;
        let Some(buf) = buf.get_mut(..expected) else {
            return Err(TransportError::ShortRead {
                expected,
                actual: buf.len(),
            });
        };
        let cb = self.read_command.prepare(lba, blocks);
        let received = self.run_in(&cb, buf, READ_DATA_TIMEOUT)?;
        if received != expected {
            return Err(TransportError::ShortRead {
                expected,
                actual: received,
            });
        }
        Ok(())
    }

    /// WRITE(10) `data`, a whole number of blocks, at `lba`.
    pub fn write_blocks(&mut self, lba: u32, blocks: u16, data: &[u8]) -> Result<(), TransportError> {
        let expected = usize::from(blocks) * self.block_length as usize;
        if data.len() < expected {
            return Err(TransportError::ShortWrite {
                expected,
                actual: data.len(),
            });
        }
        let cb = self.write_command.prepare(lba, blocks);
        let result = self
            .transport
            .execute_out(&cb, &data[..expected], WRITE_DATA_TIMEOUT);
        self.explain_failure(result)
    }

    fn run_in(
        &mut self,
        cb: &command::CommandBlock,
        buf: &mut [u8],
        timeout: std::time::Duration,
    ) -> Result<usize, TransportError> {
        let result = self.transport.execute_in(cb, buf, timeout);
        self.explain_failure(result)
    }

    /// Log the device's own account of a failed command, then hand the failure back.
    fn explain_failure<T>(
        &mut self,
        result: Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        if let Err(TransportError::CommandFailed { tag, .. }) = &result {
            let tag = *tag;
            match self.request_sense() {
                Ok(sense) => warn!(
                    "command #{tag} failed: {} (ASC 0x{:02x}, ASCQ 0x{:02x}, info {})",
                    sense.sense_key_name(),
                    sense.asc,
                    sense.ascq,
                    sense.information
                ),
                Err(e) => warn!("command #{tag} failed and REQUEST SENSE did too: {e}"),
            }
        }
        result
    }
}
