//! A mass storage device that lives in memory.
//!
//! [`RamDrive`] answers CBWs the way a bulk-only SCSI flash drive would, serving
//! READ CAPACITY, REQUEST SENSE, READ(10) and WRITE(10) from a byte vector. It backs
//! the mock device and lets the whole stack above the USB endpoints run without hardware.

use std::time::Duration;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use tracing::debug;

use super::cbw::{
    CBW_SIGNATURE, CBW_SIZE, CSW_SIZE, CommandStatus, CommandStatusWrapper,
};
use super::{BulkPipe, TransportError};
use crate::scsi::command_descriptor::OpCode;

/// One-shot misbehaviour, applied to the next exchange it concerns.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Accept one byte less of the next CBW and drop it.
    ShortCommandWrite,
    /// Report the next command as failed.
    FailStatus,
    /// Answer the next command with a CSW carrying the CBW signature.
    CorruptSignature,
    /// Echo the wrong tag in the next CSW.
    WrongTag,
    /// Send only 12 bytes of the next CSW.
    TruncateStatus,
    /// Stall the next Data-In phase.
    StallDataIn,
    /// Halt the OUT endpoint at the next Data-Out phase and fail the command as a
    /// write-protected medium would.
    StallDataOut,
}

/// A recorded READ(10)/WRITE(10).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockTransfer {
    pub opcode: u8,
    pub lba: u32,
    pub blocks: u16,
}

#[derive(Debug)]
enum Phase {
    Idle,
    DataIn {
        data: Vec<u8>,
        csw: CommandStatusWrapper,
    },
    DataOut {
        offset: Option<usize>,
        expected: usize,
        csw: CommandStatusWrapper,
    },
    Status(CommandStatusWrapper),
}

#[derive(Copy, Clone, Debug, Default)]
struct Sense {
    key: u8,
    asc: u8,
    information: u32,
}

pub struct RamDrive {
    block_size: u32,
    storage: Vec<u8>,
    phase: Phase,
    sense: Sense,
    fault: Option<Fault>,
    bad_block: Option<u64>,
    out_halted: bool,
    last_cbw: Option<[u8; CBW_SIZE]>,
    transfers: Vec<BlockTransfer>,
}

impl RamDrive {
    /// A drive of `storage.len() / block_size` blocks. Trailing bytes that do not fill a
    /// whole block are dropped.
    pub fn new(block_size: u32, mut storage: Vec<u8>) -> Self {
        let block_size = block_size.max(1);
        let whole = storage.len() / block_size as usize * block_size as usize;
        storage.truncate(whole);
        Self {
            block_size,
            storage,
            phase: Phase::Idle,
            sense: Sense::default(),
            fault: None,
            bad_block: None,
            out_halted: false,
            last_cbw: None,
            transfers: Vec::new(),
        }
    }

    pub fn block_count(&self) -> u64 {
        (self.storage.len() / self.block_size as usize) as u64
    }

    pub fn inject(&mut self, fault: Fault) {
        self.fault = Some(fault);
    }

    /// Every READ(10)/WRITE(10) touching `lba` fails with a medium error from now on.
    pub fn mark_bad_block(&mut self, lba: u64) {
        self.bad_block = Some(lba);
    }

    pub fn last_cbw(&self) -> Option<&[u8]> {
        self.last_cbw.as_ref().map(|cbw| &cbw[..])
    }

    pub fn last_cbw_tag(&self) -> Option<u32> {
        self.last_cbw
            .as_ref()
            .map(|cbw| LittleEndian::read_u32(&cbw[4..8]))
    }

    pub fn transfers(&self) -> &[BlockTransfer] {
        &self.transfers
    }

    /// Whether the OUT endpoint is halted and waiting for a clear.
    pub fn out_halted(&self) -> bool {
        self.out_halted
    }

    fn take_fault(&mut self, fault: Fault) -> bool {
        if self.fault == Some(fault) {
            self.fault = None;
            true
        } else {
            false
        }
    }

    fn fail(&mut self, key: u8, asc: u8, information: u32) -> CommandStatus {
        self.sense = Sense {
            key,
            asc,
            information,
        };
        CommandStatus::Failed
    }

    /// Byte range of a block transfer, if it lies on the medium and avoids the bad block.
    fn block_range(&mut self, lba: u32, blocks: u16) -> Result<usize, CommandStatus> {
        let end = u64::from(lba) + u64::from(blocks);
        if end > self.block_count() {
            return Err(self.fail(0x05, 0x21, lba));
        }
        if let Some(bad) = self.bad_block {
            if (u64::from(lba)..end).contains(&bad) {
                return Err(self.fail(0x03, 0x11, bad as u32));
            }
        }
        Ok(lba as usize * self.block_size as usize)
    }

    fn accept_command(&mut self, cbw: &[u8]) -> Result<(), TransportError> {
        let mut raw = [0u8; CBW_SIZE];
        raw.copy_from_slice(cbw);
        self.last_cbw = Some(raw);

        let tag = LittleEndian::read_u32(&cbw[4..8]);
        let expected = LittleEndian::read_u32(&cbw[8..12]) as usize;
        let cdb_len = usize::from(cbw[14]).min(16);
        let cdb = &cbw[15..15 + cdb_len];
        let csw = |status| CommandStatusWrapper {
            tag,
            data_residue: 0,
            status,
        };

        let opcode = cdb.first().copied().unwrap_or(0xff);
        self.phase = if opcode == OpCode::ReadCapacity as u8 {
            let mut data = vec![0u8; 8];
            BigEndian::write_u32(&mut data[0..4], (self.block_count() as u32).saturating_sub(1));
            BigEndian::write_u32(&mut data[4..8], self.block_size);
            Phase::DataIn {
                data,
                csw: csw(CommandStatus::Passed),
            }
        } else if opcode == OpCode::RequestSense as u8 {
            let mut data = vec![0u8; 18];
            data[0] = 0x70;
            if self.sense.information != 0 {
                data[0] |= 0x80;
            }
            data[2] = self.sense.key;
            BigEndian::write_u32(&mut data[3..7], self.sense.information);
            data[7] = 10;
            data[12] = self.sense.asc;
            data.truncate(usize::from(cdb.get(4).copied().unwrap_or(18)).min(expected));
            self.sense = Sense::default();
            Phase::DataIn {
                data,
                csw: csw(CommandStatus::Passed),
            }
        } else if (opcode == OpCode::Read10 as u8 || opcode == OpCode::Write10 as u8)
            && cdb.len() >= 10
        {
            let lba = BigEndian::read_u32(&cdb[2..6]);
            let blocks = BigEndian::read_u16(&cdb[7..9]);
            self.transfers.push(BlockTransfer {
                opcode,
                lba,
                blocks,
            });
            let range = self.block_range(lba, blocks);
            let length = usize::from(blocks) * self.block_size as usize;
            if opcode == OpCode::Read10 as u8 {
                match range {
                    Ok(start) => Phase::DataIn {
                        data: self.storage[start..start + length].to_vec(),
                        csw: csw(CommandStatus::Passed),
                    },
                    Err(status) => Phase::DataIn {
                        data: Vec::new(),
                        csw: CommandStatusWrapper {
                            data_residue: expected as u32,
                            ..csw(status)
                        },
                    },
                }
            } else {
                match range {
                    Ok(start) => Phase::DataOut {
                        offset: Some(start),
                        expected: length,
                        csw: csw(CommandStatus::Passed),
                    },
                    Err(status) => Phase::DataOut {
                        offset: None,
                        expected,
                        csw: csw(status),
                    },
                }
            }
        } else {
            debug!("ram drive: unsupported opcode 0x{opcode:02x}");
            let status = self.fail(0x05, 0x20, 0);
            if expected > 0 && cbw[12] & 0x80 != 0 {
                Phase::DataIn {
                    data: Vec::new(),
                    csw: csw(status),
                }
            } else {
                Phase::Status(csw(status))
            }
        };
        Ok(())
    }

    fn status_bytes(&mut self, mut csw: CommandStatusWrapper) -> Vec<u8> {
        if self.take_fault(Fault::FailStatus) {
            csw.status = CommandStatus::Failed;
        }
        if self.take_fault(Fault::WrongTag) {
            csw.tag = csw.tag.wrapping_add(1);
        }
        let mut bytes = csw.to_bytes().to_vec();
        if self.take_fault(Fault::CorruptSignature) {
            bytes[0..4].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
        }
        if self.take_fault(Fault::TruncateStatus) {
            bytes.truncate(CSW_SIZE - 1);
        }
        bytes
    }
}

impl BulkPipe for RamDrive {
    fn write_bulk(&mut self, data: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        if self.out_halted {
            return Err(TransportError::Stalled);
        }
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => {
                if self.take_fault(Fault::ShortCommandWrite) {
                    return Ok(data.len().saturating_sub(1));
                }
                if data.len() != CBW_SIZE || LittleEndian::read_u32(&data[0..4]) != CBW_SIGNATURE {
                    return Err(TransportError::Stalled);
                }
                self.accept_command(data)?;
                Ok(data.len())
            }
            Phase::DataOut {
                offset,
                expected,
                mut csw,
            } => {
                if self.take_fault(Fault::StallDataOut) {
                    self.out_halted = true;
                    self.fail(0x07, 0x27, 0);
                    csw.status = CommandStatus::Failed;
                    csw.data_residue = expected as u32;
                    self.phase = Phase::Status(csw);
                    return Err(TransportError::Stalled);
                }
                let accepted = data.len().min(expected);
                if let Some(start) = offset {
                    self.storage[start..start + accepted].copy_from_slice(&data[..accepted]);
                }
                csw.data_residue = (expected - accepted) as u32;
                self.phase = Phase::Status(csw);
                Ok(accepted)
            }
            other => {
                self.phase = other;
                Err(TransportError::Stalled)
            }
        }
    }

    fn read_bulk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::DataIn { data, mut csw } => {
                if self.take_fault(Fault::StallDataIn) {
                    self.phase = Phase::Status(csw);
                    return Err(TransportError::Stalled);
                }
                let sent = data.len().min(buf.len());
                buf[..sent].copy_from_slice(&data[..sent]);
                csw.data_residue = csw.data_residue.max((buf.len() - sent) as u32);
                self.phase = Phase::Status(csw);
                Ok(sent)
            }
            Phase::Status(csw) => {
                let bytes = self.status_bytes(csw);
                let sent = bytes.len().min(buf.len());
                buf[..sent].copy_from_slice(&bytes[..sent]);
                Ok(sent)
            }
            other => {
                self.phase = other;
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    fn clear_out_halt(&mut self) -> Result<(), TransportError> {
        self.out_halted = false;
        Ok(())
    }
}
