//! One Bulk-Only Transport command/response cycle: CBW out, optional data phase, CSW in.

use std::time::Duration;

use tracing::{trace, warn};

use super::cbw::{
    CSW_SIZE, CommandBlockWrapper, CommandStatus, CommandStatusWrapper, TagGenerator,
};
use super::{BulkPipe, SEND_TIMEOUT, STATUS_TIMEOUT, TransportError};
use crate::hexdump::hexdump;
use crate::scsi::command::CommandBlock;

/// Frames SCSI commands for a bulk-only mass storage device.
///
/// BOT does not pipeline: there is one outstanding command at a time, which
/// `&mut self` on every exchange enforces, and the tag counter lives here with it.
pub struct BulkOnlyTransport<P> {
    pipe: P,
    tags: TagGenerator,
    lun: u8,
}

impl<P: BulkPipe> BulkOnlyTransport<P> {
    pub fn new(pipe: P) -> Self {
        Self {
            pipe,
            tags: TagGenerator::new(),
            lun: 0,
        }
    }

    pub fn with_tags(pipe: P, tags: TagGenerator) -> Self {
        Self { pipe, tags, lun: 0 }
    }

    pub fn pipe(&self) -> &P {
        &self.pipe
    }

    pub fn pipe_mut(&mut self) -> &mut P {
        &mut self.pipe
    }

    /// Send a CBW carrying `command` with a fresh tag. Returns that tag.
    pub fn send(
        &mut self,
        expected_length: u32,
        command: &CommandBlock,
    ) -> Result<u32, TransportError> {
        let tag = self.tags.tag();
        let cbw = CommandBlockWrapper::new(command, expected_length, self.lun, tag);
        let bytes = cbw.as_slice();
        let sent = self.pipe.write_bulk(bytes, SEND_TIMEOUT)?;
        if sent != bytes.len() {
            warn!("failed to send CBW#{tag}, device took {sent} bytes");
            return Err(TransportError::ShortWrite {
                expected: bytes.len(),
                actual: sent,
            });
        }
        trace!("CBW#{tag}:\n{}", hexdump(bytes));
        Ok(tag)
    }

    /// Read the CSW answering the command sent with `tag`. Returns the data residue.
    pub fn receive_status(&mut self, tag: u32) -> Result<u32, TransportError> {
        let mut buf = [0u8; CSW_SIZE];
        let received = match self.pipe.read_bulk(&mut buf, STATUS_TIMEOUT) {
            // BOT 6.7.2: a stalled status phase is cleared and the CSW read once more.
            Err(TransportError::Stalled) => {
                self.pipe.clear_in_halt()?;
                self.pipe.read_bulk(&mut buf, STATUS_TIMEOUT)?
            }
            other => other?,
        };
        trace!("CSW#{tag}:\n{}", hexdump(&buf[..received]));
        let csw = CommandStatusWrapper::from_slice(&buf[..received])?;
        if csw.tag != tag {
            return Err(TransportError::TagMismatch {
                expected: tag,
                actual: csw.tag,
            });
        }
        if csw.status != CommandStatus::Passed {
            return Err(TransportError::CommandFailed {
                tag,
                status: csw.status,
            });
        }
        Ok(csw.data_residue)
    }

    /// Run a command with a device-to-host data phase into `buf`.
    ///
    /// Returns the number of bytes the device actually sent, which may be less than
    /// `buf.len()`; callers that need whole buffers check it.
    pub fn execute_in(
        &mut self,
        command: &CommandBlock,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let tag = self.send(buf.len() as u32, command)?;
        let received = match self.pipe.read_bulk(buf, timeout) {
            Ok(received) => received,
            Err(TransportError::Stalled) => {
                self.pipe.clear_in_halt()?;
                self.receive_status(tag)?;
                return Err(TransportError::Stalled);
            }
            Err(e) => return Err(e),
        };
        let residue = self.receive_status(tag)?;
        if residue != 0 {
            trace!("CSW#{tag} reports a residue of {residue} bytes");
        }
        Ok(received)
    }

    /// Run a command with a host-to-device data phase carrying `data`.
    pub fn execute_out(
        &mut self,
        command: &CommandBlock,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let tag = self.send(data.len() as u32, command)?;
        let sent = match self.pipe.write_bulk(data, timeout) {
            Ok(sent) => sent,
            Err(TransportError::Stalled) => {
                warn!("CBW#{tag}: device stalled the data-out phase");
                self.pipe.clear_out_halt()?;
                self.receive_status(tag)?;
                return Err(TransportError::Stalled);
            }
            Err(e) => return Err(e),
        };
        // The status phase still has to be consumed to keep the device in step.
        self.receive_status(tag)?;
        if sent != data.len() {
            return Err(TransportError::ShortWrite {
                expected: data.len(),
                actual: sent,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::command;
    use crate::usb::cbw::{CBW_SIGNATURE, CBW_SIZE};
    use crate::usb::ram::{Fault, RamDrive};
    use byteorder::{ByteOrder, LittleEndian};

    fn transport() -> BulkOnlyTransport<RamDrive> {
        BulkOnlyTransport::new(RamDrive::new(512, vec![0u8; 512 * 64]))
    }

    #[test]
    fn tags_increase_per_command() {
        let mut t = transport();
        let mut previous = None;
        for _ in 0..5 {
            let mut buf = [0u8; 8];
            t.execute_in(&command::read_capacity(), &mut buf, Duration::from_millis(10))
                .unwrap();
            let tag = t.pipe().last_cbw_tag().unwrap();
            if let Some(previous) = previous {
                assert_eq!(tag, previous + 1);
            }
            previous = Some(tag);
        }
    }

    #[test]
    fn tags_wrap_across_commands() {
        let drive = RamDrive::new(512, vec![0u8; 512 * 4]);
        let mut t = BulkOnlyTransport::with_tags(drive, TagGenerator::starting_at(u32::MAX));
        let mut buf = [0u8; 8];
        t.execute_in(&command::read_capacity(), &mut buf, Duration::ZERO)
            .unwrap();
        assert_eq!(t.pipe().last_cbw_tag(), Some(u32::MAX));
        t.execute_in(&command::read_capacity(), &mut buf, Duration::ZERO)
            .unwrap();
        assert_eq!(t.pipe().last_cbw_tag(), Some(0));
    }

    #[test]
    fn sent_cbw_is_well_formed() {
        let mut t = transport();
        let mut buf = [0u8; 512];
        t.execute_in(&command::read10(3, 1), &mut buf, Duration::ZERO)
            .unwrap();
        let raw = t.pipe().last_cbw().unwrap();
        assert_eq!(raw.len(), CBW_SIZE);
        assert_eq!(LittleEndian::read_u32(&raw[0..4]), CBW_SIGNATURE);
        assert_eq!(LittleEndian::read_u32(&raw[8..12]), 512);
        assert_eq!(raw[12], 0x80);
    }

    #[test]
    fn failed_status_is_a_transport_failure() {
        let mut t = transport();
        t.pipe_mut().inject(Fault::FailStatus);
        let mut buf = [0u8; 8];
        let r = t.execute_in(&command::read_capacity(), &mut buf, Duration::ZERO);
        assert!(matches!(
            r,
            Err(TransportError::CommandFailed {
                status: CommandStatus::Failed,
                ..
            })
        ));
    }

    #[test]
    fn bad_signature_is_a_transport_failure() {
        let mut t = transport();
        t.pipe_mut().inject(Fault::CorruptSignature);
        let mut buf = [0u8; 8];
        let r = t.execute_in(&command::read_capacity(), &mut buf, Duration::ZERO);
        assert!(matches!(r, Err(TransportError::BadSignature(_))));
    }

    #[test]
    fn mismatched_tag_is_rejected() {
        let mut t = transport();
        t.pipe_mut().inject(Fault::WrongTag);
        let mut buf = [0u8; 8];
        let r = t.execute_in(&command::read_capacity(), &mut buf, Duration::ZERO);
        match r {
            Err(TransportError::TagMismatch { expected, actual }) => {
                assert_eq!(actual, expected.wrapping_add(1))
            }
            other => panic!("expected a tag mismatch, got {other:?}"),
        }
    }

    #[test]
    fn short_status_is_rejected() {
        let mut t = transport();
        t.pipe_mut().inject(Fault::TruncateStatus);
        let mut buf = [0u8; 8];
        let r = t.execute_in(&command::read_capacity(), &mut buf, Duration::ZERO);
        assert!(matches!(r, Err(TransportError::ShortRead { .. })));
    }

    #[test]
    fn short_cbw_write_is_rejected() {
        let mut t = transport();
        t.pipe_mut().inject(Fault::ShortCommandWrite);
        let mut buf = [0u8; 8];
        let r = t.execute_in(&command::read_capacity(), &mut buf, Duration::ZERO);
        assert!(matches!(
            r,
            Err(TransportError::ShortWrite {
                expected: 31,
                actual: 30
            })
        ));
    }

    #[test]
    fn stalled_data_phase_recovers_status() {
        let mut t = transport();
        t.pipe_mut().inject(Fault::StallDataIn);
        let mut buf = [0u8; 8];
        let r = t.execute_in(&command::read_capacity(), &mut buf, Duration::ZERO);
        assert!(matches!(r, Err(TransportError::Stalled)));
        // the exchange was completed, the next command goes through
        t.execute_in(&command::read_capacity(), &mut buf, Duration::ZERO)
            .unwrap();
        assert_eq!(&buf[4..8], &[0, 0, 2, 0]);
    }

    #[test]
    fn stalled_data_out_phase_recovers_status() {
        let mut t = transport();
        t.pipe_mut().inject(Fault::StallDataOut);
        let r = t.execute_out(&command::write10(2, 1), &[0xaa; 512], Duration::ZERO);
        assert!(matches!(
            r,
            Err(TransportError::CommandFailed {
                status: CommandStatus::Failed,
                ..
            })
        ));
        assert!(!t.pipe().out_halted());

        // nothing reached the medium and the device answers the next command
        let mut buf = [0u8; 8];
        t.execute_in(&command::read_capacity(), &mut buf, Duration::ZERO)
            .unwrap();
        assert_eq!(&buf[4..8], &[0, 0, 2, 0]);
        let mut sector = [0u8; 512];
        t.execute_in(&command::read10(2, 1), &mut sector, Duration::ZERO)
            .unwrap();
        assert_eq!(sector, [0u8; 512]);
    }
}
