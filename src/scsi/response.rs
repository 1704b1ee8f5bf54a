//! Representations for responses to SCSI commands.

use byteorder::{BigEndian, ByteOrder};

use crate::usb::TransportError;

/// Response to READ CAPACITY(10), SBC-2 table 28.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReadCapacity {
    /// `RETURNED LOGICAL BLOCK ADDRESS`: the address of the last block on the unit.
    pub last_lba: u32,
    /// `BLOCK LENGTH IN BYTES`
    pub block_length: u32,
}

impl ReadCapacity {
    pub fn parse(buf: &[u8]) -> Result<Self, TransportError> {
        if buf.len() < 8 {
            return Err(TransportError::ShortRead {
                expected: 8,
                actual: buf.len(),
            });
        }
        Ok(Self {
            last_lba: BigEndian::read_u32(&buf[0..4]),
            block_length: BigEndian::read_u32(&buf[4..8]),
        })
    }

    /// Number of addressable blocks, one more than the last address.
    pub fn block_count(&self) -> u64 {
        u64::from(self.last_lba) + 1
    }
}

/// Fixed format sense data, SPC-2 7.20.2 table 102.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SenseData {
    /// `RESPONSE CODE` with the `VALID` bit stripped, 0x70 or 0x71.
    pub response_code: u8,
    /// Set when `information` holds a meaningful value.
    pub valid: bool,
    pub sense_key: u8,
    pub information: u32,
    /// `ADDITIONAL SENSE CODE`
    pub asc: u8,
    /// `ADDITIONAL SENSE CODE QUALIFIER`
    pub ascq: u8,
}

impl SenseData {
    pub fn parse(buf: &[u8]) -> Result<Self, TransportError> {
        if buf.len() < 14 {
            return Err(TransportError::ShortRead {
                expected: 14,
                actual: buf.len(),
            });
        }
        Ok(Self {
            response_code: buf[0] & 0x7f,
            valid: buf[0] & 0x80 != 0,
            sense_key: buf[2] & 0x0f,
            information: BigEndian::read_u32(&buf[3..7]),
            asc: buf[12],
            ascq: buf[13],
        })
    }

    pub fn sense_key_name(&self) -> &'static str {
        match self.sense_key {
            0x0 => "NO SENSE",
            0x1 => "RECOVERED ERROR",
            0x2 => "NOT READY",
            0x3 => "MEDIUM ERROR",
            0x4 => "HARDWARE ERROR",
            0x5 => "ILLEGAL REQUEST",
            0x6 => "UNIT ATTENTION",
            0x7 => "DATA PROTECT",
            0x8 => "BLANK CHECK",
            0xb => "ABORTED COMMAND",
            0xd => "VOLUME OVERFLOW",
            0xe => "MISCOMPARE",
            _ => "RESERVED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_counts_last_block() {
        let cap = ReadCapacity::parse(&[0, 0, 0x0f, 0xff, 0, 0, 2, 0]).unwrap();
        assert_eq!(cap.last_lba, 4095);
        assert_eq!(cap.block_length, 512);
        assert_eq!(cap.block_count(), 4096);
    }

    #[test]
    fn sense_data_fields() {
        let mut buf = [0u8; 18];
        buf[0] = 0xf0;
        buf[2] = 0x05;
        buf[3..7].copy_from_slice(&0x1234_u32.to_be_bytes());
        buf[12] = 0x21;
        buf[13] = 0x00;
        let sense = SenseData::parse(&buf).unwrap();
        assert!(sense.valid);
        assert_eq!(sense.response_code, 0x70);
        assert_eq!(sense.sense_key_name(), "ILLEGAL REQUEST");
        assert_eq!(sense.information, 0x1234);
        assert_eq!(sense.asc, 0x21);
    }
}
