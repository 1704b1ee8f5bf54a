//! Fixed-length CDB layouts, SPC-2 4.3.2.

/// `OPERATION CODE` values of the commands this crate issues (SPC-2 7.1).
#[repr(u8)]
#[non_exhaustive]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpCode {
    /// SPC-2 7.20
    RequestSense = 0x03,
    /// SBC-2 5.1.10, table 27
    ReadCapacity = 0x25,
    /// SBC-2 5.1.6
    Read10 = 0x28,
    /// SBC-2 5.1.20
    Write10 = 0x2a,
}

/// Six byte CDB, SPC-2 table 1.
#[repr(C, packed)]
pub struct X6CommandDescriptor {
    pub operation_code: OpCode,
    /// 21 significant bits, the top 3 are reserved. Zero for REQUEST SENSE.
    pub logical_block_address: [u8; 3],
    /// `TRANSFER LENGTH`, `PARAMETER LIST LENGTH` or `ALLOCATION LENGTH`, whichever the
    /// opcode calls for.
    pub misc_len: u8,
    /// `CONTROL` (SAM-2). Always zero here.
    pub control: u8,
}

impl CommandDescriptor for X6CommandDescriptor {}

/// Ten byte CDB, SPC-2 table 2.
#[repr(C, packed)]
pub struct X10CommandDescriptor {
    pub operation_code: OpCode,
    /// `SERVICE ACTION` in the low 5 bits, flags for READ(10)/WRITE(10).
    pub service_action: u8,
    /// Big endian. The use of this field varies from command to command.
    pub logical_block_address: [u8; 4],
    /// Reserved for most commands, `GROUP NUMBER` for READ(10)/WRITE(10).
    pub group_number: u8,
    /// Big endian, see [`X6CommandDescriptor::misc_len`].
    pub misc_len: [u8; 2],
    /// See [`X6CommandDescriptor::control`]
    pub control: u8,
}

impl X10CommandDescriptor {
    /// A descriptor with every parameter zeroed, to be filled in per call.
    pub const fn blank(operation_code: OpCode) -> Self {
        Self {
            operation_code,
            service_action: 0,
            logical_block_address: [0; 4],
            group_number: 0,
            misc_len: [0; 2],
            control: 0,
        }
    }

    /// Rewrite the `LOGICAL BLOCK ADDRESS` and `TRANSFER LENGTH` fields, leaving the opcode and
    /// every other static field untouched.
    pub fn set_block_range(&mut self, lba: u32, blocks: u16) {
        self.logical_block_address = lba.to_be_bytes();
        self.misc_len = blocks.to_be_bytes();
    }
}

impl CommandDescriptor for X10CommandDescriptor {}

pub trait CommandDescriptor: Sized {
    fn as_slice(&'_ self) -> &[u8] {
        // SAFETY: A struct is the size of itself. Implementors are `repr(C, packed)`
        // and built from bytes only.
        let slice: &'_ [u8] = unsafe {
            let ptr = self as *const Self as *const u8;
            std::slice::from_raw_parts(ptr, std::mem::size_of::<Self>())
        };
        slice
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_sizes() {
        assert_eq!(std::mem::size_of::<X6CommandDescriptor>(), 6);
        assert_eq!(std::mem::size_of::<X10CommandDescriptor>(), 10);
    }

    #[test]
    fn block_range_is_big_endian() {
        let mut cdb = X10CommandDescriptor::blank(OpCode::Write10);
        cdb.set_block_range(0x00ab_cdef, 0x0120);
        assert_eq!(
            cdb.as_slice(),
            &[0x2a, 0, 0x00, 0xab, 0xcd, 0xef, 0, 0x01, 0x20, 0]
        );
    }
}
