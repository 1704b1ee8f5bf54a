//! Back up a USB stick's FAT volume by talking Bulk-Only Transport to it directly.

pub mod backup;
pub mod config;
pub mod disk;
pub mod fs;
pub mod hexdump;
pub mod scsi;
pub mod session;
pub mod usb;
pub mod walk;
