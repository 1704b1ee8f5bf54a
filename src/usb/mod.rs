//! Interactions with USB mass storage devices

pub mod cbw;
pub mod ram;
mod transport;

// Scratchpad:
// https://www.downtowndougbrown.com/2018/12/usb-mass-storage-with-embedded-devices-tips-and-quirks/

// When a flash drive is plugged in, the computer looks at its device,
// configuration, interface, and endpoint descriptors to determine what type of device it is.
// Flash drives use the mass storage class (0x08), SCSI transparent command set subclass (0x06),
// and the bulk-only transport protocol (0x50).

// There will be two bulk endpoints: one for sending data from the host computer to the flash
// drive (OUT) and one for receiving data from the flash drive to the computer (IN). The host
// sends a 31-byte command block wrapper (CBW), optionally sends or receives data depending on
// the command, and then reads a 13-byte command status wrapper (CSW).

use std::time::Duration;

use color_eyre::Result;
use color_eyre::eyre::{OptionExt, ensure};
use nusb::descriptors::TransferType;
use nusb::transfer::{Buffer, Bulk, ControlIn, ControlType, In, Out, Recipient, TransferError};
use nusb::{DeviceInfo, Endpoint, Interface, MaybeFuture, list_devices};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use transport::BulkOnlyTransport;

/// https://www.usb.org/defined-class-codes
pub const MASS_STORAGE_USB_CLASS: u8 = 0x08;

/// Time allowed for a CBW to be accepted by the device.
pub const SEND_TIMEOUT: Duration = Duration::from_millis(800);
/// Time allowed for a CSW to arrive.
pub const STATUS_TIMEOUT: Duration = Duration::from_millis(800);
/// Data phase of small replies (capacity, sense data).
pub const SHORT_DATA_TIMEOUT: Duration = Duration::from_millis(750);
/// Data phase of a READ(10).
pub const READ_DATA_TIMEOUT: Duration = Duration::from_millis(3000);
/// Data phase of a WRITE(10).
pub const WRITE_DATA_TIMEOUT: Duration = Duration::from_millis(5000);

/// How long to wait for a cancelled transfer to be handed back.
const CANCEL_GRACE: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("short write: sent {actual} of {expected} bytes")]
    ShortWrite { expected: usize, actual: usize },

    #[error("short read: received {actual} of {expected} bytes")]
    ShortRead { expected: usize, actual: usize },

    #[error("invalid magic number for command status wrapper, should be 0x53425355, is 0x{0:08X}")]
    BadSignature(u32),

    #[error("status wrapper tag {actual} does not match command tag {expected}")]
    TagMismatch { expected: u32, actual: u32 },

    #[error("command #{tag} failed with status {status:?}")]
    CommandFailed {
        tag: u32,
        status: cbw::CommandStatus,
    },

    #[error("the command status field is invalid, should be in 0..=2, was {0}")]
    InvalidStatus(u8),

    #[error("bulk transfer timed out after {0:?}")]
    Timeout(Duration),

    #[error("endpoint stalled")]
    Stalled,

    #[error("USB transfer error: {0}")]
    Transfer(TransferError),

    #[error("USB error: {0}")]
    Usb(#[from] nusb::Error),
}

impl From<TransferError> for TransportError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Stall => TransportError::Stalled,
            other => TransportError::Transfer(other),
        }
    }
}

/// The two unidirectional bulk channels of a claimed mass storage interface.
///
/// Both calls block for at most `timeout`.
pub trait BulkPipe: Send {
    /// Host to device. Returns the number of bytes the device accepted.
    fn write_bulk(&mut self, data: &[u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Device to host. Returns the number of bytes written into `buf`.
    fn read_bulk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Clear a halt condition on the IN endpoint after a stall.
    fn clear_in_halt(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Clear a halt condition on the OUT endpoint after a stall.
    fn clear_out_halt(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

impl<P: BulkPipe + ?Sized> BulkPipe for Box<P> {
    fn write_bulk(&mut self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).write_bulk(data, timeout)
    }

    fn read_bulk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).read_bulk(buf, timeout)
    }

    fn clear_in_halt(&mut self) -> Result<(), TransportError> {
        (**self).clear_in_halt()
    }

    fn clear_out_halt(&mut self) -> Result<(), TransportError> {
        (**self).clear_out_halt()
    }
}

/// Returns a list of every USB storage device currently connected to the host machine
pub async fn enumerate_usb_storage_devices() -> Result<impl Iterator<Item = DeviceInfo>> {
    let all_usb_devices = list_devices().await?;

    // Each USB device typically exposes one or more *interfaces* as a
    // way to interact with specific functionality of the device.
    let usb_storage_devices = all_usb_devices.filter(|dev| {
        debug!("scanning usb device: {:#?}", dev);
        dev.class() == MASS_STORAGE_USB_CLASS
            || dev
                .interfaces()
                .any(|interface| interface.class() == MASS_STORAGE_USB_CLASS)
    });
    Ok(usb_storage_devices)
}

/// A claimed mass storage interface and its bulk endpoints.
pub struct UsbPipe {
    bulk_out: Endpoint<Bulk, Out>,
    bulk_in: Endpoint<Bulk, In>,
    _interface: Interface,
}

/// As described by  the USB Mass Storage Class - Bulk Only Transport spec,
/// section 3.2.
///
/// LUN stands for Logical Unit Number, and it's a number
/// used as a unique identifier for a storage device or logical volume.
///
/// <https://en.wikipedia.org/wiki/Logical_unit_number>
fn max_lun_request(interface_number: u8) -> ControlIn {
    ControlIn {
        control_type: ControlType::Class,
        recipient: Recipient::Interface,
        request: 0xfe,
        value: 0,
        index: u16::from(interface_number),
        length: 1,
    }
}

/// Opens the provided USB mass storage device.
///
/// This initialization sequence follows the order
/// described here: <https://www.downtowndougbrown.com/2018/12/usb-mass-storage-with-embedded-devices-tips-and-quirks/>,
///
/// where the author obtained it with a USB hardware signal analyzer and reverse engineering the implementations on macos, windows, and linux
#[tracing::instrument(skip_all, fields(vendor = device_info.vendor_id(), product = device_info.product_id()))]
pub async fn open_usb_device(device_info: DeviceInfo) -> Result<UsbPipe> {
    let interface_number = device_info
        .interfaces()
        .find(|interface| interface.class() == MASS_STORAGE_USB_CLASS)
        .map(|interface| interface.interface_number())
        .unwrap_or(0);

    // 1. Claim the USB device to read and write to it
    debug!(interface_number, "opening device");
    let device = device_info.open().await?;
    let interface = device.detach_and_claim_interface(interface_number).await?;

    // 2. Request the maximum LUN. Single-unit devices are allowed to stall the request.
    let max_lun = match interface
        .control_in(max_lun_request(interface_number), Duration::from_millis(500))
        .await
    {
        Ok(reply) => reply.first().copied().unwrap_or(0),
        Err(TransferError::Stall) => 0,
        Err(e) => return Err(e.into()),
    };
    if max_lun > 0 {
        warn!(max_lun, "multiple logical units reported, only unit 0 is used");
    }

    // 3. Work out which bulk endpoint goes which way from the direction bit of its address
    // rather than trusting the descriptor order.
    let configuration = device.active_configuration()?;
    let alt_setting = configuration
        .interface_alt_settings()
        .find(|alt| alt.interface_number() == interface_number && alt.alternate_setting() == 0)
        .ok_or_eyre("mass storage interface has no descriptor")?;
    let mut in_address = None;
    let mut out_address = None;
    for endpoint in alt_setting.endpoints() {
        if endpoint.transfer_type() != TransferType::Bulk {
            continue;
        }
        let address = endpoint.address();
        if address & 0x80 != 0 {
            in_address.get_or_insert(address);
        } else {
            out_address.get_or_insert(address);
        }
    }
    let (Some(in_address), Some(out_address)) = (in_address, out_address) else {
        color_eyre::eyre::bail!("mass storage interface lacks a bulk IN/OUT endpoint pair");
    };
    ensure!(
        in_address != out_address,
        "bulk endpoints must be distinct"
    );
    info!(
        "bulk endpoints: IN 0x{:02x}, OUT 0x{:02x}",
        in_address, out_address
    );

    let bulk_in = interface.endpoint::<Bulk, In>(in_address)?;
    let bulk_out = interface.endpoint::<Bulk, Out>(out_address)?;

    Ok(UsbPipe {
        bulk_out,
        bulk_in,
        _interface: interface,
    })
}

impl BulkPipe for UsbPipe {
    fn write_bulk(&mut self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        self.bulk_out.submit(Buffer::from(data.to_vec()));
        let Some(completion) = self.bulk_out.wait_next_complete(timeout) else {
            self.bulk_out.cancel_all();
            let _ = self.bulk_out.wait_next_complete(CANCEL_GRACE);
            return Err(TransportError::Timeout(timeout));
        };
        completion.status?;
        Ok(completion.actual_len)
    }

    fn read_bulk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        // IN requests have to be a whole number of packets, the device ends the
        // transfer early with a short packet.
        let packet = self.bulk_in.max_packet_size().max(1);
        let requested = buf.len().div_ceil(packet) * packet;
        let mut buffer = Buffer::new(requested);
        buffer.set_requested_len(requested);
        self.bulk_in.submit(buffer);
        let Some(completion) = self.bulk_in.wait_next_complete(timeout) else {
            self.bulk_in.cancel_all();
            let _ = self.bulk_in.wait_next_complete(CANCEL_GRACE);
            return Err(TransportError::Timeout(timeout));
        };
        completion.status?;
        let received = completion
            .actual_len
            .min(buf.len())
            .min(completion.buffer.len());
        buf[..received].copy_from_slice(&completion.buffer[..received]);
        Ok(received)
    }

    fn clear_in_halt(&mut self) -> Result<(), TransportError> {
        self.bulk_in.clear_halt().wait()?;
        Ok(())
    }

    fn clear_out_halt(&mut self) -> Result<(), TransportError> {
        self.bulk_out.clear_halt().wait()?;
        Ok(())
    }
}
