//! USBTMC bulk-endpoint transport, built on `nusb`.
//!
//! Only the bulk message layer is implemented: device dependent messages out,
//! requests for device dependent messages in, and their reassembly. That is
//! all the probe needs for its command/response exchanges.

use crate::transport::{Transport, TransportError};
use bitflags::bitflags;
use futures_lite::future::block_on;
use nusb::{
    transfer::{ControlIn, ControlType, Direction, EndpointType, Recipient, RequestBuffer},
    Interface,
};

/// Metrolab Technology SA
pub const METROLAB_VID: u16 = 0x1BFA;
/// THM1176 three-axis Hall magnetometer
pub const THM1176_PID: u16 = 0x0498;

/// Largest reply we ask for in one transfer: 4096 samples on each of the three
/// axes at 4 bytes per sample, plus room for timestamp, temperature and status
pub const MAX_TRANSFER_SIZE: u32 = 49216;

/// The opened USB TMC device
pub struct Device {
    interface: nusb::Interface,
    interface_capabilities: InterfaceCapabilities,
    device_capabilities: DeviceCapabilities,
    vendor: Option<String>,
    product: Option<String>,
    serial: Option<String>,
    tag: u8,
    max_packet_size: usize,
    /// Bulk-out addr
    bulk_out_endpoint: u8,
    /// Bulk-in addr
    bulk_in_endpoint: u8,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Tried to write no data")]
    EmptyWrite,
    #[error("Requested vid/pid device was not found or did not support USBTMC")]
    DeviceNotFound,
    #[error("Tried to write data to a `talk-only` device")]
    TalkOnly,
    #[error("Tried to ask for data from a `listen-only` device")]
    ListenOnly,
    #[error("Lower-level USB driver error")]
    Driver(#[from] nusb::Error),
    #[error("Error encountered during USB transfer")]
    Transfer(#[from] nusb::transfer::TransferError),
    #[error("USBTMC control request returned a non-success status: {0:#?}")]
    Control(ControlStatus),
    #[error("USB device is unconfigured")]
    Unconfigured(#[from] nusb::descriptors::ActiveConfigurationError),
    #[error("Returned data was invalid")]
    BadData,
}

pub type Result<T> = std::result::Result<T, Error>;

// ---------- Interface Descriptor

const INTERFACE_CLASS: u8 = 0xFE; // "Application-Class"
const INTERFACE_SUBCLASS: u8 = 0x03; // "USBTMC"
const INTERFACE_PROTO_TMC: u8 = 0x00; // Vanilla USBTMC
const INTERFACE_PROTO_488: u8 = 0x01; // USB488 subclass

impl Device {
    pub async fn open(vid: u16, pid: u16) -> Result<Self> {
        // Find the interface which matches the expected interface descriptor
        let di = nusb::list_devices()?
            .find(|dev| dev.vendor_id() == vid && dev.product_id() == pid)
            .ok_or(Error::DeviceNotFound)?;
        let device = di.open()?;

        let configuration = device.active_configuration()?;

        let mut tmc_idx = None;
        let mut bulk_out = None;
        let mut bulk_in = None;
        for i in configuration.interfaces() {
            for alt in i.alt_settings() {
                if alt.class() != INTERFACE_CLASS || alt.subclass() != INTERFACE_SUBCLASS {
                    continue;
                }
                if !matches!(alt.protocol(), INTERFACE_PROTO_TMC | INTERFACE_PROTO_488) {
                    return Err(Error::DeviceNotFound);
                }
                tmc_idx = Some(i.interface_number());
                for endpoint in alt.endpoints() {
                    match (endpoint.direction(), endpoint.transfer_type()) {
                        (Direction::In, EndpointType::Bulk) => {
                            bulk_in = Some((endpoint.address(), endpoint.max_packet_size()));
                        }
                        (Direction::Out, EndpointType::Bulk) => {
                            bulk_out = Some(endpoint.address());
                        }
                        _ => (),
                    }
                }
            }
        }

        // USBTMC requires exactly two bulk endpoints for the interface and an optional interrupt
        let bulk_out_endpoint = bulk_out.ok_or(Error::DeviceNotFound)?;
        let (bulk_in_endpoint, max_packet_size) = bulk_in.ok_or(Error::DeviceNotFound)?;

        let interface = device.detach_and_claim_interface(tmc_idx.ok_or(Error::DeviceNotFound)?)?;

        let (interface_capabilities, device_capabilities) = get_capabilities(&interface).await?;
        tracing::debug!(?interface_capabilities, ?device_capabilities, "USBTMC capabilities");

        Ok(Self {
            interface,
            interface_capabilities,
            device_capabilities,
            product: di.product_string().map(str::to_string),
            vendor: di.manufacturer_string().map(str::to_string),
            serial: di.serial_number().map(str::to_string),
            tag: 1,
            max_packet_size,
            bulk_out_endpoint,
            bulk_in_endpoint,
        })
    }

    /// Open the first THM1176 on the bus
    pub async fn open_thm1176() -> Result<Self> {
        Self::open(METROLAB_VID, THM1176_PID).await
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "USBTMC Device: {} PN:{} SN:{}",
            self.vendor.as_deref().unwrap_or_default(),
            self.product.as_deref().unwrap_or_default(),
            self.serial.as_deref().unwrap_or_default()
        )
    }
}

// ---------- Control Endpoints

/// Values to assign to bRequest
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ControlRequest {
    /// Returns attributes and capabilities of the interface
    GetCapabilities = 7,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ControlStatus {
    _Reserved,
    /// Success
    Success,
    // ---- Generic Warnings
    /// This status is valid if a device has received a USBTMC split transaction CHECK_STATUS request and the request is still being processed
    Pending,
    // ---- 0x03-0x1F USBTMC Warnings
    UsbTmcWarning(u8),
    // ---- 0x20-0x3F Subclass Warnings
    SubclassWarning(u8),
    // ---- 0x40-0x7F VISA Warnings
    VisaWarning(u8),
    // ---- Generic Failures
    /// Failure, unspecified reason, and a more specific USBTMC_status is not defined
    Failed,
    TransferNotInProgress,
    SplitNotInProgress,
    SplitInProgress,
    // --- 0x84-0x9F USBTMC Failures
    UsbTmcFailure(u8),
    // --- 0xA0-0xBF Subclass Failures
    SubclassFailure(u8),
    // --- 0xC0-0xFF VISA Failures
    VisaFailure(u8),
}

impl From<ControlStatus> for u8 {
    fn from(value: ControlStatus) -> Self {
        match value {
            ControlStatus::_Reserved => 0x00,
            ControlStatus::Success => 0x01,
            ControlStatus::Pending => 0x02,
            ControlStatus::UsbTmcWarning(v) => v,
            ControlStatus::SubclassWarning(v) => v,
            ControlStatus::VisaWarning(v) => v,
            ControlStatus::Failed => 0x80,
            ControlStatus::TransferNotInProgress => 0x81,
            ControlStatus::SplitNotInProgress => 0x82,
            ControlStatus::SplitInProgress => 0x83,
            ControlStatus::UsbTmcFailure(v) => v,
            ControlStatus::SubclassFailure(v) => v,
            ControlStatus::VisaFailure(v) => v,
        }
    }
}

// Not TryFrom because every value has a distinct pair
impl From<u8> for ControlStatus {
    fn from(value: u8) -> Self {
        match value {
            0x00 => ControlStatus::_Reserved,
            0x01 => ControlStatus::Success,
            0x02 => ControlStatus::Pending,
            0x03..0x20 => ControlStatus::UsbTmcWarning(value),
            0x20..0x40 => ControlStatus::SubclassWarning(value),
            0x40..0x80 => ControlStatus::VisaWarning(value),
            0x80 => ControlStatus::Failed,
            0x81 => ControlStatus::TransferNotInProgress,
            0x82 => ControlStatus::SplitNotInProgress,
            0x83 => ControlStatus::SplitInProgress,
            0x84..0xA0 => ControlStatus::UsbTmcFailure(value),
            0xA0..0xC0 => ControlStatus::SubclassFailure(value),
            0xC0..=0xFF => ControlStatus::VisaFailure(value),
        }
    }
}

impl ControlStatus {
    /// Check if the interpretation of the status should be a failure
    pub fn is_failure(self) -> bool {
        u8::from(self) >= 0x80u8
    }

    /// Check if the interpretation of the status should be a warning
    pub fn is_warning(self) -> bool {
        (0x02..0x80).contains(&u8::from(self))
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterfaceCapabilities: u8 {
        /// The interface supports an IndicatorPulse request
        const IndicatorPulse = 0b00000100;
        /// The interface is talk-only
        const TalkOnly = 0b00000010;
        /// The interface is listen-only
        const ListenOnly = 0b00000001;
        // The source may set any bits
        const _ = !0;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceCapabilities: u8 {
        /// The device supports ending a bulk-in transfer when a byte matches a specified termination
        const TermCharTransferEnd = 0b00000001;
        // The source may set any bits
        const _ = !0;
    }
}

/// Initiate a device->host control request with `N` data bytes (the status byte is always prepended)
async fn control_in_request<const N: usize>(
    interface: &Interface,
    req: ControlRequest,
    recipient: Recipient,
    value: u16,
    index: u16,
) -> Result<[u8; N]> {
    let resp = interface
        .control_in(ControlIn {
            control_type: ControlType::Class,
            recipient,
            request: req as u8,
            value,
            index,
            length: (N + 1) as u16,
        })
        .await
        .into_result()?;
    let status = ControlStatus::from(*resp.first().ok_or(Error::BadData)?);
    if status.is_warning() {
        tracing::warn!(?req, ?status, "USBTMC control request warning");
    }
    if status != ControlStatus::Success && !status.is_warning() {
        return Err(Error::Control(status));
    }
    resp[1..].try_into().map_err(|_| Error::BadData)
}

async fn get_capabilities(
    interface: &Interface,
) -> Result<(InterfaceCapabilities, DeviceCapabilities)> {
    let resp: [u8; 0x17] = control_in_request(
        interface,
        ControlRequest::GetCapabilities,
        Recipient::Interface,
        0x00,
        0x00,
    )
    .await?;
    Ok((
        InterfaceCapabilities::from_bits_retain(resp[3]),
        DeviceCapabilities::from_bits_retain(resp[4]),
    ))
}

// ----- Bulk Endpoints

/// Size of the bulk transfer headers in bytes
const HEADER_SIZE: usize = 12;

const MSG_DEV_DEP_OUT: u8 = 0x01;
const MSG_DEV_DEP_IN: u8 = 0x02;

/// Host to device bulk-out headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BulkOut {
    /// Device-dependent command message
    DevDepMsgOut { transfer_size: u32, eom: bool },
    /// Request the device to send a message to the bulk-in endpoint
    RequestDevDepMsgIn {
        transfer_size: u32,
        term_char: Option<u8>,
    },
}

impl BulkOut {
    fn pack(self, tag: u8) -> [u8; HEADER_SIZE] {
        let mut header = [0u8; HEADER_SIZE];
        let (msg_id, transfer_size) = match self {
            BulkOut::DevDepMsgOut { transfer_size, eom } => {
                header[8] = eom as u8;
                (MSG_DEV_DEP_OUT, transfer_size)
            }
            BulkOut::RequestDevDepMsgIn {
                transfer_size,
                term_char,
            } => {
                if let Some(term_char) = term_char {
                    header[8] = 1 << 1;
                    header[9] = term_char;
                }
                (MSG_DEV_DEP_IN, transfer_size)
            }
        };
        header[0] = msg_id;
        header[1] = tag;
        header[2] = !tag;
        header[4..8].copy_from_slice(&transfer_size.to_le_bytes());
        header
    }
}

/// Header of a device to host device-dependent message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DevDepMsgIn {
    tag: u8,
    transfer_size: u32,
    /// The transfer ended on the requested termination character
    term_char: bool,
    eom: bool,
}

impl DevDepMsgIn {
    fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE || bytes[0] != MSG_DEV_DEP_IN {
            return Err(Error::BadData);
        }
        let tag = bytes[1];
        if !bytes[2] != tag || bytes[3] != 0 {
            return Err(Error::BadData);
        }
        Ok(Self {
            tag,
            transfer_size: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            term_char: bytes[8] & (1 << 1) != 0,
            eom: bytes[8] & 1 != 0,
        })
    }
}

impl Device {
    /// Current bTag, then advance it. bTag cycles through 1..=255.
    fn next_tag(&mut self) -> u8 {
        let tag = self.tag;
        self.tag = if self.tag == 255 { 1 } else { self.tag + 1 };
        tag
    }

    async fn bulk_out(&mut self, data: Vec<u8>) -> Result<()> {
        self.interface
            .bulk_out(self.bulk_out_endpoint, data)
            .await
            .into_result()?;
        Ok(())
    }

    async fn bulk_in(&mut self) -> Result<Vec<u8>> {
        Ok(self
            .interface
            .bulk_in(
                self.bulk_in_endpoint,
                RequestBuffer::new(self.max_packet_size),
            )
            .await
            .into_result()?)
    }

    /// Write one complete message to the device
    pub async fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        // Not supported on "talk-only" devices
        if self
            .interface_capabilities
            .contains(InterfaceCapabilities::TalkOnly)
        {
            return Err(Error::TalkOnly);
        }

        // There must be data
        if data.is_empty() {
            return Err(Error::EmptyWrite);
        }

        // Each bulk-out transfer must be 32-bit aligned, the padding is not part of transfer_size
        let padding = (4 - data.len() % 4) % 4;
        let transfer_size = u32::try_from(data.len()).map_err(|_| Error::BadData)?;

        // We will always enqueue all the bytes into one transfer, so EOM is always true
        let tag = self.next_tag();
        let mut payload = BulkOut::DevDepMsgOut {
            transfer_size,
            eom: true,
        }
        .pack(tag)
        .to_vec();
        payload.extend_from_slice(data);
        payload.resize(payload.len() + padding, 0);

        // Send out in chunks
        let mut boq = self.interface.bulk_out_queue(self.bulk_out_endpoint);
        for chunk in payload.chunks(self.max_packet_size) {
            boq.submit(chunk.to_vec());
        }

        // Wait for all of those to flush
        while boq.pending() != 0 {
            boq.next_complete().await.into_result()?;
        }

        Ok(())
    }

    /// Read one complete message from the device, possibly spanning several
    /// transfers, stopping early on `term_char` if given
    pub async fn read_bytes(&mut self, term_char: Option<u8>) -> Result<Vec<u8>> {
        // Not supported on "listen-only" devices
        if self
            .interface_capabilities
            .contains(InterfaceCapabilities::ListenOnly)
        {
            return Err(Error::ListenOnly);
        }

        let mut buf = vec![];

        loop {
            let tag = self.next_tag();
            let request = BulkOut::RequestDevDepMsgIn {
                transfer_size: MAX_TRANSFER_SIZE,
                term_char,
            }
            .pack(tag);
            self.bulk_out(request.to_vec()).await?;

            let first = self.bulk_in().await?;
            let header = DevDepMsgIn::parse(&first)?;
            if header.tag != tag {
                return Err(Error::BadData);
            }

            // Keep requesting data until we get all of transfer_size
            let start = buf.len();
            let size = header.transfer_size as usize;
            buf.extend_from_slice(&first[HEADER_SIZE..]);
            while buf.len() - start < size {
                let chunk = self.bulk_in().await?;
                if chunk.is_empty() {
                    return Err(Error::BadData);
                }
                buf.extend_from_slice(&chunk);
            }
            // Drop the alignment padding of the last packet
            buf.truncate(start + size);

            if header.eom || header.term_char {
                break;
            }
        }

        Ok(buf)
    }
}

impl Transport for Device {
    fn write(&mut self, command: &str) -> std::result::Result<(), TransportError> {
        Ok(block_on(self.write_bytes(command.as_bytes()))?)
    }

    fn read(&mut self) -> std::result::Result<String, TransportError> {
        let term_char = self
            .device_capabilities
            .contains(DeviceCapabilities::TermCharTransferEnd)
            .then_some(b'\n');
        let mut reply = String::from_utf8(block_on(self.read_bytes(term_char))?)?;
        while reply.ends_with(['\n', '\r']) {
            reply.pop();
        }
        Ok(reply)
    }

    fn read_raw(&mut self) -> std::result::Result<Vec<u8>, TransportError> {
        Ok(block_on(self.read_bytes(None))?)
    }
}

#[cfg(test)]
pub mod test {
    use super::*;

    #[test]
    fn test_pack_dev_dep_msg_out() {
        let bytes = BulkOut::DevDepMsgOut {
            transfer_size: 0xDE,
            eom: true,
        }
        .pack(0xAD);
        assert_eq!([1, 0xAD, !0xAD, 0, 0xDE, 0, 0, 0, 1, 0, 0, 0], bytes);

        let bytes = BulkOut::DevDepMsgOut {
            transfer_size: 0x0102_0304,
            eom: false,
        }
        .pack(0x01);
        assert_eq!([1, 0x01, 0xFE, 0, 4, 3, 2, 1, 0, 0, 0, 0], bytes);
    }

    #[test]
    fn test_pack_request_dev_dep_msg_in() {
        let bytes = BulkOut::RequestDevDepMsgIn {
            transfer_size: MAX_TRANSFER_SIZE,
            term_char: None,
        }
        .pack(7);
        assert_eq!([2, 7, !7, 0, 0x40, 0xC0, 0, 0, 0, 0, 0, 0], bytes);

        let bytes = BulkOut::RequestDevDepMsgIn {
            transfer_size: 64,
            term_char: Some(b'\n'),
        }
        .pack(7);
        assert_eq!([2, 7, !7, 0, 64, 0, 0, 0, 0b10, b'\n', 0, 0], bytes);
    }

    #[test]
    fn test_parse_dev_dep_msg_in() {
        let header = DevDepMsgIn::parse(&[2, 9, !9, 0, 0x10, 0x01, 0, 0, 0b01, 0, 0, 0, b'x']).unwrap();
        assert_eq!(
            header,
            DevDepMsgIn {
                tag: 9,
                transfer_size: 0x110,
                term_char: false,
                eom: true,
            }
        );

        let header = DevDepMsgIn::parse(&[2, 9, !9, 0, 1, 0, 0, 0, 0b10, 0, 0, 0]).unwrap();
        assert!(header.term_char);
        assert!(!header.eom);

        // Tag inverse mismatch
        assert!(DevDepMsgIn::parse(&[2, 9, 9, 0, 1, 0, 0, 0, 1, 0, 0, 0]).is_err());
        // Wrong message id
        assert!(DevDepMsgIn::parse(&[1, 9, !9, 0, 1, 0, 0, 0, 1, 0, 0, 0]).is_err());
        // Short header
        assert!(DevDepMsgIn::parse(&[2, 9, !9, 0]).is_err());
    }

    #[test]
    fn test_control_status_classes() {
        assert_eq!(ControlStatus::from(0x01), ControlStatus::Success);
        assert!(!ControlStatus::Success.is_warning());
        assert!(ControlStatus::Pending.is_warning());
        assert!(ControlStatus::from(0x45).is_warning());
        assert!(ControlStatus::from(0x80).is_failure());
        assert_eq!(ControlStatus::from(0xC3), ControlStatus::VisaFailure(0xC3));
        assert!(!ControlStatus::from(0x7F).is_failure());
    }
}
