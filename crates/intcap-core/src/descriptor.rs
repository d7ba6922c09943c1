//! USB interface and endpoint descriptors.
//!
//! Multi-byte fields are little-endian on the wire (USB 2.0, chapter 9)
//! and are converted to host order when a descriptor is parsed.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

// ============================================================================
// Descriptor Constants
// ============================================================================

pub const DT_CONFIG: u8 = 0x02;
pub const DT_INTERFACE: u8 = 0x04;
pub const DT_ENDPOINT: u8 = 0x05;

pub const DT_INTERFACE_SIZE: usize = 9;
pub const DT_ENDPOINT_SIZE: usize = 7;

/// Bit 7 of `bEndpointAddress`: set for device-to-host.
pub const ENDPOINT_DIR_IN: u8 = 0x80;
pub const ENDPOINT_NUMBER_MASK: u8 = 0x0F;
pub const ENDPOINT_XFERTYPE_MASK: u8 = 0x03;

/// `wMaxPacketSize` bits 0..10 hold the packet size, 11..12 the
/// high-bandwidth multiplier.
pub const ENDPOINT_MAXP_MASK: u16 = 0x07FF;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("Descriptor at offset {offset} truncated: need {needed} bytes, have {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Invalid bLength {length} at offset {offset}")]
    InvalidLength { offset: usize, length: u8 },

    #[error("Expected descriptor type 0x{expected:02X}, found 0x{found:02X}")]
    UnexpectedType { expected: u8, found: u8 },

    #[error("Endpoint descriptor at offset {offset} precedes any interface descriptor")]
    OrphanEndpoint { offset: usize },
}

/// Endpoint transfer type (`bmAttributes` bits 0..1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferType {
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & ENDPOINT_XFERTYPE_MASK {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }

    pub fn attributes(self) -> u8 {
        match self {
            TransferType::Control => 0,
            TransferType::Isochronous => 1,
            TransferType::Bulk => 2,
            TransferType::Interrupt => 3,
        }
    }
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferType::Control => write!(f, "control"),
            TransferType::Isochronous => write!(f, "isochronous"),
            TransferType::Bulk => write!(f, "bulk"),
            TransferType::Interrupt => write!(f, "interrupt"),
        }
    }
}

/// Data direction as seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to device.
    Out,
    /// Device to host.
    In,
}

impl Direction {
    pub fn from_address(address: u8) -> Self {
        if address & ENDPOINT_DIR_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Out => write!(f, "OUT"),
            Direction::In => write!(f, "IN"),
        }
    }
}

/// A single endpoint descriptor, fields in host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    address: u8,
    attributes: u8,
    w_max_packet_size: u16,
    interval: u8,
}

impl EndpointDescriptor {
    pub const fn new(address: u8, attributes: u8, w_max_packet_size: u16, interval: u8) -> Self {
        Self {
            address,
            attributes,
            w_max_packet_size,
            interval,
        }
    }

    /// Decode a 7-byte endpoint descriptor.
    pub fn parse(bytes: &[u8]) -> Result<Self, DescriptorError> {
        check_header(bytes, 0, DT_ENDPOINT_SIZE)?;
        if bytes[1] != DT_ENDPOINT {
            return Err(DescriptorError::UnexpectedType {
                expected: DT_ENDPOINT,
                found: bytes[1],
            });
        }

        Ok(Self {
            address: bytes[2],
            attributes: bytes[3],
            w_max_packet_size: LittleEndian::read_u16(&bytes[4..6]),
            interval: bytes[6],
        })
    }

    /// `bEndpointAddress`, direction bit included.
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn number(&self) -> u8 {
        self.address & ENDPOINT_NUMBER_MASK
    }

    pub fn direction(&self) -> Direction {
        Direction::from_address(self.address)
    }

    pub fn attributes(&self) -> u8 {
        self.attributes
    }

    pub fn transfer_type(&self) -> TransferType {
        TransferType::from_attributes(self.attributes)
    }

    /// Raw `wMaxPacketSize`, including the multiplier bits.
    pub fn w_max_packet_size(&self) -> u16 {
        self.w_max_packet_size
    }

    /// Packet size in bytes (`usb_endpoint_maxp`).
    pub fn max_packet_size(&self) -> usize {
        (self.w_max_packet_size & ENDPOINT_MAXP_MASK) as usize
    }

    /// `bInterval`, the polling interval in frames (or exponent at high speed).
    pub fn interval(&self) -> u8 {
        self.interval
    }

    pub fn is_int_in(&self) -> bool {
        self.transfer_type() == TransferType::Interrupt && self.direction() == Direction::In
    }
}

/// One alternate setting of an interface together with its endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    number: u8,
    alternate_setting: u8,
    class: u8,
    subclass: u8,
    protocol: u8,
    endpoints: Vec<EndpointDescriptor>,
}

impl InterfaceDescriptor {
    pub fn new(number: u8, alternate_setting: u8, class: u8, subclass: u8, protocol: u8) -> Self {
        Self {
            number,
            alternate_setting,
            class,
            subclass,
            protocol,
            endpoints: Vec::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: EndpointDescriptor) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn alternate_setting(&self) -> u8 {
        self.alternate_setting
    }

    pub fn class(&self) -> u8 {
        self.class
    }

    pub fn subclass(&self) -> u8 {
        self.subclass
    }

    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    /// Endpoints in the order the device reported them.
    pub fn endpoints(&self) -> &[EndpointDescriptor] {
        &self.endpoints
    }
}

fn check_header(raw: &[u8], offset: usize, min_len: usize) -> Result<usize, DescriptorError> {
    let available = raw.len() - offset;
    if available < 2 {
        return Err(DescriptorError::Truncated {
            offset,
            needed: 2,
            available,
        });
    }

    let length = raw[offset];
    if (length as usize) < 2 || (length as usize) < min_len {
        return Err(DescriptorError::InvalidLength { offset, length });
    }
    if length as usize > available {
        return Err(DescriptorError::Truncated {
            offset,
            needed: length as usize,
            available,
        });
    }

    Ok(length as usize)
}

/// Walk a configuration descriptor blob and collect every interface
/// alternate setting with its endpoints.
///
/// Class-specific descriptors (HID, audio, ...) are skipped. The leading
/// configuration descriptor is optional.
pub fn parse_interfaces(raw: &[u8]) -> Result<Vec<InterfaceDescriptor>, DescriptorError> {
    let mut interfaces: Vec<InterfaceDescriptor> = Vec::new();
    let mut offset = 0;

    while offset < raw.len() {
        let kind = raw.get(offset + 1).copied().unwrap_or(0);
        let min_len = match kind {
            DT_INTERFACE => DT_INTERFACE_SIZE,
            DT_ENDPOINT => DT_ENDPOINT_SIZE,
            _ => 2,
        };
        let length = check_header(raw, offset, min_len)?;
        let desc = &raw[offset..offset + length];

        match kind {
            DT_INTERFACE => {
                interfaces.push(InterfaceDescriptor::new(
                    desc[2], desc[3], desc[5], desc[6], desc[7],
                ));
            }
            DT_ENDPOINT => {
                let endpoint = EndpointDescriptor::parse(desc)?;
                interfaces
                    .last_mut()
                    .ok_or(DescriptorError::OrphanEndpoint { offset })?
                    .endpoints
                    .push(endpoint);
            }
            _ => {}
        }

        offset += length;
    }

    Ok(interfaces)
}
