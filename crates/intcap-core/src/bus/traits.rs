//! USB bus layer abstraction.
//!
//! Defines the `UsbBus` and `UsbDevice` traits the capture driver consumes,
//! allowing different implementations (nusb, mock, etc.).

use std::sync::Arc;

use thiserror::Error;

use crate::alloc::TransferBuffer;
use crate::urb::Urb;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Out of memory allocating {what}")]
    NoMemory { what: &'static str },

    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("No interface with class {class:02X}/{subclass:02X}/{protocol:02X}")]
    InterfaceNotFound { class: u8, subclass: u8, protocol: u8 },

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Failed to claim endpoint 0x{endpoint:02X}: {message}")]
    ClaimEndpointFailed { endpoint: u8, message: String },

    #[error("Submission rejected: {0}")]
    SubmitFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A physical USB device as seen by the driver.
///
/// Handles are shared as `Arc<D>`: cloning the `Arc` retains the device,
/// dropping it releases the reference.
pub trait UsbDevice: Send + Sync {
    fn vendor_id(&self) -> u16;

    fn product_id(&self) -> u16;

    /// `iManufacturer` string, if the device has one.
    fn manufacturer(&self) -> Option<&str>;

    /// `iProduct` string, if the device has one.
    fn product(&self) -> Option<&str>;
}

/// Asynchronous I/O services of the bus.
///
/// Completions are delivered by calling [`Urb::giveback`] from the bus's
/// own completion context, once per enqueued request.
pub trait UsbBus: Send + Sync {
    type Device: UsbDevice + 'static;

    /// Allocate a receive buffer of exactly `len` bytes.
    fn alloc_buffer(&self, len: usize) -> Result<TransferBuffer, BusError> {
        TransferBuffer::try_new(len)
    }

    /// Allocate an unbound transfer request.
    fn alloc_urb(&self) -> Result<Urb, BusError> {
        Ok(Urb::new())
    }

    /// Queue a bound request.
    ///
    /// Called with the request's state locked: implementations must not
    /// give the request back before returning.
    fn enqueue(&self, urb: &Arc<Urb>) -> Result<(), BusError>;

    /// Unlink a queued request. The bus must give it back with
    /// [`UrbStatus::Cancelled`](crate::urb::UrbStatus::Cancelled) (or its
    /// real status, if it already finished) without further delay.
    fn cancel(&self, urb: &Arc<Urb>);
}
