//! intcap-core: interrupt-IN endpoint capture for USB devices.
//!
//! The crate binds to a matching USB interface, finds its first
//! interrupt-IN endpoint and keeps exactly one read request in flight on
//! it, surfacing every completed report until the device goes away.
//!
//! # Architecture
//!
//! - **Descriptor**: Endpoint/interface descriptors and raw descriptor parsing
//! - **Resolver**: Endpoint selection on the active alternate setting
//! - **URB**: Transfer requests, submission, completion and the kill barrier
//! - **Bus**: Backend abstraction (nusb, mock) and interface instances
//! - **Session**: Per-attachment state and the completion handler
//! - **Driver**: Attach / detach lifecycle
//! - **Registry**: Id-table matching and driver registration
//! - **Events**: Observer pattern for captured data
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use intcap_core::{CaptureConfig, CaptureDriver, NusbBus};
//!
//! let config = CaptureConfig::default();
//! let (bus, interface) = NusbBus::open(&config).expect("device not found");
//! let driver = CaptureDriver::new(Arc::clone(&bus), &config);
//!
//! driver.attach(&interface).expect("attach failed");
//! // ... reports are logged as they arrive ...
//! driver.detach(&interface);
//! ```

pub mod alloc;
pub mod bus;
pub mod config;
pub mod descriptor;
pub mod driver;
pub mod events;
pub mod registry;
pub mod resolver;
pub mod session;
pub mod urb;

// Re-exports for convenience
pub use alloc::{AllocStats, TransferBuffer};
pub use bus::{BusError, MockBus, MockDevice, NusbBus, NusbDevice, UsbBus, UsbDevice, UsbInterface};
pub use config::CaptureConfig;
pub use descriptor::{DescriptorError, EndpointDescriptor, InterfaceDescriptor, parse_interfaces};
pub use driver::{AttachError, CaptureDriver};
pub use events::{CaptureEvent, CaptureObserver, NullObserver, TracingObserver};
pub use registry::{DeviceId, Registration, UsbDriver};
pub use session::SessionStats;
pub use urb::{Pipe, SubmitError, Urb, UrbStatus};
