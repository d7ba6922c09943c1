//! Bus layer module.

pub mod interface;
pub mod mock;
pub mod nusb;
pub mod traits;

pub use interface::UsbInterface;
pub use mock::{MockBus, MockDevice, interfaces_from_config};
pub use nusb::{NusbBus, NusbDevice};
pub use traits::{BusError, UsbBus, UsbDevice};
