//! Driver registration and device matching.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::bus::{UsbBus, UsbDevice, UsbInterface};
use crate::descriptor::InterfaceDescriptor;
use crate::driver::AttachError;

/// One id-table entry: vendor/product plus interface class triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId {
    pub vendor_id: u16,
    pub product_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl DeviceId {
    pub const fn device_and_interface_info(
        vendor_id: u16,
        product_id: u16,
        class: u8,
        subclass: u8,
        protocol: u8,
    ) -> Self {
        Self {
            vendor_id,
            product_id,
            class,
            subclass,
            protocol,
        }
    }

    pub fn matches<D: UsbDevice + ?Sized>(&self, device: &D, alt: &InterfaceDescriptor) -> bool {
        device.vendor_id() == self.vendor_id
            && device.product_id() == self.product_id
            && alt.class() == self.class
            && alt.subclass() == self.subclass
            && alt.protocol() == self.protocol
    }
}

/// First entry of `table` matching the interface's active alt setting.
pub fn match_id<'a, D: UsbDevice>(
    table: &'a [DeviceId],
    interface: &UsbInterface<D>,
) -> Option<&'a DeviceId> {
    let alt = interface.cur_altsetting()?;
    table
        .iter()
        .find(|id| id.matches(interface.device().as_ref(), alt))
}

/// Entry points a USB interface driver exposes to the bus.
pub trait UsbDriver<B: UsbBus>: Send + Sync {
    fn name(&self) -> &str;

    fn id_table(&self) -> &[DeviceId];

    /// Bind to a matching interface. All-or-nothing.
    fn probe(&self, interface: &UsbInterface<B::Device>) -> Result<(), AttachError>;

    /// Unbind. Must tolerate interfaces it holds no state for.
    fn disconnect(&self, interface: &UsbInterface<B::Device>);
}

/// A registered driver and the interfaces bound to it.
///
/// Dropping the registration unregisters the driver and disconnects every
/// interface still bound.
pub struct Registration<B: UsbBus, T: UsbDriver<B>> {
    driver: T,
    bound: Mutex<Vec<Arc<UsbInterface<B::Device>>>>,
}

impl<B: UsbBus, T: UsbDriver<B>> Registration<B, T> {
    pub fn register(driver: T) -> Self {
        info!(
            driver = driver.name(),
            ids = driver.id_table().len(),
            "Driver registered"
        );
        Self {
            driver,
            bound: Mutex::new(Vec::new()),
        }
    }

    pub fn driver(&self) -> &T {
        &self.driver
    }

    /// Interfaces currently bound.
    pub fn bound(&self) -> usize {
        self.bound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Offer an arriving interface to the driver.
    ///
    /// Returns `Ok(false)` when the id table does not match or the
    /// interface is already bound.
    pub fn attach(&self, interface: Arc<UsbInterface<B::Device>>) -> Result<bool, AttachError> {
        let mut bound = self.bound.lock().unwrap_or_else(PoisonError::into_inner);
        if bound.iter().any(|b| Arc::ptr_eq(b, &interface)) {
            debug!(interface = interface.number(), "Interface already bound");
            return Ok(false);
        }

        let Some(id) = match_id(self.driver.id_table(), &interface) else {
            debug!(
                driver = self.driver.name(),
                interface = interface.number(),
                "No id table match"
            );
            return Ok(false);
        };
        debug!(
            vid = %format!("{:04X}", id.vendor_id),
            pid = %format!("{:04X}", id.product_id),
            "Id table match"
        );

        self.driver.probe(&interface)?;
        bound.push(interface);
        Ok(true)
    }

    /// Report removal of an interface. No-op for interfaces not bound here.
    pub fn detach(&self, interface: &Arc<UsbInterface<B::Device>>) {
        let removed = {
            let mut bound = self.bound.lock().unwrap_or_else(PoisonError::into_inner);
            bound
                .iter()
                .position(|b| Arc::ptr_eq(b, interface))
                .map(|i| bound.remove(i))
        };

        if let Some(interface) = removed {
            self.driver.disconnect(&interface);
        }
    }

    /// Unregister explicitly.
    pub fn deregister(self) {
        drop(self);
    }
}

impl<B: UsbBus, T: UsbDriver<B>> Drop for Registration<B, T> {
    fn drop(&mut self) {
        let bound = std::mem::take(
            self.bound
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for interface in bound.iter().rev() {
            self.driver.disconnect(interface);
        }
        info!(driver = self.driver.name(), "Driver deregistered");
    }
}
