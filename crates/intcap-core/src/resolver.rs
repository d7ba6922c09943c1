//! Endpoint selection.

use tracing::debug;

use crate::bus::UsbInterface;
use crate::descriptor::{EndpointDescriptor, InterfaceDescriptor};

/// First interrupt-IN endpoint of `alt`, in the order the device reported.
pub fn find_int_in(alt: &InterfaceDescriptor) -> Option<&EndpointDescriptor> {
    alt.endpoints().iter().find(|ep| ep.is_int_in())
}

/// Log every alternate setting and its endpoints. Diagnostic only.
pub fn log_alt_settings<D>(interface: &UsbInterface<D>) {
    for (i, alt) in interface.alt_settings().iter().enumerate() {
        debug!(
            interface = interface.number(),
            index = i,
            alt_setting = alt.alternate_setting(),
            endpoints = alt.endpoints().len(),
            "Alternate setting"
        );
        for (j, ep) in alt.endpoints().iter().enumerate() {
            debug!(
                index = j,
                attributes = %format!("0x{:x}", ep.attributes()),
                address = %format!("0x{:02x}", ep.address()),
                max_packet_size = ep.max_packet_size(),
                "Endpoint: {} {}",
                ep.transfer_type(),
                ep.direction()
            );
        }
    }
}
