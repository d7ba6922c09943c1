//! Event system for capture output.
//!
//! The completion handler surfaces what it captures through a
//! [`CaptureObserver`], so front ends decide what to do with the bytes
//! without touching the lifecycle code.

use std::fmt::Write as _;

use crate::urb::UrbStatus;

/// Events emitted by the capture driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// Session established and first transfer submitted.
    Attached {
        vid: u16,
        pid: u16,
        interface: u8,
        endpoint: u8,
        max_packet_size: usize,
        interval: u8,
    },
    /// A transfer completed; `data` holds exactly the bytes received.
    Data { endpoint: u8, data: Vec<u8> },
    /// A transfer completed with an error. No data is surfaced.
    TransferError { endpoint: u8, status: UrbStatus },
    /// The session stopped resubmitting.
    PollingStopped { endpoint: u8, reason: String },
    /// Session torn down.
    Detached { vid: u16, pid: u16, interface: u8 },
}

/// Observer trait for receiving capture events.
///
/// Called from the bus's completion context: implementations must return
/// quickly and must not block.
pub trait CaptureObserver: Send + Sync {
    fn on_event(&self, event: &CaptureEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl CaptureObserver for NullObserver {
    fn on_event(&self, _event: &CaptureEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl CaptureObserver for TracingObserver {
    fn on_event(&self, event: &CaptureEvent) {
        match event {
            CaptureEvent::Attached {
                vid,
                pid,
                interface,
                endpoint,
                max_packet_size,
                interval,
            } => {
                tracing::info!(
                    vid = %format!("{:04X}", vid),
                    pid = %format!("{:04X}", pid),
                    interface = interface,
                    endpoint = %format!("0x{:02X}", endpoint),
                    max_packet_size = max_packet_size,
                    interval = interval,
                    "Device connected successfully"
                );
            }
            CaptureEvent::Data { endpoint, data } => {
                tracing::info!(
                    endpoint = %format!("0x{:02X}", endpoint),
                    len = data.len(),
                    "Data received: {}",
                    hex_bytes(data)
                );
            }
            CaptureEvent::TransferError { endpoint, status } => {
                tracing::error!(
                    endpoint = %format!("0x{:02X}", endpoint),
                    code = status.code(),
                    "URB error: {}",
                    status
                );
            }
            CaptureEvent::PollingStopped { endpoint, reason } => {
                tracing::warn!(endpoint = %format!("0x{:02X}", endpoint), "Polling stopped: {}", reason);
            }
            CaptureEvent::Detached {
                vid,
                pid,
                interface,
            } => {
                tracing::info!(
                    vid = %format!("{:04X}", vid),
                    pid = %format!("{:04X}", pid),
                    interface = interface,
                    "Device successfully disconnected"
                );
            }
        }
    }
}

/// Space-separated lowercase hex, e.g. `00 00 04 00`.
pub fn hex_bytes(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, b) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02x}", b);
    }
    out
}
