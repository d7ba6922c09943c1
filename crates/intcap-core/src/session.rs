//! Device session: everything one attachment owns.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, error, warn};

use crate::alloc::TransferBuffer;
use crate::bus::UsbBus;
use crate::descriptor::EndpointDescriptor;
use crate::events::{CaptureEvent, CaptureObserver};
use crate::urb::{CompletionFn, Pipe, SubmitError, Urb, UrbStatus};

/// Point-in-time view of a session, handed out instead of the session so
/// callers never keep its resources alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub interface_number: u8,
    pub endpoint_address: u8,
    pub max_packet_size: usize,
    pub poll_interval: u8,
    /// Bytes requested per transfer.
    pub transfer_buffer_length: usize,
    /// False once the session stopped resubmitting.
    pub polling: bool,
    pub completions: u64,
    pub bytes_captured: u64,
    pub transfer_errors: u64,
}

/// Per-interface state of an attached device.
///
/// Holds a retained device reference, the request and (through it) the
/// receive buffer. The completion callback reaches the session through a
/// weak reference, so the session is owned only by the interface slot.
pub(crate) struct DeviceSession<B: UsbBus> {
    // Declaration order is release order: request and buffer, then device.
    urb: Arc<Urb>,
    device: Arc<B::Device>,
    bus: Arc<B>,
    observer: Arc<dyn CaptureObserver>,
    interface_number: u8,
    endpoint: EndpointDescriptor,
    polling: AtomicBool,
    completions: AtomicU64,
    bytes_captured: AtomicU64,
    transfer_errors: AtomicU64,
}

impl<B: UsbBus + 'static> DeviceSession<B> {
    /// Bind `buffer` and `urb` to the endpoint and wrap everything in a
    /// session. Nothing is submitted yet.
    pub(crate) fn bind(
        bus: Arc<B>,
        device: Arc<B::Device>,
        interface_number: u8,
        endpoint: EndpointDescriptor,
        buffer: TransferBuffer,
        mut urb: Urb,
        observer: Arc<dyn CaptureObserver>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|session: &Weak<Self>| {
            let session = session.clone();
            let complete: CompletionFn = Arc::new(move |urb: &Urb| {
                if let Some(session) = session.upgrade() {
                    session.complete(urb);
                }
            });

            urb.fill_int(
                &device,
                Pipe::int_in(endpoint.address()),
                buffer,
                complete,
                endpoint.interval(),
            );

            Self {
                urb: Arc::new(urb),
                device,
                bus,
                observer,
                interface_number,
                endpoint,
                polling: AtomicBool::new(true),
                completions: AtomicU64::new(0),
                bytes_captured: AtomicU64::new(0),
                transfer_errors: AtomicU64::new(0),
            }
        })
    }

    /// Completion handler. Runs in the bus's completion context.
    fn complete(&self, urb: &Urb) {
        let endpoint = self.endpoint.address();
        let status = urb.status();
        self.completions.fetch_add(1, Ordering::Relaxed);

        match status {
            UrbStatus::Completed => {
                let data = urb.received();
                self.bytes_captured
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                self.observer
                    .on_event(&CaptureEvent::Data { endpoint, data });
            }
            UrbStatus::Cancelled => {
                debug!(endpoint = %format!("0x{:02X}", endpoint), "Transfer cancelled");
                self.polling.store(false, Ordering::Release);
                return;
            }
            status if status.ends_polling() => {
                self.transfer_errors.fetch_add(1, Ordering::Relaxed);
                self.stop(format!("transfer ended with {}", status));
                return;
            }
            status => {
                self.transfer_errors.fetch_add(1, Ordering::Relaxed);
                self.observer
                    .on_event(&CaptureEvent::TransferError { endpoint, status });
            }
        }

        match self.urb.submit(&*self.bus) {
            Ok(()) => {}
            Err(SubmitError::Killed) => {
                debug!(endpoint = %format!("0x{:02X}", endpoint), "Resubmission refused, request is being killed");
                self.polling.store(false, Ordering::Release);
            }
            Err(e) => {
                error!(
                    endpoint = %format!("0x{:02X}", endpoint),
                    code = e.code(),
                    "Failed to resubmit URB: {}",
                    e
                );
                self.stop(format!("resubmission failed: {}", e));
            }
        }
    }

    fn stop(&self, reason: String) {
        self.polling.store(false, Ordering::Release);
        self.observer.on_event(&CaptureEvent::PollingStopped {
            endpoint: self.endpoint.address(),
            reason,
        });
    }

    /// Cancel the outstanding request, wait for its callback, then free
    /// request, buffer and device reference in that order.
    ///
    /// The request is unbound right after the kill, so it can never be
    /// submitted again even if the session outlives this call.
    pub(crate) fn release(self: Arc<Self>) {
        self.urb.kill(&*self.bus);
        self.polling.store(false, Ordering::Release);
        let buffer = self.urb.unbind();

        match Arc::into_inner(self) {
            Some(session) => {
                let DeviceSession { urb, device, .. } = session;
                drop(urb);
                drop(buffer);
                drop(device);
            }
            None => {
                drop(buffer);
                warn!("Session still shared after cancellation, freeing with its last reference");
            }
        }
    }
}

impl<B: UsbBus> DeviceSession<B> {
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            interface_number: self.interface_number,
            endpoint_address: self.endpoint.address(),
            max_packet_size: self.endpoint.max_packet_size(),
            poll_interval: self.endpoint.interval(),
            transfer_buffer_length: self.urb.transfer_buffer_length(),
            polling: self.is_polling(),
            completions: self.completions(),
            bytes_captured: self.bytes_captured(),
            transfer_errors: self.transfer_errors(),
        }
    }

    pub fn device(&self) -> &Arc<B::Device> {
        &self.device
    }

    pub fn urb(&self) -> &Arc<Urb> {
        &self.urb
    }

    /// False once the session stopped resubmitting.
    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::Acquire)
    }

    pub fn completions(&self) -> u64 {
        self.completions.load(Ordering::Relaxed)
    }

    pub fn bytes_captured(&self) -> u64 {
        self.bytes_captured.load(Ordering::Relaxed)
    }

    pub fn transfer_errors(&self) -> u64 {
        self.transfer_errors.load(Ordering::Relaxed)
    }
}
