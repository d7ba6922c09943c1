//! Mock USB bus for testing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::interface::UsbInterface;
use super::traits::{BusError, UsbBus, UsbDevice};
use crate::alloc::{AllocStats, TransferBuffer};
use crate::descriptor::{DescriptorError, InterfaceDescriptor, parse_interfaces};
use crate::urb::{Urb, UrbStatus};

/// Simulated device.
pub struct MockDevice {
    vid: u16,
    pid: u16,
    manufacturer: Option<String>,
    product: Option<String>,
}

impl MockDevice {
    pub fn new(vid: u16, pid: u16) -> Self {
        Self {
            vid,
            pid,
            manufacturer: None,
            product: None,
        }
    }

    pub fn with_strings(mut self, manufacturer: &str, product: &str) -> Self {
        self.manufacturer = Some(manufacturer.to_string());
        self.product = Some(product.to_string());
        self
    }
}

impl UsbDevice for MockDevice {
    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }

    fn manufacturer(&self) -> Option<&str> {
        self.manufacturer.as_deref()
    }

    fn product(&self) -> Option<&str> {
        self.product.as_deref()
    }
}

/// Build the interfaces of `device` from a raw configuration descriptor.
///
/// Alternate settings are grouped by interface number; every interface
/// starts at alternate setting 0.
pub fn interfaces_from_config(
    device: &Arc<MockDevice>,
    raw: &[u8],
) -> Result<Vec<UsbInterface<MockDevice>>, DescriptorError> {
    let mut grouped: Vec<Vec<InterfaceDescriptor>> = Vec::new();
    for alt in parse_interfaces(raw)? {
        match grouped.iter_mut().find(|g| g[0].number() == alt.number()) {
            Some(group) => group.push(alt),
            None => grouped.push(vec![alt]),
        }
    }

    Ok(grouped
        .into_iter()
        .map(|alts| UsbInterface::new(Arc::clone(device), alts, 0))
        .collect())
}

#[derive(Default)]
struct Faults {
    buffer_alloc: bool,
    urb_alloc: bool,
    submit: bool,
}

/// Mock bus for unit testing the driver lifecycle.
///
/// Requests are queued on submit and only complete when the test calls
/// [`MockBus::complete_next`], which may happen from any thread.
pub struct MockBus {
    stats: Arc<AllocStats>,
    /// Queued requests, oldest first.
    queue: Mutex<VecDeque<Arc<Urb>>>,
    peak_in_flight: AtomicUsize,
    submissions: AtomicUsize,
    cancellations: AtomicUsize,
    faults: Mutex<Faults>,
}

impl MockBus {
    pub fn new() -> Self {
        Self {
            stats: AllocStats::new(),
            queue: Mutex::new(VecDeque::new()),
            peak_in_flight: AtomicUsize::new(0),
            submissions: AtomicUsize::new(0),
            cancellations: AtomicUsize::new(0),
            faults: Mutex::new(Faults::default()),
        }
    }

    pub fn stats(&self) -> &Arc<AllocStats> {
        &self.stats
    }

    /// Make buffer allocation fail.
    pub fn fail_buffer_alloc(&self, fail: bool) {
        self.faults.lock().unwrap().buffer_alloc = fail;
    }

    /// Make request allocation fail.
    pub fn fail_urb_alloc(&self, fail: bool) {
        self.faults.lock().unwrap().urb_alloc = fail;
    }

    /// Make every submission fail.
    pub fn fail_submit(&self, fail: bool) {
        self.faults.lock().unwrap().submit = fail;
    }

    /// Requests currently queued.
    pub fn in_flight(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Highest number of requests ever queued at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Accepted submissions.
    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Requests given back as cancelled.
    pub fn cancellations(&self) -> usize {
        self.cancellations.load(Ordering::SeqCst)
    }

    /// Complete the oldest queued request with `status`, delivering `data`.
    ///
    /// Runs the completion callback on the calling thread. Returns `false`
    /// if nothing was queued.
    pub fn complete_next(&self, status: UrbStatus, data: &[u8]) -> bool {
        let urb = self.queue.lock().unwrap().pop_front();
        match urb {
            Some(urb) => {
                urb.giveback(status, data);
                true
            }
            None => false,
        }
    }
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbBus for MockBus {
    type Device = MockDevice;

    fn alloc_buffer(&self, len: usize) -> Result<TransferBuffer, BusError> {
        if self.faults.lock().unwrap().buffer_alloc {
            return Err(BusError::NoMemory {
                what: "transfer buffer",
            });
        }
        Ok(TransferBuffer::try_new(len)?.tracked(&self.stats))
    }

    fn alloc_urb(&self) -> Result<Urb, BusError> {
        if self.faults.lock().unwrap().urb_alloc {
            return Err(BusError::NoMemory {
                what: "transfer request",
            });
        }
        Ok(Urb::new().tracked(&self.stats))
    }

    fn enqueue(&self, urb: &Arc<Urb>) -> Result<(), BusError> {
        if self.faults.lock().unwrap().submit {
            return Err(BusError::SubmitFailed("injected failure".into()));
        }

        let mut queue = self.queue.lock().unwrap();
        queue.push_back(Arc::clone(urb));
        self.peak_in_flight.fetch_max(queue.len(), Ordering::SeqCst);
        self.submissions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cancel(&self, urb: &Arc<Urb>) {
        let removed = {
            let mut queue = self.queue.lock().unwrap();
            queue
                .iter()
                .position(|queued| Arc::ptr_eq(queued, urb))
                .and_then(|i| queue.remove(i))
        };

        // Already popped by a completer: its giveback will finish the job.
        if let Some(urb) = removed {
            self.cancellations.fetch_add(1, Ordering::SeqCst);
            urb.giveback(UrbStatus::Cancelled, &[]);
        }
    }
}
