//! Asynchronous transfer requests.
//!
//! A [`Urb`] describes one in-flight read: the pipe, the buffer it lends,
//! and the completion callback. Its lifecycle is
//!
//! ```text
//! Idle --submit--> InFlight --giveback--> Completing --+--> Idle
//!                     ^                                |
//!                     +-------- resubmit from ---------+
//!                               the callback
//! ```
//!
//! [`Urb::kill`] is the cancel-before-free barrier: once it returns, the
//! request is idle, its callback is not running and cannot run again until
//! it is resubmitted.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};

use thiserror::Error;
use tracing::warn;

use crate::alloc::{AllocStats, Lease, TransferBuffer};
use crate::bus::{BusError, UsbBus, UsbDevice};
use crate::descriptor::{Direction, ENDPOINT_DIR_IN, TransferType};

/// Completion callback. Runs in the bus's completion context and must not
/// block; it may resubmit the request it is called for.
pub type CompletionFn = Arc<dyn Fn(&Urb) + Send + Sync>;

// Linux errno values, used for status codes in logs.
const ENOENT: i32 = 2;
const EPIPE: i32 = 32;
const EPROTO: i32 = 71;
const EOVERFLOW: i32 = 75;
const ESHUTDOWN: i32 = 108;
const EINPROGRESS: i32 = 115;

/// Endpoint plus transfer type and direction, as addressed by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pipe {
    endpoint: u8,
    transfer_type: TransferType,
}

impl Pipe {
    /// Receive pipe for an interrupt endpoint.
    pub fn int_in(endpoint_address: u8) -> Self {
        Self {
            endpoint: endpoint_address | ENDPOINT_DIR_IN,
            transfer_type: TransferType::Interrupt,
        }
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    pub fn transfer_type(&self) -> TransferType {
        self.transfer_type
    }

    pub fn direction(&self) -> Direction {
        Direction::from_address(self.endpoint)
    }
}

/// Outcome of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrbStatus {
    /// Submitted, not yet given back.
    Pending,
    /// Completed; `actual_length` bytes are valid.
    Completed,
    /// Unlinked by the host.
    Cancelled,
    /// Endpoint halted.
    Stall,
    /// Device or host controller went away.
    Disconnected,
    /// Device sent more than the buffer holds.
    Overflow,
    /// Bit-stuffing, CRC or timeout error on the wire.
    Protocol,
    /// Anything else, as a negative errno.
    Other(i32),
}

impl UrbStatus {
    /// Linux-style status code: 0 on success, negative errno otherwise.
    pub fn code(&self) -> i32 {
        match self {
            UrbStatus::Pending => -EINPROGRESS,
            UrbStatus::Completed => 0,
            UrbStatus::Cancelled => -ENOENT,
            UrbStatus::Stall => -EPIPE,
            UrbStatus::Disconnected => -ESHUTDOWN,
            UrbStatus::Overflow => -EOVERFLOW,
            UrbStatus::Protocol => -EPROTO,
            UrbStatus::Other(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == UrbStatus::Completed
    }

    /// Statuses after which resubmitting is pointless.
    pub fn ends_polling(&self) -> bool {
        matches!(self, UrbStatus::Cancelled | UrbStatus::Disconnected)
    }
}

impl fmt::Display for UrbStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UrbStatus::Pending => "pending",
            UrbStatus::Completed => "completed",
            UrbStatus::Cancelled => "cancelled",
            UrbStatus::Stall => "stall",
            UrbStatus::Disconnected => "disconnected",
            UrbStatus::Overflow => "overflow",
            UrbStatus::Protocol => "protocol error",
            UrbStatus::Other(_) => "error",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Request is being killed")]
    Killed,

    #[error("Request is already in flight")]
    Busy,

    #[error("Request has no transfer bound")]
    Unbound,

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl SubmitError {
    /// Negative errno equivalent, for logs.
    pub fn code(&self) -> i32 {
        match self {
            SubmitError::Killed => -1,   // EPERM
            SubmitError::Busy => -16,    // EBUSY
            SubmitError::Unbound => -22, // EINVAL
            SubmitError::Bus(BusError::NoMemory { .. }) => -12,
            SubmitError::Bus(BusError::Disconnected) => -19,
            SubmitError::Bus(_) => -5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    InFlight,
    Completing,
}

struct Control {
    phase: Phase,
    /// Nonzero while a kill is in progress; submissions are refused.
    reject: u32,
}

struct Binding {
    device: Weak<dyn UsbDevice>,
    pipe: Pipe,
    buffer: TransferBuffer,
    interval: u8,
    complete: CompletionFn,
}

struct Transfer {
    binding: Option<Binding>,
    status: UrbStatus,
    actual_length: usize,
}

/// One asynchronous transfer request.
pub struct Urb {
    control: Mutex<Control>,
    idle: Condvar,
    /// Serializes givebacks so callbacks never overlap.
    giveback: Mutex<()>,
    transfer: Mutex<Transfer>,
    _lease: Option<Lease>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for Urb {
    fn default() -> Self {
        Self::new()
    }
}

impl Urb {
    pub fn new() -> Self {
        Self {
            control: Mutex::new(Control {
                phase: Phase::Idle,
                reject: 0,
            }),
            idle: Condvar::new(),
            giveback: Mutex::new(()),
            transfer: Mutex::new(Transfer {
                binding: None,
                status: UrbStatus::Completed,
                actual_length: 0,
            }),
            _lease: None,
        }
    }

    /// Count this request in `stats` until it is dropped.
    pub fn tracked(mut self, stats: &Arc<AllocStats>) -> Self {
        self._lease = Some(stats.request_lease());
        self
    }

    /// Bind an interrupt transfer (`usb_fill_int_urb`).
    ///
    /// The request keeps only a weak reference to `device`. The buffer is
    /// lent to the request until [`Urb::unbind`].
    pub fn fill_int<D: UsbDevice + 'static>(
        &mut self,
        device: &Arc<D>,
        pipe: Pipe,
        buffer: TransferBuffer,
        complete: CompletionFn,
        interval: u8,
    ) {
        let device: Arc<dyn UsbDevice> = device.clone();
        let transfer = self
            .transfer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);

        transfer.binding = Some(Binding {
            device: Arc::downgrade(&device),
            pipe,
            buffer,
            interval,
            complete,
        });
        transfer.status = UrbStatus::Completed;
        transfer.actual_length = 0;
    }

    /// Take the buffer back. Returns `None` while the request is in flight
    /// or if nothing is bound.
    pub fn unbind(&self) -> Option<TransferBuffer> {
        let control = lock(&self.control);
        if control.phase != Phase::Idle {
            warn!("Refusing to unbind a request that is in flight");
            return None;
        }
        let binding = lock(&self.transfer).binding.take()?;
        Some(binding.buffer)
    }

    pub fn pipe(&self) -> Option<Pipe> {
        lock(&self.transfer).binding.as_ref().map(|b| b.pipe)
    }

    pub fn interval(&self) -> Option<u8> {
        lock(&self.transfer).binding.as_ref().map(|b| b.interval)
    }

    pub fn device(&self) -> Option<Arc<dyn UsbDevice>> {
        lock(&self.transfer)
            .binding
            .as_ref()
            .and_then(|b| b.device.upgrade())
    }

    /// Bytes requested per transfer (the bound buffer's size).
    pub fn transfer_buffer_length(&self) -> usize {
        lock(&self.transfer)
            .binding
            .as_ref()
            .map(|b| b.buffer.len())
            .unwrap_or(0)
    }

    pub fn status(&self) -> UrbStatus {
        lock(&self.transfer).status
    }

    /// Bytes the bus reported for the last completion.
    pub fn actual_length(&self) -> usize {
        lock(&self.transfer).actual_length
    }

    /// Copy of the received bytes. Empty unless the last completion
    /// succeeded.
    pub fn received(&self) -> Vec<u8> {
        let transfer = lock(&self.transfer);
        match &transfer.binding {
            Some(b) if transfer.status.is_success() => {
                b.buffer.as_slice()[..transfer.actual_length].to_vec()
            }
            _ => Vec::new(),
        }
    }

    /// Whether the request is queued on the bus.
    pub fn is_in_flight(&self) -> bool {
        lock(&self.control).phase == Phase::InFlight
    }

    /// Whether the request is neither queued nor running its callback.
    pub fn is_idle(&self) -> bool {
        lock(&self.control).phase == Phase::Idle
    }

    /// Queue the request on `bus`.
    ///
    /// Legal from the completion callback. Fails with
    /// [`SubmitError::Busy`] if the request is already queued, so at most
    /// one transfer per request is ever outstanding.
    pub fn submit<B: UsbBus + ?Sized>(self: &Arc<Self>, bus: &B) -> Result<(), SubmitError> {
        let mut control = lock(&self.control);
        if control.reject > 0 {
            return Err(SubmitError::Killed);
        }
        if control.phase == Phase::InFlight {
            return Err(SubmitError::Busy);
        }

        {
            let mut transfer = lock(&self.transfer);
            if transfer.binding.is_none() {
                return Err(SubmitError::Unbound);
            }
            transfer.status = UrbStatus::Pending;
            transfer.actual_length = 0;
        }

        let previous = control.phase;
        control.phase = Phase::InFlight;
        if let Err(e) = bus.enqueue(self) {
            let err = SubmitError::from(e);
            control.phase = previous;
            lock(&self.transfer).status = UrbStatus::Other(err.code());
            self.idle.notify_all();
            return Err(err);
        }

        Ok(())
    }

    /// Hand a finished transfer back. Called by the bus only.
    ///
    /// `received` is copied into the buffer when `status` is a success;
    /// its length becomes `actual_length`. A success longer than the
    /// buffer is turned into [`UrbStatus::Overflow`] with no data.
    pub fn giveback(&self, status: UrbStatus, received: &[u8]) {
        let _serial = lock(&self.giveback);

        {
            let mut control = lock(&self.control);
            if control.phase != Phase::InFlight {
                warn!(status = %status, "Giveback for a request that is not in flight");
                return;
            }
            control.phase = Phase::Completing;
        }

        let complete = {
            let mut transfer = lock(&self.transfer);
            let Transfer {
                binding,
                status: slot,
                actual_length,
            } = &mut *transfer;
            *slot = status;
            *actual_length = 0;

            binding.as_mut().map(|b| {
                if status.is_success() {
                    let n = received.len();
                    if n > b.buffer.len() {
                        warn!(
                            received = n,
                            capacity = b.buffer.len(),
                            "Completion longer than the transfer buffer"
                        );
                        *slot = UrbStatus::Overflow;
                    } else {
                        b.buffer.as_mut_slice()[..n].copy_from_slice(received);
                        *actual_length = n;
                    }
                }
                Arc::clone(&b.complete)
            })
        };

        if let Some(complete) = complete {
            complete(self);
        }

        let mut control = lock(&self.control);
        if control.phase == Phase::Completing {
            control.phase = Phase::Idle;
            self.idle.notify_all();
        }
    }

    /// Cancel the request and wait until it is idle (`usb_kill_urb`).
    ///
    /// Blocks until any running callback has returned. Submissions,
    /// including resubmission from the callback, are refused while the
    /// kill is in progress. Must not be called from the callback.
    pub fn kill<B: UsbBus + ?Sized>(self: &Arc<Self>, bus: &B) {
        let in_flight = {
            let mut control = lock(&self.control);
            control.reject += 1;
            control.phase == Phase::InFlight
        };

        if in_flight {
            bus.cancel(self);
        }

        let mut control = lock(&self.control);
        while control.phase != Phase::Idle {
            control = self
                .idle
                .wait(control)
                .unwrap_or_else(PoisonError::into_inner);
        }
        control.reject -= 1;
    }
}
