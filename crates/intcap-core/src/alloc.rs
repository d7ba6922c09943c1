//! Transfer buffers and allocation accounting.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::bus::BusError;

/// Live allocation counters shared between a bus backend and its leases.
#[derive(Debug, Default)]
pub struct AllocStats {
    buffers: AtomicUsize,
    requests: AtomicUsize,
}

#[derive(Debug, Clone, Copy)]
enum LeaseKind {
    Buffer,
    Request,
}

impl AllocStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transfer buffers allocated and not yet released.
    pub fn live_buffers(&self) -> usize {
        self.buffers.load(Ordering::Acquire)
    }

    /// Transfer requests allocated and not yet released.
    pub fn live_requests(&self) -> usize {
        self.requests.load(Ordering::Acquire)
    }

    fn counter(&self, kind: LeaseKind) -> &AtomicUsize {
        match kind {
            LeaseKind::Buffer => &self.buffers,
            LeaseKind::Request => &self.requests,
        }
    }

    fn lease(self: &Arc<Self>, kind: LeaseKind) -> Lease {
        self.counter(kind).fetch_add(1, Ordering::AcqRel);
        Lease {
            stats: Arc::clone(self),
            kind,
        }
    }

    pub(crate) fn buffer_lease(self: &Arc<Self>) -> Lease {
        self.lease(LeaseKind::Buffer)
    }

    pub(crate) fn request_lease(self: &Arc<Self>) -> Lease {
        self.lease(LeaseKind::Request)
    }
}

/// Decrements its counter when dropped.
#[derive(Debug)]
pub(crate) struct Lease {
    stats: Arc<AllocStats>,
    kind: LeaseKind,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.stats.counter(self.kind).fetch_sub(1, Ordering::AcqRel);
    }
}

/// Fixed-size receive buffer owned by a session and lent to its request.
#[derive(Debug)]
pub struct TransferBuffer {
    data: Box<[u8]>,
    _lease: Option<Lease>,
}

impl TransferBuffer {
    /// Allocate a zeroed buffer of exactly `len` bytes.
    pub fn try_new(len: usize) -> Result<Self, BusError> {
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| BusError::NoMemory {
                what: "transfer buffer",
            })?;
        data.resize(len, 0);

        Ok(Self {
            data: data.into_boxed_slice(),
            _lease: None,
        })
    }

    /// Count this buffer in `stats` until it is dropped.
    pub fn tracked(mut self, stats: &Arc<AllocStats>) -> Self {
        self._lease = Some(stats.buffer_lease());
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}
