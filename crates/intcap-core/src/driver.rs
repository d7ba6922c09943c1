//! Capture driver: attach, detach and the glue to the bus.
//!
//! Attach acquires, in order, a device reference, the receive buffer and
//! the transfer request, then submits. Every step that fails returns
//! early and the values acquired so far drop in reverse order, so a failed
//! attach leaves nothing behind and nothing reachable from the interface.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, instrument};

use crate::bus::{BusError, UsbBus, UsbDevice, UsbInterface};
use crate::config::CaptureConfig;
use crate::events::{CaptureEvent, CaptureObserver, TracingObserver};
use crate::registry::{DeviceId, UsbDriver};
use crate::resolver;
use crate::session::{DeviceSession, SessionStats};
use crate::urb::SubmitError;

#[derive(Error, Debug)]
pub enum AttachError {
    #[error("Interface {interface} has no interrupt IN endpoint")]
    NoCompatibleEndpoint { interface: u8 },

    #[error("Interface {interface} is already bound")]
    AlreadyBound { interface: u8 },

    #[error("Failed to allocate transfer buffer: {0}")]
    BufferAlloc(#[source] BusError),

    #[error("Failed to allocate transfer request: {0}")]
    RequestAlloc(#[source] BusError),

    #[error("Failed to submit transfer request: {0}")]
    Submit(#[source] SubmitError),
}

impl AttachError {
    /// Negative errno equivalent reported to the bus.
    pub fn code(&self) -> i32 {
        match self {
            AttachError::NoCompatibleEndpoint { .. } => -19, // ENODEV
            AttachError::AlreadyBound { .. } => -16,         // EBUSY
            AttachError::BufferAlloc(_) | AttachError::RequestAlloc(_) => -12, // ENOMEM
            AttachError::Submit(e) => e.code(),
        }
    }
}

/// Interrupt-IN capture driver.
pub struct CaptureDriver<B: UsbBus> {
    name: String,
    id_table: Vec<DeviceId>,
    bus: Arc<B>,
    observer: Arc<dyn CaptureObserver>,
}

impl<B: UsbBus + 'static> CaptureDriver<B> {
    /// Create a driver that logs captured data with tracing.
    pub fn new(bus: Arc<B>, config: &CaptureConfig) -> Self {
        Self::with_observer(bus, config, Arc::new(TracingObserver))
    }

    pub fn with_observer(
        bus: Arc<B>,
        config: &CaptureConfig,
        observer: Arc<dyn CaptureObserver>,
    ) -> Self {
        Self {
            name: config.driver_name.clone(),
            id_table: vec![config.device_id()],
            bus,
            observer,
        }
    }

    pub fn bus(&self) -> &Arc<B> {
        &self.bus
    }

    /// Snapshot of the session bound to `interface`, if any.
    pub fn session(&self, interface: &UsbInterface<B::Device>) -> Option<SessionStats> {
        interface.with_intfdata(|s: &Arc<DeviceSession<B>>| s.stats())
    }

    /// Bind to `interface` and start polling its interrupt-IN endpoint.
    #[instrument(skip_all, fields(driver = %self.name, interface = interface.number()))]
    pub fn attach(&self, interface: &UsbInterface<B::Device>) -> Result<(), AttachError> {
        let number = interface.number();
        if interface.has_intfdata() {
            return Err(AttachError::AlreadyBound { interface: number });
        }

        let device = interface.get_device();
        info!(
            "Probe called for device: {}:{}",
            device.manufacturer().unwrap_or("Unknown"),
            device.product().unwrap_or("Unknown")
        );

        resolver::log_alt_settings(interface);

        let endpoint = interface
            .cur_altsetting()
            .and_then(resolver::find_int_in)
            .copied()
            .ok_or_else(|| {
                error!("Could not find interrupt IN endpoint");
                AttachError::NoCompatibleEndpoint { interface: number }
            })?;

        let buffer = self
            .bus
            .alloc_buffer(endpoint.max_packet_size())
            .map_err(AttachError::BufferAlloc)?;

        let urb = self.bus.alloc_urb().map_err(AttachError::RequestAlloc)?;

        let session = DeviceSession::bind(
            Arc::clone(&self.bus),
            device,
            number,
            endpoint,
            buffer,
            urb,
            Arc::clone(&self.observer),
        );

        session.urb().submit(&*self.bus).map_err(|e| {
            error!(code = e.code(), "Failed to submit URB: {}", e);
            AttachError::Submit(e)
        })?;

        let attached = CaptureEvent::Attached {
            vid: session.device().vendor_id(),
            pid: session.device().product_id(),
            interface: number,
            endpoint: endpoint.address(),
            max_packet_size: endpoint.max_packet_size(),
            interval: endpoint.interval(),
        };
        if let Err(session) = interface.try_set_intfdata(session) {
            error!("Interface was bound concurrently, releasing new session");
            session.release();
            return Err(AttachError::AlreadyBound { interface: number });
        }
        self.observer.on_event(&attached);

        Ok(())
    }

    /// Tear down the session bound to `interface`. Idempotent.
    #[instrument(skip_all, fields(driver = %self.name, interface = interface.number()))]
    pub fn detach(&self, interface: &UsbInterface<B::Device>) {
        let Some(session) = interface.take_intfdata::<Arc<DeviceSession<B>>>() else {
            error!("Disconnect called with no session");
            return;
        };

        info!("Device disconnecting...");
        let detached = CaptureEvent::Detached {
            vid: session.device().vendor_id(),
            pid: session.device().product_id(),
            interface: interface.number(),
        };

        session.release();
        self.observer.on_event(&detached);
    }
}

impl<B: UsbBus + 'static> UsbDriver<B> for CaptureDriver<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn id_table(&self) -> &[DeviceId] {
        &self.id_table
    }

    fn probe(&self, interface: &UsbInterface<B::Device>) -> Result<(), AttachError> {
        self.attach(interface)
    }

    fn disconnect(&self, interface: &UsbInterface<B::Device>) {
        self.detach(interface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MockBus, MockDevice};
    use crate::descriptor::{EndpointDescriptor, InterfaceDescriptor};
    use crate::registry::Registration;
    use crate::urb::UrbStatus;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    const BULK_OUT: EndpointDescriptor = EndpointDescriptor::new(0x02, 0x02, 64, 0);
    const INT_IN: EndpointDescriptor = EndpointDescriptor::new(0x81, 0x03, 8, 10);

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<CaptureEvent>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<CaptureEvent> {
            self.events.lock().unwrap().clone()
        }

        fn data(&self) -> Vec<Vec<u8>> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    CaptureEvent::Data { data, .. } => Some(data),
                    _ => None,
                })
                .collect()
        }

        fn count(&self, pred: impl Fn(&CaptureEvent) -> bool) -> usize {
            self.events().iter().filter(|e| pred(e)).count()
        }
    }

    impl CaptureObserver for Recorder {
        fn on_event(&self, event: &CaptureEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    struct Fixture {
        bus: Arc<MockBus>,
        recorder: Arc<Recorder>,
        driver: CaptureDriver<MockBus>,
        device: Arc<MockDevice>,
    }

    impl Fixture {
        fn new() -> Self {
            let bus = Arc::new(MockBus::new());
            let recorder = Arc::new(Recorder::default());
            let driver = CaptureDriver::with_observer(
                Arc::clone(&bus),
                &CaptureConfig::default(),
                Arc::clone(&recorder) as Arc<dyn CaptureObserver>,
            );
            let device = Arc::new(
                MockDevice::new(0x0416, 0xA0F8).with_strings("Holtek", "USB Keyboard"),
            );
            Self {
                bus,
                recorder,
                driver,
                device,
            }
        }

        fn interface(&self, endpoints: &[EndpointDescriptor]) -> UsbInterface<MockDevice> {
            let alt = endpoints
                .iter()
                .fold(InterfaceDescriptor::new(0, 0, 3, 1, 1), |a, ep| {
                    a.with_endpoint(*ep)
                });
            UsbInterface::new(Arc::clone(&self.device), vec![alt], 0)
        }

        fn assert_nothing_held(&self) {
            assert_eq!(Arc::strong_count(&self.device), 2, "device refs: test + interface");
            assert_eq!(self.bus.stats().live_buffers(), 0);
            assert_eq!(self.bus.stats().live_requests(), 0);
            assert_eq!(self.bus.in_flight(), 0);
        }
    }

    #[test]
    fn test_attach_selects_interrupt_in() {
        let fx = Fixture::new();
        let intf = fx.interface(&[BULK_OUT, INT_IN]);

        fx.driver.attach(&intf).unwrap();

        let session = fx.driver.session(&intf).unwrap();
        assert_eq!(session.endpoint_address, 0x81);
        assert_eq!(session.max_packet_size, 8);
        assert_eq!(session.poll_interval, 10);
        assert_eq!(session.transfer_buffer_length, 8);
        assert!(session.polling);

        assert_eq!(fx.bus.in_flight(), 1);
        assert_eq!(fx.bus.stats().live_buffers(), 1);
        assert_eq!(fx.bus.stats().live_requests(), 1);
        // test + interface + session
        assert_eq!(Arc::strong_count(&fx.device), 3);
        assert_eq!(
            fx.recorder.count(|e| matches!(e, CaptureEvent::Attached { endpoint: 0x81, max_packet_size: 8, .. })),
            1
        );
    }

    #[test]
    fn test_attach_without_interrupt_in_fails() {
        let fx = Fixture::new();
        let intf = fx.interface(&[BULK_OUT]);

        let err = fx.driver.attach(&intf).unwrap_err();
        assert!(matches!(err, AttachError::NoCompatibleEndpoint { interface: 0 }));
        assert_eq!(err.code(), -19);

        fx.assert_nothing_held();
        assert_eq!(fx.bus.submissions(), 0);
        assert!(!intf.has_intfdata());
        assert!(fx.recorder.events().is_empty());
    }

    #[test]
    fn test_only_current_alt_setting_is_considered() {
        let fx = Fixture::new();
        let alts = vec![
            InterfaceDescriptor::new(0, 0, 3, 1, 1).with_endpoint(BULK_OUT),
            InterfaceDescriptor::new(0, 1, 3, 1, 1).with_endpoint(INT_IN),
        ];
        let intf = UsbInterface::new(Arc::clone(&fx.device), alts.clone(), 0);
        assert!(matches!(
            fx.driver.attach(&intf),
            Err(AttachError::NoCompatibleEndpoint { .. })
        ));
        fx.assert_nothing_held();

        let intf = UsbInterface::new(Arc::clone(&fx.device), alts, 1);
        fx.driver.attach(&intf).unwrap();
        assert_eq!(fx.driver.session(&intf).unwrap().endpoint_address, 0x81);
    }

    #[test]
    fn test_buffer_allocation_failure_unwinds() {
        let fx = Fixture::new();
        let intf = fx.interface(&[INT_IN]);
        fx.bus.fail_buffer_alloc(true);

        let err = fx.driver.attach(&intf).unwrap_err();
        assert!(matches!(err, AttachError::BufferAlloc(_)));
        assert_eq!(err.code(), -12);
        fx.assert_nothing_held();
        assert!(!intf.has_intfdata());
    }

    #[test]
    fn test_request_allocation_failure_unwinds() {
        let fx = Fixture::new();
        let intf = fx.interface(&[INT_IN]);
        fx.bus.fail_urb_alloc(true);

        assert!(matches!(
            fx.driver.attach(&intf),
            Err(AttachError::RequestAlloc(_))
        ));
        fx.assert_nothing_held();
        assert!(!intf.has_intfdata());
    }

    #[test]
    fn test_submit_failure_unwinds() {
        let fx = Fixture::new();
        let intf = fx.interface(&[INT_IN]);
        fx.bus.fail_submit(true);

        assert!(matches!(
            fx.driver.attach(&intf),
            Err(AttachError::Submit(SubmitError::Bus(_)))
        ));
        fx.assert_nothing_held();
        assert!(!intf.has_intfdata());
        assert!(fx.recorder.events().is_empty());
    }

    #[test]
    fn test_attach_twice_is_rejected() {
        let fx = Fixture::new();
        let intf = fx.interface(&[INT_IN]);
        fx.driver.attach(&intf).unwrap();

        assert!(matches!(
            fx.driver.attach(&intf),
            Err(AttachError::AlreadyBound { .. })
        ));
        assert_eq!(fx.bus.in_flight(), 1);
        assert_eq!(fx.bus.stats().live_buffers(), 1);
    }

    #[test]
    fn test_surfaces_actual_length() {
        let fx = Fixture::new();
        let intf = fx.interface(&[BULK_OUT, INT_IN]);
        fx.driver.attach(&intf).unwrap();

        fx.bus.complete_next(UrbStatus::Completed, &[0x00, 0x00, 0x04]);
        fx.bus
            .complete_next(UrbStatus::Completed, &[0x02, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00]);
        fx.bus.complete_next(UrbStatus::Completed, &[]);

        assert_eq!(
            fx.recorder.data(),
            vec![
                vec![0x00, 0x00, 0x04],
                vec![0x02, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00],
                vec![],
            ]
        );
        let session = fx.driver.session(&intf).unwrap();
        assert_eq!(session.bytes_captured, 11);
        assert_eq!(session.completions, 3);
        assert_eq!(fx.bus.in_flight(), 1);
    }

    #[test]
    fn test_oversized_completion_is_reported_not_surfaced() {
        let fx = Fixture::new();
        let intf = fx.interface(&[INT_IN]);
        fx.driver.attach(&intf).unwrap();

        assert!(fx.bus.complete_next(UrbStatus::Completed, &[0x55; 12]));

        assert!(fx.recorder.data().is_empty());
        assert_eq!(
            fx.recorder.count(|e| matches!(
                e,
                CaptureEvent::TransferError {
                    endpoint: 0x81,
                    status: UrbStatus::Overflow
                }
            )),
            1
        );
        assert_eq!(fx.bus.in_flight(), 1);
        assert_eq!(fx.driver.session(&intf).unwrap().bytes_captured, 0);
    }

    #[test]
    fn test_error_completion_logs_and_resubmits() {
        let fx = Fixture::new();
        let intf = fx.interface(&[INT_IN]);
        fx.driver.attach(&intf).unwrap();

        fx.bus.complete_next(UrbStatus::Protocol, &[0xDE, 0xAD]);

        assert!(fx.recorder.data().is_empty());
        assert_eq!(
            fx.recorder.count(|e| matches!(
                e,
                CaptureEvent::TransferError {
                    endpoint: 0x81,
                    status: UrbStatus::Protocol
                }
            )),
            1
        );
        assert_eq!(fx.bus.in_flight(), 1);
        assert_eq!(fx.bus.submissions(), 2);

        let session = fx.driver.session(&intf).unwrap();
        assert!(session.polling);
        assert_eq!(session.transfer_errors, 1);
    }

    #[test]
    fn test_outstanding_requests_never_exceed_one() {
        let fx = Fixture::new();
        let intf = fx.interface(&[INT_IN]);

        for round in 0..3 {
            fx.driver.attach(&intf).unwrap();
            for i in 0..50u8 {
                let status = if i % 7 == 0 {
                    UrbStatus::Stall
                } else {
                    UrbStatus::Completed
                };
                assert!(fx.bus.complete_next(status, &[i, round]));
                assert_eq!(fx.bus.in_flight(), 1);
            }
            fx.driver.detach(&intf);
            assert_eq!(fx.bus.in_flight(), 0);
        }

        assert_eq!(fx.bus.peak_in_flight(), 1);
        fx.assert_nothing_held();
    }

    #[test]
    fn test_detach_releases_everything() {
        let fx = Fixture::new();
        let intf = fx.interface(&[INT_IN]);
        fx.driver.attach(&intf).unwrap();
        fx.bus.complete_next(UrbStatus::Completed, &[1, 2]);

        fx.driver.detach(&intf);

        fx.assert_nothing_held();
        assert!(!intf.has_intfdata());
        assert_eq!(fx.bus.cancellations(), 1);
        assert_eq!(
            fx.recorder.count(|e| matches!(e, CaptureEvent::Detached { .. })),
            1
        );
    }

    #[test]
    fn test_detach_is_idempotent() {
        let fx = Fixture::new();
        let intf = fx.interface(&[INT_IN]);
        fx.driver.attach(&intf).unwrap();

        fx.driver.detach(&intf);
        fx.driver.detach(&intf);

        fx.assert_nothing_held();
        assert_eq!(fx.bus.cancellations(), 1);
        assert_eq!(
            fx.recorder.count(|e| matches!(e, CaptureEvent::Detached { .. })),
            1
        );

        // Detach on a never-attached interface is a no-op too
        let other = fx.interface(&[INT_IN]);
        fx.driver.detach(&other);
    }

    #[test]
    fn test_resubmit_failure_stops_polling() {
        let fx = Fixture::new();
        let intf = fx.interface(&[INT_IN]);
        fx.driver.attach(&intf).unwrap();

        fx.bus.fail_submit(true);
        fx.bus.complete_next(UrbStatus::Completed, &[7]);

        assert_eq!(fx.recorder.data(), vec![vec![7]]);
        assert_eq!(fx.bus.in_flight(), 0);
        assert_eq!(
            fx.recorder.count(|e| matches!(e, CaptureEvent::PollingStopped { .. })),
            1
        );
        assert!(!fx.driver.session(&intf).unwrap().polling);

        // No inline retry: nothing left to complete
        assert!(!fx.bus.complete_next(UrbStatus::Completed, &[8]));

        fx.driver.detach(&intf);
        fx.assert_nothing_held();
        assert_eq!(fx.bus.cancellations(), 0);
    }

    #[test]
    fn test_disconnected_completion_stops_polling() {
        let fx = Fixture::new();
        let intf = fx.interface(&[INT_IN]);
        fx.driver.attach(&intf).unwrap();

        fx.bus.complete_next(UrbStatus::Disconnected, &[]);

        assert_eq!(fx.bus.in_flight(), 0);
        assert!(!fx.driver.session(&intf).unwrap().polling);
        assert_eq!(
            fx.recorder.count(|e| matches!(e, CaptureEvent::PollingStopped { .. })),
            1
        );

        fx.driver.detach(&intf);
        fx.assert_nothing_held();
    }

    #[test]
    fn test_snapshot_does_not_outlive_detach() {
        let fx = Fixture::new();
        let intf = fx.interface(&[INT_IN]);
        fx.driver.attach(&intf).unwrap();

        let snapshot = fx.driver.session(&intf).unwrap();
        fx.driver.detach(&intf);

        assert!(snapshot.polling);
        assert!(fx.driver.session(&intf).is_none());
        fx.assert_nothing_held();
    }

    #[test]
    fn test_shared_session_is_unbound_on_release() {
        let fx = Fixture::new();
        let intf = fx.interface(&[INT_IN]);
        fx.driver.attach(&intf).unwrap();

        let held = intf
            .with_intfdata(|s: &Arc<DeviceSession<MockBus>>| Arc::clone(s))
            .unwrap();
        fx.driver.detach(&intf);

        // Buffer and callback are gone even though the session is still shared
        assert_eq!(fx.bus.stats().live_buffers(), 0);
        assert_eq!(fx.bus.in_flight(), 0);
        assert!(!held.stats().polling);
        assert!(matches!(
            held.urb().submit(&*fx.bus),
            Err(SubmitError::Unbound)
        ));
        assert_eq!(fx.bus.in_flight(), 0);

        drop(held);
        fx.assert_nothing_held();
    }

    /// Bus whose enqueue binds the interface behind the driver's back,
    /// between the bound check and publication.
    struct RacingBus {
        inner: MockBus,
        interface: Mutex<Option<Arc<UsbInterface<MockDevice>>>>,
    }

    impl UsbBus for RacingBus {
        type Device = MockDevice;

        fn alloc_buffer(&self, len: usize) -> Result<crate::alloc::TransferBuffer, BusError> {
            self.inner.alloc_buffer(len)
        }

        fn alloc_urb(&self) -> Result<crate::urb::Urb, BusError> {
            self.inner.alloc_urb()
        }

        fn enqueue(&self, urb: &Arc<crate::urb::Urb>) -> Result<(), BusError> {
            self.inner.enqueue(urb)?;
            if let Some(intf) = self.interface.lock().unwrap().take() {
                intf.set_intfdata("bound elsewhere");
            }
            Ok(())
        }

        fn cancel(&self, urb: &Arc<crate::urb::Urb>) {
            self.inner.cancel(urb)
        }
    }

    #[test]
    fn test_concurrent_bind_is_not_overwritten() {
        let device = Arc::new(MockDevice::new(0x0416, 0xA0F8));
        let alt = InterfaceDescriptor::new(0, 0, 3, 1, 1).with_endpoint(INT_IN);
        let intf = Arc::new(UsbInterface::new(Arc::clone(&device), vec![alt], 0));
        let bus = Arc::new(RacingBus {
            inner: MockBus::new(),
            interface: Mutex::new(Some(Arc::clone(&intf))),
        });
        let recorder = Arc::new(Recorder::default());
        let driver = CaptureDriver::with_observer(
            Arc::clone(&bus),
            &CaptureConfig::default(),
            Arc::clone(&recorder) as Arc<dyn CaptureObserver>,
        );

        assert!(matches!(
            driver.attach(&intf),
            Err(AttachError::AlreadyBound { interface: 0 })
        ));

        // The other binding survives and the new session is fully released
        assert_eq!(intf.with_intfdata(|s: &&str| *s), Some("bound elsewhere"));
        assert_eq!(bus.inner.in_flight(), 0);
        assert_eq!(bus.inner.cancellations(), 1);
        assert_eq!(bus.inner.stats().live_buffers(), 0);
        assert_eq!(bus.inner.stats().live_requests(), 0);
        assert_eq!(Arc::strong_count(&device), 2);
        assert!(recorder.events().is_empty());
    }

    /// Observer that flags any event delivered after the session's buffer
    /// was released.
    struct ReleaseGuard {
        bus: Arc<MockBus>,
        released: AtomicBool,
        late: AtomicUsize,
        seen: AtomicUsize,
    }

    impl CaptureObserver for ReleaseGuard {
        fn on_event(&self, event: &CaptureEvent) {
            if let CaptureEvent::Data { .. } | CaptureEvent::TransferError { .. } = event {
                self.seen.fetch_add(1, Ordering::SeqCst);
                if self.released.load(Ordering::SeqCst) || self.bus.stats().live_buffers() == 0 {
                    self.late.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }

    #[test]
    fn test_no_completion_after_release_under_concurrent_injection() {
        let bus = Arc::new(MockBus::new());
        let guard = Arc::new(ReleaseGuard {
            bus: Arc::clone(&bus),
            released: AtomicBool::new(false),
            late: AtomicUsize::new(0),
            seen: AtomicUsize::new(0),
        });
        let driver = CaptureDriver::with_observer(
            Arc::clone(&bus),
            &CaptureConfig::default(),
            Arc::clone(&guard) as Arc<dyn CaptureObserver>,
        );
        let device = Arc::new(MockDevice::new(0x0416, 0xA0F8));
        let alt = InterfaceDescriptor::new(0, 0, 3, 1, 1).with_endpoint(INT_IN);
        let intf = UsbInterface::new(Arc::clone(&device), vec![alt], 0);

        for _ in 0..20 {
            guard.released.store(false, Ordering::SeqCst);
            driver.attach(&intf).unwrap();

            let stop = Arc::new(AtomicBool::new(false));
            let injectors: Vec<_> = (0..3)
                .map(|i| {
                    let bus = Arc::clone(&bus);
                    let stop = Arc::clone(&stop);
                    thread::spawn(move || {
                        while !stop.load(Ordering::SeqCst) {
                            let status = if i == 2 {
                                UrbStatus::Overflow
                            } else {
                                UrbStatus::Completed
                            };
                            bus.complete_next(status, &[i as u8; 8]);
                            thread::yield_now();
                        }
                    })
                })
                .collect();

            thread::sleep(Duration::from_millis(5));
            driver.detach(&intf);
            guard.released.store(true, Ordering::SeqCst);

            // Keep injecting for a while after release
            thread::sleep(Duration::from_millis(5));
            stop.store(true, Ordering::SeqCst);
            for injector in injectors {
                injector.join().unwrap();
            }

            assert_eq!(bus.in_flight(), 0);
            assert_eq!(bus.stats().live_buffers(), 0);
            assert_eq!(bus.stats().live_requests(), 0);
        }

        assert_eq!(guard.late.load(Ordering::SeqCst), 0);
        assert!(guard.seen.load(Ordering::SeqCst) > 0);
        assert_eq!(bus.peak_in_flight(), 1);
        assert_eq!(Arc::strong_count(&device), 2);
    }

    #[test]
    fn test_registration_drives_lifecycle() {
        let fx = Fixture::new();
        let intf = Arc::new(fx.interface(&[INT_IN]));
        let bus = Arc::clone(&fx.bus);

        let reg = Registration::register(fx.driver);
        assert!(reg.attach(Arc::clone(&intf)).unwrap());
        assert_eq!(bus.in_flight(), 1);

        // Unload with the device still attached
        drop(reg);
        assert_eq!(bus.in_flight(), 0);
        assert_eq!(bus.stats().live_buffers(), 0);
        assert_eq!(bus.stats().live_requests(), 0);
        assert!(!intf.has_intfdata());
    }
}
