//! nusb-based USB bus implementation.
//!
//! Each interrupt-IN endpoint in use gets a worker thread that owns the
//! `nusb` endpoint and acts as the completion context: it submits queued
//! requests, waits for their completion and gives them back on its own
//! thread. Requests reach the worker over a channel, so [`UsbBus::enqueue`]
//! never runs a callback synchronously.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use nusb::transfer::{In, Interrupt, TransferError};
use nusb::{Endpoint, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, trace, warn};

use super::interface::UsbInterface;
use super::traits::{BusError, UsbBus, UsbDevice};
use crate::alloc::{AllocStats, TransferBuffer};
use crate::config::CaptureConfig;
use crate::descriptor::{EndpointDescriptor, InterfaceDescriptor, TransferType};
use crate::urb::{Urb, UrbStatus};

const EIO: i32 = 5;

/// An opened device.
pub struct NusbDevice {
    vid: u16,
    pid: u16,
    manufacturer: Option<String>,
    product: Option<String>,
    _device: nusb::Device,
}

impl UsbDevice for NusbDevice {
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

enum Command {
    Submit(Arc<Urb>),
    Cancel,
}

/// Handle to an endpoint worker. Dropping it closes the channel, which
/// makes the worker cancel whatever is pending and exit.
struct EndpointWorker {
    commands: Sender<Command>,
}

/// Real hardware bus for one claimed interface.
pub struct NusbBus {
    interface: Interface,
    device_id: nusb::DeviceId,
    stats: Arc<AllocStats>,
    completion_wait: Duration,
    workers: Mutex<HashMap<u8, EndpointWorker>>,
}

impl NusbBus {
    /// Open the first device matching `config` and claim the interface
    /// whose class triple matches.
    #[instrument(level = "info", skip(config), fields(vid = %format!("{:04X}", config.vendor_id), pid = %format!("{:04X}", config.product_id)))]
    pub fn open(
        config: &CaptureConfig,
    ) -> Result<(Arc<Self>, UsbInterface<NusbDevice>), BusError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| BusError::OpenFailed(e.to_string()))?
            .find(|d| d.vendor_id() == config.vendor_id && d.product_id() == config.product_id)
            .ok_or(BusError::DeviceNotFound {
                vid: config.vendor_id,
                pid: config.product_id,
            })?;

        info!(
            vendor_id = %format!("{:04X}", device_info.vendor_id()),
            product_id = %format!("{:04X}", device_info.product_id()),
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| BusError::OpenFailed(e.to_string()))?;

        let not_found = BusError::InterfaceNotFound {
            class: config.interface_class,
            subclass: config.interface_subclass,
            protocol: config.interface_protocol,
        };
        let number = device
            .active_configuration()
            .map_err(|e| BusError::OpenFailed(e.to_string()))?
            .interface_alt_settings()
            .find(|alt| {
                alt.class() == config.interface_class
                    && alt.subclass() == config.interface_subclass
                    && alt.protocol() == config.interface_protocol
            })
            .map(|alt| alt.interface_number())
            .ok_or(not_found)?;

        let interface = device
            .detach_and_claim_interface(number)
            .wait()
            .map_err(|e| BusError::ClaimInterfaceFailed {
                interface: number,
                message: e.to_string(),
            })?;

        let alt_settings: Vec<InterfaceDescriptor> =
            interface.descriptors().map(|alt| convert_alt(&alt)).collect();
        let current_alt = interface.get_alt_setting();

        debug!(
            interface = number,
            alt_settings = alt_settings.len(),
            current_alt,
            "Interface claimed"
        );

        let usb_device = Arc::new(NusbDevice {
            vid: device_info.vendor_id(),
            pid: device_info.product_id(),
            manufacturer: device_info.manufacturer_string().map(str::to_owned),
            product: device_info.product_string().map(str::to_owned),
            _device: device,
        });

        let bus = Arc::new(Self {
            interface,
            device_id: device_info.id(),
            stats: AllocStats::new(),
            completion_wait: config.completion_wait(),
            workers: Mutex::new(HashMap::new()),
        });

        Ok((bus, UsbInterface::new(usb_device, alt_settings, current_alt)))
    }

    /// Whether the opened device is still enumerated.
    pub fn is_connected(&self) -> bool {
        match list_devices().wait() {
            Ok(mut devices) => devices.any(|d| d.id() == self.device_id),
            Err(e) => {
                warn!("Failed to enumerate devices: {}", e);
                false
            }
        }
    }

    pub fn stats(&self) -> &Arc<AllocStats> {
        &self.stats
    }

    fn spawn_worker(&self, address: u8) -> Result<EndpointWorker, BusError> {
        let endpoint = self
            .interface
            .endpoint::<Interrupt, In>(address)
            .map_err(|e| BusError::ClaimEndpointFailed {
                endpoint: address,
                message: e.to_string(),
            })?;

        let (commands, rx) = mpsc::channel();
        let wait = self.completion_wait;
        thread::Builder::new()
            .name(format!("intcap-ep{:02x}", address))
            .spawn(move || run_worker(endpoint, rx, wait))?;

        debug!(endpoint = %format!("0x{:02X}", address), "Endpoint worker started");
        Ok(EndpointWorker { commands })
    }
}

impl UsbBus for NusbBus {
    type Device = NusbDevice;

    fn alloc_buffer(&self, len: usize) -> Result<TransferBuffer, BusError> {
        Ok(TransferBuffer::try_new(len)?.tracked(&self.stats))
    }

    fn alloc_urb(&self) -> Result<Urb, BusError> {
        Ok(Urb::new().tracked(&self.stats))
    }

    fn enqueue(&self, urb: &Arc<Urb>) -> Result<(), BusError> {
        let address = urb
            .pipe()
            .map(|p| p.endpoint())
            .ok_or_else(|| BusError::SubmitFailed("request is not bound".into()))?;

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if !workers.contains_key(&address) {
            let worker = self.spawn_worker(address)?;
            workers.insert(address, worker);
        }

        let sent = workers
            .get(&address)
            .map(|w| w.commands.send(Command::Submit(Arc::clone(urb))).is_ok())
            .unwrap_or(false);
        if !sent {
            // Worker exited; the endpoint is gone with it.
            workers.remove(&address);
            return Err(BusError::Disconnected);
        }
        Ok(())
    }

    fn cancel(&self, urb: &Arc<Urb>) {
        let Some(address) = urb.pipe().map(|p| p.endpoint()) else {
            return;
        };
        let workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(worker) = workers.get(&address) {
            let _ = worker.commands.send(Command::Cancel);
        }
    }
}

/// Completion context for one endpoint.
fn run_worker(mut endpoint: Endpoint<Interrupt, In>, rx: Receiver<Command>, wait: Duration) {
    let address = endpoint.endpoint_address();
    let mut current: Option<Arc<Urb>> = None;

    loop {
        // Idle: block until there is something to submit.
        if current.is_none() {
            match rx.recv() {
                Ok(Command::Submit(urb)) => {
                    submit(&mut endpoint, &urb);
                    current = Some(urb);
                }
                Ok(Command::Cancel) => continue,
                Err(_) => break,
            }
        }

        match rx.try_recv() {
            Ok(Command::Cancel) => {
                trace!(endpoint = %format!("0x{:02X}", address), "Cancelling pending transfer");
                endpoint.cancel_all();
            }
            Ok(Command::Submit(_)) => {
                warn!(endpoint = %format!("0x{:02X}", address), "Submit while a transfer is pending, ignoring");
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                endpoint.cancel_all();
                drain(&mut endpoint);
                break;
            }
        }

        let Some(completion) = endpoint.wait_next_complete(wait) else {
            continue;
        };

        if let Some(urb) = current.take() {
            let status = status_of(completion.status);
            trace!(endpoint = %format!("0x{:02X}", address), %status, len = completion.actual_len, "Transfer complete");
            urb.giveback(status, received(&completion.buffer, completion.actual_len));
        }
    }

    debug!(endpoint = %format!("0x{:02X}", address), "Endpoint worker exiting");
}

/// Bytes of a completed IN transfer that the device actually wrote.
fn received(data: &[u8], actual_len: usize) -> &[u8] {
    &data[..actual_len.min(data.len())]
}

fn submit(endpoint: &mut Endpoint<Interrupt, In>, urb: &Urb) {
    let len = urb.transfer_buffer_length();
    let mut buffer = endpoint.allocate(len);
    buffer.set_requested_len(len);
    endpoint.submit(buffer);
}

/// Collect cancelled transfers before the endpoint is dropped.
fn drain(endpoint: &mut Endpoint<Interrupt, In>) {
    while endpoint.pending() > 0 {
        if endpoint.wait_next_complete(Duration::from_secs(1)).is_none() {
            warn!("Timed out waiting for cancelled transfer");
            break;
        }
    }
}

fn status_of(result: Result<(), TransferError>) -> UrbStatus {
    match result {
        Ok(()) => UrbStatus::Completed,
        Err(TransferError::Cancelled) => UrbStatus::Cancelled,
        Err(TransferError::Stall) => UrbStatus::Stall,
        Err(TransferError::Disconnected) => UrbStatus::Disconnected,
        Err(_) => UrbStatus::Other(-EIO),
    }
}

fn convert_alt(alt: &nusb::descriptors::InterfaceDescriptor) -> InterfaceDescriptor {
    let base = InterfaceDescriptor::new(
        alt.interface_number(),
        alt.alternate_setting(),
        alt.class(),
        alt.subclass(),
        alt.protocol(),
    );

    alt.endpoints().fold(base, |desc, ep| {
        desc.with_endpoint(EndpointDescriptor::new(
            ep.address(),
            transfer_type(ep.transfer_type()).attributes(),
            ep.max_packet_size() as u16,
            ep.interval(),
        ))
    })
}

fn transfer_type(t: nusb::descriptors::TransferType) -> TransferType {
    use nusb::descriptors::TransferType as Nusb;

    match t {
        Nusb::Control => TransferType::Control,
        Nusb::Isochronous => TransferType::Isochronous,
        Nusb::Bulk => TransferType::Bulk,
        Nusb::Interrupt => TransferType::Interrupt,
    }
}
