use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{Result, bail};
use clap::Parser;
use intcap_core::{
    BusError, CaptureConfig, CaptureDriver, NusbBus, NusbDevice, Registration, UsbInterface,
};
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "USB interrupt endpoint capture tool", long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Vendor id (hex)
    #[arg(long, value_parser = parse_hex_u16)]
    vid: Option<u16>,

    /// Product id (hex)
    #[arg(long, value_parser = parse_hex_u16)]
    pid: Option<u16>,

    /// Interface class (hex)
    #[arg(long, value_parser = parse_hex_u8)]
    class: Option<u8>,

    /// Interface subclass (hex)
    #[arg(long, value_parser = parse_hex_u8)]
    subclass: Option<u8>,

    /// Interface protocol (hex)
    #[arg(long, value_parser = parse_hex_u8)]
    protocol: Option<u8>,

    /// Write the effective configuration to this path
    #[arg(long)]
    save_config: Option<PathBuf>,

    /// Exit after the first device is removed
    #[arg(long)]
    once: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value '{}': {}", s, e))
}

fn parse_hex_u8(s: &str) -> Result<u8, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value '{}': {}", s, e))
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("Starting intcap (nusb backend)...");

    if let Err(e) = run(&args) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    let config = effective_config(args)?;

    if let Some(path) = &args.save_config {
        config.save_to_file(path)?;
        info!(path = %path.display(), "Configuration saved");
    }

    info!(
        driver = %config.driver_name,
        vid = %format!("{:04X}", config.vendor_id),
        pid = %format!("{:04X}", config.product_id),
        class = config.interface_class,
        subclass = config.interface_subclass,
        protocol = config.interface_protocol,
        "Capture configuration"
    );

    loop {
        let (bus, interface) = wait_for_device(&config)?;
        capture(&config, bus, interface)?;

        if args.once {
            break;
        }
    }

    Ok(())
}

fn effective_config(args: &Args) -> Result<CaptureConfig> {
    let mut config = match &args.config {
        Some(path) => CaptureConfig::load_from_file(path)?,
        None => CaptureConfig::default(),
    };

    if let Some(vid) = args.vid {
        config.vendor_id = vid;
    }
    if let Some(pid) = args.pid {
        config.product_id = pid;
    }
    if let Some(class) = args.class {
        config.interface_class = class;
    }
    if let Some(subclass) = args.subclass {
        config.interface_subclass = subclass;
    }
    if let Some(protocol) = args.protocol {
        config.interface_protocol = protocol;
    }

    Ok(config)
}

fn wait_for_device(config: &CaptureConfig) -> Result<(Arc<NusbBus>, UsbInterface<NusbDevice>)> {
    info!("Waiting for device...");
    let mut poll_count = 0u64;

    loop {
        poll_count += 1;

        match NusbBus::open(config) {
            Ok(opened) => {
                info!("Device found after {} polls", poll_count);
                return Ok(opened);
            }
            Err(BusError::DeviceNotFound { .. }) => thread::sleep(config.hotplug_poll()),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Attach, watch until the device goes away or polling stops, detach.
fn capture(
    config: &CaptureConfig,
    bus: Arc<NusbBus>,
    interface: UsbInterface<NusbDevice>,
) -> Result<()> {
    let interface = Arc::new(interface);
    let registration = Registration::register(CaptureDriver::new(Arc::clone(&bus), config));

    if !registration.attach(Arc::clone(&interface))? {
        bail!(
            "Interface {} does not match driver {}",
            interface.number(),
            config.driver_name
        );
    }

    loop {
        thread::sleep(config.hotplug_poll());

        if !bus.is_connected() {
            info!("Device removed");
            break;
        }

        let polling = registration
            .driver()
            .session(&interface)
            .is_some_and(|s| s.polling);
        if !polling {
            warn!("Polling stopped, releasing device");
            break;
        }
    }

    if let Some(session) = registration.driver().session(&interface) {
        info!(
            completions = session.completions,
            bytes = session.bytes_captured,
            errors = session.transfer_errors,
            "Capture statistics"
        );
    }

    registration.detach(&interface);
    registration.deregister();

    let stats = bus.stats();
    if stats.live_buffers() != 0 || stats.live_requests() != 0 {
        warn!(
            buffers = stats.live_buffers(),
            requests = stats.live_requests(),
            "Transfer resources still allocated after detach"
        );
    } else {
        debug!("All transfer resources released");
    }

    Ok(())
}
