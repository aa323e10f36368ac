//! usbh-sim
//!
//! Runs the USB host runtime against the simulated controller. Devices are
//! hot-plugged from a worker thread created through the threading port, so
//! every event crosses the IRQ line exactly as it would from a real
//! controller interrupt.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::setup_logging;
use common::usb_types::DeviceAddress;
use host::config::{SimCdcConfig, SimDeviceConfig, SimHidConfig, SimMscConfig};
use host::sim::{SimController, SimHandle, keyboard_report};
use host::{CdcHandle, HidHandle, HostConfig, IRQ_REPORT, IRQ_RX, IrqEvent, IrqHandler, MscHandle, UsbHost};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use threading::{StdKernel, ThreadPort, ThreadStatus};
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usbh-sim")]
#[command(
    author,
    version,
    about = "USB host runtime simulator - exercise the class bindings without hardware"
)]
#[command(long_about = "
Drives the USB host runtime with a simulated host controller. Configured
devices are plugged in from a worker thread; CDC and HID activity is logged
through IRQ handlers and every class instance gets a short self-check.

EXAMPLES:
    # Run with the built-in demo devices for 10 seconds
    usbh-sim

    # Run with custom config
    usbh-sim --config /path/to/host.toml

    # Plug the configured devices, list them and exit
    usbh-sim --list-devices

    # Run for a minute with debug logging
    usbh-sim --duration 60 --log-level debug

CONFIGURATION:
    The simulator looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbh/host.toml
    3. /etc/usbh/host.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Plug the simulated devices, list them and exit
    #[arg(long)]
    list_devices: bool,

    /// How long to run the monitor loop, in seconds
    #[arg(short, long, value_name = "SECS", default_value_t = 10)]
    duration: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let mut config = HostConfig::default();
        config.sim.devices = demo_devices();
        let path = HostConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        HostConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        HostConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.host.log_level.clone());
    setup_logging(&log_level).context("Failed to setup logging")?;

    info!("usbh-sim v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    if config.sim.devices.is_empty() {
        info!("No simulated devices configured, using the demo set");
        config.sim.devices = demo_devices();
    }

    let (controller, hw) = SimController::new();
    let devices = config.sim.devices.clone();
    let plug_delay = config.sim.plug_delay.unwrap_or(Duration::from_millis(50));
    let threads = ThreadPort::init(Arc::new(StdKernel::new()), config.threading.clone(), None)
        .context("Failed to initialize threading")?;

    let mut usb = UsbHost::new(Box::new(controller), config).context("Failed to create USB host")?;
    usb.active(true).context("Failed to activate USB host")?;

    let duration = if args.list_devices {
        Duration::ZERO
    } else {
        Duration::from_secs(args.duration)
    };

    let stop = Arc::new(AtomicBool::new(false));
    let worker = {
        let hw = hw.clone();
        let stop = Arc::clone(&stop);
        threads
            .create_thread_ex(
                move |ctx| {
                    ctx.start();
                    run_hardware(&hw, &devices, plug_delay, &stop);
                },
                0,
                0,
                threads.config().priority,
                "sim-hw",
            )
            .context("Failed to start simulated hardware thread")?
    };

    let expected = usb.config().sim.devices.len();
    wait_for_devices(&mut usb, expected, Duration::from_secs(2));

    let result = if args.list_devices {
        list_devices(&mut usb)
    } else {
        monitor(&mut usb, duration)
    };

    stop.store(true, Ordering::Release);
    let finished = wait_finished(&threads, &worker.id, Duration::from_secs(2));
    if !finished {
        warn!("Hardware thread did not finish, aborting it");
    }
    threads.deinit();

    print_summary(&usb, &hw);
    usb.deinit();

    result
}

fn demo_devices() -> Vec<SimDeviceConfig> {
    vec![
        SimDeviceConfig {
            address: 1,
            vendor_id: 0x2E8A,
            product_id: 0x000A,
            class: 0xEF,
            subclass: 0x02,
            protocol: 0x01,
            manufacturer: Some("Raspberry Pi".to_string()),
            product: Some("Pico".to_string()),
            serial: Some("E66118604B1F5A2E".to_string()),
            cdc: vec![SimCdcConfig {
                index: 0,
                echo: true,
            }],
            msc: Vec::new(),
            hid: Vec::new(),
        },
        SimDeviceConfig {
            address: 2,
            vendor_id: 0x0781,
            product_id: 0x5581,
            class: 0,
            subclass: 0,
            protocol: 0,
            manufacturer: Some("SanDisk".to_string()),
            product: Some("Ultra".to_string()),
            serial: None,
            cdc: Vec::new(),
            msc: vec![SimMscConfig {
                lun: 0,
                block_size: 512,
                block_count: 1000,
                read_only: false,
            }],
            hid: Vec::new(),
        },
        SimDeviceConfig {
            address: 3,
            vendor_id: 0x046D,
            product_id: 0xC31C,
            class: 0,
            subclass: 0,
            protocol: 0,
            manufacturer: Some("Logitech".to_string()),
            product: Some("USB Keyboard".to_string()),
            serial: None,
            cdc: Vec::new(),
            msc: Vec::new(),
            hid: vec![SimHidConfig {
                instance: 0,
                protocol: 1,
                report_descriptor: Vec::new(),
            }],
        },
    ]
}

/// Body of the simulated hardware thread
fn run_hardware(hw: &SimHandle, devices: &[SimDeviceConfig], plug_delay: Duration, stop: &AtomicBool) {
    std::thread::sleep(plug_delay);
    for device in devices {
        match hw.plug(device) {
            Some(addr) => debug!("Plugged simulated device {}", addr),
            None => error!("Invalid simulated device address {}", device.address),
        }
    }

    // Keep the bus busy: keystrokes on every HID, a line on every CDC.
    let mut tick: u8 = 0;
    while !stop.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(250));
        tick = tick.wrapping_add(1);
        for device in devices {
            let Some(addr) = DeviceAddress::new(device.address) else {
                continue;
            };
            for hid in &device.hid {
                hw.hid_report(addr, hid.instance, &keyboard_report(0x04 + tick % 26));
            }
            for cdc in &device.cdc {
                hw.cdc_receive(cdc.index, format!("tick {}\r\n", tick).as_bytes());
            }
        }
    }
}

fn wait_for_devices(usb: &mut UsbHost, expected: usize, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while usb.devices().len() < expected && Instant::now() < deadline {
        usb.wait_ms(10);
    }
    if usb.devices().len() < expected {
        warn!(
            "Only {} of {} simulated devices appeared",
            usb.devices().len(),
            expected
        );
    }
}

fn wait_finished(threads: &ThreadPort<StdKernel>, id: &threading::KernelThreadId, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match threads.status(*id) {
            None | Some(ThreadStatus::Finished) => return true,
            _ if Instant::now() >= deadline => return false,
            _ => std::thread::sleep(Duration::from_millis(10)),
        }
    }
}

fn list_devices(usb: &mut UsbHost) -> Result<()> {
    let devices = usb.devices();
    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for handle in devices {
        let mut device = usb.device(handle);
        let vid = device.vid()?;
        let pid = device.pid()?;
        let manufacturer = device
            .manufacturer()?
            .unwrap_or("Unknown Manufacturer")
            .to_string();
        let product = device.product()?.unwrap_or("Unknown Product").to_string();
        println!(
            "  [{}] {:04x}:{:04x} - {} {}",
            handle.addr(),
            vid,
            pid,
            manufacturer,
            product
        );
        if let Some(serial) = device.serial()? {
            println!("      Serial: {}", serial);
        }
        println!();
    }

    for cdc in usb.cdc_devices() {
        println!("  CDC slot {:?}", cdc);
    }
    for msc in usb.msc_devices() {
        let port = usb.msc(msc);
        println!(
            "  MSC {} blocks of {} bytes{}",
            port.block_count()?,
            port.block_size()?,
            if port.is_readonly()? { " (read-only)" } else { "" }
        );
    }
    for hid in usb.hid_devices() {
        println!("  HID {:?}", usb.hid(hid).protocol()?);
    }
    Ok(())
}

fn on_cdc_rx(usb: &mut UsbHost, event: IrqEvent) {
    let IrqEvent::CdcRx(handle) = event else {
        return;
    };
    match usb.cdc(handle).read(256) {
        Ok(data) => info!("CDC IRQ: {:?}", String::from_utf8_lossy(&data)),
        Err(e) => warn!("CDC IRQ read failed: {}", e),
    }
}

fn on_hid_report(usb: &mut UsbHost, event: IrqEvent) {
    let IrqEvent::HidReport(handle) = event else {
        return;
    };
    if let Ok(Some(report)) = usb.hid(handle).get_report() {
        info!("HID IRQ: {:02x?}", report);
    }
}

fn monitor(usb: &mut UsbHost, duration: Duration) -> Result<()> {
    info!("Monitoring for {:?}", duration);

    let mut seen_cdc: HashSet<CdcHandle> = HashSet::new();
    let mut seen_msc: HashSet<MscHandle> = HashSet::new();
    let mut seen_hid: HashSet<HidHandle> = HashSet::new();
    let mut failures = 0;

    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        for handle in usb.cdc_devices() {
            if seen_cdc.insert(handle) {
                failures += usize::from(!check_cdc(usb, handle));
                usb.cdc(handle)
                    .irq(Some(IrqHandler::function(on_cdc_rx)), IRQ_RX, false)?;
            }
        }
        for handle in usb.msc_devices() {
            if seen_msc.insert(handle) {
                failures += usize::from(!check_msc(usb, handle));
            }
        }
        for handle in usb.hid_devices() {
            if seen_hid.insert(handle) {
                failures += usize::from(!check_hid(usb, handle));
                usb.hid(handle)
                    .irq(Some(IrqHandler::function(on_hid_report)), IRQ_REPORT, false)?;
            }
        }

        usb.wait_ms(50);
    }

    if failures > 0 {
        return Err(anyhow!("{} self-checks failed", failures));
    }
    Ok(())
}

fn check_cdc(usb: &mut UsbHost, handle: CdcHandle) -> bool {
    const PROBE: &[u8] = b"usbh-sim probe";

    let mut port = usb.cdc(handle);
    // Drop whatever the device sent before the probe.
    let _ = port.read(usize::MAX);

    match port.write(PROBE) {
        Ok(n) if n == PROBE.len() => {}
        Ok(n) => {
            warn!("CDC self-check: short write of {} bytes", n);
            return false;
        }
        Err(e) => {
            warn!("CDC self-check: write failed: {}", e);
            return false;
        }
    }

    match port.read_timeout(PROBE.len(), Some(Duration::from_millis(200))) {
        Ok(data) if data.starts_with(PROBE) => {
            info!("CDC self-check passed (echo)");
            true
        }
        Ok(data) if data.is_empty() => {
            info!("CDC self-check: write accepted, no echo");
            true
        }
        Ok(data) => {
            info!("CDC self-check: {} unrelated bytes pending", data.len());
            true
        }
        Err(e) => {
            warn!("CDC self-check: read failed: {}", e);
            false
        }
    }
}

fn check_msc(usb: &mut UsbHost, handle: MscHandle) -> bool {
    let mut port = usb.msc(handle);
    let block_size = match port.block_size() {
        Ok(size) => size as usize,
        Err(e) => {
            warn!("MSC self-check: {}", e);
            return false;
        }
    };

    let mut block = vec![0u8; block_size];
    match port.readblocks(0, &mut block, None) {
        Ok(_) => {
            info!(
                "MSC self-check passed: block 0 read ({} blocks of {} bytes)",
                port.block_count().unwrap_or(0),
                block_size
            );
            true
        }
        Err(e) => {
            warn!("MSC self-check: reading block 0 failed: {}", e);
            false
        }
    }
}

fn check_hid(usb: &mut UsbHost, handle: HidHandle) -> bool {
    let mut port = usb.hid(handle);
    let (protocol, usage_page, usage) = match (port.protocol(), port.usage_page(), port.usage()) {
        (Ok(protocol), Ok(page), Ok(usage)) => (protocol, page, usage),
        _ => {
            warn!("HID self-check: device went away");
            return false;
        }
    };

    // The report may already be armed from mount; either answer is fine.
    match port.request_report() {
        Ok(accepted) => {
            info!(
                "HID self-check passed: {:?}, usage {:#06x}/{:#06x}, request accepted: {}",
                protocol, usage_page, usage, accepted
            );
            true
        }
        Err(e) => {
            warn!("HID self-check: request failed: {}", e);
            false
        }
    }
}

fn print_summary(usb: &UsbHost, hw: &SimHandle) {
    let stats = usb.stats();
    let sim = hw.stats();
    println!("\nSummary:");
    println!(
        "  Pump requests: {} ({} coalesced), controller tasks: {}",
        stats.pump.requests, stats.pump.coalesced, sim.tasks
    );
    println!(
        "  MSC transfers: {} reads, {} writes",
        sim.msc_reads, sim.msc_writes
    );
    println!(
        "  Dropped: {} device mounts, {} class mounts, {} notifications, {} reports",
        stats.bridge.dropped_device_mounts,
        stats.bridge.dropped_class_mounts,
        stats.bridge.dropped_notifications,
        stats.bridge.dropped_reports
    );
}
