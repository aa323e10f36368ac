//! USB host runtime
//!
//! Binds a USB host controller to application code: a fixed-capacity pool of
//! devices and class instances, an event bridge fed by controller callbacks, a
//! coalesced cooperative task pump, and class bindings for CDC serial, MSC
//! block devices and HID.
//!
//! ```no_run
//! use host::{HostConfig, UsbHost, sim::SimController};
//!
//! let (controller, _hw) = SimController::new();
//! let mut usb = UsbHost::new(Box::new(controller), HostConfig::default())?;
//! usb.active(true)?;
//! usb.wait_ms(10);
//! for cdc in usb.cdc_devices() {
//!     let data = usb.cdc(cdc).read(64)?;
//!     println!("{} bytes", data.len());
//! }
//! # Ok::<(), host::UsbhError>(())
//! ```

pub mod blocking;
pub mod bridge;
pub mod cdc;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod hid;
pub mod host;
pub mod irq;
pub mod msc;
pub mod pool;
pub mod pump;
pub mod sim;

pub use bridge::BridgeStats;
pub use cdc::{CdcPort, PollFlags, StreamRequest};
pub use config::HostConfig;
pub use controller::{HostController, HostEvents, MscLunInfo, TransferBuffer, TransferTag};
pub use device::DevicePort;
pub use error::{Result, TransferFailure, UsbhError};
pub use hid::HidPort;
pub use host::{HostStats, UsbHost};
pub use irq::{CoroutineState, IRQ_REPORT, IRQ_RX, IrqCoroutine, IrqEvent, IrqHandler};
pub use msc::{BlockIoctl, MscPort};
pub use pool::{CdcHandle, DeviceHandle, DevicePool, HidHandle, MscHandle};
pub use pump::{IrqLine, PumpSignal, PumpStats};
