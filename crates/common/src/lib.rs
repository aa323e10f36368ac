//! Common utilities for usbh-runtime
//!
//! This crate provides functionality shared by the host runtime and the
//! threading shim: USB type abstractions, error handling, logging setup and
//! the bounded schedule queue used to defer callbacks to the cooperative task.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;
pub mod usb_types;

pub use channel::{ScheduleRunner, Scheduler, create_schedule_queue};
pub use error::{Error, Result};
pub use logging::setup_logging;
