//! Test utilities for usbh-runtime
//!
//! Provides mock descriptors and helper functions for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{create_mock_device_descriptor, mock_address};
//!
//! # fn main() {
//! let desc = create_mock_device_descriptor(0x1234, 0x5678);
//! assert_eq!(desc.vendor_id, 0x1234);
//! assert_eq!(mock_address(3).get(), 3);
//! # }
//! ```

use crate::usb_types::{BOOT_KEYBOARD_REPORT_DESCRIPTOR, DeviceAddress, DeviceDescriptor, class};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Build a device address for tests
///
/// # Panics
/// Panics when `addr` is not a valid bus address (0 or above 127).
pub fn mock_address(addr: u8) -> DeviceAddress {
    match DeviceAddress::new(addr) {
        Some(addr) => addr,
        None => panic!("invalid mock device address {addr}"),
    }
}

/// Create a mock device descriptor with string indices 1, 2 and 3
///
/// # Example
/// ```
/// use common::test_utils::create_mock_device_descriptor;
///
/// let desc = create_mock_device_descriptor(0xCAFE, 0x4001);
/// assert_eq!(desc.product_id, 0x4001);
/// assert_eq!(desc.manufacturer_index, 1);
/// ```
pub fn create_mock_device_descriptor(vendor_id: u16, product_id: u16) -> DeviceDescriptor {
    create_mock_device_descriptor_with_class(vendor_id, product_id, 0x00, 0x00, 0x00)
}

/// Create a mock device descriptor with a specific device class triple
pub fn create_mock_device_descriptor_with_class(
    vendor_id: u16,
    product_id: u16,
    class: u8,
    subclass: u8,
    protocol: u8,
) -> DeviceDescriptor {
    DeviceDescriptor {
        vendor_id,
        product_id,
        class,
        subclass,
        protocol,
        manufacturer_index: 1,
        product_index: 2,
        serial_index: 3,
    }
}

/// Create a mock CDC ACM device descriptor
pub fn create_mock_cdc_descriptor() -> DeviceDescriptor {
    create_mock_device_descriptor_with_class(0x2E8A, 0x000A, class::CDC, 0x00, 0x00)
}

/// Create a mock mass storage device descriptor (class in interface)
pub fn create_mock_msc_descriptor() -> DeviceDescriptor {
    create_mock_device_descriptor_with_class(0x0781, 0x5581, 0x00, 0x00, 0x00)
}

/// Create a mock HID keyboard device descriptor (class in interface)
pub fn create_mock_hid_descriptor() -> DeviceDescriptor {
    create_mock_device_descriptor_with_class(0x046D, 0xC31C, 0x00, 0x00, 0x00)
}

/// HID report descriptor for a boot keyboard
pub fn boot_keyboard_report_descriptor() -> Vec<u8> {
    BOOT_KEYBOARD_REPORT_DESCRIPTOR.to_vec()
}

/// HID report descriptor for a boot mouse (header only)
pub fn boot_mouse_report_descriptor() -> Vec<u8> {
    vec![0x05, 0x01, 0x09, 0x02, 0xA1, 0x01, 0x09, 0x01, 0xA1, 0x00, 0xC0, 0xC0]
}

/// Boot keyboard report with the given key code in the first key slot
pub fn create_mock_keyboard_report(key_code: u8) -> [u8; 8] {
    [0, 0, key_code, 0, 0, 0, 0, 0]
}

/// Deterministic block contents so tests can verify which block they read
pub fn create_mock_block_pattern(block: u32, block_size: usize) -> Vec<u8> {
    (0..block_size)
        .map(|i| (block as usize).wrapping_mul(31).wrapping_add(i) as u8)
        .collect()
}

/// Create mock bulk data of the given size
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

/// Poll `condition` every millisecond until it holds or `timeout` passes
///
/// Returns whether the condition was observed to hold.
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
