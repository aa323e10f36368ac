//! USB type abstractions and utilities
//!
//! Plain data shared by the host runtime, the controller seam and the
//! simulated controller: addresses, descriptors, line coding, transfer
//! status and the small descriptor decoders the class bindings need.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Language ID used when fetching string descriptors (US English)
pub const LANG_ID_EN_US: u16 = 0x0409;

/// Descriptor type of a string descriptor
pub const DESC_TYPE_STRING: u8 = 0x03;

/// HID report descriptor of a boot-protocol keyboard
pub const BOOT_KEYBOARD_REPORT_DESCRIPTOR: &[u8] = &[
    0x05, 0x01, // Usage Page (Generic Desktop)
    0x09, 0x06, // Usage (Keyboard)
    0xA1, 0x01, // Collection (Application)
    0x05, 0x07, //   Usage Page (Key Codes)
    0x19, 0xE0, //   Usage Minimum (224)
    0x29, 0xE7, //   Usage Maximum (231)
    0x15, 0x00, //   Logical Minimum (0)
    0x25, 0x01, //   Logical Maximum (1)
    0x75, 0x01, //   Report Size (1)
    0x95, 0x08, //   Report Count (8)
    0x81, 0x02, //   Input (Data, Variable, Absolute)
    0x95, 0x01, //   Report Count (1)
    0x75, 0x08, //   Report Size (8)
    0x81, 0x01, //   Input (Constant)
    0x95, 0x06, //   Report Count (6)
    0x75, 0x08, //   Report Size (8)
    0x15, 0x00, //   Logical Minimum (0)
    0x25, 0x65, //   Logical Maximum (101)
    0x05, 0x07, //   Usage Page (Key Codes)
    0x19, 0x00, //   Usage Minimum (0)
    0x29, 0x65, //   Usage Maximum (101)
    0x81, 0x00, //   Input (Data, Array)
    0xC0, // End Collection
];

/// USB interface class codes the host binds
pub mod class {
    pub const CDC: u8 = 0x02;
    pub const HID: u8 = 0x03;
    pub const MSC: u8 = 0x08;
    pub const CDC_DATA: u8 = 0x0A;
    pub const MISC: u8 = 0xEF;
}

/// Bus address assigned to a device during enumeration (1..=127)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct DeviceAddress(u8);

impl DeviceAddress {
    pub const MAX: u8 = 127;

    /// Returns `None` for address 0 (default address) and values above 127
    pub const fn new(addr: u8) -> Option<Self> {
        if addr == 0 || addr > Self::MAX {
            None
        } else {
            Some(Self(addr))
        }
    }

    pub const fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for DeviceAddress {
    type Error = crate::Error;

    fn try_from(addr: u8) -> crate::Result<Self> {
        Self::new(addr)
            .ok_or_else(|| crate::Error::Descriptor(format!("invalid device address {}", addr)))
    }
}

impl From<DeviceAddress> for u8 {
    fn from(addr: DeviceAddress) -> u8 {
        addr.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The fields of a device descriptor the host keeps per device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    #[serde(default)]
    pub class: u8,
    #[serde(default)]
    pub subclass: u8,
    #[serde(default)]
    pub protocol: u8,
    /// String descriptor index, 0 when absent
    #[serde(default)]
    pub manufacturer_index: u8,
    #[serde(default)]
    pub product_index: u8,
    #[serde(default)]
    pub serial_index: u8,
}

/// HID interface protocol as exposed to applications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum HidProtocol {
    #[default]
    None = 0,
    Keyboard = 1,
    Mouse = 2,
    Generic = 3,
}

impl HidProtocol {
    /// Map a bInterfaceProtocol value (0 none, 1 keyboard, 2 mouse)
    pub fn from_interface_protocol(protocol: u8) -> Self {
        match protocol {
            0 => HidProtocol::None,
            1 => HidProtocol::Keyboard,
            2 => HidProtocol::Mouse,
            _ => HidProtocol::Generic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
    Mark,
    Space,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StopBits {
    #[default]
    #[serde(rename = "1")]
    One,
    #[serde(rename = "1.5")]
    OnePointFive,
    #[serde(rename = "2")]
    Two,
}

/// CDC ACM line coding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineCoding {
    #[serde(default = "LineCoding::default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "LineCoding::default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default)]
    pub stop_bits: StopBits,
}

impl LineCoding {
    fn default_baud_rate() -> u32 {
        115_200
    }

    fn default_data_bits() -> u8 {
        8
    }
}

impl Default for LineCoding {
    /// 115200 baud, 8 data bits, no parity, 1 stop bit
    fn default() -> Self {
        Self {
            baud_rate: Self::default_baud_rate(),
            data_bits: Self::default_data_bits(),
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

/// Completion status reported by the host controller for a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Success,
    Failed,
    Stalled,
    /// The controller itself gave up on the transfer
    Timeout,
    Invalid,
}

impl TransferStatus {
    pub fn is_success(self) -> bool {
        matches!(self, TransferStatus::Success)
    }
}

/// Usage page and usage of a HID report descriptor's top-level collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HidUsage {
    pub usage_page: u16,
    pub usage: u16,
}

/// Extract the first Usage Page and Usage items from a HID report descriptor
///
/// Missing items are reported as 0. Long items are skipped; a truncated
/// trailing item ends the scan.
pub fn parse_hid_usage(report_desc: &[u8]) -> HidUsage {
    let mut usage_page = None;
    let mut usage = None;
    let mut pos = 0;

    while pos < report_desc.len() && (usage_page.is_none() || usage.is_none()) {
        let prefix = report_desc[pos];

        if prefix == 0xFE {
            // Long item: bDataSize, bLongItemTag, data
            let Some(&size) = report_desc.get(pos + 1) else {
                break;
            };
            pos += 3 + size as usize;
            continue;
        }

        let size = match prefix & 0x03 {
            3 => 4,
            n => n as usize,
        };
        let Some(data) = report_desc.get(pos + 1..pos + 1 + size) else {
            break;
        };
        let value = data
            .iter()
            .rev()
            .fold(0u32, |acc, &b| (acc << 8) | u32::from(b)) as u16;

        match prefix & 0xFC {
            // Global item, tag 0: Usage Page
            0x04 if usage_page.is_none() => usage_page = Some(value),
            // Local item, tag 0: Usage
            0x08 if usage.is_none() => usage = Some(value),
            _ => {}
        }

        pos += 1 + size;
    }

    HidUsage {
        usage_page: usage_page.unwrap_or(0),
        usage: usage.unwrap_or(0),
    }
}

/// Decode a raw UTF-16LE string descriptor into UTF-8
///
/// `raw[0]` is the descriptor header (bLength in the low byte, bDescriptorType
/// in the high byte). Output stops at the last whole character that fits in
/// `out`; unpaired surrogates become U+FFFD. Returns the number of bytes written.
pub fn decode_string_descriptor(raw: &[u16], out: &mut [u8]) -> usize {
    let Some((&header, units)) = raw.split_first() else {
        return 0;
    };

    let declared = ((header & 0x00FF) as usize / 2).saturating_sub(1);
    let units = &units[..declared.min(units.len())];

    let mut written = 0;
    for ch in char::decode_utf16(units.iter().copied()) {
        let ch = ch.unwrap_or(char::REPLACEMENT_CHARACTER);
        let len = ch.len_utf8();
        if written + len > out.len() {
            break;
        }
        ch.encode_utf8(&mut out[written..written + len]);
        written += len;
    }
    written
}

/// Build a raw string descriptor (header word followed by UTF-16 code units)
///
/// Strings longer than the 126 code units a descriptor can carry are truncated.
pub fn encode_string_descriptor(s: &str) -> Vec<u16> {
    let units: Vec<u16> = s.encode_utf16().take(126).collect();
    let length = (2 + units.len() * 2) as u16;

    let mut raw = Vec::with_capacity(units.len() + 1);
    raw.push(length | (u16::from(DESC_TYPE_STRING) << 8));
    raw.extend(units);
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_address_bounds() {
        assert!(DeviceAddress::new(0).is_none());
        assert!(DeviceAddress::new(128).is_none());
        assert_eq!(DeviceAddress::new(1).map(DeviceAddress::get), Some(1));
        assert_eq!(DeviceAddress::new(127).map(DeviceAddress::get), Some(127));
        assert!(DeviceAddress::try_from(200).is_err());
    }

    #[test]
    fn test_hid_protocol_mapping() {
        assert_eq!(HidProtocol::from_interface_protocol(0), HidProtocol::None);
        assert_eq!(HidProtocol::from_interface_protocol(1), HidProtocol::Keyboard);
        assert_eq!(HidProtocol::from_interface_protocol(2), HidProtocol::Mouse);
        assert_eq!(HidProtocol::from_interface_protocol(7), HidProtocol::Generic);
        assert_eq!(HidProtocol::Generic as u8, 3);
    }

    #[test]
    fn test_line_coding_default_is_115200_8n1() {
        let coding = LineCoding::default();
        assert_eq!(coding.baud_rate, 115_200);
        assert_eq!(coding.data_bits, 8);
        assert_eq!(coding.parity, Parity::None);
        assert_eq!(coding.stop_bits, StopBits::One);
    }

    #[test]
    fn test_parse_hid_usage_keyboard() {
        // Usage Page (Generic Desktop), Usage (Keyboard), Collection (Application)
        let desc = [0x05, 0x01, 0x09, 0x06, 0xA1, 0x01, 0xC0];
        assert_eq!(
            parse_hid_usage(&desc),
            HidUsage {
                usage_page: 0x01,
                usage: 0x06
            }
        );
    }

    #[test]
    fn test_parse_hid_usage_two_byte_vendor_page() {
        // Usage Page (0xFF00), Usage (0x01)
        let desc = [0x06, 0x00, 0xFF, 0x09, 0x01, 0xA1, 0x01];
        let usage = parse_hid_usage(&desc);
        assert_eq!(usage.usage_page, 0xFF00);
        assert_eq!(usage.usage, 0x01);
    }

    #[test]
    fn test_parse_hid_usage_missing_or_truncated() {
        assert_eq!(parse_hid_usage(&[]), HidUsage::default());
        assert_eq!(parse_hid_usage(&[0x05]), HidUsage::default());
        assert_eq!(
            parse_hid_usage(&[0x05, 0x0C]),
            HidUsage {
                usage_page: 0x0C,
                usage: 0
            }
        );
    }

    #[test]
    fn test_string_descriptor_decode() {
        let raw = encode_string_descriptor("Acme Corp");
        let mut out = [0u8; 32];
        let n = decode_string_descriptor(&raw, &mut out);
        assert_eq!(&out[..n], b"Acme Corp");
    }

    #[test]
    fn test_string_descriptor_truncates_on_char_boundary() {
        let raw = encode_string_descriptor("aé€");
        let mut out = [0u8; 4];
        let n = decode_string_descriptor(&raw, &mut out);
        // 'a' (1) + 'é' (2) fit, '€' (3) does not
        assert_eq!(std::str::from_utf8(&out[..n]).unwrap(), "aé");
    }

    #[test]
    fn test_string_descriptor_respects_declared_length() {
        let mut raw = encode_string_descriptor("abc");
        raw.extend("garbage".encode_utf16());
        let mut out = [0u8; 32];
        let n = decode_string_descriptor(&raw, &mut out);
        assert_eq!(&out[..n], b"abc");
    }

    #[test]
    fn test_string_descriptor_empty_input() {
        let mut out = [0u8; 8];
        assert_eq!(decode_string_descriptor(&[], &mut out), 0);
    }
}
