//! Device attributes

use crate::error::{Result, UsbhError};
use crate::host::UsbHost;
use crate::pool::{DeviceHandle, DeviceSlot, StringState};
use common::usb_types::{DeviceAddress, DeviceDescriptor, LANG_ID_EN_US, decode_string_descriptor};
use tracing::debug;

/// UTF-16 units fetched per string descriptor, header included
const STRING_DESC_UNITS: usize = 64;

#[derive(Debug, Clone, Copy)]
enum StringField {
    Manufacturer,
    Product,
    Serial,
}

/// Read-only view of a mounted device
pub struct DevicePort<'a> {
    host: &'a mut UsbHost,
    handle: DeviceHandle,
}

impl<'a> DevicePort<'a> {
    pub(crate) fn new(host: &'a mut UsbHost, handle: DeviceHandle) -> Self {
        Self { host, handle }
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub fn addr(&self) -> DeviceAddress {
        self.handle.addr
    }

    /// Whether this device is still the one the handle was issued for
    pub fn is_connected(&self) -> bool {
        self.host.is_active() && self.host.pool().device_active(self.handle).is_some()
    }

    fn slot(&self) -> Result<&DeviceSlot> {
        self.host.ensure_active()?;
        self.host
            .pool()
            .device_active(self.handle)
            .ok_or(UsbhError::NoDevice)
    }

    pub fn descriptor(&self) -> Result<DeviceDescriptor> {
        Ok(self.slot()?.desc)
    }

    pub fn vid(&self) -> Result<u16> {
        Ok(self.slot()?.desc.vendor_id)
    }

    pub fn pid(&self) -> Result<u16> {
        Ok(self.slot()?.desc.product_id)
    }

    pub fn class(&self) -> Result<u8> {
        Ok(self.slot()?.desc.class)
    }

    pub fn subclass(&self) -> Result<u8> {
        Ok(self.slot()?.desc.subclass)
    }

    pub fn protocol(&self) -> Result<u8> {
        Ok(self.slot()?.desc.protocol)
    }

    /// Manufacturer string, fetched from the device on first use
    pub fn manufacturer(&mut self) -> Result<Option<&str>> {
        self.string(StringField::Manufacturer)
    }

    pub fn product(&mut self) -> Result<Option<&str>> {
        self.string(StringField::Product)
    }

    pub fn serial(&mut self) -> Result<Option<&str>> {
        self.string(StringField::Serial)
    }

    fn string(&mut self, field: StringField) -> Result<Option<&str>> {
        self.slot()?;
        let addr = self.handle.addr;
        let (controller, pool) = self.host.parts();
        let device = pool.device_slot_mut(addr).ok_or(UsbhError::NoDevice)?;

        let (index, string) = match field {
            StringField::Manufacturer => (device.desc.manufacturer_index, &mut device.manufacturer),
            StringField::Product => (device.desc.product_index, &mut device.product),
            StringField::Serial => (device.desc.serial_index, &mut device.serial),
        };

        if string.state == StringState::NotFetched {
            string.state = StringState::Absent;
            if index != 0 {
                let mut raw = [0u16; STRING_DESC_UNITS];
                match controller.string_descriptor(addr, index, LANG_ID_EN_US, &mut raw) {
                    Ok(units) => {
                        string.len = decode_string_descriptor(&raw[..units.min(raw.len())], &mut string.buf);
                        string.state = StringState::Present;
                    }
                    Err(status) => {
                        debug!(
                            "String descriptor {} of device {} unavailable: {:?}",
                            index, addr, status
                        );
                    }
                }
            }
        }

        Ok(string.as_str())
    }
}
