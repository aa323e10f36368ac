//! HID binding

use crate::error::{Result, TransferFailure, UsbhError};
use crate::host::UsbHost;
use crate::irq::{IRQ_REPORT, IrqHandler, resolve_registration};
use crate::pool::{HID_MAX_REPORT_SIZE, HidHandle};
use common::usb_types::{DeviceAddress, HidProtocol};

/// A bound HID interface
pub struct HidPort<'a> {
    host: &'a mut UsbHost,
    handle: HidHandle,
}

impl<'a> HidPort<'a> {
    pub(crate) fn new(host: &'a mut UsbHost, handle: HidHandle) -> Self {
        Self { host, handle }
    }

    pub fn handle(&self) -> HidHandle {
        self.handle
    }

    fn slot_index(&self) -> Result<usize> {
        self.host.ensure_active()?;
        self.host
            .pool()
            .hid_active(self.handle)
            .ok_or(UsbhError::NoDevice)
    }

    fn endpoint(&self) -> Result<(DeviceAddress, u8)> {
        let i = self.slot_index()?;
        let slot = &self.host.pool().hid[i];
        let addr = slot.bind.addr.ok_or(UsbhError::NoDevice)?;
        Ok((addr, slot.instance))
    }

    pub fn is_connected(&self) -> bool {
        self.slot_index().is_ok()
    }

    pub fn instance(&self) -> Result<u8> {
        Ok(self.endpoint()?.1)
    }

    pub fn protocol(&self) -> Result<HidProtocol> {
        let i = self.slot_index()?;
        Ok(self.host.pool().hid[i].protocol)
    }

    /// Usage page of the top-level collection, 0 if the descriptor has none
    pub fn usage_page(&self) -> Result<u16> {
        let i = self.slot_index()?;
        Ok(self.host.pool().hid[i].usage_page)
    }

    pub fn usage(&self) -> Result<u16> {
        let i = self.slot_index()?;
        Ok(self.host.pool().hid[i].usage)
    }

    /// Take a copy of the latest report, or `None` if none arrived since the last take
    pub fn get_report(&mut self) -> Result<Option<Vec<u8>>> {
        let i = self.slot_index()?;
        let slot = &mut self.host.pool_mut().hid[i];
        if !slot.report_ready {
            return Ok(None);
        }
        slot.report_ready = false;
        Ok(Some(slot.report[..slot.report_len].to_vec()))
    }

    /// Copy the latest report into `buf`, returning the bytes copied (0 if none)
    ///
    /// An empty `buf` leaves a pending report in place.
    pub fn readinto(&mut self, buf: &mut [u8]) -> Result<usize> {
        let i = self.slot_index()?;
        let slot = &mut self.host.pool_mut().hid[i];
        if !slot.report_ready || buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(slot.report_len);
        buf[..n].copy_from_slice(&slot.report[..n]);
        slot.report_ready = false;
        Ok(n)
    }

    /// Ask the controller for the next input report
    ///
    /// Returns whether the request was accepted, not whether a report arrived.
    pub fn request_report(&mut self) -> Result<bool> {
        let (addr, instance) = self.endpoint()?;
        let accepted = self.host.controller_mut().hid_receive_report(addr, instance);
        if accepted {
            if let Some(i) = self.host.pool().hid_active(self.handle) {
                self.host.pool_mut().hid[i].rearm = false;
            }
        }
        Ok(accepted)
    }

    /// Send an output report
    pub fn send_report(&mut self, report_id: u8, report: &[u8]) -> Result<()> {
        let (addr, instance) = self.endpoint()?;
        if report.len() > HID_MAX_REPORT_SIZE {
            return Err(UsbhError::ReportTooLarge {
                len: report.len(),
                max: HID_MAX_REPORT_SIZE,
            });
        }
        if self
            .host
            .controller_mut()
            .hid_send_report(addr, instance, report_id, report)
        {
            Ok(())
        } else {
            Err(UsbhError::TransferFailed(TransferFailure::Rejected))
        }
    }

    /// Register, replace or clear (`trigger == 0`) the report handler
    pub fn irq(&mut self, handler: Option<IrqHandler>, trigger: u32, hard: bool) -> Result<()> {
        let i = self.slot_index()?;
        let resolved = resolve_registration(handler, trigger, IRQ_REPORT, hard)?;
        self.host.pool_mut().hid[i].irq.set(resolved);
        Ok(())
    }
}
