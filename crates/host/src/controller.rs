//! Host-controller seam
//!
//! [`HostController`] is the interface the runtime consumes from a USB host
//! stack: enumeration and class drivers are the controller's business. The
//! controller reports what happened through [`HostEvents`], which the event
//! bridge implements, and only ever from inside [`HostController::task`].

use crate::pump::IrqLine;
use common::usb_types::{DeviceAddress, DeviceDescriptor, LineCoding, TransferStatus};

/// Geometry of one mass-storage logical unit, known once the controller has
/// read its capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MscLunInfo {
    pub lun: u8,
    pub block_size: u32,
    pub block_count: u32,
    pub read_only: bool,
}

/// Opaque tag the controller hands back with a transfer completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferTag {
    pub slot: u8,
    pub generation: u32,
}

/// Owned transfer buffer, moved to the controller for the duration of an
/// asynchronous transfer and moved back with its completion
#[derive(Debug, Default)]
pub struct TransferBuffer {
    data: Vec<u8>,
}

impl TransferBuffer {
    pub fn with_len(len: usize) -> Self {
        Self { data: vec![0; len] }
    }

    /// Resize in place; only grows the allocation when needed
    pub fn resize(&mut self, len: usize) {
        self.data.resize(len, 0);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Callbacks raised by the controller while it processes events
///
/// Implementations run in controller-callback context: they must not block
/// and must not allocate.
pub trait HostEvents {
    fn device_mounted(&mut self, addr: DeviceAddress, desc: &DeviceDescriptor);
    fn device_unmounted(&mut self, addr: DeviceAddress);

    /// A CDC interface was opened; `index` is unique across all devices
    fn cdc_mounted(&mut self, addr: DeviceAddress, index: u8);
    fn cdc_unmounted(&mut self, index: u8);
    fn cdc_rx(&mut self, index: u8);

    fn msc_mounted(&mut self, addr: DeviceAddress, info: &MscLunInfo);
    fn msc_unmounted(&mut self, addr: DeviceAddress);

    fn hid_mounted(&mut self, addr: DeviceAddress, instance: u8, protocol: u8, report_desc: &[u8]);
    fn hid_unmounted(&mut self, addr: DeviceAddress, instance: u8);
    fn hid_report(&mut self, addr: DeviceAddress, instance: u8, report: &[u8]);

    /// An asynchronous MSC transfer finished; the buffer comes back with it
    fn transfer_complete(
        &mut self,
        addr: DeviceAddress,
        tag: TransferTag,
        status: TransferStatus,
        buffer: TransferBuffer,
    );
}

pub trait HostController: Send {
    /// Bring the controller up; `irq` is raised whenever it has work for [`task`](Self::task)
    fn init(&mut self, irq: IrqLine) -> crate::Result<()>;

    fn deinit(&mut self);

    /// Process ready events without blocking, reporting them to `events`
    fn task(&mut self, events: &mut dyn HostEvents);

    /// Fetch a string descriptor synchronously; returns the number of UTF-16
    /// units written (descriptor header included)
    fn string_descriptor(
        &mut self,
        addr: DeviceAddress,
        index: u8,
        lang_id: u16,
        buf: &mut [u16],
    ) -> Result<usize, TransferStatus>;

    fn cdc_read_available(&self, index: u8) -> usize;
    fn cdc_read(&mut self, index: u8, buf: &mut [u8]) -> usize;
    fn cdc_write_available(&self, index: u8) -> usize;
    /// Queue bytes for transmission; returns how many were accepted
    fn cdc_write(&mut self, index: u8, data: &[u8]) -> usize;
    fn cdc_write_flush(&mut self, index: u8) -> usize;
    fn cdc_set_line_coding(&mut self, index: u8, coding: &LineCoding) -> bool;

    /// Start reading `count` blocks at `lba` into `buffer`
    ///
    /// On rejection the buffer is handed straight back.
    fn msc_read10(
        &mut self,
        addr: DeviceAddress,
        lun: u8,
        lba: u32,
        count: u16,
        buffer: TransferBuffer,
        tag: TransferTag,
    ) -> Result<(), TransferBuffer>;

    /// Start writing `count` blocks from `buffer` at `lba`
    fn msc_write10(
        &mut self,
        addr: DeviceAddress,
        lun: u8,
        lba: u32,
        count: u16,
        buffer: TransferBuffer,
        tag: TransferTag,
    ) -> Result<(), TransferBuffer>;

    /// Arm reception of the next input report
    fn hid_receive_report(&mut self, addr: DeviceAddress, instance: u8) -> bool;

    fn hid_send_report(&mut self, addr: DeviceAddress, instance: u8, report_id: u8, report: &[u8])
    -> bool;
}
