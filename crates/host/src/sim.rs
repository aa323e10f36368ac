//! Simulated host controller
//!
//! An in-memory [`HostController`] for tests and the `usbh-sim` binary.
//! [`SimHandle`] is the "hardware" side: it can be cloned and moved to any
//! thread, and every event it injects raises the IRQ line exactly like a
//! real controller's interrupt would. Events are only delivered to the host
//! from [`HostController::task`].

use crate::config::SimDeviceConfig;
use crate::controller::{HostController, HostEvents, MscLunInfo, TransferBuffer, TransferTag};
use crate::pump::IrqLine;
use common::usb_types::{
    BOOT_KEYBOARD_REPORT_DESCRIPTOR, DeviceAddress, DeviceDescriptor, LineCoding, TransferStatus,
    encode_string_descriptor,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

/// Default transmit FIFO size of a simulated CDC interface
pub const SIM_CDC_TX_CAPACITY: usize = 64;

/// Boot keyboard input report pressing `key_code` with no modifiers
pub fn keyboard_report(key_code: u8) -> [u8; 8] {
    [0, 0, key_code, 0, 0, 0, 0, 0]
}

/// How simulated MSC transfers behave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MscMode {
    /// Complete on the next task
    #[default]
    Complete,
    /// Complete on the next task with this status
    Fail(TransferStatus),
    /// Refuse to start the transfer
    Reject,
    /// Hold the transfer until [`SimHandle::release_transfers`]
    Never,
    /// Complete after this many further tasks
    Delay(u32),
}

/// Activity counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimStats {
    pub tasks: u64,
    pub msc_reads: u64,
    pub msc_writes: u64,
    pub string_fetches: u64,
    pub line_codings: u64,
}

#[derive(Debug)]
enum HwEvent {
    DeviceMount(DeviceAddress, DeviceDescriptor),
    DeviceUnmount(DeviceAddress),
    CdcMount(DeviceAddress, u8),
    CdcUnmount(u8),
    CdcRx(u8),
    MscMount(DeviceAddress, MscLunInfo),
    MscUnmount(DeviceAddress),
    HidMount(DeviceAddress, u8, u8, Vec<u8>),
    HidUnmount(DeviceAddress, u8),
}

#[derive(Debug)]
struct SimCdc {
    addr: DeviceAddress,
    rx: VecDeque<u8>,
    tx: VecDeque<u8>,
    transmitted: Vec<u8>,
    tx_capacity: usize,
    /// Bytes moved out of the TX FIFO per task; 0 means all of them
    drain_per_task: usize,
    echo: bool,
    line_coding: Option<LineCoding>,
}

#[derive(Debug)]
struct SimLun {
    addr: DeviceAddress,
    info: MscLunInfo,
    data: Vec<u8>,
}

#[derive(Debug)]
struct SimHid {
    addr: DeviceAddress,
    instance: u8,
    armed: bool,
    queued: VecDeque<Vec<u8>>,
    sent: Vec<(u8, Vec<u8>)>,
}

#[derive(Debug)]
struct SimTransfer {
    addr: DeviceAddress,
    lun: u8,
    lba: u32,
    write: bool,
    tag: TransferTag,
    buffer: TransferBuffer,
    mode: MscMode,
}

#[derive(Debug, Default)]
struct SimBus {
    irq: Option<IrqLine>,
    initialized: bool,
    events: VecDeque<HwEvent>,
    strings: HashMap<(u8, u8), String>,
    cdc: BTreeMap<u8, SimCdc>,
    luns: Vec<SimLun>,
    hid: Vec<SimHid>,
    transfers: Vec<SimTransfer>,
    msc_mode: MscMode,
    stats: SimStats,
}

impl SimBus {
    fn raise(&self) {
        if let Some(irq) = &self.irq {
            irq.raise();
        }
    }

    fn push(&mut self, event: HwEvent) {
        trace!("Simulated hardware event: {:?}", event);
        self.events.push_back(event);
        self.raise();
    }

    fn lun_mut(&mut self, addr: DeviceAddress, lun: u8) -> Option<&mut SimLun> {
        self.luns
            .iter_mut()
            .find(|l| l.addr == addr && l.info.lun == lun)
    }

    fn hid_mut(&mut self, addr: DeviceAddress, instance: u8) -> Option<&mut SimHid> {
        self.hid
            .iter_mut()
            .find(|h| h.addr == addr && h.instance == instance)
    }

    fn start_transfer(&mut self, mut transfer: SimTransfer, count: u16) -> Result<(), TransferBuffer> {
        let mode = self.msc_mode;
        let Some(lun) = self.lun_mut(transfer.addr, transfer.lun) else {
            return Err(transfer.buffer);
        };

        let end = u64::from(transfer.lba) + u64::from(count);
        let bytes = usize::from(count) * lun.info.block_size as usize;
        if mode == MscMode::Reject
            || end > u64::from(lun.info.block_count)
            || transfer.buffer.len() < bytes
            || (transfer.write && lun.info.read_only)
        {
            return Err(transfer.buffer);
        }

        transfer.mode = mode;
        if transfer.write {
            self.stats.msc_writes += 1;
        } else {
            self.stats.msc_reads += 1;
        }
        self.transfers.push(transfer);
        self.raise();
        Ok(())
    }

    /// Move a finished transfer's data between its buffer and the backing store
    fn apply(&mut self, transfer: &mut SimTransfer) {
        let Some(lun) = self.lun_mut(transfer.addr, transfer.lun) else {
            return;
        };
        let block_size = lun.info.block_size as usize;
        let start = transfer.lba as usize * block_size;
        let len = transfer.buffer.len();
        let Some(stored) = lun.data.get_mut(start..start + len) else {
            return;
        };
        if transfer.write {
            stored.copy_from_slice(transfer.buffer.as_slice());
        } else {
            transfer.buffer.as_mut_slice().copy_from_slice(stored);
        }
    }

    fn remove_device(&mut self, addr: DeviceAddress) {
        self.cdc.retain(|_, c| c.addr != addr);
        self.luns.retain(|l| l.addr != addr);
        self.hid.retain(|h| h.addr != addr);
        self.transfers.retain(|t| t.addr != addr);
        self.strings.retain(|(a, _), _| *a != addr.get());
    }
}

/// The controller half, owned by the host
#[derive(Debug)]
pub struct SimController {
    bus: Arc<Mutex<SimBus>>,
}

/// The hardware half, used to inject events and inspect traffic
#[derive(Debug, Clone)]
pub struct SimHandle {
    bus: Arc<Mutex<SimBus>>,
}

fn lock(bus: &Mutex<SimBus>) -> MutexGuard<'_, SimBus> {
    bus.lock().unwrap_or_else(|e| e.into_inner())
}

impl SimController {
    pub fn new() -> (Self, SimHandle) {
        let bus = Arc::new(Mutex::new(SimBus::default()));
        (
            Self {
                bus: Arc::clone(&bus),
            },
            SimHandle { bus },
        )
    }
}

impl HostController for SimController {
    fn init(&mut self, irq: IrqLine) -> crate::Result<()> {
        let mut bus = lock(&self.bus);
        bus.irq = Some(irq);
        bus.initialized = true;
        if !bus.events.is_empty() {
            bus.raise();
        }
        debug!("Simulated controller initialized");
        Ok(())
    }

    fn deinit(&mut self) {
        let mut bus = lock(&self.bus);
        bus.irq = None;
        bus.initialized = false;
        bus.transfers.clear();
        debug!("Simulated controller deinitialized");
    }

    fn task(&mut self, events: &mut dyn HostEvents) {
        let mut bus = lock(&self.bus);
        if !bus.initialized {
            return;
        }
        bus.stats.tasks += 1;

        let pending = std::mem::take(&mut bus.events);
        for event in pending {
            match event {
                HwEvent::DeviceMount(addr, desc) => events.device_mounted(addr, &desc),
                HwEvent::DeviceUnmount(addr) => events.device_unmounted(addr),
                HwEvent::CdcMount(addr, index) => events.cdc_mounted(addr, index),
                HwEvent::CdcUnmount(index) => events.cdc_unmounted(index),
                HwEvent::CdcRx(index) => events.cdc_rx(index),
                HwEvent::MscMount(addr, info) => events.msc_mounted(addr, &info),
                HwEvent::MscUnmount(addr) => events.msc_unmounted(addr),
                HwEvent::HidMount(addr, instance, protocol, desc) => {
                    events.hid_mounted(addr, instance, protocol, &desc)
                }
                HwEvent::HidUnmount(addr, instance) => events.hid_unmounted(addr, instance),
            }
        }

        // Transmit FIFOs drain toward the device.
        let mut echoed = Vec::new();
        for (&index, cdc) in bus.cdc.iter_mut() {
            let n = match cdc.drain_per_task {
                0 => cdc.tx.len(),
                n => n.min(cdc.tx.len()),
            };
            if n == 0 {
                continue;
            }
            let sent: Vec<u8> = cdc.tx.drain(..n).collect();
            if cdc.echo {
                cdc.rx.extend(sent.iter().copied());
                echoed.push(index);
            }
            cdc.transmitted.extend(sent);
        }
        for index in echoed {
            events.cdc_rx(index);
        }
        if bus.cdc.values().any(|c| !c.tx.is_empty()) {
            bus.raise();
        }

        // One-shot report reception.
        let mut reports = Vec::new();
        for hid in bus.hid.iter_mut() {
            if hid.armed {
                if let Some(report) = hid.queued.pop_front() {
                    hid.armed = false;
                    reports.push((hid.addr, hid.instance, report));
                }
            }
        }
        for (addr, instance, report) in reports {
            events.hid_report(addr, instance, &report);
        }

        let transfers = std::mem::take(&mut bus.transfers);
        for mut transfer in transfers {
            let status = match transfer.mode {
                MscMode::Never => None,
                MscMode::Delay(n) if n > 0 => {
                    transfer.mode = MscMode::Delay(n - 1);
                    None
                }
                MscMode::Fail(status) => Some(status),
                _ => Some(TransferStatus::Success),
            };
            match status {
                Some(status) => {
                    if status.is_success() {
                        bus.apply(&mut transfer);
                    }
                    events.transfer_complete(transfer.addr, transfer.tag, status, transfer.buffer);
                }
                None => bus.transfers.push(transfer),
            }
        }
        if bus
            .transfers
            .iter()
            .any(|t| matches!(t.mode, MscMode::Delay(_)))
        {
            bus.raise();
        }
    }

    fn string_descriptor(
        &mut self,
        addr: DeviceAddress,
        index: u8,
        _lang_id: u16,
        buf: &mut [u16],
    ) -> Result<usize, TransferStatus> {
        let mut bus = lock(&self.bus);
        bus.stats.string_fetches += 1;
        let raw = bus
            .strings
            .get(&(addr.get(), index))
            .map(|s| encode_string_descriptor(s))
            .ok_or(TransferStatus::Stalled)?;
        let n = raw.len().min(buf.len());
        buf[..n].copy_from_slice(&raw[..n]);
        Ok(n)
    }

    fn cdc_read_available(&self, index: u8) -> usize {
        lock(&self.bus).cdc.get(&index).map_or(0, |c| c.rx.len())
    }

    fn cdc_read(&mut self, index: u8, buf: &mut [u8]) -> usize {
        let mut bus = lock(&self.bus);
        let Some(cdc) = bus.cdc.get_mut(&index) else {
            return 0;
        };
        let n = buf.len().min(cdc.rx.len());
        for (dst, src) in buf.iter_mut().zip(cdc.rx.drain(..n)) {
            *dst = src;
        }
        n
    }

    fn cdc_write_available(&self, index: u8) -> usize {
        lock(&self.bus)
            .cdc
            .get(&index)
            .map_or(0, |c| c.tx_capacity.saturating_sub(c.tx.len()))
    }

    fn cdc_write(&mut self, index: u8, data: &[u8]) -> usize {
        let mut bus = lock(&self.bus);
        let Some(cdc) = bus.cdc.get_mut(&index) else {
            return 0;
        };
        let n = data.len().min(cdc.tx_capacity.saturating_sub(cdc.tx.len()));
        cdc.tx.extend(&data[..n]);
        n
    }

    fn cdc_write_flush(&mut self, index: u8) -> usize {
        let bus = lock(&self.bus);
        let queued = bus.cdc.get(&index).map_or(0, |c| c.tx.len());
        if queued > 0 {
            bus.raise();
        }
        queued
    }

    fn cdc_set_line_coding(&mut self, index: u8, coding: &LineCoding) -> bool {
        let mut bus = lock(&self.bus);
        bus.stats.line_codings += 1;
        match bus.cdc.get_mut(&index) {
            Some(cdc) => {
                cdc.line_coding = Some(*coding);
                true
            }
            None => false,
        }
    }

    fn msc_read10(
        &mut self,
        addr: DeviceAddress,
        lun: u8,
        lba: u32,
        count: u16,
        buffer: TransferBuffer,
        tag: TransferTag,
    ) -> Result<(), TransferBuffer> {
        let transfer = SimTransfer {
            addr,
            lun,
            lba,
            write: false,
            tag,
            buffer,
            mode: MscMode::Complete,
        };
        lock(&self.bus).start_transfer(transfer, count)
    }

    fn msc_write10(
        &mut self,
        addr: DeviceAddress,
        lun: u8,
        lba: u32,
        count: u16,
        buffer: TransferBuffer,
        tag: TransferTag,
    ) -> Result<(), TransferBuffer> {
        let transfer = SimTransfer {
            addr,
            lun,
            lba,
            write: true,
            tag,
            buffer,
            mode: MscMode::Complete,
        };
        lock(&self.bus).start_transfer(transfer, count)
    }

    fn hid_receive_report(&mut self, addr: DeviceAddress, instance: u8) -> bool {
        let mut bus = lock(&self.bus);
        let Some(hid) = bus.hid_mut(addr, instance) else {
            return false;
        };
        hid.armed = true;
        let waiting = !hid.queued.is_empty();
        if waiting {
            bus.raise();
        }
        true
    }

    fn hid_send_report(
        &mut self,
        addr: DeviceAddress,
        instance: u8,
        report_id: u8,
        report: &[u8],
    ) -> bool {
        let mut bus = lock(&self.bus);
        match bus.hid_mut(addr, instance) {
            Some(hid) => {
                hid.sent.push((report_id, report.to_vec()));
                true
            }
            None => false,
        }
    }
}

impl SimHandle {
    /// Attach a device; class interfaces are added separately
    pub fn plug_device(&self, addr: DeviceAddress, desc: DeviceDescriptor) {
        lock(&self.bus).push(HwEvent::DeviceMount(addr, desc));
    }

    /// Serve `value` as string descriptor `index` of `addr`
    pub fn set_string(&self, addr: DeviceAddress, index: u8, value: &str) {
        lock(&self.bus)
            .strings
            .insert((addr.get(), index), value.to_string());
    }

    pub fn plug_cdc(&self, addr: DeviceAddress, index: u8) {
        let mut bus = lock(&self.bus);
        bus.cdc.insert(
            index,
            SimCdc {
                addr,
                rx: VecDeque::new(),
                tx: VecDeque::new(),
                transmitted: Vec::new(),
                tx_capacity: SIM_CDC_TX_CAPACITY,
                drain_per_task: 0,
                echo: false,
                line_coding: None,
            },
        );
        bus.push(HwEvent::CdcMount(addr, index));
    }

    /// Attach a logical unit backed by zeroed storage
    pub fn plug_msc(&self, addr: DeviceAddress, info: MscLunInfo) {
        let mut bus = lock(&self.bus);
        let size = info.block_size as usize * info.block_count as usize;
        bus.luns.retain(|l| !(l.addr == addr && l.info.lun == info.lun));
        bus.luns.push(SimLun {
            addr,
            info,
            data: vec![0; size],
        });
        bus.push(HwEvent::MscMount(addr, info));
    }

    pub fn plug_hid(&self, addr: DeviceAddress, instance: u8, protocol: u8, report_desc: &[u8]) {
        let mut bus = lock(&self.bus);
        bus.hid.retain(|h| !(h.addr == addr && h.instance == instance));
        bus.hid.push(SimHid {
            addr,
            instance,
            armed: false,
            queued: VecDeque::new(),
            sent: Vec::new(),
        });
        bus.push(HwEvent::HidMount(addr, instance, protocol, report_desc.to_vec()));
    }

    /// Attach a device and all its interfaces as configured
    pub fn plug(&self, config: &SimDeviceConfig) -> Option<DeviceAddress> {
        let addr = DeviceAddress::new(config.address)?;
        let desc = config.descriptor();

        let strings = [
            (desc.manufacturer_index, &config.manufacturer),
            (desc.product_index, &config.product),
            (desc.serial_index, &config.serial),
        ];
        for (index, value) in strings {
            if let Some(value) = value {
                self.set_string(addr, index, value);
            }
        }

        self.plug_device(addr, desc);
        for cdc in &config.cdc {
            self.plug_cdc(addr, cdc.index);
            self.set_cdc_echo(cdc.index, cdc.echo);
        }
        for msc in &config.msc {
            self.plug_msc(
                addr,
                MscLunInfo {
                    lun: msc.lun,
                    block_size: msc.block_size,
                    block_count: msc.block_count,
                    read_only: msc.read_only,
                },
            );
        }
        for hid in &config.hid {
            let desc = if hid.report_descriptor.is_empty() {
                BOOT_KEYBOARD_REPORT_DESCRIPTOR
            } else {
                hid.report_descriptor.as_slice()
            };
            self.plug_hid(addr, hid.instance, hid.protocol, desc);
        }
        Some(addr)
    }

    /// Detach a device, reporting its interfaces gone before the device itself
    pub fn unplug(&self, addr: DeviceAddress) {
        let mut bus = lock(&self.bus);
        let cdc: Vec<u8> = bus
            .cdc
            .iter()
            .filter(|(_, c)| c.addr == addr)
            .map(|(&i, _)| i)
            .collect();
        let hid: Vec<u8> = bus
            .hid
            .iter()
            .filter(|h| h.addr == addr)
            .map(|h| h.instance)
            .collect();
        let has_msc = bus.luns.iter().any(|l| l.addr == addr);

        bus.remove_device(addr);
        for index in cdc {
            bus.push(HwEvent::CdcUnmount(index));
        }
        if has_msc {
            bus.push(HwEvent::MscUnmount(addr));
        }
        for instance in hid {
            bus.push(HwEvent::HidUnmount(addr, instance));
        }
        bus.push(HwEvent::DeviceUnmount(addr));
    }

    /// Close one CDC interface, leaving its device attached
    pub fn unplug_cdc(&self, index: u8) {
        let mut bus = lock(&self.bus);
        if bus.cdc.remove(&index).is_some() {
            bus.push(HwEvent::CdcUnmount(index));
        }
    }

    /// Report only the device unmount, leaving interface teardown to the host
    pub fn device_unmount(&self, addr: DeviceAddress) {
        let mut bus = lock(&self.bus);
        bus.remove_device(addr);
        bus.push(HwEvent::DeviceUnmount(addr));
    }

    /// Deliver bytes into a CDC receive FIFO
    pub fn cdc_receive(&self, index: u8, data: &[u8]) {
        let mut bus = lock(&self.bus);
        let Some(cdc) = bus.cdc.get_mut(&index) else {
            return;
        };
        cdc.rx.extend(data);
        bus.push(HwEvent::CdcRx(index));
    }

    /// Bytes that have left the CDC transmit FIFO since the last call
    pub fn take_cdc_tx(&self, index: u8) -> Vec<u8> {
        lock(&self.bus)
            .cdc
            .get_mut(&index)
            .map(|c| std::mem::take(&mut c.transmitted))
            .unwrap_or_default()
    }

    pub fn cdc_line_coding(&self, index: u8) -> Option<LineCoding> {
        lock(&self.bus).cdc.get(&index).and_then(|c| c.line_coding)
    }

    pub fn set_cdc_echo(&self, index: u8, echo: bool) {
        if let Some(cdc) = lock(&self.bus).cdc.get_mut(&index) {
            cdc.echo = echo;
        }
    }

    pub fn set_cdc_tx_capacity(&self, index: u8, capacity: usize) {
        if let Some(cdc) = lock(&self.bus).cdc.get_mut(&index) {
            cdc.tx_capacity = capacity;
        }
    }

    /// Limit how many bytes leave the transmit FIFO per task; 0 drains fully
    pub fn set_cdc_drain(&self, index: u8, bytes_per_task: usize) {
        if let Some(cdc) = lock(&self.bus).cdc.get_mut(&index) {
            cdc.drain_per_task = bytes_per_task;
        }
    }

    /// Queue an input report; delivered once the host arms reception
    pub fn hid_report(&self, addr: DeviceAddress, instance: u8, report: &[u8]) {
        let mut bus = lock(&self.bus);
        let Some(hid) = bus.hid_mut(addr, instance) else {
            return;
        };
        hid.queued.push_back(report.to_vec());
        let armed = hid.armed;
        if armed {
            bus.raise();
        }
    }

    pub fn hid_armed(&self, addr: DeviceAddress, instance: u8) -> bool {
        lock(&self.bus)
            .hid_mut(addr, instance)
            .is_some_and(|h| h.armed)
    }

    /// Output reports sent to a HID interface, as `(report_id, data)`
    pub fn hid_sent(&self, addr: DeviceAddress, instance: u8) -> Vec<(u8, Vec<u8>)> {
        lock(&self.bus)
            .hid_mut(addr, instance)
            .map(|h| h.sent.clone())
            .unwrap_or_default()
    }

    /// Behavior of transfers started from now on
    pub fn set_msc_mode(&self, mode: MscMode) {
        lock(&self.bus).msc_mode = mode;
    }

    /// Let held transfers complete on the next task with `status`
    pub fn release_transfers(&self, status: TransferStatus) {
        let mut bus = lock(&self.bus);
        let mode = if status.is_success() {
            MscMode::Complete
        } else {
            MscMode::Fail(status)
        };
        for transfer in bus.transfers.iter_mut() {
            transfer.mode = mode;
        }
        bus.raise();
    }

    pub fn pending_transfers(&self) -> usize {
        lock(&self.bus).transfers.len()
    }

    /// Backing-store contents of one block
    pub fn msc_block(&self, addr: DeviceAddress, lun: u8, block: u32) -> Option<Vec<u8>> {
        let mut bus = lock(&self.bus);
        let lun = bus.lun_mut(addr, lun)?;
        let size = lun.info.block_size as usize;
        let start = block as usize * size;
        lun.data.get(start..start + size).map(<[u8]>::to_vec)
    }

    /// Overwrite one block of the backing store
    pub fn fill_msc_block(&self, addr: DeviceAddress, lun: u8, block: u32, data: &[u8]) -> bool {
        let mut bus = lock(&self.bus);
        let Some(lun) = bus.lun_mut(addr, lun) else {
            return false;
        };
        let size = lun.info.block_size as usize;
        let start = block as usize * size;
        match lun.data.get_mut(start..start + size) {
            Some(stored) if data.len() == size => {
                stored.copy_from_slice(data);
                true
            }
            _ => false,
        }
    }

    pub fn stats(&self) -> SimStats {
        lock(&self.bus).stats
    }
}
