//! Event bridge
//!
//! Translates controller callbacks into pool state. Everything here runs in
//! controller-callback context, so it only touches pre-allocated slots and the
//! bounded schedule queue. Each instance's fields are written before it is
//! marked connected, and a device unmount releases every instance bound to
//! that address.

use crate::controller::{HostEvents, MscLunInfo, TransferBuffer, TransferTag};
use crate::irq::{Deferred, IrqSlot};
use crate::pool::{self, DevicePool, HID_MAX_REPORT_SIZE};
use common::Scheduler;
use common::usb_types::{
    DeviceAddress, DeviceDescriptor, HidProtocol, TransferStatus, parse_hid_usage,
};
use tracing::{debug, trace, warn};

/// Events the bridge had to discard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BridgeStats {
    /// Device mounts at an address beyond the pool
    pub dropped_device_mounts: u64,
    /// Class mounts that found every slot of their kind taken
    pub dropped_class_mounts: u64,
    /// IRQ notifications lost to a full schedule queue
    pub dropped_notifications: u64,
    /// HID reports larger than the report buffer
    pub dropped_reports: u64,
    /// Completions for transfers nobody is waiting on any more
    pub stray_completions: u64,
}

pub(crate) struct EventBridge<'a> {
    pool: &'a mut DevicePool,
    scheduler: &'a Scheduler<Deferred>,
    stats: &'a mut BridgeStats,
}

impl<'a> EventBridge<'a> {
    pub fn new(
        pool: &'a mut DevicePool,
        scheduler: &'a Scheduler<Deferred>,
        stats: &'a mut BridgeStats,
    ) -> Self {
        Self {
            pool,
            scheduler,
            stats,
        }
    }

    fn notify(&mut self, item: Deferred) -> bool {
        if self.scheduler.try_schedule(item) {
            true
        } else {
            self.stats.dropped_notifications += 1;
            warn!("Schedule queue full, dropping {:?}", item);
            false
        }
    }
}

impl HostEvents for EventBridge<'_> {
    fn device_mounted(&mut self, addr: DeviceAddress, desc: &DeviceDescriptor) {
        let Some(slot) = self.pool.device_slot_mut(addr) else {
            self.stats.dropped_device_mounts += 1;
            warn!("No device slot for address {}, ignoring mount", addr);
            return;
        };

        slot.desc = *desc;
        slot.manufacturer.reset();
        slot.product.reset();
        slot.serial.reset();
        slot.generation = slot.generation.wrapping_add(1);
        slot.mounted = true;

        let promoted = pool::connect_staged(&mut self.pool.cdc, addr)
            + pool::connect_staged(&mut self.pool.msc, addr)
            + pool::connect_staged(&mut self.pool.hid, addr);

        debug!(
            "Device {} mounted ({:04x}:{:04x}), {} staged interfaces connected",
            addr, desc.vendor_id, desc.product_id, promoted
        );
    }

    fn device_unmounted(&mut self, addr: DeviceAddress) {
        if let Some(slot) = self.pool.device_slot_mut(addr) {
            slot.mounted = false;
        }

        let released = pool::release_all(&mut self.pool.cdc, addr)
            + pool::release_all(&mut self.pool.msc, addr)
            + pool::release_all(&mut self.pool.hid, addr);

        debug!("Device {} unmounted, {} interfaces released", addr, released);
    }

    fn cdc_mounted(&mut self, addr: DeviceAddress, index: u8) {
        let Some(i) = self
            .pool
            .cdc_slot_by_index(index)
            .or_else(|| pool::first_free(&self.pool.cdc))
        else {
            self.stats.dropped_class_mounts += 1;
            warn!("CDC pool full, ignoring interface {} of device {}", index, addr);
            return;
        };

        let parent_mounted = self.pool.is_mounted(addr);
        let slot = &mut self.pool.cdc[i];
        slot.index = index;
        slot.irq = IrqSlot::Empty;
        slot.irq_scheduled = false;
        slot.needs_line_coding = true;
        slot.bind.occupy(addr);
        if parent_mounted {
            slot.bind.connect();
        }

        debug!("CDC interface {} of device {} bound to slot {}", index, addr, i);
    }

    fn cdc_unmounted(&mut self, index: u8) {
        if let Some(i) = self.pool.cdc_slot_by_index(index) {
            self.pool.cdc[i].bind.release();
            debug!("CDC interface {} unbound from slot {}", index, i);
        }
    }

    fn cdc_rx(&mut self, index: u8) {
        let Some(i) = self.pool.cdc_slot_by_index(index) else {
            return;
        };
        let slot = &self.pool.cdc[i];
        if !slot.bind.is_connected() || !slot.irq.is_armed() || slot.irq_scheduled {
            return;
        }

        let item = Deferred::CdcRx {
            slot: i as u8,
            generation: slot.bind.generation,
        };
        if self.notify(item) {
            self.pool.cdc[i].irq_scheduled = true;
        }
    }

    fn msc_mounted(&mut self, addr: DeviceAddress, info: &MscLunInfo) {
        if info.block_size == 0 {
            self.stats.dropped_class_mounts += 1;
            warn!("MSC LUN {} of device {} reports zero block size", info.lun, addr);
            return;
        }

        let Some(i) = self
            .pool
            .msc_slot_by_lun(addr, info.lun)
            .or_else(|| pool::first_free(&self.pool.msc))
        else {
            self.stats.dropped_class_mounts += 1;
            warn!("MSC pool full, ignoring LUN {} of device {}", info.lun, addr);
            return;
        };

        let parent_mounted = self.pool.is_mounted(addr);
        let slot = &mut self.pool.msc[i];
        slot.lun = info.lun;
        slot.block_size = info.block_size;
        slot.block_count = info.block_count;
        slot.read_only = info.read_only;
        slot.operation_pending = false;
        slot.operation_success = false;
        slot.operation_status = None;
        slot.bind.occupy(addr);
        if parent_mounted {
            slot.bind.connect();
        }

        debug!(
            "MSC LUN {} of device {} bound to slot {} ({} x {} bytes{})",
            info.lun,
            addr,
            i,
            info.block_count,
            info.block_size,
            if info.read_only { ", read-only" } else { "" }
        );
    }

    fn msc_unmounted(&mut self, addr: DeviceAddress) {
        let released = pool::release_all(&mut self.pool.msc, addr);
        debug!("MSC device {} unmounted, {} LUNs released", addr, released);
    }

    fn hid_mounted(&mut self, addr: DeviceAddress, instance: u8, protocol: u8, report_desc: &[u8]) {
        let Some(i) = self
            .pool
            .hid_slot_by_instance(addr, instance)
            .or_else(|| pool::first_free(&self.pool.hid))
        else {
            self.stats.dropped_class_mounts += 1;
            warn!("HID pool full, ignoring instance {} of device {}", instance, addr);
            return;
        };

        let usage = parse_hid_usage(report_desc);
        let parent_mounted = self.pool.is_mounted(addr);
        let slot = &mut self.pool.hid[i];
        slot.instance = instance;
        slot.protocol = HidProtocol::from_interface_protocol(protocol);
        slot.usage_page = usage.usage_page;
        slot.usage = usage.usage;
        slot.report_len = 0;
        slot.report_ready = false;
        slot.irq = IrqSlot::Empty;
        slot.irq_scheduled = false;
        slot.rearm = true;
        slot.bind.occupy(addr);
        if parent_mounted {
            slot.bind.connect();
        }

        debug!(
            "HID instance {} of device {} bound to slot {} (protocol {:?}, usage {:04x}:{:04x})",
            instance, addr, i, slot.protocol, usage.usage_page, usage.usage
        );
    }

    fn hid_unmounted(&mut self, addr: DeviceAddress, instance: u8) {
        if let Some(i) = self.pool.hid_slot_by_instance(addr, instance) {
            self.pool.hid[i].bind.release();
            debug!("HID instance {} of device {} unbound", instance, addr);
        }
    }

    fn hid_report(&mut self, addr: DeviceAddress, instance: u8, report: &[u8]) {
        let Some(i) = self.pool.hid_slot_by_instance(addr, instance) else {
            return;
        };
        if !self.pool.hid[i].bind.is_connected() {
            return;
        }

        // Reception is one-shot; ask for the next report whatever happens to this one.
        self.pool.hid[i].rearm = true;

        if report.len() > HID_MAX_REPORT_SIZE {
            self.stats.dropped_reports += 1;
            warn!(
                "HID report of {} bytes from device {} exceeds {} bytes, dropped",
                report.len(),
                addr,
                HID_MAX_REPORT_SIZE
            );
            return;
        }

        let slot = &mut self.pool.hid[i];
        slot.report[..report.len()].copy_from_slice(report);
        slot.report_len = report.len();
        slot.report_ready = true;
        trace!("HID report of {} bytes from device {}", report.len(), addr);

        if !slot.irq.is_armed() || slot.irq_scheduled {
            return;
        }
        let item = Deferred::HidReport {
            slot: i as u8,
            generation: slot.bind.generation,
        };
        if self.notify(item) {
            self.pool.hid[i].irq_scheduled = true;
        }
    }

    fn transfer_complete(
        &mut self,
        addr: DeviceAddress,
        tag: TransferTag,
        status: TransferStatus,
        buffer: TransferBuffer,
    ) {
        let Some(slot) = self.pool.msc.get_mut(usize::from(tag.slot)) else {
            self.stats.stray_completions += 1;
            return;
        };

        // The buffer goes home even when nobody waits for it any more.
        if slot.buffer.is_none() {
            slot.buffer = Some(buffer);
        }

        let awaited = slot.bind.generation == tag.generation
            && slot.bind.addr == Some(addr)
            && slot.operation_pending;
        if !awaited {
            self.stats.stray_completions += 1;
            debug!("Stray transfer completion for device {} ({:?})", addr, tag);
            return;
        }

        slot.operation_success = status.is_success();
        slot.operation_status = Some(status);
        slot.operation_pending = false;
        trace!("MSC transfer on device {} completed: {:?}", addr, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irq::{IrqHandler, IrqSlot};
    use common::create_schedule_queue;
    use common::test_utils::{
        boot_keyboard_report_descriptor, create_mock_device_descriptor, mock_address,
    };

    struct Fixture {
        pool: DevicePool,
        scheduler: Scheduler<Deferred>,
        runner: common::ScheduleRunner<Deferred>,
        stats: BridgeStats,
    }

    impl Fixture {
        fn new(depth: usize) -> Self {
            let (scheduler, runner) = create_schedule_queue(depth);
            Self {
                pool: DevicePool::new(),
                scheduler,
                runner,
                stats: BridgeStats::default(),
            }
        }

        fn bridge(&mut self) -> EventBridge<'_> {
            EventBridge::new(&mut self.pool, &self.scheduler, &mut self.stats)
        }
    }

    fn lun(block_count: u32) -> MscLunInfo {
        MscLunInfo {
            lun: 0,
            block_size: 512,
            block_count,
            read_only: false,
        }
    }

    #[test]
    fn test_device_mount_fills_slot() {
        let mut fx = Fixture::new(4);
        let addr = mock_address(3);
        fx.bridge()
            .device_mounted(addr, &create_mock_device_descriptor(0x1234, 0x5678));

        let handle = fx.pool.find_device(addr).unwrap();
        let slot = fx.pool.device_active(handle).unwrap();
        assert_eq!(slot.desc.vendor_id, 0x1234);
        assert_eq!(slot.desc.product_id, 0x5678);
    }

    #[test]
    fn test_device_mount_beyond_pool_is_dropped() {
        let mut fx = Fixture::new(4);
        let addr = mock_address(crate::pool::MAX_DEVICES as u8 + 1);
        fx.bridge()
            .device_mounted(addr, &create_mock_device_descriptor(1, 2));
        assert!(fx.pool.devices().is_empty());
        assert_eq!(fx.stats.dropped_device_mounts, 1);
    }

    #[test]
    fn test_class_mount_before_device_is_staged() {
        let mut fx = Fixture::new(4);
        let addr = mock_address(1);
        fx.bridge().msc_mounted(addr, &lun(100));
        assert!(fx.pool.find_msc(addr, 0).is_none());

        fx.bridge()
            .device_mounted(addr, &create_mock_device_descriptor(1, 2));
        assert!(fx.pool.find_msc(addr, 0).is_some());
    }

    #[test]
    fn test_unmount_cascades_to_instances() {
        let mut fx = Fixture::new(4);
        let addr = mock_address(1);
        let other = mock_address(2);
        let mut bridge = fx.bridge();
        bridge.device_mounted(addr, &create_mock_device_descriptor(1, 2));
        bridge.device_mounted(other, &create_mock_device_descriptor(3, 4));
        bridge.cdc_mounted(addr, 0);
        bridge.msc_mounted(addr, &lun(10));
        bridge.hid_mounted(addr, 0, 1, &boot_keyboard_report_descriptor());
        bridge.cdc_mounted(other, 1);

        bridge.device_unmounted(addr);

        assert!(fx.pool.find_cdc(0).is_none());
        assert!(fx.pool.find_msc(addr, 0).is_none());
        assert!(fx.pool.find_hid(addr, 0).is_none());
        assert!(fx.pool.find_cdc(1).is_some());
    }

    #[test]
    fn test_cdc_pool_full_drops_mount() {
        let mut fx = Fixture::new(4);
        let addr = mock_address(1);
        let mut bridge = fx.bridge();
        bridge.device_mounted(addr, &create_mock_device_descriptor(1, 2));
        for index in 0..=crate::pool::MAX_CDC as u8 {
            bridge.cdc_mounted(addr, index);
        }

        assert_eq!(fx.pool.cdc_instances().len(), crate::pool::MAX_CDC);
        assert_eq!(fx.stats.dropped_class_mounts, 1);
    }

    #[test]
    fn test_hid_mount_parses_usage() {
        let mut fx = Fixture::new(4);
        let addr = mock_address(1);
        let mut bridge = fx.bridge();
        bridge.device_mounted(addr, &create_mock_device_descriptor(1, 2));
        bridge.hid_mounted(addr, 0, 1, &boot_keyboard_report_descriptor());

        let slot = &fx.pool.hid[0];
        assert_eq!(slot.protocol, HidProtocol::Keyboard);
        assert_eq!(slot.usage_page, 0x01);
        assert_eq!(slot.usage, 0x06);
        assert!(slot.rearm);
    }

    #[test]
    fn test_oversize_hid_report_dropped() {
        let mut fx = Fixture::new(4);
        let addr = mock_address(1);
        let mut bridge = fx.bridge();
        bridge.device_mounted(addr, &create_mock_device_descriptor(1, 2));
        bridge.hid_mounted(addr, 0, 3, &[]);
        bridge.hid_report(addr, 0, &[0u8; HID_MAX_REPORT_SIZE + 1]);

        assert!(!fx.pool.hid[0].report_ready);
        assert_eq!(fx.stats.dropped_reports, 1);
    }

    #[test]
    fn test_cdc_rx_schedules_once_until_run() {
        let mut fx = Fixture::new(4);
        let addr = mock_address(1);
        {
            let mut bridge = fx.bridge();
            bridge.device_mounted(addr, &create_mock_device_descriptor(1, 2));
            bridge.cdc_mounted(addr, 0);
        }
        fx.pool.cdc[0].irq = IrqSlot::Installed(IrqHandler::callable(|_, _| {}));

        let mut bridge = fx.bridge();
        bridge.cdc_rx(0);
        bridge.cdc_rx(0);
        bridge.cdc_rx(0);

        assert_eq!(fx.runner.len(), 1);
        assert!(matches!(fx.runner.try_next(), Some(Deferred::CdcRx { slot: 0, .. })));
    }

    #[test]
    fn test_full_queue_counts_dropped_notification() {
        let mut fx = Fixture::new(1);
        let addr = mock_address(1);
        {
            let mut bridge = fx.bridge();
            bridge.device_mounted(addr, &create_mock_device_descriptor(1, 2));
            bridge.hid_mounted(addr, 0, 3, &[]);
            bridge.hid_mounted(addr, 1, 3, &[]);
        }
        fx.pool.hid[0].irq = IrqSlot::Installed(IrqHandler::callable(|_, _| {}));
        fx.pool.hid[1].irq = IrqSlot::Installed(IrqHandler::callable(|_, _| {}));

        let mut bridge = fx.bridge();
        bridge.hid_report(addr, 0, &[1]);
        bridge.hid_report(addr, 1, &[2]);

        assert_eq!(fx.stats.dropped_notifications, 1);
        // The report itself is kept even though the notification was lost.
        assert!(fx.pool.hid[1].report_ready);
        assert!(!fx.pool.hid[1].irq_scheduled);
    }

    #[test]
    fn test_transfer_complete_clears_pending_last() {
        let mut fx = Fixture::new(4);
        let addr = mock_address(1);
        {
            let mut bridge = fx.bridge();
            bridge.device_mounted(addr, &create_mock_device_descriptor(1, 2));
            bridge.msc_mounted(addr, &lun(10));
        }
        fx.pool.msc[0].operation_pending = true;
        let tag = TransferTag {
            slot: 0,
            generation: fx.pool.msc[0].bind.generation,
        };

        fx.bridge().transfer_complete(
            addr,
            tag,
            TransferStatus::Success,
            TransferBuffer::with_len(512),
        );

        let slot = &fx.pool.msc[0];
        assert!(!slot.operation_pending);
        assert!(slot.operation_success);
        assert_eq!(slot.buffer.as_ref().map(TransferBuffer::len), Some(512));
    }

    #[test]
    fn test_stale_completion_is_ignored() {
        let mut fx = Fixture::new(4);
        let addr = mock_address(1);
        {
            let mut bridge = fx.bridge();
            bridge.device_mounted(addr, &create_mock_device_descriptor(1, 2));
            bridge.msc_mounted(addr, &lun(10));
        }
        fx.pool.msc[0].operation_pending = true;
        let stale = TransferTag {
            slot: 0,
            generation: fx.pool.msc[0].bind.generation.wrapping_sub(1),
        };

        fx.bridge()
            .transfer_complete(addr, stale, TransferStatus::Success, TransferBuffer::default());

        assert!(fx.pool.msc[0].operation_pending);
        assert_eq!(fx.stats.stray_completions, 1);
    }
}
