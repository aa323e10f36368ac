//! The USB host context
//!
//! [`UsbHost`] owns the controller, the device pool and the deferred-callback
//! queue. It is created explicitly by whatever brings the hardware up and
//! passed by `&mut` to every operation; there is no process-wide instance.

use crate::bridge::{BridgeStats, EventBridge};
use crate::cdc::CdcPort;
use crate::config::HostConfig;
use crate::controller::{HostController, HostEvents};
use crate::device::DevicePort;
use crate::error::{Result, UsbhError};
use crate::hid::HidPort;
use crate::irq::{Deferred, IrqEvent};
use crate::msc::MscPort;
use crate::pool::{CdcHandle, DeviceHandle, DevicePool, HidHandle, MscHandle};
use crate::pump::{IrqLine, PumpSignal, PumpStats};
use common::usb_types::DeviceAddress;
use common::{ScheduleRunner, Scheduler, create_schedule_queue};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Diagnostic counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostStats {
    pub bridge: BridgeStats,
    pub pump: PumpStats,
    /// Notifications waiting for the next safe point
    pub queued_notifications: usize,
}

pub struct UsbHost {
    controller: Box<dyn HostController>,
    pool: DevicePool,
    scheduler: Scheduler<Deferred>,
    runner: ScheduleRunner<Deferred>,
    signal: Arc<PumpSignal>,
    config: HostConfig,
    bridge_stats: BridgeStats,
    initialized: bool,
    active: bool,
    dispatching: bool,
}

impl UsbHost {
    /// Create the host context; activates immediately when `host.auto_activate` is set
    pub fn new(controller: Box<dyn HostController>, config: HostConfig) -> Result<Self> {
        let (scheduler, runner) = create_schedule_queue(config.scheduler.queue_depth);
        let auto_activate = config.host.auto_activate;

        let mut host = Self {
            controller,
            pool: DevicePool::new(),
            scheduler,
            runner,
            signal: PumpSignal::new(),
            config,
            bridge_stats: BridgeStats::default(),
            initialized: false,
            active: false,
            dispatching: false,
        };

        if auto_activate {
            host.active(true)?;
        }
        Ok(host)
    }

    /// Switch the host on or off, returning the previous state
    ///
    /// The controller is brought up on first activation. Deactivating unmounts
    /// every device and shuts the controller down.
    pub fn active(&mut self, active: bool) -> Result<bool> {
        let was_active = self.active;
        if active == was_active {
            return Ok(was_active);
        }

        if active {
            if !self.initialized {
                self.controller
                    .init(IrqLine::new(Arc::clone(&self.signal)))?;
                self.initialized = true;
            }
            self.active = true;
            self.signal.request();
            info!("USB host activated");
        } else {
            self.release_devices();
            self.controller.deinit();
            self.initialized = false;
            self.active = false;
            info!("USB host deactivated");
        }
        Ok(was_active)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Tear the host down; safe to call more than once
    pub fn deinit(&mut self) {
        if self.initialized || self.active {
            self.release_devices();
            self.controller.deinit();
            self.initialized = false;
            self.active = false;
            info!("USB host deinitialized");
        }
    }

    fn release_devices(&mut self) {
        let mounted = self.pool.devices();
        let mut bridge = EventBridge::new(&mut self.pool, &self.scheduler, &mut self.bridge_stats);
        for handle in mounted {
            bridge.device_unmounted(handle.addr());
        }

        // Instances staged for devices that never mounted go too.
        let staged = self.pool.release_instances();
        if staged > 0 {
            debug!("Released {} staged interfaces", staged);
        }
    }

    /// A handle the controller's interrupt path can raise from any thread
    pub fn irq_line(&self) -> IrqLine {
        IrqLine::new(Arc::clone(&self.signal))
    }

    /// Mark a pump as owed; coalesces with any request already pending
    pub fn request_task(&self) -> bool {
        self.signal.request()
    }

    pub(crate) fn signal(&self) -> Arc<PumpSignal> {
        Arc::clone(&self.signal)
    }

    /// Pump the controller once
    ///
    /// Clears the pending marker and lets the controller process whatever it
    /// has ready, without blocking. Returns whether the controller ran: it is
    /// skipped while the host is inactive.
    pub fn task(&mut self) -> bool {
        self.signal.take();
        if !(self.initialized && self.active) {
            return false;
        }

        let mut bridge = EventBridge::new(&mut self.pool, &self.scheduler, &mut self.bridge_stats);
        self.controller.task(&mut bridge);
        self.apply_follow_ups();
        trace!("Host task pumped");
        true
    }

    /// Work the callbacks left for application context
    fn apply_follow_ups(&mut self) {
        let coding = self.config.cdc.line_coding;
        for slot in self.pool.cdc.iter_mut() {
            if slot.needs_line_coding && slot.bind.is_connected() {
                slot.needs_line_coding = false;
                if !self.controller.cdc_set_line_coding(slot.index, &coding) {
                    warn!("Failed to set line coding on CDC interface {}", slot.index);
                }
            }
        }

        for slot in self.pool.hid.iter_mut() {
            if !slot.rearm || !slot.bind.is_connected() {
                continue;
            }
            let Some(addr) = slot.bind.addr else {
                continue;
            };
            // Left set on failure so the next pump tries again.
            if self.controller.hid_receive_report(addr, slot.instance) {
                slot.rearm = false;
            }
        }
    }

    /// Safe point: pump if a pump is owed, then run queued IRQ handlers
    ///
    /// Returns the number of handlers run.
    pub fn poll(&mut self) -> usize {
        if self.signal.is_pending() {
            self.task();
        }
        self.run_scheduled()
    }

    /// Pump unconditionally and run queued handlers; used by blocking waits
    pub(crate) fn pump(&mut self) {
        self.task();
        self.run_scheduled();
    }

    /// Keep polling until `timeout` passes, sleeping until the next IRQ in between
    pub fn wait(&mut self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let slice = self.config.scheduler.wait_slice;
        let mut ran = 0;
        loop {
            ran += self.poll();
            let now = Instant::now();
            if now >= deadline {
                return ran;
            }
            self.signal.wait(slice.min(deadline - now));
        }
    }

    pub fn wait_ms(&mut self, ms: u64) -> usize {
        self.wait(Duration::from_millis(ms))
    }

    /// Run every queued IRQ handler
    ///
    /// Does nothing when called from inside a handler.
    pub fn run_scheduled(&mut self) -> usize {
        if self.dispatching {
            return 0;
        }
        self.dispatching = true;

        let mut ran = 0;
        while let Some(item) = self.runner.try_next() {
            if self.dispatch(item) {
                ran += 1;
            }
        }

        self.dispatching = false;
        ran
    }

    fn dispatch(&mut self, item: Deferred) -> bool {
        match item {
            Deferred::CdcRx { slot, generation } => {
                let i = usize::from(slot);
                let Some(cdc) = self.pool.cdc.get_mut(i) else {
                    return false;
                };
                if cdc.bind.generation != generation {
                    return false;
                }
                cdc.irq_scheduled = false;
                if !cdc.bind.is_connected() {
                    return false;
                }
                let Some(mut handler) = cdc.irq.begin() else {
                    return false;
                };

                let keep = handler.dispatch(self, IrqEvent::CdcRx(CdcHandle { slot, generation }));

                let cdc = &mut self.pool.cdc[i];
                if cdc.bind.generation == generation {
                    cdc.irq.finish(handler, keep);
                }
                if !keep {
                    debug!("CDC IRQ handler on slot {} completed", slot);
                }
                true
            }
            Deferred::HidReport { slot, generation } => {
                let i = usize::from(slot);
                let Some(hid) = self.pool.hid.get_mut(i) else {
                    return false;
                };
                if hid.bind.generation != generation {
                    return false;
                }
                hid.irq_scheduled = false;
                if !hid.bind.is_connected() {
                    return false;
                }
                let Some(mut handler) = hid.irq.begin() else {
                    return false;
                };

                let keep =
                    handler.dispatch(self, IrqEvent::HidReport(HidHandle { slot, generation }));

                let hid = &mut self.pool.hid[i];
                if hid.bind.generation == generation {
                    hid.irq.finish(handler, keep);
                }
                if !keep {
                    debug!("HID IRQ handler on slot {} completed", slot);
                }
                true
            }
        }
    }

    /// Mounted devices; empty while inactive
    pub fn devices(&self) -> Vec<DeviceHandle> {
        if !self.active {
            return Vec::new();
        }
        self.pool.devices()
    }

    pub fn cdc_devices(&self) -> Vec<CdcHandle> {
        if !self.active {
            return Vec::new();
        }
        self.pool.cdc_instances()
    }

    pub fn msc_devices(&self) -> Vec<MscHandle> {
        if !self.active {
            return Vec::new();
        }
        self.pool.msc_instances()
    }

    pub fn hid_devices(&self) -> Vec<HidHandle> {
        if !self.active {
            return Vec::new();
        }
        self.pool.hid_instances()
    }

    pub fn find_device(&self, addr: DeviceAddress) -> Option<DeviceHandle> {
        self.pool.find_device(addr)
    }

    pub fn find_cdc(&self, index: u8) -> Option<CdcHandle> {
        self.pool.find_cdc(index)
    }

    pub fn find_msc(&self, addr: DeviceAddress, lun: u8) -> Option<MscHandle> {
        self.pool.find_msc(addr, lun)
    }

    pub fn find_hid(&self, addr: DeviceAddress, instance: u8) -> Option<HidHandle> {
        self.pool.find_hid(addr, instance)
    }

    pub fn pool(&self) -> &DevicePool {
        &self.pool
    }

    pub(crate) fn pool_mut(&mut self) -> &mut DevicePool {
        &mut self.pool
    }

    pub(crate) fn controller(&self) -> &dyn HostController {
        self.controller.as_ref()
    }

    pub(crate) fn controller_mut(&mut self) -> &mut dyn HostController {
        self.controller.as_mut()
    }

    pub(crate) fn parts(&mut self) -> (&mut dyn HostController, &mut DevicePool) {
        (self.controller.as_mut(), &mut self.pool)
    }

    pub fn device(&mut self, handle: DeviceHandle) -> DevicePort<'_> {
        DevicePort::new(self, handle)
    }

    pub fn cdc(&mut self, handle: CdcHandle) -> CdcPort<'_> {
        CdcPort::new(self, handle)
    }

    pub fn msc(&mut self, handle: MscHandle) -> MscPort<'_> {
        MscPort::new(self, handle)
    }

    pub fn hid(&mut self, handle: HidHandle) -> HidPort<'_> {
        HidPort::new(self, handle)
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn stats(&self) -> HostStats {
        HostStats {
            bridge: self.bridge_stats,
            pump: self.signal.stats(),
            queued_notifications: self.runner.len(),
        }
    }

    /// Fail with `NotActive` unless the host is running
    pub(crate) fn ensure_active(&self) -> Result<()> {
        if self.active {
            Ok(())
        } else {
            Err(UsbhError::NotActive)
        }
    }
}

impl Drop for UsbHost {
    fn drop(&mut self) {
        self.deinit();
    }
}

impl std::fmt::Debug for UsbHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbHost")
            .field("initialized", &self.initialized)
            .field("active", &self.active)
            .field("devices", &self.pool.devices().len())
            .finish_non_exhaustive()
    }
}
