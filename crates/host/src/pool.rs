//! Device pool registry
//!
//! Fixed arrays of device and class-instance slots, sized at compile time.
//! Lookups never allocate or block, so the event bridge can use them from
//! callback context. A device at bus address `n` always lives in slot `n - 1`;
//! class instances take the first free slot of their kind.

use crate::controller::TransferBuffer;
use crate::irq::IrqSlot;
use common::usb_types::{DeviceAddress, DeviceDescriptor, HidProtocol, TransferStatus};

pub const MAX_DEVICES: usize = 8;
pub const MAX_CDC: usize = 4;
pub const MAX_MSC: usize = 4;
pub const MAX_HID: usize = 4;
pub const HID_MAX_REPORT_SIZE: usize = 64;
pub const MAX_STRING_LEN: usize = 32;

/// A mounted device, valid until that device is unmounted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub(crate) addr: DeviceAddress,
    pub(crate) generation: u32,
}

impl DeviceHandle {
    pub fn addr(&self) -> DeviceAddress {
        self.addr
    }
}

/// A CDC instance, valid until its interface or device is unmounted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CdcHandle {
    pub(crate) slot: u8,
    pub(crate) generation: u32,
}

/// A mass-storage logical unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MscHandle {
    pub(crate) slot: u8,
    pub(crate) generation: u32,
}

/// A HID interface instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HidHandle {
    pub(crate) slot: u8,
    pub(crate) generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum BindState {
    #[default]
    Free,
    /// Bound before its device mounted; promoted when it does
    Staged,
    Connected,
}

/// Occupancy header shared by every class slot
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Binding {
    pub state: BindState,
    pub generation: u32,
    pub addr: Option<DeviceAddress>,
}

impl Binding {
    pub fn is_free(&self) -> bool {
        self.state == BindState::Free
    }

    pub fn is_connected(&self) -> bool {
        self.state == BindState::Connected
    }

    pub fn belongs_to(&self, addr: DeviceAddress) -> bool {
        !self.is_free() && self.addr == Some(addr)
    }

    /// Take the slot for a new instance; it stays invisible until `connect`
    pub fn occupy(&mut self, addr: DeviceAddress) {
        self.generation = self.generation.wrapping_add(1);
        self.addr = Some(addr);
        self.state = BindState::Staged;
    }

    pub fn connect(&mut self) {
        self.state = BindState::Connected;
    }

    pub fn release(&mut self) {
        self.state = BindState::Free;
    }
}

pub(crate) trait ClassSlot {
    fn binding(&self) -> &Binding;
    fn binding_mut(&mut self) -> &mut Binding;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum StringState {
    #[default]
    NotFetched,
    Absent,
    Present,
}

/// Fixed-capacity UTF-8 string fetched lazily from a string descriptor
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct StringSlot {
    pub state: StringState,
    pub buf: [u8; MAX_STRING_LEN],
    pub len: usize,
}

impl StringSlot {
    pub fn reset(&mut self) {
        self.state = StringState::NotFetched;
        self.len = 0;
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.state {
            StringState::Present => std::str::from_utf8(&self.buf[..self.len]).ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct DeviceSlot {
    pub mounted: bool,
    pub generation: u32,
    pub desc: DeviceDescriptor,
    pub manufacturer: StringSlot,
    pub product: StringSlot,
    pub serial: StringSlot,
}

#[derive(Debug, Default)]
pub(crate) struct CdcSlot {
    pub bind: Binding,
    /// Controller-wide CDC interface index
    pub index: u8,
    pub irq: IrqSlot,
    pub irq_scheduled: bool,
    pub needs_line_coding: bool,
}

#[derive(Debug, Default)]
pub(crate) struct MscSlot {
    pub bind: Binding,
    pub lun: u8,
    pub block_size: u32,
    pub block_count: u32,
    pub read_only: bool,
    pub operation_pending: bool,
    pub operation_success: bool,
    pub operation_status: Option<TransferStatus>,
    /// Home of the transfer buffer while no transfer owns it
    pub buffer: Option<TransferBuffer>,
}

#[derive(Debug)]
pub(crate) struct HidSlot {
    pub bind: Binding,
    pub instance: u8,
    pub protocol: HidProtocol,
    pub usage_page: u16,
    pub usage: u16,
    pub report: [u8; HID_MAX_REPORT_SIZE],
    pub report_len: usize,
    pub report_ready: bool,
    pub irq: IrqSlot,
    pub irq_scheduled: bool,
    pub rearm: bool,
}

impl Default for HidSlot {
    fn default() -> Self {
        Self {
            bind: Binding::default(),
            instance: 0,
            protocol: HidProtocol::None,
            usage_page: 0,
            usage: 0,
            report: [0; HID_MAX_REPORT_SIZE],
            report_len: 0,
            report_ready: false,
            irq: IrqSlot::Empty,
            irq_scheduled: false,
            rearm: false,
        }
    }
}

macro_rules! impl_class_slot {
    ($($slot:ty),*) => {
        $(impl ClassSlot for $slot {
            fn binding(&self) -> &Binding {
                &self.bind
            }

            fn binding_mut(&mut self) -> &mut Binding {
                &mut self.bind
            }
        })*
    };
}

impl_class_slot!(CdcSlot, MscSlot, HidSlot);

/// Registry of every device and class-instance slot
#[derive(Debug)]
pub struct DevicePool {
    pub(crate) devices: [DeviceSlot; MAX_DEVICES],
    pub(crate) cdc: [CdcSlot; MAX_CDC],
    pub(crate) msc: [MscSlot; MAX_MSC],
    pub(crate) hid: [HidSlot; MAX_HID],
}

impl Default for DevicePool {
    fn default() -> Self {
        Self::new()
    }
}

impl DevicePool {
    pub fn new() -> Self {
        Self {
            devices: std::array::from_fn(|_| DeviceSlot::default()),
            cdc: std::array::from_fn(|_| CdcSlot::default()),
            msc: std::array::from_fn(|_| MscSlot::default()),
            hid: std::array::from_fn(|_| HidSlot::default()),
        }
    }

    /// Slot index reserved for `addr`, or `None` if the address is beyond the pool
    pub fn claim_device_slot(&self, addr: DeviceAddress) -> Option<usize> {
        let index = usize::from(addr.get()) - 1;
        (index < MAX_DEVICES).then_some(index)
    }

    pub(crate) fn device_slot(&self, addr: DeviceAddress) -> Option<&DeviceSlot> {
        self.claim_device_slot(addr).map(|i| &self.devices[i])
    }

    pub(crate) fn device_slot_mut(&mut self, addr: DeviceAddress) -> Option<&mut DeviceSlot> {
        self.claim_device_slot(addr).map(|i| &mut self.devices[i])
    }

    pub fn is_mounted(&self, addr: DeviceAddress) -> bool {
        self.device_slot(addr).is_some_and(|d| d.mounted)
    }

    /// Handle to the mounted device at `addr`
    pub fn find_device(&self, addr: DeviceAddress) -> Option<DeviceHandle> {
        self.device_slot(addr)
            .filter(|d| d.mounted)
            .map(|d| DeviceHandle {
                addr,
                generation: d.generation,
            })
    }

    /// Handle to the CDC instance bound to controller interface `index`
    pub fn find_cdc(&self, index: u8) -> Option<CdcHandle> {
        self.cdc_slot_by_index(index)
            .filter(|&i| self.cdc[i].bind.is_connected())
            .map(|i| CdcHandle {
                slot: i as u8,
                generation: self.cdc[i].bind.generation,
            })
    }

    /// Handle to the MSC instance for logical unit `lun` of `addr`
    pub fn find_msc(&self, addr: DeviceAddress, lun: u8) -> Option<MscHandle> {
        self.msc_slot_by_lun(addr, lun)
            .filter(|&i| self.msc[i].bind.is_connected())
            .map(|i| MscHandle {
                slot: i as u8,
                generation: self.msc[i].bind.generation,
            })
    }

    /// Handle to HID interface `instance` of `addr`
    pub fn find_hid(&self, addr: DeviceAddress, instance: u8) -> Option<HidHandle> {
        self.hid_slot_by_instance(addr, instance)
            .filter(|&i| self.hid[i].bind.is_connected())
            .map(|i| HidHandle {
                slot: i as u8,
                generation: self.hid[i].bind.generation,
            })
    }

    pub(crate) fn cdc_slot_by_index(&self, index: u8) -> Option<usize> {
        self.cdc
            .iter()
            .position(|s| !s.bind.is_free() && s.index == index)
    }

    pub(crate) fn msc_slot_by_lun(&self, addr: DeviceAddress, lun: u8) -> Option<usize> {
        self.msc
            .iter()
            .position(|s| s.bind.belongs_to(addr) && s.lun == lun)
    }

    pub(crate) fn hid_slot_by_instance(&self, addr: DeviceAddress, instance: u8) -> Option<usize> {
        self.hid
            .iter()
            .position(|s| s.bind.belongs_to(addr) && s.instance == instance)
    }

    fn parent_mounted(&self, bind: &Binding) -> bool {
        bind.addr.is_some_and(|addr| self.is_mounted(addr))
    }

    pub(crate) fn device_active(&self, handle: DeviceHandle) -> Option<&DeviceSlot> {
        self.device_slot(handle.addr)
            .filter(|d| d.mounted && d.generation == handle.generation)
    }

    /// Slot index of a CDC handle whose instance and device are both live
    pub(crate) fn cdc_active(&self, handle: CdcHandle) -> Option<usize> {
        let i = usize::from(handle.slot);
        let slot = self.cdc.get(i)?;
        (slot.bind.is_connected()
            && slot.bind.generation == handle.generation
            && self.parent_mounted(&slot.bind))
        .then_some(i)
    }

    pub(crate) fn msc_active(&self, handle: MscHandle) -> Option<usize> {
        let i = usize::from(handle.slot);
        let slot = self.msc.get(i)?;
        (slot.bind.is_connected()
            && slot.bind.generation == handle.generation
            && self.parent_mounted(&slot.bind))
        .then_some(i)
    }

    pub(crate) fn hid_active(&self, handle: HidHandle) -> Option<usize> {
        let i = usize::from(handle.slot);
        let slot = self.hid.get(i)?;
        (slot.bind.is_connected()
            && slot.bind.generation == handle.generation
            && self.parent_mounted(&slot.bind))
        .then_some(i)
    }

    /// Mounted devices in slot order
    pub fn devices(&self) -> Vec<DeviceHandle> {
        self.devices
            .iter()
            .enumerate()
            .filter(|(_, d)| d.mounted)
            .filter_map(|(i, d)| {
                DeviceAddress::new(i as u8 + 1).map(|addr| DeviceHandle {
                    addr,
                    generation: d.generation,
                })
            })
            .collect()
    }

    pub fn cdc_instances(&self) -> Vec<CdcHandle> {
        (0..MAX_CDC)
            .filter(|&i| self.cdc[i].bind.is_connected() && self.parent_mounted(&self.cdc[i].bind))
            .map(|i| CdcHandle {
                slot: i as u8,
                generation: self.cdc[i].bind.generation,
            })
            .collect()
    }

    pub fn msc_instances(&self) -> Vec<MscHandle> {
        (0..MAX_MSC)
            .filter(|&i| self.msc[i].bind.is_connected() && self.parent_mounted(&self.msc[i].bind))
            .map(|i| MscHandle {
                slot: i as u8,
                generation: self.msc[i].bind.generation,
            })
            .collect()
    }

    pub fn hid_instances(&self) -> Vec<HidHandle> {
        (0..MAX_HID)
            .filter(|&i| self.hid[i].bind.is_connected() && self.parent_mounted(&self.hid[i].bind))
            .map(|i| HidHandle {
                slot: i as u8,
                generation: self.hid[i].bind.generation,
            })
            .collect()
    }

    /// Free every class slot, staged or connected, for controller teardown
    pub(crate) fn release_instances(&mut self) -> usize {
        release_occupied(&mut self.cdc)
            + release_occupied(&mut self.msc)
            + release_occupied(&mut self.hid)
    }
}

/// First slot not occupied by any instance
pub(crate) fn first_free<S: ClassSlot>(slots: &[S]) -> Option<usize> {
    slots.iter().position(|s| s.binding().is_free())
}

/// Promote staged instances of `addr` to connected
pub(crate) fn connect_staged<S: ClassSlot>(slots: &mut [S], addr: DeviceAddress) -> usize {
    let mut promoted = 0;
    for slot in slots.iter_mut() {
        let bind = slot.binding_mut();
        if bind.belongs_to(addr) && bind.state == BindState::Staged {
            bind.connect();
            promoted += 1;
        }
    }
    promoted
}

/// Release every instance of `addr`, staged or connected
pub(crate) fn release_all<S: ClassSlot>(slots: &mut [S], addr: DeviceAddress) -> usize {
    let mut released = 0;
    for slot in slots.iter_mut() {
        let bind = slot.binding_mut();
        if bind.belongs_to(addr) {
            bind.release();
            released += 1;
        }
    }
    released
}

/// Release every occupied slot; generations are kept so old handles stay stale
pub(crate) fn release_occupied<S: ClassSlot>(slots: &mut [S]) -> usize {
    let mut released = 0;
    for slot in slots.iter_mut() {
        let bind = slot.binding_mut();
        if !bind.is_free() {
            bind.release();
            released += 1;
        }
    }
    released
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::mock_address;

    #[test]
    fn test_claim_device_slot_uses_address_minus_one() {
        let pool = DevicePool::new();
        assert_eq!(pool.claim_device_slot(mock_address(1)), Some(0));
        assert_eq!(
            pool.claim_device_slot(mock_address(MAX_DEVICES as u8)),
            Some(MAX_DEVICES - 1)
        );
        assert_eq!(pool.claim_device_slot(mock_address(MAX_DEVICES as u8 + 1)), None);
        assert_eq!(pool.claim_device_slot(mock_address(127)), None);
    }

    #[test]
    fn test_find_device_requires_mount() {
        let mut pool = DevicePool::new();
        let addr = mock_address(2);
        assert!(pool.find_device(addr).is_none());

        pool.devices[1].mounted = true;
        pool.devices[1].generation = 7;
        let handle = pool.find_device(addr).unwrap();
        assert_eq!(handle.addr(), addr);
        assert!(pool.device_active(handle).is_some());

        pool.devices[1].generation = 8;
        assert!(pool.device_active(handle).is_none());
    }

    #[test]
    fn test_first_free_scans_in_order() {
        let mut pool = DevicePool::new();
        assert_eq!(first_free(&pool.cdc), Some(0));
        pool.cdc[0].bind.occupy(mock_address(1));
        pool.cdc[1].bind.occupy(mock_address(1));
        assert_eq!(first_free(&pool.cdc), Some(2));
        pool.cdc[0].bind.release();
        assert_eq!(first_free(&pool.cdc), Some(0));
    }

    #[test]
    fn test_staged_instance_is_not_active_until_promoted() {
        let mut pool = DevicePool::new();
        let addr = mock_address(1);
        pool.hid[0].bind.occupy(addr);
        pool.hid[0].instance = 0;
        let handle = HidHandle {
            slot: 0,
            generation: pool.hid[0].bind.generation,
        };
        assert!(pool.hid_active(handle).is_none());
        assert!(pool.find_hid(addr, 0).is_none());

        pool.devices[0].mounted = true;
        assert_eq!(connect_staged(&mut pool.hid, addr), 1);
        assert_eq!(pool.hid_active(handle), Some(0));
        assert_eq!(pool.find_hid(addr, 0), Some(handle));
    }

    #[test]
    fn test_release_all_matches_address_only() {
        let mut pool = DevicePool::new();
        pool.msc[0].bind.occupy(mock_address(1));
        pool.msc[1].bind.occupy(mock_address(2));
        pool.msc[2].bind.occupy(mock_address(1));

        assert_eq!(release_all(&mut pool.msc, mock_address(1)), 2);
        assert!(pool.msc[0].bind.is_free());
        assert!(!pool.msc[1].bind.is_free());
        assert!(pool.msc[2].bind.is_free());
    }

    #[test]
    fn test_release_instances_frees_staged_and_keeps_generation() {
        let mut pool = DevicePool::new();
        pool.devices[0].mounted = true;
        pool.cdc[0].bind.occupy(mock_address(1));
        pool.cdc[0].bind.connect();
        pool.hid[1].bind.occupy(mock_address(5));
        let generation = pool.hid[1].bind.generation;

        assert_eq!(pool.release_instances(), 2);
        assert!(pool.cdc.iter().all(|s| s.bind.is_free()));
        assert!(pool.hid.iter().all(|s| s.bind.is_free()));
        assert_eq!(pool.hid[1].bind.generation, generation);
        assert_eq!(pool.release_instances(), 0);
    }

    #[test]
    fn test_reoccupied_slot_gets_new_generation() {
        let mut bind = Binding::default();
        bind.occupy(mock_address(1));
        let first = bind.generation;
        bind.release();
        bind.occupy(mock_address(1));
        assert_ne!(first, bind.generation);
    }

    #[test]
    fn test_string_slot() {
        let mut slot = StringSlot::default();
        assert_eq!(slot.as_str(), None);
        slot.buf[..4].copy_from_slice(b"Acme");
        slot.len = 4;
        slot.state = StringState::Present;
        assert_eq!(slot.as_str(), Some("Acme"));
        slot.reset();
        assert_eq!(slot.as_str(), None);
    }
}
