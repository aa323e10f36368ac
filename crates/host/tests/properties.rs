//! Property Tests
//!
//! # Properties
//! - A CDC instance is connected exactly when its interface is bound and its
//!   device is mounted, across arbitrary mount/unmount sequences
//! - MSC blocks read back what was just written
//! - Out-of-range block numbers fail without issuing a transfer
//!
//! Run with: `cargo test -p host --test properties`

use common::test_utils::{create_mock_device_descriptor, mock_address};
use host::sim::{SimController, SimHandle};
use host::{HostConfig, MscLunInfo, UsbHost, UsbhError};
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};

const BLOCK_SIZE: usize = 512;
const BLOCK_COUNT: u32 = 64;

fn setup() -> (UsbHost, SimHandle) {
    let (controller, hw) = SimController::new();
    let mut usb = UsbHost::new(Box::new(controller), HostConfig::default()).unwrap();
    usb.active(true).unwrap();
    (usb, hw)
}

fn settle(usb: &mut UsbHost) {
    for _ in 0..4 {
        usb.task();
        usb.run_scheduled();
    }
}

fn setup_msc() -> (UsbHost, SimHandle, host::MscHandle) {
    let (mut usb, hw) = setup();
    let addr = mock_address(1);
    hw.plug_device(addr, create_mock_device_descriptor(0x0781, 0x5581));
    hw.plug_msc(
        addr,
        MscLunInfo {
            lun: 0,
            block_size: BLOCK_SIZE as u32,
            block_count: BLOCK_COUNT,
            read_only: false,
        },
    );
    settle(&mut usb);
    let msc = usb.find_msc(addr, 0).unwrap();
    (usb, hw, msc)
}

#[derive(Debug, Clone)]
enum Op {
    MountDevice(u8),
    UnmountDevice(u8),
    MountCdc(u8, u8),
    UnmountCdc(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u8..=3).prop_map(Op::MountDevice),
        (1u8..=3).prop_map(Op::UnmountDevice),
        ((1u8..=3), (0u8..4)).prop_map(|(addr, index)| Op::MountCdc(addr, index)),
        (0u8..4).prop_map(Op::UnmountCdc),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_connected_iff_bound_and_mounted(ops in prop::collection::vec(op_strategy(), 1..30)) {
        let (mut usb, hw) = setup();
        let mut mounted: HashSet<u8> = HashSet::new();
        let mut bound: HashMap<u8, u8> = HashMap::new();

        for op in ops {
            match op {
                Op::MountDevice(addr) => {
                    if mounted.insert(addr) {
                        hw.plug_device(mock_address(addr), create_mock_device_descriptor(1, u16::from(addr)));
                    }
                }
                Op::UnmountDevice(addr) => {
                    hw.device_unmount(mock_address(addr));
                    mounted.remove(&addr);
                    bound.retain(|_, a| *a != addr);
                }
                Op::MountCdc(addr, index) => {
                    if !bound.contains_key(&index) {
                        hw.plug_cdc(mock_address(addr), index);
                        bound.insert(index, addr);
                    }
                }
                Op::UnmountCdc(index) => {
                    hw.unplug_cdc(index);
                    bound.remove(&index);
                }
            }
            settle(&mut usb);

            let mut expected_count = 0;
            for index in 0u8..4 {
                let expected = bound.get(&index).is_some_and(|a| mounted.contains(a));
                let actual = usb
                    .find_cdc(index)
                    .is_some_and(|h| usb.cdc(h).is_connected());
                prop_assert_eq!(actual, expected, "interface {}", index);
                expected_count += usize::from(expected);
            }
            prop_assert_eq!(usb.cdc_devices().len(), expected_count);
        }
    }

    #[test]
    fn prop_msc_write_then_read_round_trips(
        block in 0..BLOCK_COUNT,
        blocks in 1usize..4,
        seed in any::<u8>(),
    ) {
        let (mut usb, _hw, msc) = setup_msc();
        let data: Vec<u8> = (0..blocks * BLOCK_SIZE)
            .map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed))
            .collect();

        let written = usb.msc(msc).writeblocks(block, &data, None).unwrap();
        prop_assert!(written >= 1 && written <= blocks);

        let mut back = vec![0u8; written * BLOCK_SIZE];
        prop_assert_eq!(usb.msc(msc).readblocks(block, &mut back, None), Ok(written));
        prop_assert_eq!(&back[..], &data[..written * BLOCK_SIZE]);
    }

    #[test]
    fn prop_out_of_range_issues_no_transfer(block in BLOCK_COUNT..u32::MAX, write in any::<bool>()) {
        let (mut usb, hw, msc) = setup_msc();
        let mut buf = vec![0u8; BLOCK_SIZE];

        let result = if write {
            usb.msc(msc).writeblocks(block, &buf, None)
        } else {
            usb.msc(msc).readblocks(block, &mut buf, None)
        };

        prop_assert_eq!(result, Err(UsbhError::OutOfRange { block, count: BLOCK_COUNT }));
        let stats = hw.stats();
        prop_assert_eq!(stats.msc_reads + stats.msc_writes, 0);
    }
}
