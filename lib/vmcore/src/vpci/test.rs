// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use slog::Logger;
use vmcore_types::{PtdevConfig, VmConfig, VmType};

use super::*;
use crate::hw::pci::bar::BAR_COUNT;
use crate::hw::pci::BarN;
use crate::platform::sim::{
    SimBar, SimEvent, SimFail, SimFunction, SimMapping, SimPlatform,
};
use crate::platform::{AddrTable, EptFlags, PhysPci};

// Common test prep setup

pub(crate) struct Scaffold {
    pub sim: Arc<SimPlatform>,
    pub platform: Platform,
    pub log: Logger,
}
impl Scaffold {
    pub(crate) fn new() -> Self {
        let sim = Arc::new(SimPlatform::new());
        Self {
            platform: Platform::from_provider(sim.clone()),
            sim,
            log: Logger::root(slog::Discard, slog::o!()),
        }
    }

    pub(crate) fn vpci(
        &self,
        vm: VmId,
        mode: VpciMode,
        config: &VmConfig,
        claimed: &BTreeSet<Bdf>,
    ) -> Arc<Vpci> {
        let root = self.sim.create(vm).unwrap();
        let vpci = Vpci::new(
            vm,
            mode,
            root,
            Arc::new(Mutex::new(None)),
            &self.platform,
            &self.log,
        );
        vpci.init(config, claimed).unwrap();
        vpci
    }

    /// Latch `bdf`/`reg` through the address port.
    pub(crate) fn latch(&self, vm: VmId, bdf: Bdf, reg: u8) {
        let addr = bits::CFG_ADDR_ENABLE
            | u32::from(bdf.to_raw()) << 8
            | u32::from(reg & 0xfc);
        self.sim.pio_out(vm, bits::PORT_PCI_CONFIG_ADDR, 4, addr);
    }

    pub(crate) fn cfg_read(
        &self,
        vm: VmId,
        bdf: Bdf,
        reg: u8,
        width: u8,
    ) -> u32 {
        self.latch(vm, bdf, reg);
        let port = bits::PORT_PCI_CONFIG_DATA + u16::from(reg & 3);
        self.sim.pio_in(vm, port, width)
    }

    pub(crate) fn cfg_write(
        &self,
        vm: VmId,
        bdf: Bdf,
        reg: u8,
        width: u8,
        val: u32,
    ) {
        self.latch(vm, bdf, reg);
        let port = bits::PORT_PCI_CONFIG_DATA + u16::from(reg & 3);
        self.sim.pio_out(vm, port, width, val);
    }
}

fn vm0() -> VmId {
    VmId::new(0).unwrap()
}

fn bdf(b: u8, d: u8, f: u8) -> Bdf {
    Bdf::new(b, d, f).unwrap()
}

fn ptdev(vbdf: &str, pbdf: &str) -> PtdevConfig {
    PtdevConfig {
        name: None,
        vbdf: vbdf.parse().unwrap(),
        pbdf: pbdf.parse().unwrap(),
    }
}

fn prelaunched(ptdevs: Vec<PtdevConfig>) -> VmConfig {
    VmConfig {
        name: "rtvm".to_string(),
        vm_type: VmType::PreLaunched,
        pcpu_bitmap: 0b10,
        pci_ptdevs: ptdevs,
        ..Default::default()
    }
}

fn mem32_bars(size: u64, base: u64) -> [Option<SimBar>; BAR_COUNT] {
    [Some(SimBar::Mem32 { size, base }), None, None, None, None, None]
}

/// Partition-mode VM with one storage device at 00:01.0, backed by 00:12.0.
fn partition_setup() -> (Scaffold, Arc<Vpci>) {
    let scaffold = Scaffold::new();
    scaffold.sim.add_function(
        bdf(0, 18, 0),
        SimFunction::endpoint(0x8086, 0x5ae3, mem32_bars(0x2000, 0xa000_0000)),
    );
    let config = prelaunched(vec![ptdev("00:01.0", "00:12.0")]);
    let vpci =
        scaffold.vpci(vm0(), VpciMode::Partition, &config, &BTreeSet::new());
    (scaffold, vpci)
}

const ADDR_CLEARED: u32 = 0x00ff_ff00;

#[test]
fn config_read_through_ports() {
    let (s, _vpci) = partition_setup();
    let dev = bdf(0, 1, 0);

    assert_eq!(s.cfg_read(vm0(), dev, 0x00, 4), 0x5ae3_8086);
    // The data access consumed the latched address
    let addr = s.sim.pio_in(vm0(), bits::PORT_PCI_CONFIG_ADDR, 4);
    assert_eq!(addr, ADDR_CLEARED);
    assert_eq!(s.sim.pio_in(vm0(), bits::PORT_PCI_CONFIG_DATA, 4), u32::MAX);

    assert_eq!(s.cfg_read(vm0(), dev, 0x02, 2), 0x5ae3);
    assert_eq!(s.cfg_read(vm0(), dev, 0x0b, 1), u32::from(bits::CLASS_STORAGE));
}

#[test]
fn single_dispatch_per_latch() {
    let s = Scaffold::new();
    let dev = bdf(0, 1, 0);
    s.sim.add_function(
        dev,
        SimFunction::endpoint(0x8086, 0x5ae3, mem32_bars(0x1000, 0xa000_0000)),
    );
    let config = VmConfig {
        name: "sos".to_string(),
        vm_type: VmType::ServiceOs,
        pcpu_bitmap: 0b1,
        ..Default::default()
    };
    let _vpci = s.vpci(vm0(), VpciMode::Sharing, &config, &BTreeSet::new());
    let port = bits::PORT_PCI_CONFIG_ADDR;

    s.sim.pio_out(vm0(), port, 4, 0x8000_0810);
    assert_eq!(s.sim.pio_in(vm0(), port, 4), 0x8000_0810);

    let before = s.sim.cfg_reads(dev).len();
    assert_eq!(s.sim.pio_in(vm0(), bits::PORT_PCI_CONFIG_DATA, 4), 0xa000_0000);
    assert_eq!(s.sim.cfg_reads(dev)[before..], [(0x10, 4)]);

    assert_eq!(s.sim.pio_in(vm0(), bits::PORT_PCI_CONFIG_DATA, 4), u32::MAX);
    assert_eq!(s.sim.cfg_reads(dev).len(), before + 1);
}

#[test]
fn address_port_readback() {
    let (s, _vpci) = partition_setup();
    let port = bits::PORT_PCI_CONFIG_ADDR;

    s.sim.pio_out(vm0(), port, 4, 0x8000_0813);
    assert_eq!(s.sim.pio_in(vm0(), port, 4), 0x8000_0810);
    // Narrow accesses neither see nor change the latch
    assert_eq!(s.sim.pio_in(vm0(), port, 2), 0xffff);
    s.sim.pio_out(vm0(), port, 1, 0);
    assert_eq!(s.sim.pio_in(vm0(), port, 4), 0x8000_0810);
}

#[test]
fn disabled_address_not_honored() {
    let (s, _vpci) = partition_setup();
    s.sim.pio_out(vm0(), bits::PORT_PCI_CONFIG_ADDR, 4, 0x0000_0800);
    assert_eq!(s.sim.pio_in(vm0(), bits::PORT_PCI_CONFIG_DATA, 4), u32::MAX);
    // Only an enabled latch is cleared by a data access
    assert_eq!(s.sim.pio_in(vm0(), bits::PORT_PCI_CONFIG_ADDR, 4), 0x0000_0800);
}

#[test]
fn missing_device_reads_ones() {
    let (s, _vpci) = partition_setup();
    // 00:12.0 exists physically, but is not part of this VM's hierarchy
    assert_eq!(s.cfg_read(vm0(), bdf(0, 18, 0), 0x00, 4), u32::MAX);
    assert_eq!(s.cfg_read(vm0(), bdf(0, 2, 0), 0x00, 2), 0xffff);

    let before = s.sim.cfg_writes(bdf(0, 18, 0)).len();
    s.cfg_write(vm0(), bdf(0, 2, 0), 0x04, 2, 0x6);
    assert_eq!(s.sim.cfg_writes(bdf(0, 18, 0)).len(), before);
}

#[test]
fn invalid_data_access() {
    let (s, vpci) = partition_setup();

    s.latch(vm0(), bdf(0, 1, 0), 0);
    assert!(matches!(vpci.cfgdata_read(1, 4), Err(Error::InvalidParameter(_))));
    assert_eq!(vpci.cfgaddr_read(4), ADDR_CLEARED);

    s.latch(vm0(), bdf(0, 1, 0), 0);
    assert!(matches!(
        vpci.cfgdata_write(0, 3, 0),
        Err(Error::InvalidParameter(_))
    ));
    assert_eq!(vpci.cfgaddr_read(4), ADDR_CLEARED);

    // Through the port, a window-crossing read reads as ones
    s.latch(vm0(), bdf(0, 1, 0), 0);
    assert_eq!(s.sim.pio_in(vm0(), bits::PORT_PCI_CONFIG_DATA + 3, 2), 0xffff);
}

#[test]
fn passthru_writes_reach_device() {
    let (s, _vpci) = partition_setup();
    s.cfg_write(vm0(), bdf(0, 1, 0), 0x04, 2, 0x0006);
    assert_eq!(s.sim.read(bdf(0, 18, 0), 0x04, 2), 0x0006);
    assert_eq!(s.cfg_read(vm0(), bdf(0, 1, 0), 0x04, 2), 0x0006);
}

#[test]
fn bar_remap() {
    let (s, vpci) = partition_setup();
    let dev = bdf(0, 1, 0);
    let pdev = bdf(0, 18, 0);
    let bar0 = BarN::BAR0.offset() as u8;

    // Unprogrammed, the virtual BAR reads as 0 rather than the host address
    assert_eq!(s.cfg_read(vm0(), dev, bar0, 4), 0);

    s.cfg_write(vm0(), dev, bar0, 4, u32::MAX);
    assert_eq!(s.cfg_read(vm0(), dev, bar0, 4), 0xffff_e000);
    assert!(s.sim.ept_mappings(vm0()).unwrap().is_empty());

    s.cfg_write(vm0(), dev, bar0, 4, 0xc000_0000);
    assert_eq!(s.cfg_read(vm0(), dev, bar0, 4), 0xc000_0000);
    let window = SimMapping {
        hpa: 0xa000_0000,
        len: 0x2000,
        flags: EptFlags::READ | EptFlags::WRITE,
    };
    assert_eq!(
        s.sim.ept_mappings(vm0()).unwrap(),
        BTreeMap::from([(0xc000_0000, window)])
    );

    s.cfg_write(vm0(), dev, bar0, 4, 0xd000_0000);
    assert_eq!(
        s.sim.ept_mappings(vm0()).unwrap(),
        BTreeMap::from([(0xd000_0000, window)])
    );
    assert_eq!(
        vpci.with_vdev(dev, |d| d.mapped_window(BarN::BAR0)),
        Some(Some(0xd000_0000))
    );

    // Partial writes leave the BAR alone
    s.cfg_write(vm0(), dev, bar0, 2, 0x1234);
    assert_eq!(s.cfg_read(vm0(), dev, bar0, 4), 0xd000_0000);
    assert_eq!(s.cfg_read(vm0(), dev, bar0 + 2, 2), 0xd000);

    // The physical BAR is never touched by the guest
    assert_eq!(s.sim.read(pdev, BarN::BAR0.offset(), 4), 0xa000_0000);
}

#[test]
fn mem64_bar_as_mem32() {
    let s = Scaffold::new();
    s.sim.add_function(
        bdf(0, 18, 0),
        SimFunction::endpoint(
            0x8086,
            0x5ae3,
            [
                Some(SimBar::Mem64 { size: 0x4000, base: 0x1_2000_0000 }),
                None,
                None,
                None,
                None,
                None,
            ],
        ),
    );
    let config = prelaunched(vec![ptdev("00:01.0", "00:12.0")]);
    let _vpci = s.vpci(vm0(), VpciMode::Partition, &config, &BTreeSet::new());
    let dev = bdf(0, 1, 0);

    s.cfg_write(vm0(), dev, 0x10, 4, u32::MAX);
    // 32-bit memory type, sized 16K
    assert_eq!(s.cfg_read(vm0(), dev, 0x10, 4), 0xffff_c000);
    // The upper half of the physical BAR is not exposed
    s.cfg_write(vm0(), dev, 0x14, 4, u32::MAX);
    assert_eq!(s.cfg_read(vm0(), dev, 0x14, 4), 0);

    s.cfg_write(vm0(), dev, 0x10, 4, 0xc000_0000);
    let maps = s.sim.ept_mappings(vm0()).unwrap();
    assert_eq!(maps.get(&0xc000_0000).map(|m| m.hpa), Some(0x1_2000_0000));
}

#[test]
fn hostbridge_slot() {
    let s = Scaffold::new();
    s.sim.add_function(bdf(0, 0, 0), SimFunction::bridge(0x8086, 0x1234));
    let config = prelaunched(vec![ptdev("00:00.0", "00:00.0")]);
    let vpci = s.vpci(vm0(), VpciMode::Partition, &config, &BTreeSet::new());
    let hb = bdf(0, 0, 0);

    assert_eq!(vpci.devices(), vec![(hb, None, None)]);
    assert_eq!(s.cfg_read(vm0(), hb, 0x00, 4), 0x5af0_8086);
    assert_eq!(s.cfg_read(vm0(), hb, 0x0e, 1), 0);

    s.cfg_write(vm0(), hb, 0x00, 4, 0);
    assert_eq!(s.cfg_read(vm0(), hb, 0x00, 4), 0x5af0_8086);
    s.cfg_write(vm0(), hb, 0x04, 2, 0x0002);
    assert_eq!(s.cfg_read(vm0(), hb, 0x04, 2), 0x0002);

    // Emulated entirely: nothing reaches the physical function
    assert!(s.sim.cfg_writes(hb).is_empty());
    assert!(s.sim.domains().is_empty());
}

#[test]
fn unsupported_header_keeps_slot() {
    let s = Scaffold::new();
    s.sim.add_function(bdf(0, 5, 0), SimFunction::other(0x8086, 0x1111, 2));
    let config = prelaunched(vec![ptdev("00:05.0", "00:05.0")]);
    let vpci = s.vpci(vm0(), VpciMode::Partition, &config, &BTreeSet::new());

    assert_eq!(vpci.devices(), vec![(bdf(0, 5, 0), Some(bdf(0, 5, 0)), None)]);
    assert_eq!(s.cfg_read(vm0(), bdf(0, 5, 0), 0x00, 4), u32::MAX);
}

#[test]
fn sharing_adds_unclaimed() {
    let s = Scaffold::new();
    for dev in [2, 3, 4] {
        s.sim.add_function(
            bdf(0, dev, 0),
            SimFunction::endpoint(
                0x8086,
                0x1000 + u16::from(dev),
                mem32_bars(0x1000, 0xa000_0000 + u64::from(dev) * 0x10_0000),
            ),
        );
    }
    let config = VmConfig {
        name: "sos".to_string(),
        vm_type: VmType::ServiceOs,
        pcpu_bitmap: 0b1,
        pci_ptdevs: vec![ptdev("00:02.0", "00:02.0")],
        ..Default::default()
    };
    let claimed = BTreeSet::from([bdf(0, 3, 0)]);
    let vpci = s.vpci(vm0(), VpciMode::Sharing, &config, &claimed);

    let vbdfs: Vec<Bdf> = vpci.devices().iter().map(|d| d.0).collect();
    assert_eq!(vbdfs, vec![bdf(0, 2, 0), bdf(0, 4, 0)]);

    // Sharing mode shows the physical BARs as-is
    assert_eq!(s.cfg_read(vm0(), bdf(0, 4, 0), 0x10, 4), 0xa040_0000);
    assert_eq!(s.cfg_read(vm0(), bdf(0, 4, 0), 0x00, 4), 0x1004_8086);
    assert_eq!(s.cfg_read(vm0(), bdf(0, 3, 0), 0x00, 4), u32::MAX);
    assert_eq!(
        vpci.assigned_pbdfs(),
        BTreeSet::from([bdf(0, 2, 0), bdf(0, 4, 0)])
    );
}

#[test]
fn passthru_owns_device() {
    let (s, vpci) = partition_setup();
    let domains = s.sim.domains();
    assert_eq!(domains.len(), 1);
    let (domain, owner) = domains[0];
    assert_eq!(owner, vm0());
    assert_eq!(s.sim.domain_devices(domain), Some(vec![bdf(0, 18, 0)]));

    s.cfg_write(vm0(), bdf(0, 1, 0), 0x10, 4, 0xc000_0000);
    s.sim.clear_events();
    vpci.deinit();

    let events = s.sim.events();
    assert!(events.contains(&SimEvent::EptUnmap {
        vm: vm0(),
        gpa: 0xc000_0000,
        len: 0x2000
    }));
    assert!(events
        .contains(&SimEvent::Unassign { domain, bdf: bdf(0, 18, 0) }));
    assert_eq!(s.sim.domain_devices(domain), Some(vec![]));
    assert!(s.sim.port_ranges(vm0()).is_empty());
    assert!(vpci.devices().is_empty());

    // A second teardown has nothing left to do
    s.sim.clear_events();
    vpci.deinit();
    assert!(s.sim.events().is_empty());
}

#[test]
fn device_init_failure_not_fatal() {
    let s = Scaffold::new();
    s.sim.add_function(
        bdf(0, 18, 0),
        SimFunction::endpoint(0x8086, 0x5ae3, mem32_bars(0x2000, 0xa000_0000)),
    );
    s.sim.fail_on(SimFail::AssignDevice);
    let config = prelaunched(vec![ptdev("00:01.0", "00:12.0")]);
    let vpci = s.vpci(vm0(), VpciMode::Partition, &config, &BTreeSet::new());

    assert_eq!(vpci.devices().len(), 1);
    assert_eq!(s.cfg_read(vm0(), bdf(0, 1, 0), 0x00, 4), 0x5ae3_8086);
}

#[test]
fn port_claim_failure() {
    let s = Scaffold::new();
    s.sim.add_function(
        bdf(0, 18, 0),
        SimFunction::endpoint(0x8086, 0x5ae3, mem32_bars(0x2000, 0xa000_0000)),
    );
    s.sim.fail_on(SimFail::PioRegister);
    let root = s.sim.create(vm0()).unwrap();
    let vpci = Vpci::new(
        vm0(),
        VpciMode::Partition,
        root,
        Arc::new(Mutex::new(None)),
        &s.platform,
        &s.log,
    );
    let config = prelaunched(vec![ptdev("00:01.0", "00:12.0")]);
    let res = vpci.init(&config, &BTreeSet::new());

    assert!(matches!(res, Err(Error::Platform { .. })));
    assert!(vpci.devices().is_empty());
    let (domain, _) = s.sim.domains()[0];
    assert_eq!(s.sim.domain_devices(domain), Some(vec![]));
}

#[test]
fn latch_per_vm() {
    let s = Scaffold::new();
    let vm1 = VmId::new(1).unwrap();
    s.sim.add_function(bdf(0, 0, 0), SimFunction::bridge(0x8086, 0x1234));
    let config = prelaunched(vec![ptdev("00:00.0", "00:00.0")]);
    let _a = s.vpci(vm0(), VpciMode::Partition, &config, &BTreeSet::new());
    let _b = s.vpci(vm1, VpciMode::Partition, &config, &BTreeSet::new());

    s.latch(vm0(), bdf(0, 0, 0), 0);
    assert_eq!(s.sim.pio_in(vm1, bits::PORT_PCI_CONFIG_ADDR, 4), ADDR_CLEARED);
    assert_eq!(s.sim.pio_in(vm1, bits::PORT_PCI_CONFIG_DATA, 4), u32::MAX);
    assert_eq!(s.sim.pio_in(vm0(), bits::PORT_PCI_CONFIG_DATA, 4), 0x5af0_8086);
}
