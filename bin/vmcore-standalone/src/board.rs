// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated board built from the configuration, and a guest-side view of
//! the config ports.

use std::collections::BTreeSet;
use std::sync::Arc;

use slog::{debug, Logger};
use vmcore::hw::pci::bar::BAR_COUNT;
use vmcore::hw::pci::{bits, Bdf};
use vmcore::platform::sim::{SimBar, SimFunction, SimPlatform};
use vmcore::VmId;
use vmcore_config_toml::Config;

/// Size of the single memory BAR given to each simulated endpoint.
const ENDPOINT_BAR_SIZE: u64 = 0x1000;
/// Base from which endpoint BARs are laid out, one MiB apart.
const ENDPOINT_BAR_BASE: u64 = 0xa000_0000;

/// Populate a simulated platform with every physical function the VMs name
/// and every boot module the configuration lists.
///
/// Function 00:00.0 is the host bridge; everything else is an endpoint with
/// one 32-bit memory BAR.
pub fn build(config: &Config, log: &Logger) -> Arc<SimPlatform> {
    let sim = Arc::new(SimPlatform::new());

    for module in config.modules.iter() {
        sim.add_boot_module(&module.tag, module.hpa, module.size);
    }

    let pbdfs: BTreeSet<Bdf> = config
        .vm
        .iter()
        .flat_map(|vm| vm.pci_ptdevs.iter())
        .map(|dev| Bdf::from(dev.pbdf))
        .collect();

    let host_bridge = Bdf::new(0, 0, 0);
    for (n, bdf) in pbdfs.into_iter().enumerate() {
        let func = if Some(bdf) == host_bridge {
            SimFunction::bridge(bits::VENDOR_INTEL, 0x5af0)
        } else {
            let mut bars = [None; BAR_COUNT];
            bars[0] = Some(SimBar::Mem32 {
                size: ENDPOINT_BAR_SIZE,
                base: ENDPOINT_BAR_BASE + n as u64 * 0x10_0000,
            });
            let device = 0x1000 | u16::from(bdf.dev.get());
            SimFunction::endpoint(bits::VENDOR_INTEL, device, bars)
        };
        debug!(log, "simulated function"; "bdf" => %bdf);
        sim.add_function(bdf, func);
    }
    sim
}

/// A function found by a guest scanning bus 0.
pub struct Found {
    pub bdf: Bdf,
    pub vendor: u16,
    pub device: u16,
    pub bar0: u32,
}

/// Walk bus 0 the way guest firmware would, through the 0xcf8/0xcfc pair.
pub fn scan_bus0(sim: &SimPlatform, vm: VmId) -> Vec<Found> {
    let read = |bdf: Bdf, reg: u8| {
        let addr = bits::CFG_ADDR_ENABLE
            | u32::from(bdf.to_raw()) << 8
            | u32::from(reg) & bits::CFG_ADDR_REG_MASK;
        sim.pio_out(vm, bits::PORT_PCI_CONFIG_ADDR, 4, addr);
        sim.pio_in(vm, bits::PORT_PCI_CONFIG_DATA, 4)
    };

    (0..=bits::MASK_DEV)
        .filter_map(|dev| Bdf::new(0, dev, 0))
        .filter_map(|bdf| {
            let id = read(bdf, bits::OFF_VENDOR as u8);
            if id == u32::MAX {
                return None;
            }
            Some(Found {
                bdf,
                vendor: id as u16,
                device: (id >> 16) as u16,
                bar0: read(bdf, bits::OFF_BAR0 as u8),
            })
        })
        .collect()
}
