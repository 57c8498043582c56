// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtual PCI hierarchy of a VM.
//!
//! Guests reach config space through the legacy port pair: a dword write to
//! 0xcf8 latches an address, and the following access to 0xcfc..0xcff is
//! dispatched to the device at that address. What the guest finds there
//! depends on the [VpciMode] in effect.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use slog::{debug, o, warn, Logger};
use vmcore_types::VmConfig;

pub use vmcore_types::VpciMode;

use crate::common::RWOp;
use crate::hw::pci::bits;
use crate::hw::pci::Bdf;
use crate::platform::{
    AddrTable, DomainId, EptRoot, Iommu, PhysPci, Platform, PioFn,
    PioRegistry,
};
use crate::vm::{platform_err, Error, VmId};

pub mod cfgport;
pub mod mode;
pub mod vdev;

use cfgport::PciAddrInfo;
use mode::ModeStrategy;
use vdev::Vdev;

/// Services and identity handed to device hooks.
pub(crate) struct DevCtx {
    pub vm: VmId,
    pub mode: VpciMode,
    pub ept_root: EptRoot,
    pub domain: Arc<Mutex<Option<DomainId>>>,
    pub ept: Arc<dyn AddrTable>,
    pub iommu: Arc<dyn Iommu>,
    pub pci: Arc<dyn PhysPci>,
    pub log: Logger,
}

pub struct Vpci {
    ctx: DevCtx,
    latch: Mutex<PciAddrInfo>,
    devices: Mutex<Vec<Vdev>>,
    pio: Arc<dyn PioRegistry>,
    active: AtomicBool,
}

impl Vpci {
    pub(crate) fn new(
        vm: VmId,
        mode: VpciMode,
        ept_root: EptRoot,
        domain: Arc<Mutex<Option<DomainId>>>,
        platform: &Platform,
        log: &Logger,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx: DevCtx {
                vm,
                mode,
                ept_root,
                domain,
                ept: platform.ept.clone(),
                iommu: platform.iommu.clone(),
                pci: platform.pci.clone(),
                log: log.new(o!("component" => "vpci")),
            },
            latch: Mutex::new(PciAddrInfo::cleared()),
            devices: Mutex::new(Vec::new()),
            pio: platform.pio.clone(),
            active: AtomicBool::new(false),
        })
    }

    pub fn mode(&self) -> VpciMode {
        self.ctx.mode
    }

    /// Populate the device list from `config` and claim the config ports.
    ///
    /// A device whose initialization fails is logged and left in the list;
    /// only failing to claim the ports is an error.
    pub(crate) fn init(
        self: &Arc<Self>,
        config: &VmConfig,
        claimed: &BTreeSet<Bdf>,
    ) -> Result<(), Error> {
        let devices = self.ctx.mode.init(&self.ctx, config, claimed);
        *self.devices.lock().unwrap() = devices;
        self.active.store(true, Ordering::Release);

        let vm = self.ctx.vm;
        let this: Weak<Self> = Arc::downgrade(self);
        let addr_fn: Arc<PioFn> = Arc::new(move |port: u16, rwop: RWOp| {
            if let Some(vpci) = this.upgrade() {
                vpci.pio_addr(port, rwop);
            }
        });
        let this: Weak<Self> = Arc::downgrade(self);
        let data_fn: Arc<PioFn> = Arc::new(move |port: u16, rwop: RWOp| {
            if let Some(vpci) = this.upgrade() {
                vpci.pio_data(port, rwop);
            }
        });

        let res = self
            .pio
            .register(
                vm,
                bits::PORT_PCI_CONFIG_ADDR,
                bits::LEN_PCI_CONFIG_ADDR,
                addr_fn,
            )
            .and_then(|_| {
                self.pio.register(
                    vm,
                    bits::PORT_PCI_CONFIG_DATA,
                    bits::LEN_PCI_CONFIG_DATA,
                    data_fn,
                )
            });
        if let Err(e) = res {
            self.deinit();
            return Err(platform_err("config port registration")(e));
        }
        Ok(())
    }

    /// Tear down every device and release the config ports. Safe to call
    /// more than once.
    pub(crate) fn deinit(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        self.pio.unregister(self.ctx.vm, bits::PORT_PCI_CONFIG_ADDR);
        self.pio.unregister(self.ctx.vm, bits::PORT_PCI_CONFIG_DATA);

        let mut devices = self.devices.lock().unwrap();
        self.ctx.mode.deinit(&self.ctx, &mut devices);
        devices.clear();
        *self.latch.lock().unwrap() = PciAddrInfo::cleared();
    }

    /// Port handler for the config-address register.
    pub fn pio_addr(&self, _port: u16, rwop: RWOp) {
        match rwop {
            RWOp::Read(ro) => {
                let val = self.cfgaddr_read(ro.len());
                ro.write_val(val);
            }
            RWOp::Write(wo) => self.cfgaddr_write(wo.len(), wo.read_val()),
        }
    }

    /// Port handler for the config-data window.
    pub fn pio_data(&self, port: u16, rwop: RWOp) {
        let offset = rwop.offset();
        match rwop {
            RWOp::Read(ro) => {
                match self.cfgdata_read(offset, ro.len()) {
                    Ok(val) => ro.write_val(val),
                    Err(e) => {
                        warn!(self.ctx.log, "config data read rejected";
                            "port" => port, "error" => %e);
                        ro.fill(0xff);
                    }
                }
            }
            RWOp::Write(wo) => {
                if let Err(e) =
                    self.cfgdata_write(offset, wo.len(), wo.read_val())
                {
                    warn!(self.ctx.log, "config data write rejected";
                        "port" => port, "error" => %e);
                }
            }
        }
    }

    /// Guest read of the address register. Only dword reads see the latch.
    pub fn cfgaddr_read(&self, width: usize) -> u32 {
        if width != 4 {
            return u32::MAX;
        }
        self.latch.lock().unwrap().encode()
    }

    /// Guest write of the address register. Narrower writes are dropped.
    pub fn cfgaddr_write(&self, width: usize, val: u32) {
        if width == 4 {
            *self.latch.lock().unwrap() = PciAddrInfo::decode(val);
        }
    }

    /// Guest read at `offset` within the data window.
    ///
    /// With no enabled address latched, or no device handling the latched
    /// address, the read returns all-ones. An enabled latch is cleared by
    /// the access whatever its outcome.
    pub fn cfgdata_read(
        &self,
        offset: usize,
        width: usize,
    ) -> Result<u32, Error> {
        let target = self.latch.lock().unwrap().take();
        check_data_access(offset, width)?;
        let Some((vbdf, reg)) = target else {
            return Ok(u32::MAX);
        };
        let reg = u16::from(reg) + offset as u16;

        let mut devices = self.devices.lock().unwrap();
        let val = self
            .ctx
            .mode
            .cfg_read(&self.ctx, &mut devices, vbdf, reg, width as u8)
            .unwrap_or(u32::MAX);
        debug!(self.ctx.log, "config read";
            "vbdf" => %vbdf, "reg" => reg, "width" => width, "val" => val);
        Ok(val)
    }

    /// Guest write at `offset` within the data window. Writes to absent
    /// devices are dropped.
    pub fn cfgdata_write(
        &self,
        offset: usize,
        width: usize,
        val: u32,
    ) -> Result<(), Error> {
        let target = self.latch.lock().unwrap().take();
        check_data_access(offset, width)?;
        let Some((vbdf, reg)) = target else {
            return Ok(());
        };
        let reg = u16::from(reg) + offset as u16;

        let mut devices = self.devices.lock().unwrap();
        let _ = self.ctx.mode.cfg_write(
            &self.ctx,
            &mut devices,
            vbdf,
            reg,
            width as u8,
            val,
        );
        debug!(self.ctx.log, "config write";
            "vbdf" => %vbdf, "reg" => reg, "width" => width, "val" => val);
        Ok(())
    }

    /// Snapshot of the devices, as (vbdf, pbdf, name) triples.
    pub fn devices(&self) -> Vec<(Bdf, Option<Bdf>, Option<String>)> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .map(|d| (d.vbdf, d.pbdf, d.name.clone()))
            .collect()
    }

    /// Run `f` against the device at `vbdf`.
    pub fn with_vdev<R>(
        &self,
        vbdf: Bdf,
        f: impl FnOnce(&Vdev) -> R,
    ) -> Option<R> {
        let mut devices = self.devices.lock().unwrap();
        self.ctx.mode.find_vdev(&mut devices, vbdf).map(|d| f(d))
    }

    /// Physical functions bound to this VM's pass-through devices.
    pub fn assigned_pbdfs(&self) -> BTreeSet<Bdf> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.is_passthru())
            .filter_map(|d| d.pbdf)
            .collect()
    }
}

fn check_data_access(offset: usize, width: usize) -> Result<(), Error> {
    if cfgport::valid_data_access(offset, width) {
        Ok(())
    } else {
        Err(Error::InvalidParameter(format!(
            "{}-byte config data access at offset {}",
            width, offset
        )))
    }
}

#[cfg(test)]
mod test;
