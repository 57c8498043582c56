// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Devices in a VM's virtual PCI hierarchy.

use anyhow::Context;
use slog::{debug, error, o, Logger};

use super::{DevCtx, VpciMode};
use crate::hw::pci::bar::{self, Bars, BAR_COUNT};
use crate::hw::pci::bits;
use crate::hw::pci::{BarN, Bdf};
use crate::platform::{DomainId, EptFlags};

/// Capability set bound to a virtual device.
pub enum VdevOps {
    /// Config accesses reach the bound physical function, save for the BARs
    /// when the VM is partitioned.
    PassThru,
    /// Fully emulated host bridge.
    HostBridge(HostBridge),
}

/// A device slot visible to the guest.
pub struct Vdev {
    pub vbdf: Bdf,
    pub pbdf: Option<Bdf>,
    pub name: Option<String>,
    pub bars: Bars,
    pub ops: Option<VdevOps>,
    /// Guest-physical windows currently mapped onto the physical BARs.
    mapped: [Option<u64>; BAR_COUNT],
    log: Logger,
}

impl Vdev {
    /// Bind virtual address `vbdf` to the physical function `pbdf`, picking
    /// a capability set from the physical header type.
    pub(crate) fn bind(
        ctx: &DevCtx,
        vbdf: Bdf,
        pbdf: Bdf,
        name: Option<String>,
    ) -> Self {
        let log = ctx.log.new(o!("vbdf" => vbdf.to_string()));
        let hdr = ctx.pci.read(pbdf, bits::OFF_HEADER_TYPE, 1) as u8
            & bits::HEADER_TYPE_MASK;

        let (pbdf, bars, ops) = match hdr {
            bits::HEADER_TYPE_DEVICE => {
                let bars = bar::probe(ctx.pci.as_ref(), pbdf, &log);
                (Some(pbdf), bars, Some(VdevOps::PassThru))
            }
            bits::HEADER_TYPE_BRIDGE => (
                None,
                Bars::default(),
                Some(VdevOps::HostBridge(HostBridge::new())),
            ),
            _ => (Some(pbdf), Bars::default(), None),
        };
        debug!(log, "bound device";
            "pbdf" => pbdf.map(|b| b.to_string()),
            "header_type" => hdr);

        Self { vbdf, pbdf, name, bars, ops, mapped: [None; BAR_COUNT], log }
    }

    pub fn is_passthru(&self) -> bool {
        matches!(self.ops, Some(VdevOps::PassThru))
    }
    pub fn is_hostbridge(&self) -> bool {
        matches!(self.ops, Some(VdevOps::HostBridge(_)))
    }

    pub(crate) fn init(&mut self, ctx: &DevCtx) -> anyhow::Result<()> {
        match (&self.ops, self.pbdf) {
            (Some(VdevOps::PassThru), Some(pbdf)) => {
                let domain = vm_domain(ctx)?;
                ctx.iommu.assign_device(domain, pbdf).with_context(|| {
                    format!("assigning {} to IOMMU domain", pbdf)
                })
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn deinit(&mut self, ctx: &DevCtx) -> anyhow::Result<()> {
        let pbdf = match (&self.ops, self.pbdf) {
            (Some(VdevOps::PassThru), Some(pbdf)) => pbdf,
            _ => return Ok(()),
        };
        let mut res = Ok(());
        for idx in 0..BAR_COUNT {
            if let Some(gpa) = self.mapped[idx].take() {
                let len = self.bars.virt[idx].size;
                if let Err(e) = ctx.ept.remove_mapping(ctx.vm, gpa, len) {
                    res = Err(e.context(format!("unmapping BAR{}", idx)));
                }
            }
        }
        let domain = *ctx.domain.lock().unwrap();
        if let Some(domain) = domain {
            ctx.iommu.unassign_device(domain, pbdf).with_context(|| {
                format!("removing {} from IOMMU domain", pbdf)
            })?;
        }
        res
    }

    /// Read from config space. `None` means the device has no handler.
    pub(crate) fn cfg_read(
        &self,
        ctx: &DevCtx,
        offset: u16,
        width: u8,
    ) -> Option<u32> {
        match self.ops.as_ref()? {
            VdevOps::HostBridge(hb) => Some(hb.read(offset, width)),
            VdevOps::PassThru => {
                let pbdf = self.pbdf?;
                match BarN::from_offset(offset) {
                    Some(n) if ctx.mode == VpciMode::Partition => {
                        let dword = self.bars.virt[n as usize].reg_read();
                        let shift = u32::from(offset & 3) * 8;
                        Some(truncate(dword >> shift, width))
                    }
                    _ => Some(ctx.pci.read(pbdf, offset, width)),
                }
            }
        }
    }

    /// Write to config space. `None` means the device has no handler.
    pub(crate) fn cfg_write(
        &mut self,
        ctx: &DevCtx,
        offset: u16,
        width: u8,
        val: u32,
    ) -> Option<()> {
        if let Some(VdevOps::HostBridge(hb)) = self.ops.as_mut() {
            hb.write(offset, width, val);
            return Some(());
        }
        if !self.is_passthru() {
            return None;
        }
        let pbdf = self.pbdf?;
        match BarN::from_offset(offset) {
            Some(n) if ctx.mode == VpciMode::Partition => {
                // BARs are only reprogrammed a dword at a time
                if width == 4 && offset & 3 == 0 {
                    self.write_vbar(ctx, n, val);
                }
            }
            _ => ctx.pci.write(pbdf, offset, width, val),
        }
        Some(())
    }

    fn write_vbar(&mut self, ctx: &DevCtx, n: BarN, val: u32) {
        let idx = n as usize;
        let Some(res) = self.bars.virt[idx].reg_write(val) else {
            return;
        };
        if res.sizing
            || (res.val_old == res.val_new && self.mapped[idx].is_some())
        {
            return;
        }

        let len = self.bars.virt[idx].size;
        if let Some(old) = self.mapped[idx].take() {
            if let Err(e) = ctx.ept.remove_mapping(ctx.vm, old, len) {
                error!(self.log, "failed to unmap BAR window";
                    "bar" => idx, "gpa" => format!("{:#x}", old),
                    "error" => %e);
            }
        }
        if res.val_new == 0 {
            return;
        }
        let hpa = self.bars.phys[idx].base;
        match ctx.ept.add_mapping(
            ctx.vm,
            res.val_new,
            hpa,
            len,
            EptFlags::READ | EptFlags::WRITE,
        ) {
            Ok(()) => {
                self.mapped[idx] = Some(res.val_new);
                debug!(self.log, "remapped BAR window";
                    "bar" => idx,
                    "gpa" => format!("{:#x}", res.val_new),
                    "hpa" => format!("{:#x}", hpa));
            }
            Err(e) => {
                error!(self.log, "failed to map BAR window";
                    "bar" => idx, "gpa" => format!("{:#x}", res.val_new),
                    "error" => %e);
            }
        }
    }

    /// Guest-physical window currently mapped for BAR `n`, if any.
    pub fn mapped_window(&self, n: BarN) -> Option<u64> {
        self.mapped[n as usize]
    }
}

/// The VM's IOMMU domain, created on first use.
fn vm_domain(ctx: &DevCtx) -> anyhow::Result<DomainId> {
    let mut slot = ctx.domain.lock().unwrap();
    match *slot {
        Some(domain) => Ok(domain),
        None => {
            let domain = ctx
                .iommu
                .create_domain(ctx.vm, ctx.ept_root)
                .context("creating IOMMU domain")?;
            *slot = Some(domain);
            Ok(domain)
        }
    }
}

fn truncate(val: u32, width: u8) -> u32 {
    match width {
        1 => val & 0xff,
        2 => val & 0xffff,
        _ => val,
    }
}

/// Emulated host bridge: a fixed identity with a small writable area.
pub struct HostBridge {
    regs: [u8; bits::LEN_CFG],
}

impl HostBridge {
    pub const VENDOR_ID: u16 = bits::VENDOR_INTEL;
    pub const DEVICE_ID: u16 = 0x5af0;
    const REVISION: u8 = 0x0b;

    pub fn new() -> Self {
        let mut regs = [0u8; bits::LEN_CFG];
        let mut put = |off: u16, bytes: &[u8]| {
            let off = off as usize;
            regs[off..off + bytes.len()].copy_from_slice(bytes);
        };
        put(bits::OFF_VENDOR, &Self::VENDOR_ID.to_le_bytes());
        put(bits::OFF_DEVICE, &Self::DEVICE_ID.to_le_bytes());
        put(bits::OFF_REVISION, &[Self::REVISION]);
        put(bits::OFF_SUBCLASS, &[bits::SUBCLASS_BRIDGE_HOST]);
        put(bits::OFF_CLASS, &[bits::CLASS_BRIDGE]);
        put(bits::OFF_HEADER_TYPE, &[bits::HEADER_TYPE_DEVICE]);
        Self { regs }
    }

    pub fn read(&self, offset: u16, width: u8) -> u32 {
        let mut bytes = [0xffu8; 4];
        for (i, b) in bytes.iter_mut().take(width as usize).enumerate() {
            if let Some(reg) = self.regs.get(offset as usize + i) {
                *b = *reg;
            }
        }
        truncate(u32::from_le_bytes(bytes), width)
    }

    pub fn write(&mut self, offset: u16, width: u8, val: u32) {
        let bytes = val.to_le_bytes();
        for (i, b) in bytes.iter().take(width as usize).enumerate() {
            let off = offset as usize + i;
            if Self::writable(off) && off < self.regs.len() {
                self.regs[off] = *b;
            }
        }
    }

    fn writable(off: usize) -> bool {
        let cmd = bits::OFF_COMMAND as usize;
        (cmd..cmd + 4).contains(&off)
            || off == bits::OFF_INTR_LINE as usize
            || off >= bits::LEN_CFG_STD
    }
}
impl Default for HostBridge {
    fn default() -> Self {
        Self::new()
    }
}
