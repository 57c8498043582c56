// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! BAR sizing of physical functions and the simplified BARs shown to guests.

use slog::{debug, error, Logger};

use super::bits::{self, RegCmd};
use super::{BarN, Bdf};
use crate::platform::PhysPci;

pub const BAR_COUNT: usize = 6;

/// Smallest window a virtual BAR will expose, so it can be mapped at page
/// granularity.
pub const VBAR_MIN_SIZE: u64 = 0x1000;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BarType {
    #[default]
    None,
    Io,
    Mem32,
    Mem64,
}

/// A BAR as found on the physical function.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PciBar {
    pub base: u64,
    pub size: u64,
    pub bar_type: BarType,
}

/// A BAR as presented to the guest.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VirtBar {
    pub size: u64,
    pub bar_type: BarType,
    /// Base last programmed by the guest
    pub base: u64,
}

/// Result from a guest write to a virtual BAR
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WriteResult {
    pub val_old: u64,
    pub val_new: u64,
    /// The write was the all-ones sizing probe rather than placement.
    pub sizing: bool,
}

impl VirtBar {
    pub fn is_present(&self) -> bool {
        self.size != 0
    }

    pub fn reg_read(&self) -> u32 {
        match self.bar_type {
            _ if !self.is_present() => 0,
            BarType::None => 0,
            BarType::Io => self.base as u32 | bits::BAR_TYPE_IO,
            BarType::Mem32 => self.base as u32 | bits::BAR_TYPE_MEM,
            BarType::Mem64 => self.base as u32 | bits::BAR_TYPE_MEM64,
        }
    }

    pub fn reg_write(&mut self, val: u32) -> Option<WriteResult> {
        if !self.is_present() {
            return None;
        }
        let mask = !(self.size - 1) as u32;
        let old = self.base;
        self.base = u64::from(val & mask);
        Some(WriteResult {
            val_old: old,
            val_new: self.base,
            sizing: val == u32::MAX,
        })
    }
}

/// Physical and virtual BAR tables of one pass-through function.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Bars {
    pub phys: [PciBar; BAR_COUNT],
    pub virt: [VirtBar; BAR_COUNT],
}

/// Size the memory BARs of physical function `bdf`, deriving the virtual BAR
/// each one is presented as.
///
/// Memory decode is turned off for the duration of the probe and every
/// register touched is restored afterward. I/O BARs are left alone, and
/// memory BARs too large for a 32-bit window are dropped.
pub fn probe(pci: &dyn PhysPci, bdf: Bdf, log: &Logger) -> Bars {
    let mut bars = Bars::default();

    let orig_cmd = pci.read(bdf, bits::OFF_COMMAND, 2) as u16;
    let decode_on =
        RegCmd::from_bits_retain(orig_cmd).contains(RegCmd::MMIO_EN);
    if decode_on {
        let cmd = orig_cmd & !RegCmd::MMIO_EN.bits();
        pci.write(bdf, bits::OFF_COMMAND, 2, u32::from(cmd));
    }

    let mut bars_iter = BarN::iter();
    while let Some(n) = bars_iter.next() {
        let idx = n as usize;
        let off = n.offset();
        let lo = pci.read(bdf, off, 4);
        if lo & bits::BAR_SPACE_MASK == bits::BAR_TYPE_IO {
            continue;
        }

        let (bar_type, base, size) = match lo & bits::BAR_MEM_TYPE_MASK {
            bits::BAR_TYPE_MEM => {
                pci.write(bdf, off, 4, u32::MAX);
                let probed = pci.read(bdf, off, 4);
                pci.write(bdf, off, 4, lo);

                let masked = probed & bits::BAR_MEM_BASE_MASK;
                let size = u64::from((!masked).wrapping_add(1));
                (BarType::Mem32, u64::from(lo & bits::BAR_MEM_BASE_MASK), size)
            }
            bits::BAR_TYPE_MEM64 if n != BarN::BAR5 => {
                // The high dword belongs to this BAR whatever the outcome.
                let _ = bars_iter.next();

                let hi = pci.read(bdf, off + 4, 4);
                pci.write(bdf, off, 4, u32::MAX);
                let probed_lo = pci.read(bdf, off, 4);
                pci.write(bdf, off + 4, 4, u32::MAX);
                let probed_hi = pci.read(bdf, off + 4, 4);
                pci.write(bdf, off, 4, lo);
                pci.write(bdf, off + 4, 4, hi);

                let masked = u64::from(probed_hi) << 32
                    | u64::from(probed_lo & bits::BAR_MEM_BASE_MASK);
                let mut size = (!masked).wrapping_add(1);
                if size > u64::from(u32::MAX) {
                    error!(log, "PCI BAR size is too big to support";
                        "bdf" => %bdf, "bar" => idx, "size" => size);
                    size = 0;
                }
                let base = u64::from(hi) << 32
                    | u64::from(lo & bits::BAR_MEM_BASE_MASK);
                (BarType::Mem64, base, size)
            }
            _ => continue,
        };
        if size == 0 {
            continue;
        }

        bars.phys[idx] = PciBar { base, size, bar_type };
        bars.virt[idx] = VirtBar {
            size: size.max(VBAR_MIN_SIZE),
            bar_type: BarType::Mem32,
            base: 0,
        };
        debug!(log, "sized BAR";
            "bdf" => %bdf,
            "bar" => idx,
            "pbase" => format!("{:#x}", base),
            "psize" => format!("{:#x}", size),
            "vsize" => format!("{:#x}", bars.virt[idx].size),
            "ptype" => ?bar_type
        );
    }

    if decode_on {
        pci.write(bdf, bits::OFF_COMMAND, 2, u32::from(orig_cmd));
    }

    bars
}
