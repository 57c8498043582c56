// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The config-address (0xcf8) and config-data (0xcfc) port pair.

use crate::hw::pci::bits::{CFG_ADDR_ENABLE, CFG_ADDR_REG_MASK};
use crate::hw::pci::Bdf;

/// Config address latched by the last dword write to the address port.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PciAddrInfo {
    /// Packed bus/device/function
    pub bdf: u16,
    /// Dword-aligned register offset
    pub reg: u8,
    pub enable: bool,
}

impl PciAddrInfo {
    pub const fn cleared() -> Self {
        Self { bdf: 0xffff, reg: 0, enable: false }
    }

    pub fn decode(val: u32) -> Self {
        Self {
            bdf: (val >> 8) as u16,
            reg: (val & CFG_ADDR_REG_MASK) as u8,
            enable: val & CFG_ADDR_ENABLE != 0,
        }
    }

    pub fn encode(&self) -> u32 {
        let enable = if self.enable { CFG_ADDR_ENABLE } else { 0 };
        enable | u32::from(self.bdf) << 8 | u32::from(self.reg)
    }

    /// Consume a latched, enabled address, leaving the latch cleared.
    pub fn take(&mut self) -> Option<(Bdf, u8)> {
        if !self.enable {
            return None;
        }
        let res = (Bdf::from_raw(self.bdf), self.reg);
        *self = Self::cleared();
        Some(res)
    }
}
impl Default for PciAddrInfo {
    fn default() -> Self {
        Self::cleared()
    }
}

/// Check a data-port access lies within the 4-byte window.
pub(super) fn valid_data_access(offset: usize, width: usize) -> bool {
    matches!(width, 1 | 2 | 4) && offset + width <= 4
}
