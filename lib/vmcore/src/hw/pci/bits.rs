// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PCI config registers.

pub const LEN_CFG: usize = 0x100;
pub const LEN_CFG_STD: usize = 0x40;

// Standard header register offsets
pub const OFF_VENDOR: u16 = 0x00;
pub const OFF_DEVICE: u16 = 0x02;
pub const OFF_COMMAND: u16 = 0x04;
pub const OFF_REVISION: u16 = 0x08;
pub const OFF_SUBCLASS: u16 = 0x0a;
pub const OFF_CLASS: u16 = 0x0b;
pub const OFF_HEADER_TYPE: u16 = 0x0e;
pub const OFF_BAR0: u16 = 0x10;
pub const OFF_BAR_END: u16 = 0x28;
pub const OFF_INTR_LINE: u16 = 0x3c;

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct RegCmd: u16 {
        const IO_EN = 1 << 0;
        const MMIO_EN = 1 << 1;
        const BUSMSTR_EN = 1 << 2;
        const INTX_DIS = 1 << 10;
    }
}

pub const BAR_TYPE_IO: u32 = 0b01;
pub const BAR_TYPE_MEM: u32 = 0b000;
pub const BAR_TYPE_MEM64: u32 = 0b100;
pub const BAR_SPACE_MASK: u32 = 0b1;
pub const BAR_MEM_TYPE_MASK: u32 = 0b110;
pub const BAR_MEM_BASE_MASK: u32 = 0xffff_fff0;

pub const CLASS_STORAGE: u8 = 1;
pub const CLASS_BRIDGE: u8 = 6;

// Sub-classes under CLASS_BRIDGE
pub const SUBCLASS_BRIDGE_HOST: u8 = 0;

pub const HEADER_TYPE_DEVICE: u8 = 0b0;
pub const HEADER_TYPE_BRIDGE: u8 = 0b1;
pub const HEADER_TYPE_MASK: u8 = 0x7f;

pub const VENDOR_INTEL: u16 = 0x8086;

pub const MASK_FUNC: u8 = 0x07;
pub const MASK_DEV: u8 = 0x1f;
pub const MASK_BUS: u8 = 0xff;

pub const PORT_PCI_CONFIG_ADDR: u16 = 0xcf8;
pub const LEN_PCI_CONFIG_ADDR: u16 = 1;
pub const PORT_PCI_CONFIG_DATA: u16 = 0xcfc;
pub const LEN_PCI_CONFIG_DATA: u16 = 4;

/// Enable bit of the config-address register.
pub const CFG_ADDR_ENABLE: u32 = 1 << 31;
/// Register field of the config-address register, dword-aligned.
pub const CFG_ADDR_REG_MASK: u32 = 0xfc;
