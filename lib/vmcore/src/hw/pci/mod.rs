// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt::Result as FmtResult;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use strum::FromRepr;
use vmcore_types::{ParseBdfError, PciBdf};

pub mod bar;
pub mod bits;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Ord, PartialOrd, Hash)]
pub struct BusNum(u8);
impl BusNum {
    pub const fn new(n: u8) -> Self {
        Self(n)
    }
    pub const fn get(&self) -> u8 {
        self.0
    }
}
#[derive(Copy, Clone, Eq, PartialEq, Debug, Ord, PartialOrd, Hash)]
pub struct DevNum(u8);
impl DevNum {
    /// Attempts to make a new PCI [DevNum]
    ///
    /// Returns [`Option::None`] if `n` is outside the range for a valid PCI
    /// device.
    pub const fn new(n: u8) -> Option<Self> {
        if n <= bits::MASK_DEV {
            Some(Self(n))
        } else {
            None
        }
    }
    pub const fn get(&self) -> u8 {
        self.0
    }
}
#[derive(Copy, Clone, Eq, PartialEq, Debug, Ord, PartialOrd, Hash)]
pub struct FuncNum(u8);
impl FuncNum {
    /// Attempts to make a new PCI [FuncNum]
    ///
    /// Returns [`Option::None`] if `n` is outside the range for a valid PCI
    /// function.
    pub const fn new(n: u8) -> Option<Self> {
        if n <= bits::MASK_FUNC {
            Some(Self(n))
        } else {
            None
        }
    }
    pub const fn get(&self) -> u8 {
        self.0
    }
}

/// Bus, Device, Function.
///
/// Addresses one PCI function, either on the physical hierarchy or in the
/// virtual hierarchy a guest sees.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Ord, PartialOrd, Hash)]
pub struct Bdf {
    pub bus: BusNum,
    pub dev: DevNum,
    pub func: FuncNum,
}

impl Bdf {
    /// Attempts to make a new PCI [Bdf].
    ///
    /// Returns [`Option::None`] if the values would not fit within a BDF.
    pub const fn new(bus: u8, dev: u8, func: u8) -> Option<Self> {
        match (DevNum::new(dev), FuncNum::new(func)) {
            (Some(dev), Some(func)) => {
                Some(Self { bus: BusNum::new(bus), dev, func })
            }
            _ => None,
        }
    }

    /// Decode the packed 16-bit form used in the config-address register:
    /// bus in bits 15:8, device in 7:3 and function in 2:0.
    pub const fn from_raw(raw: u16) -> Self {
        Self {
            bus: BusNum((raw >> 8) as u8 & bits::MASK_BUS),
            dev: DevNum((raw >> 3) as u8 & bits::MASK_DEV),
            func: FuncNum(raw as u8 & bits::MASK_FUNC),
        }
    }

    pub const fn to_raw(&self) -> u16 {
        (self.bus.0 as u16) << 8 | (self.dev.0 as u16) << 3 | self.func.0 as u16
    }
}

impl FromStr for Bdf {
    type Err = ParseBdfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<PciBdf>().map(Bdf::from)
    }
}

impl From<PciBdf> for Bdf {
    fn from(value: PciBdf) -> Self {
        Bdf::from_raw(value.raw())
    }
}

impl Display for Bdf {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{:02x}:{:02x}.{}", self.bus.0, self.dev.0, self.func.0)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Ord, PartialOrd, FromRepr)]
#[repr(u8)]
pub enum BarN {
    BAR0 = 0,
    BAR1,
    BAR2,
    BAR3,
    BAR4,
    BAR5,
}
impl BarN {
    pub fn iter() -> BarIter {
        BarIter { n: 0 }
    }

    /// Config space offset of this BAR register.
    pub const fn offset(self) -> u16 {
        bits::OFF_BAR0 + 4 * self as u16
    }

    /// The BAR register containing config space offset `off`, if any.
    pub fn from_offset(off: u16) -> Option<Self> {
        if (bits::OFF_BAR0..bits::OFF_BAR_END).contains(&off) {
            Self::from_repr(((off - bits::OFF_BAR0) / 4) as u8)
        } else {
            None
        }
    }
}
pub struct BarIter {
    n: u8,
}
impl Iterator for BarIter {
    type Item = BarN;

    fn next(&mut self) -> Option<Self::Item> {
        let res = BarN::from_repr(self.n)?;
        self.n += 1;
        Some(res)
    }
}
