//! Configuration records shared by the vmcore crates.
//!
//! The library, the TOML parser and the standalone harness all describe a
//! board with these types. PCI functions are named with [`PciBdf`], the
//! packed 16-bit address board configurations carry.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

mod vm;
pub use vm::*;

/// A PCI function address as written in a board configuration: bus in bits
/// 15:8, device in 7:3 and function in 2:0.
///
/// Every 16-bit value is a valid address, so checking happens once, when the
/// textual `bb:dd.f` form (hex bus and device, as `lspci` prints them) is
/// parsed.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciBdf(u16);

impl PciBdf {
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }
    pub const fn raw(self) -> u16 {
        self.0
    }
    pub const fn bus(self) -> u8 {
        (self.0 >> 8) as u8
    }
    pub const fn dev(self) -> u8 {
        (self.0 >> 3) as u8 & 0x1f
    }
    pub const fn func(self) -> u8 {
        self.0 as u8 & 0x7
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseBdfError {
    #[error("expected bb:dd.f, got {0:?}")]
    Format(String),
    #[error("PCI device {0:#x} outside range of 0-0x1f")]
    Device(u8),
    #[error("PCI function {0} outside range of 0-7")]
    Function(u8),
}

impl FromStr for PciBdf {
    type Err = ParseBdfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let format = || ParseBdfError::Format(s.to_string());
        let (bus, rest) = s.split_once(':').ok_or_else(format)?;
        let (dev, func) = rest.split_once('.').ok_or_else(format)?;
        let field = |f: &str, radix| {
            if f.is_empty() || f.len() > 2 || f.starts_with('+') {
                return Err(format());
            }
            u8::from_str_radix(f, radix).map_err(|_| format())
        };
        let (bus, dev, func) =
            (field(bus, 16)?, field(dev, 16)?, field(func, 10)?);

        if dev > 0x1f {
            return Err(ParseBdfError::Device(dev));
        }
        if func > 7 {
            return Err(ParseBdfError::Function(func));
        }
        Ok(Self(u16::from(bus) << 8 | u16::from(dev) << 3 | u16::from(func)))
    }
}

impl fmt::Display for PciBdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus(), self.dev(), self.func())
    }
}

impl fmt::Debug for PciBdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PciBdf({})", self)
    }
}

impl Serialize for PciBdf {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

/// Forms a [PciBdf] may take in a configuration file.
#[derive(Deserialize)]
#[serde(untagged)]
enum BdfRepr {
    Packed(u16),
    Text(String),
}

impl<'de> Deserialize<'de> for PciBdf {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match BdfRepr::deserialize(deserializer)? {
            BdfRepr::Packed(raw) => Ok(Self(raw)),
            BdfRepr::Text(s) => s.parse().map_err(de::Error::custom),
        }
    }
}

#[cfg(test)]
mod test {
    use super::{ParseBdfError, PciBdf};
    use serde::Deserialize;
    use serde_test::{assert_de_tokens, assert_tokens, Token};

    #[test]
    fn parse() {
        let good = [
            ("00:12.0", 0x0090),
            ("00:1f.7", 0x00ff),
            ("02:00.0", 0x0200),
            ("ab:3.1", 0xab19),
        ];
        for (input, raw) in good {
            assert_eq!(input.parse::<PciBdf>(), Ok(PciBdf::from_raw(raw)));
        }

        assert_eq!(
            "00:20.0".parse::<PciBdf>(),
            Err(ParseBdfError::Device(0x20))
        );
        assert_eq!(
            "00:01.8".parse::<PciBdf>(),
            Err(ParseBdfError::Function(8))
        );
        for bad in ["0.18.0", "100:00.0", "00:0x1.0", "00:01", "", "00:+1.0"] {
            assert!(
                matches!(bad.parse::<PciBdf>(), Err(ParseBdfError::Format(_))),
                "{bad:?} should not parse"
            );
        }
    }

    #[test]
    fn fields() {
        let bdf = PciBdf::from_raw(0xab19);
        assert_eq!((bdf.bus(), bdf.dev(), bdf.func()), (0xab, 3, 1));
        assert_eq!(bdf.to_string(), "ab:03.1");
    }

    #[test]
    fn serde_forms() {
        assert_tokens(&PciBdf::from_raw(0x0090), &[Token::Str("00:12.0")]);
        assert_de_tokens(&PciBdf::from_raw(0x0098), &[Token::U16(0x98)]);
        assert_de_tokens(&PciBdf::from_raw(0x0098), &[Token::I64(0x98)]);

        for tokens in [
            [Token::Str("00:40.0")],
            [Token::U32(0x1_0000)],
            [Token::I64(-1)],
        ] {
            let mut de = serde_test::Deserializer::new(&tokens);
            assert!(PciBdf::deserialize(&mut de).is_err());
        }
    }
}
