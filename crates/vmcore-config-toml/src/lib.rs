// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeSet;
use std::path::Path;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

pub use vmcore_types::{VmConfig, VpciMode};

/// Board and VM description consumed at startup.
#[derive(Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub main: Main,

    #[serde(default)]
    pub vm: Vec<VmConfig>,

    /// Boot modules made available to the loader, as a bootloader would
    /// hand them over.
    #[serde(default, rename = "module")]
    pub modules: Vec<BootModule>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Main {
    #[serde(default)]
    pub vpci_mode: VpciMode,

    /// Number of physical cores on the board.
    pub pcpus: u16,
}
impl Default for Main {
    fn default() -> Self {
        Self { vpci_mode: VpciMode::default(), pcpus: 1 }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct BootModule {
    pub tag: String,
    pub hpa: u64,
    pub size: u64,
}

/// Errors which may be returned when parsing the board configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("VM {0}: {1}")]
    Invalid(String, String),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_str(&contents)
}

/// Parses TOML text into a configuration object, checking the VM entries for
/// consistency with the board.
pub fn parse_str(contents: &str) -> Result<Config, ParseError> {
    let cfg = toml::from_str::<Config>(contents)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<(), ParseError> {
    let invalid =
        |vm: &VmConfig, msg: String| ParseError::Invalid(vm.name.clone(), msg);

    let board_mask = match cfg.main.pcpus {
        0 => return Err(ParseError::Invalid("main".into(), "no pcpus".into())),
        n if n >= 64 => u64::MAX,
        n => (1u64 << n) - 1,
    };

    let mut service_os = 0;
    let mut claimed = 0u64;
    for vm in cfg.vm.iter() {
        if vm.pcpu_bitmap == 0 {
            return Err(invalid(vm, "empty pcpu bitmap".into()));
        }
        if vm.pcpu_bitmap & !board_mask != 0 {
            return Err(invalid(
                vm,
                format!(
                    "pcpu bitmap {:#x} exceeds {} board cores",
                    vm.pcpu_bitmap, cfg.main.pcpus
                ),
            ));
        }
        if vm.is_service_os() {
            service_os += 1;
        }
        if vm.is_prelaunched() {
            if claimed & vm.pcpu_bitmap != 0 {
                return Err(invalid(vm, "pcpus shared with another VM".into()));
            }
            claimed |= vm.pcpu_bitmap;
        }

        let mut vbdfs = BTreeSet::new();
        for dev in vm.pci_ptdevs.iter() {
            if !vbdfs.insert(dev.vbdf) {
                return Err(invalid(
                    vm,
                    format!("duplicate virtual PCI path {}", dev.vbdf),
                ));
            }
        }
    }
    if service_os > 1 {
        return Err(ParseError::Invalid(
            "main".into(),
            format!("{} service OS VMs configured", service_os),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use vmcore_types::{GuestFlags, KernelType, PciBdf, VmType};

    const PARTITION: &str = r#"
[main]
vpci-mode = "partition"
pcpus = 4

[[vm]]
name = "partition vm 1"
type = "pre-launched"
pcpu-bitmap = 5
guid = "d2795438-25d6-11e8-864e-cb7a18b34643"

[vm.memory]
start-hpa = 0x100000000
size = 0x20000000

[vm.os]
name = "ClearLinux"
kernel-type = "bzimage"
kernel-mod-tag = "vm1"
bootargs = "root=/dev/sda3 rw rootwait"
kernel-load-addr = 0x1000000

[[vm.pci-ptdev]]
name = "Hostbridge"
vbdf = "00:00.0"
pbdf = "00:00.0"

[[vm.pci-ptdev]]
name = "SATA Controller"
vbdf = "00:01.0"
pbdf = 0x90

[[vm]]
name = "partition vm 2"
type = "pre-launched"
pcpu-bitmap = 0xa
guest-flags = "SECURE_WORLD_ENABLED"

[vm.os]
kernel-type = "zephyr"
kernel-mod-tag = "vm2"

[[module]]
tag = "vm1"
hpa = 0x2000000
size = 0x800000
"#;

    #[test]
    fn config_can_be_serialized_as_toml() {
        let dummy_config = Config { ..Default::default() };
        let serialized = toml::ser::to_string(&dummy_config).unwrap();
        let deserialized: Config = toml::de::from_str(&serialized).unwrap();
        assert_eq!(dummy_config, deserialized);
    }

    #[test]
    fn parse_partition_config() {
        let cfg = parse_str(PARTITION).unwrap();

        assert_eq!(cfg.main.vpci_mode, VpciMode::Partition);
        assert_eq!(cfg.main.pcpus, 4);
        assert_eq!(cfg.vm.len(), 2);

        let vm1 = &cfg.vm[0];
        assert_eq!(vm1.vm_type, VmType::PreLaunched);
        assert_eq!(vm1.pcpus().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(vm1.memory.start_hpa, 0x1_0000_0000);
        assert_eq!(vm1.memory.size, 0x2000_0000);
        assert_eq!(vm1.os.kernel_type, KernelType::BzImage);
        assert_eq!(vm1.os.kernel_load_addr, 0x100_0000);
        assert_eq!(
            vm1.guid,
            uuid::Uuid::parse_str("d2795438-25d6-11e8-864e-cb7a18b34643")
                .unwrap()
        );
        assert_eq!(vm1.pci_ptdevs.len(), 2);
        assert_eq!(vm1.pci_ptdevs[1].name.as_deref(), Some("SATA Controller"));
        assert_eq!(vm1.pci_ptdevs[1].vbdf, PciBdf::from_raw(0x0008));
        let sata: PciBdf = "00:12.0".parse().unwrap();
        assert_eq!(vm1.pci_ptdevs[1].pbdf, sata);

        let vm2 = &cfg.vm[1];
        assert_eq!(vm2.bsp_pcpu(), Some(1));
        assert_eq!(vm2.guest_flags, GuestFlags::SECURE_WORLD_ENABLED);
        assert_eq!(vm2.os.kernel_type, KernelType::Zephyr);
        assert!(vm2.guid.is_nil());
        assert!(vm2.pci_ptdevs.is_empty());

        assert_eq!(
            cfg.modules,
            vec![BootModule {
                tag: "vm1".to_string(),
                hpa: 0x200_0000,
                size: 0x80_0000
            }]
        );
    }

    #[test]
    fn defaults_to_sharing_mode() {
        let raw = r#"
[main]
pcpus = 2

[[vm]]
name = "sos"
type = "service-os"
pcpu-bitmap = 3
"#;
        let cfg = parse_str(raw).unwrap();
        assert_eq!(cfg.main.vpci_mode, VpciMode::Sharing);
        assert!(cfg.vm[0].is_service_os());
    }

    #[test]
    fn reject_malformed_bdf() {
        for bad in ["\"00:20.0\"", "\"00:01\"", "\"0.1.0\"", "0x10000"] {
            let raw = format!(
                r#"
[main]
pcpus = 1

[[vm]]
name = "vm"
type = "pre-launched"
pcpu-bitmap = 1

[[vm.pci-ptdev]]
vbdf = {bad}
pbdf = "00:01.0"
"#
            );
            assert!(
                matches!(parse_str(&raw), Err(ParseError::Toml(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn reject_inconsistent_vms() {
        let bitmap_too_wide = r#"
[main]
pcpus = 2

[[vm]]
name = "vm"
type = "pre-launched"
pcpu-bitmap = 4
"#;
        assert!(matches!(
            parse_str(bitmap_too_wide),
            Err(ParseError::Invalid(name, _)) if name == "vm"
        ));

        let shared_core = r#"
[main]
pcpus = 2

[[vm]]
name = "a"
type = "pre-launched"
pcpu-bitmap = 3

[[vm]]
name = "b"
type = "pre-launched"
pcpu-bitmap = 2
"#;
        assert!(matches!(
            parse_str(shared_core),
            Err(ParseError::Invalid(name, _)) if name == "b"
        ));

        let duplicate_vbdf = r#"
[main]
pcpus = 1

[[vm]]
name = "dup"
type = "pre-launched"
pcpu-bitmap = 1

[[vm.pci-ptdev]]
vbdf = "00:01.0"
pbdf = "00:02.0"

[[vm.pci-ptdev]]
vbdf = "00:01.0"
pbdf = "00:03.0"
"#;
        assert!(matches!(
            parse_str(duplicate_vbdf),
            Err(ParseError::Invalid(name, _)) if name == "dup"
        ));
    }

    #[test]
    fn parse_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(PARTITION.as_bytes()).unwrap();
        let cfg = parse(file.path()).unwrap();
        assert_eq!(cfg.vm.len(), 2);

        assert!(matches!(
            parse(file.path().with_extension("missing")),
            Err(ParseError::Io(_))
        ));
    }

    #[test]
    fn example_board_parses() {
        let path = concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../../bin/vmcore-standalone/example-board.toml"
        );
        let cfg = parse(path).unwrap();
        assert_eq!(cfg.main.vpci_mode, VpciMode::Sharing);
        assert!(cfg.vm[0].is_service_os());
        assert!(cfg.vm[1].is_prelaunched());
        assert_eq!(cfg.modules.len(), 3);
    }
}
