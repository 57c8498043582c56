// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest software loading.

use anyhow::{anyhow, bail, Context};
use slog::info;
use vmcore_types::{KernelType, VmConfig};

use crate::common::{round_up_p2, PAGE_SIZE};
use crate::platform::Platform;
use crate::vm::vcpu::EntryState;
use crate::vm::Vm;

/// Guest-physical address of the ACPI tables of a pre-launched VM.
pub const VIRT_ACPI_DATA_ADDR: u64 = 0x7ff0_0000;
/// Largest ACPI table image accepted for a pre-launched VM.
pub const ACPI_MODULE_SIZE: u64 = 1 << 20;
/// Distance below the kernel image at which the command line is placed.
pub const BOOTARGS_OFFSET: u64 = 8 * 1024;

/// A boot module as handed over by the bootloader.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ModuleImage {
    pub hpa: u64,
    pub size: u64,
}

/// One image to be copied into guest memory.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SwModule {
    pub src_hpa: u64,
    pub load_gpa: u64,
    pub size: u64,
}

/// Software-load descriptors of a VM, filled in from the boot modules.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SwInfo {
    pub kernel_type: KernelType,
    pub kernel: Option<SwModule>,
    pub ramdisk: Option<SwModule>,
    /// Kernel command line, placed just below the kernel image.
    pub bootargs: Option<SwModule>,
    pub acpi: Option<SwModule>,
}

/// Lay out the software of the VM described by `config`, finding each boot
/// module by tag through `lookup`.
///
/// The kernel goes to its configured load address, the ramdisk to the next
/// page past it and the command line [BOOTARGS_OFFSET] below it. The command
/// line image itself lives at `bootargs_hpa`. Pre-launched VMs also get their
/// ACPI tables at [VIRT_ACPI_DATA_ADDR].
pub fn layout_modules(
    config: &VmConfig,
    bootargs_hpa: u64,
    lookup: impl Fn(&str) -> Option<ModuleImage>,
) -> anyhow::Result<SwInfo> {
    let os = &config.os;
    let find = |tag: &str| {
        lookup(tag).ok_or_else(|| anyhow!("boot module '{}' not found", tag))
    };

    let kernel = find(&os.kernel_mod_tag)?;
    if os.kernel_load_addr == 0 {
        bail!("no kernel load address configured for '{}'", config.name);
    }
    let load_addr = os.kernel_load_addr;
    let mut sw = SwInfo {
        kernel_type: os.kernel_type,
        kernel: Some(SwModule {
            src_hpa: kernel.hpa,
            load_gpa: load_addr,
            size: kernel.size,
        }),
        ..Default::default()
    };

    if let Some(tag) = &os.ramdisk_mod_tag {
        let ramdisk = find(tag)?;
        sw.ramdisk = Some(SwModule {
            src_hpa: ramdisk.hpa,
            load_gpa: round_up_p2(load_addr + kernel.size, PAGE_SIZE),
            size: ramdisk.size,
        });
    }

    if !os.bootargs.is_empty() {
        let load_gpa = load_addr.checked_sub(BOOTARGS_OFFSET).ok_or_else(|| {
            anyhow!("kernel at {:#x} leaves no room for bootargs", load_addr)
        })?;
        sw.bootargs = Some(SwModule {
            src_hpa: bootargs_hpa,
            load_gpa,
            // NUL-terminated
            size: os.bootargs.len() as u64 + 1,
        });
    }

    if config.is_prelaunched() {
        if let Some(tag) = &os.acpi_mod_tag {
            let acpi = find(tag)?;
            if acpi.size > ACPI_MODULE_SIZE {
                bail!("ACPI module is {:#x} bytes, too large", acpi.size);
            }
            sw.acpi = Some(SwModule {
                src_hpa: acpi.hpa,
                load_gpa: VIRT_ACPI_DATA_ADDR,
                size: acpi.size,
            });
        }
    }

    Ok(sw)
}

/// Places a VM's software in its memory and points its bootstrap vCPU at
/// the entry point.
pub trait SwLoader: Send + Sync {
    fn load(&self, vm: &Vm, platform: &Platform) -> anyhow::Result<()>;
}

/// Loader used when no other has been registered: copies every described
/// image to its load address and enters the kernel in protected mode.
pub struct GeneralLoader;

impl SwLoader for GeneralLoader {
    fn load(&self, vm: &Vm, platform: &Platform) -> anyhow::Result<()> {
        let sw = vm.sw_info();
        let kernel = sw.kernel.ok_or_else(|| {
            anyhow!("no kernel image described for {}", vm.id())
        })?;
        let bsp = vm
            .vcpu(0)
            .ok_or_else(|| anyhow!("{} has no bootstrap vCPU", vm.id()))?;

        let images = [
            ("kernel", Some(kernel)),
            ("ramdisk", sw.ramdisk),
            ("bootargs", sw.bootargs),
            ("acpi", sw.acpi),
        ];
        for (what, module) in images {
            let Some(module) = module else {
                continue;
            };
            platform
                .boot
                .copy_to_guest(
                    vm.id(),
                    module.load_gpa,
                    module.src_hpa,
                    module.size,
                )
                .with_context(|| format!("failed to copy {what} image"))?;
        }

        let entry = match sw.kernel_type {
            // The zero page sits in the page below the kernel image.
            KernelType::BzImage => EntryState::Protected {
                rip: kernel.load_gpa,
                boot_params: kernel.load_gpa.saturating_sub(PAGE_SIZE),
            },
            KernelType::Zephyr => {
                EntryState::Protected { rip: kernel.load_gpa, boot_params: 0 }
            }
        };
        bsp.set_entry(entry);
        info!(vm.log(), "guest software loaded";
            "kernel_type" => ?sw.kernel_type,
            "entry" => format!("{:#x}", kernel.load_gpa));
        Ok(())
    }
}
