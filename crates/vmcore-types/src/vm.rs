//! Static description of the VMs hosted on a board.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::PciBdf;

/// Role a VM plays on the board.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmType {
    /// The privileged service OS, which owns every device not explicitly
    /// handed to another VM.
    ServiceOs,
    /// A VM launched by the hypervisor itself at boot, owning a fixed set of
    /// physical cores and devices.
    PreLaunched,
    /// A VM launched later on behalf of the service OS.
    #[default]
    Normal,
}

/// How the virtual PCI layer presents devices to guests. Chosen once for the
/// whole hypervisor.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VpciMode {
    /// The service OS sees the physical hierarchy; config accesses are
    /// forwarded to hardware.
    #[default]
    Sharing,
    /// Each pre-launched VM sees only its configured devices, with
    /// virtualized BARs.
    Partition,
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct GuestFlags: u64 {
        const SECURE_WORLD_ENABLED = 1 << 0;
        const LAPIC_PASSTHROUGH = 1 << 1;
        const IO_COMPLETION_POLLING = 1 << 2;
    }
}

/// Host memory window backing a pre-launched VM.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MemoryConfig {
    pub start_hpa: u64,
    pub size: u64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelType {
    #[default]
    BzImage,
    Zephyr,
}

/// Guest OS image selection and boot arguments.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OsConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kernel_type: KernelType,
    /// Boot module tag naming the kernel image.
    #[serde(default)]
    pub kernel_mod_tag: String,
    #[serde(default)]
    pub ramdisk_mod_tag: Option<String>,
    #[serde(default)]
    pub acpi_mod_tag: Option<String>,
    #[serde(default)]
    pub bootargs: String,
    /// Guest-physical load address for kernels which are not relocated by
    /// the loader.
    #[serde(default)]
    pub kernel_load_addr: u64,
}

/// A physical PCI function passed through to the VM at a virtual address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtdevConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub vbdf: PciBdf,
    pub pbdf: PciBdf,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VmConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub vm_type: VmType,
    /// Physical cores owned by the VM, one bit per core.
    pub pcpu_bitmap: u64,
    #[serde(default)]
    pub guest_flags: GuestFlags,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub os: OsConfig,
    #[serde(default)]
    pub guid: Uuid,
    #[serde(default, rename = "pci-ptdev")]
    pub pci_ptdevs: Vec<PtdevConfig>,
}

impl VmConfig {
    /// Physical cores assigned to the VM, in ascending order.
    pub fn pcpus(&self) -> impl Iterator<Item = u16> + '_ {
        (0..u64::BITS as u16).filter(|n| self.pcpu_bitmap & (1 << n) != 0)
    }

    /// The core which hosts vCPU 0: the lowest core in the bitmap.
    pub fn bsp_pcpu(&self) -> Option<u16> {
        if self.pcpu_bitmap == 0 {
            None
        } else {
            Some(self.pcpu_bitmap.trailing_zeros() as u16)
        }
    }

    pub fn is_service_os(&self) -> bool {
        self.vm_type == VmType::ServiceOs
    }

    pub fn is_prelaunched(&self) -> bool {
        self.vm_type == VmType::PreLaunched
    }
}
