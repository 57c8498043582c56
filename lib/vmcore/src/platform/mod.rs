// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Services the VM core consumes from the rest of the hypervisor.
//!
//! Each trait covers one hardware facility (second-level address tables,
//! the IOMMU, vCPU execution state, physical PCI config space, port I/O
//! interception, interrupt controllers, boot-time data). They are keyed by
//! [VmId] rather than by the VM itself, so the core keeps sole ownership of
//! its control blocks.
//!
//! Fallible operations return [anyhow::Result]; the core attaches the name of
//! the step which failed when surfacing the error.

use std::sync::Arc;

use vmcore_types::VmConfig;

use crate::common::RWOp;
use crate::hw::pci::Bdf;
use crate::loader::SwInfo;
use crate::vm::vcpu::{EntryState, VcpuState};
use crate::vm::VmId;

pub mod sim;

/// Root of a VM's second-level (EPT) address table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EptRoot(pub u64);

/// Handle on an IOMMU translation domain.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainId(pub u16);

bitflags! {
    /// Access and memory-type attributes of an EPT mapping.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct EptFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// Write-back memory type; mappings without it are uncached.
        const MT_WB = 6 << 3;

        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

/// Second-level address translation
pub trait AddrTable: Send + Sync {
    fn create(&self, vm: VmId) -> anyhow::Result<EptRoot>;
    fn add_mapping(
        &self,
        vm: VmId,
        gpa: u64,
        hpa: u64,
        len: u64,
        flags: EptFlags,
    ) -> anyhow::Result<()>;
    fn remove_mapping(&self, vm: VmId, gpa: u64, len: u64)
        -> anyhow::Result<()>;
    fn destroy(&self, vm: VmId);
}

pub trait Iommu: Send + Sync {
    fn enable(&self) -> anyhow::Result<()>;
    fn create_domain(&self, vm: VmId, root: EptRoot)
        -> anyhow::Result<DomainId>;
    fn destroy_domain(&self, domain: DomainId);
    fn assign_device(&self, domain: DomainId, bdf: Bdf) -> anyhow::Result<()>;
    fn unassign_device(&self, domain: DomainId, bdf: Bdf)
        -> anyhow::Result<()>;
}

/// Per-vCPU hardware state: VMCS, register file and scheduling.
pub trait VcpuHw: Send + Sync {
    fn setup_cpu_state(&self, vm: VmId) -> anyhow::Result<()>;
    fn prepare(&self, vm: VmId, vcpu: u16, pcpu: u16) -> anyhow::Result<()>;
    fn reset(&self, vm: VmId, vcpu: u16);
    fn offline(&self, vm: VmId, vcpu: u16);
    fn pause(&self, vm: VmId, vcpu: u16, reason: VcpuState);
    fn resume(&self, vm: VmId, vcpu: u16);
    fn init_vmcs(
        &self,
        vm: VmId,
        vcpu: u16,
        entry: &EntryState,
    ) -> anyhow::Result<()>;
    fn schedule(&self, vm: VmId, vcpu: u16, pcpu: u16);
}

/// Config space of the physical PCI hierarchy.
///
/// Accesses to absent functions read as all-ones and drop writes, as the
/// hardware does.
pub trait PhysPci: Send + Sync {
    fn read(&self, bdf: Bdf, offset: u16, width: u8) -> u32;
    fn write(&self, bdf: Bdf, offset: u16, width: u8, val: u32);
    fn enumerate(&self) -> Vec<Bdf>;
}

/// Handler for an intercepted port range. Called with the accessed port and
/// an operation whose offset is relative to the base of the range.
pub type PioFn = dyn Fn(u16, RWOp) + Send + Sync + 'static;

/// Port I/O interception
pub trait PioRegistry: Send + Sync {
    fn setup_io_bitmap(&self, vm: VmId) -> anyhow::Result<()>;
    fn register(
        &self,
        vm: VmId,
        base: u16,
        len: u16,
        func: Arc<PioFn>,
    ) -> anyhow::Result<()>;
    fn unregister(&self, vm: VmId, base: u16);
}

/// Emulated interrupt controllers and pass-through interrupt plumbing.
pub trait VirtDevices: Send + Sync {
    fn vpic_init(&self, vm: VmId) -> anyhow::Result<()>;
    fn vioapic_init(&self, vm: VmId) -> anyhow::Result<()>;
    fn vioapic_reset(&self, vm: VmId);
    fn reset_ioreqs(&self, vm: VmId);
    fn release_ptdev_entries(&self, vm: VmId);
    fn destroy_secure_world(&self, vm: VmId);
}

/// Boot-time data handed over by firmware and the bootloader.
pub trait BootServices: Send + Sync {
    /// Rebuild the host memory map, carving out hypervisor memory, before
    /// the service OS is handed the remainder.
    fn rebuild_memmap(&self, vm: VmId) -> anyhow::Result<()>;
    /// Locate the boot modules named by `config` and describe where the
    /// loader should place them.
    fn load_boot_info(
        &self,
        vm: VmId,
        config: &VmConfig,
    ) -> anyhow::Result<SwInfo>;
    fn set_vcpuid_entries(&self, vm: VmId) -> anyhow::Result<()>;
    /// Host-physical base of the memory reserved for a VM's secure world.
    fn secure_world_base(&self, vm: VmId) -> u64;
    fn copy_to_guest(
        &self,
        vm: VmId,
        gpa: u64,
        src_hpa: u64,
        len: u64,
    ) -> anyhow::Result<()>;
}

/// The full set of services, as handed to the [Hypervisor](crate::Hypervisor).
#[derive(Clone)]
pub struct Platform {
    pub ept: Arc<dyn AddrTable>,
    pub iommu: Arc<dyn Iommu>,
    pub vcpu: Arc<dyn VcpuHw>,
    pub pci: Arc<dyn PhysPci>,
    pub pio: Arc<dyn PioRegistry>,
    pub devs: Arc<dyn VirtDevices>,
    pub boot: Arc<dyn BootServices>,
}

impl Platform {
    /// Use a single object providing every service.
    pub fn from_provider<P>(provider: Arc<P>) -> Self
    where
        P: AddrTable
            + Iommu
            + VcpuHw
            + PhysPci
            + PioRegistry
            + VirtDevices
            + BootServices
            + 'static,
    {
        Self {
            ept: provider.clone(),
            iommu: provider.clone(),
            vcpu: provider.clone(),
            pci: provider.clone(),
            pio: provider.clone(),
            devs: provider.clone(),
            boot: provider,
        }
    }
}
