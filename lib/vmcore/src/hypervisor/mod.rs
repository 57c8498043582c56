// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The VM lifecycle manager.
//!
//! A [Hypervisor] owns the board's VM configurations, the platform services
//! and the registry of live VMs. Every VM is built by [Hypervisor::create_vm]
//! and only becomes reachable through the registry once fully constructed.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use slog::{info, o, warn, Logger};
use vmcore_types::{GuestFlags, VmConfig};

use crate::hw::pci::Bdf;
use crate::loader::{GeneralLoader, SwLoader};
use crate::platform::{DomainId, EptFlags, Platform};
use crate::vm::registry::Registry;
use crate::vm::vcpu::VcpuState;
use crate::vm::{platform_err, Error, Vm, VmId, VmState};
use crate::vpci::{Vpci, VpciMode};

mod lifecycle;


/// Guest-physical base at which a secure world's memory is mapped.
pub const TRUSTY_EPT_REBASE_GPA: u64 = 0x511 << 30;
/// Size of a secure world's memory.
pub const TRUSTY_RAM_SIZE: u64 = 16 << 20;

/// Row of the VM table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmSummary {
    pub id: VmId,
    pub name: String,
    pub state: VmState,
}

/// Row of the vCPU table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VcpuSummary {
    pub vm: VmId,
    pub vcpu_id: u16,
    pub pcpu_id: u16,
    pub run_state: VcpuState,
}

pub struct Hypervisor {
    configs: Vec<Arc<VmConfig>>,
    mode: VpciMode,
    platform: Platform,
    registry: Registry,
    loader: Mutex<Option<Arc<dyn SwLoader>>>,
    log: Logger,
}

/// Resources acquired by a VM under construction, released in reverse if
/// construction fails.
#[derive(Default)]
struct Undo {
    ept: bool,
    domain: Arc<Mutex<Option<DomainId>>>,
    vpci: Option<Arc<Vpci>>,
}

impl Hypervisor {
    pub fn new(
        configs: Vec<VmConfig>,
        mode: VpciMode,
        platform: Platform,
        log: &Logger,
    ) -> Self {
        Self {
            configs: configs.into_iter().map(Arc::new).collect(),
            mode,
            platform,
            registry: Registry::new(),
            loader: Mutex::new(None),
            log: log.new(o!("component" => "hypervisor")),
        }
    }

    pub fn configs(&self) -> &[Arc<VmConfig>] {
        &self.configs
    }
    pub fn vpci_mode(&self) -> VpciMode {
        self.mode
    }
    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Register the loader used for every VM prepared from now on.
    pub fn set_sw_loader(&self, loader: Arc<dyn SwLoader>) {
        *self.loader.lock().unwrap() = Some(loader);
    }
    fn sw_loader(&self) -> Arc<dyn SwLoader> {
        self.loader
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Arc::new(GeneralLoader))
    }

    /// Build a VM from `config` and publish it in the registry.
    ///
    /// On failure every resource acquired so far is released, the identity
    /// is returned to the pool, and nothing is published.
    pub fn create_vm(&self, config: Arc<VmConfig>) -> Result<Arc<Vm>, Error> {
        let id = self.registry.alloc_id().ok_or(Error::ResourceExhausted)?;
        let log = self.log.new(o!(
            "vm" => id.to_string(),
            "name" => config.name.clone()
        ));

        let mut undo = Undo::default();
        match self.build_vm(id, config, &log, &mut undo) {
            Ok(vm) => {
                self.registry.publish(vm.clone());
                info!(log, "VM created"; "type" => ?vm.config().vm_type);
                Ok(vm)
            }
            Err(e) => {
                warn!(log, "VM creation failed"; "error" => ?e);
                self.unwind(id, undo);
                Err(e)
            }
        }
    }

    fn build_vm(
        &self,
        id: VmId,
        config: Arc<VmConfig>,
        log: &Logger,
        undo: &mut Undo,
    ) -> Result<Arc<Vm>, Error> {
        let p = &self.platform;

        let root = p.ept.create(id).map_err(platform_err("EPT creation"))?;
        undo.ept = true;

        let vpci = Vpci::new(
            id,
            self.mode,
            root,
            undo.domain.clone(),
            &self.platform,
            log,
        );
        let vm = Arc::new(Vm::new(
            id,
            config.clone(),
            root,
            vpci.clone(),
            undo.domain.clone(),
            log.clone(),
        ));

        if config.is_service_os() {
            p.boot
                .rebuild_memmap(id)
                .map_err(platform_err("memory map rebuild"))?;
            let sw = p
                .boot
                .load_boot_info(id, &config)
                .map_err(Error::LoadFailure)?;
            vm.set_sw_info(sw);
            let domain = p
                .iommu
                .create_domain(id, root)
                .map_err(platform_err("IOMMU domain creation"))?;
            vm.set_iommu_domain(domain);
        } else {
            if config.guest_flags.contains(GuestFlags::SECURE_WORLD_ENABLED) {
                vm.update_secure_world(|sw| sw.supported = true);
                p.ept
                    .add_mapping(
                        id,
                        TRUSTY_EPT_REBASE_GPA,
                        p.boot.secure_world_base(id),
                        TRUSTY_RAM_SIZE,
                        EptFlags::RWX | EptFlags::MT_WB,
                    )
                    .map_err(platform_err("secure world mapping"))?;
            }
            if config.is_prelaunched() {
                if config.memory.size != 0 {
                    p.ept
                        .add_mapping(
                            id,
                            0,
                            config.memory.start_hpa,
                            config.memory.size,
                            EptFlags::RWX | EptFlags::MT_WB,
                        )
                        .map_err(platform_err("guest memory mapping"))?;
                }
                let sw = p
                    .boot
                    .load_boot_info(id, &config)
                    .map_err(Error::LoadFailure)?;
                vm.set_sw_info(sw);
            }
        }

        p.iommu.enable().map_err(platform_err("IOMMU enable"))?;
        p.pio.setup_io_bitmap(id).map_err(platform_err("I/O bitmap setup"))?;
        p.vcpu
            .setup_cpu_state(id)
            .map_err(platform_err("CPU state setup"))?;
        p.devs.vpic_init(id).map_err(platform_err("vPIC init"))?;

        vpci.init(&config, &self.claimed_by_others(&config))?;
        undo.vpci = Some(vpci);

        p.devs.vioapic_init(id).map_err(platform_err("vIOAPIC init"))?;
        p.boot
            .set_vcpuid_entries(id)
            .map_err(platform_err("CPUID provisioning"))?;

        vm.set_state(VmState::Created);
        Ok(vm)
    }

    fn unwind(&self, id: VmId, undo: Undo) {
        let p = &self.platform;
        if let Some(vpci) = undo.vpci {
            vpci.deinit();
        }
        let domain = undo.domain.lock().unwrap().take();
        if let Some(domain) = domain {
            p.iommu.destroy_domain(domain);
        }
        if undo.ept {
            p.ept.destroy(id);
        }
        self.registry.free_id(id);
    }

    /// Physical functions passed through by configurations other than
    /// `config`.
    fn claimed_by_others(&self, config: &VmConfig) -> BTreeSet<Bdf> {
        self.configs
            .iter()
            .filter(|c| ***c != *config)
            .flat_map(|c| c.pci_ptdevs.iter())
            .map(|dev| Bdf::from(dev.pbdf))
            .collect()
    }

    /// Whether this hypervisor launches VMs of `config`'s kind at boot.
    fn boots_at_startup(&self, config: &VmConfig) -> bool {
        match self.mode {
            VpciMode::Sharing => config.is_service_os(),
            VpciMode::Partition => config.is_prelaunched(),
        }
    }

    /// Bring up the VM, if any, whose boot core is `pcpu`.
    ///
    /// Meant to be called once on each physical core during boot. Returns
    /// `Ok(None)` when no configuration boots from `pcpu`.
    pub fn prepare_vm(&self, pcpu: u16) -> Result<Option<Arc<Vm>>, Error> {
        let Some(config) = self
            .configs
            .iter()
            .find(|c| self.boots_at_startup(c) && c.bsp_pcpu() == Some(pcpu))
            .cloned()
        else {
            return Ok(None);
        };

        let vm = self.create_vm(config.clone())?;
        for core in config.pcpus() {
            let res = vm.add_vcpu(core).and_then(|vcpu| {
                self.platform
                    .vcpu
                    .prepare(vm.id(), vcpu.id(), core)
                    .map_err(platform_err("vCPU preparation"))
            });
            if let Err(e) = res {
                self.destroy_vm(&vm);
                return Err(e);
            }
        }

        if let Err(e) = self.sw_loader().load(&vm, &self.platform) {
            self.destroy_vm(&vm);
            return Err(Error::LoadFailure(e));
        }

        if let Err(e) = self.start_vm(&vm) {
            self.destroy_vm(&vm);
            return Err(e);
        }
        Ok(Some(vm))
    }

    pub fn get_vm_from_identity(&self, id: VmId) -> Option<Arc<Vm>> {
        self.registry.get(id)
    }

    pub fn get_service_os_vm(&self) -> Option<Arc<Vm>> {
        self.registry.live().into_iter().find(|vm| vm.is_service_os())
    }

    pub fn list_vms(&self) -> Vec<VmSummary> {
        self.registry
            .live()
            .iter()
            .map(|vm| VmSummary {
                id: vm.id(),
                name: vm.name().to_string(),
                state: vm.state(),
            })
            .collect()
    }

    pub fn list_vcpus(&self) -> Vec<VcpuSummary> {
        self.registry
            .live()
            .iter()
            .flat_map(|vm| {
                vm.vcpus().into_iter().map(move |vcpu| VcpuSummary {
                    vm: vm.id(),
                    vcpu_id: vcpu.id(),
                    pcpu_id: vcpu.pcpu(),
                    run_state: vcpu.state(),
                })
            })
            .collect()
    }
}
