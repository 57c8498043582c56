// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! State transitions of live VMs.
//!
//! Destructive operations (reset and shutdown) require the VM to be paused,
//! so that no vCPU is executing guest code while its state is torn down.

use slog::{error, info};

use super::Hypervisor;
use crate::vm::vcpu::{EntryState, VcpuState};
use crate::vm::{platform_err, Error, Vm, VmState};

impl Hypervisor {
    /// Launch a created VM. Only the bootstrap vCPU is scheduled; the guest
    /// brings up the rest itself.
    pub fn start_vm(&self, vm: &Vm) -> Result<(), Error> {
        vm.require_state("start", VmState::Created)?;

        let hw = self.platform.vcpu.as_ref();
        let bsp = vm.vcpu(0);
        if let Some(bsp) = bsp.as_ref() {
            bsp.init_vmcs(hw).map_err(platform_err("VMCS init"))?;
        }
        vm.set_state(VmState::Started);
        if let Some(bsp) = bsp {
            bsp.schedule(hw);
        }
        info!(vm.log(), "VM started");
        Ok(())
    }

    /// Stop every vCPU of a VM. Pausing a paused VM does nothing; a VM never
    /// started goes straight to paused, ready for reset or shutdown.
    pub fn pause_vm(&self, vm: &Vm) -> Result<(), Error> {
        match vm.state() {
            VmState::Paused => Ok(()),
            VmState::Created | VmState::Started => {
                vm.set_state(VmState::Paused);
                let hw = self.platform.vcpu.as_ref();
                for vcpu in vm.vcpus() {
                    vcpu.pause(hw, VcpuState::Zombie);
                }
                info!(vm.log(), "VM paused");
                Ok(())
            }
            state => Err(Error::InvalidState { op: "pause", state }),
        }
    }

    pub fn resume_vm(&self, vm: &Vm) -> Result<(), Error> {
        vm.require_state("resume", VmState::Paused)?;
        let hw = self.platform.vcpu.as_ref();
        for vcpu in vm.vcpus() {
            vcpu.resume(hw);
        }
        vm.set_state(VmState::Started);
        info!(vm.log(), "VM resumed");
        Ok(())
    }

    /// Wake a VM suspended to S3, entering the bootstrap vCPU in real mode
    /// at `wakeup_vector`.
    pub fn resume_vm_from_s3(
        &self,
        vm: &Vm,
        wakeup_vector: u32,
    ) -> Result<(), Error> {
        vm.require_state("resume from S3", VmState::Paused)?;

        let bsp = vm.vcpu(0).ok_or_else(|| {
            Error::InvalidParameter(format!("{} has no boot vCPU", vm.id()))
        })?;
        let hw = self.platform.vcpu.as_ref();
        bsp.reset(hw);
        bsp.set_entry(EntryState::real_mode(wakeup_vector));
        bsp.init_vmcs(hw).map_err(platform_err("VMCS init"))?;
        vm.set_state(VmState::Started);
        bsp.schedule(hw);
        info!(vm.log(), "VM resumed from S3";
            "wakeup_vector" => format!("{:#x}", wakeup_vector));
        Ok(())
    }

    /// Return a paused VM to its boot state. The VM stays paused.
    ///
    /// A service-OS image that fails to reload does not stop the rest of the
    /// reset; the failure is reported once every step has run.
    pub fn reset_vm(&self, vm: &Vm) -> Result<(), Error> {
        vm.require_state("reset", VmState::Paused)?;
        let p = &self.platform;

        for vcpu in vm.vcpus() {
            vcpu.reset(p.vcpu.as_ref());
        }
        let loaded = if vm.is_service_os() {
            self.sw_loader().load(vm, p)
        } else {
            Ok(())
        };
        p.devs.reset_ioreqs(vm.id());
        p.devs.vioapic_reset(vm.id());
        p.devs.destroy_secure_world(vm.id());
        vm.update_secure_world(|sw| sw.active = false);

        if let Err(e) = loaded {
            error!(vm.log(), "guest reload failed during reset";
                "error" => ?e);
            return Err(Error::LoadFailure(e));
        }
        info!(vm.log(), "VM reset");
        Ok(())
    }

    /// Tear down a paused VM and release its identity.
    pub fn shutdown_vm(&self, vm: &Vm) -> Result<(), Error> {
        vm.require_state("shut down", VmState::Paused)?;
        self.destroy_vm(vm);
        info!(vm.log(), "VM shut down");
        Ok(())
    }

    /// Release everything held by `vm`, whatever its state. The identity is
    /// freed last, once nothing refers to the VM through the registry.
    pub(super) fn destroy_vm(&self, vm: &Vm) {
        let p = &self.platform;
        let id = vm.id();

        for vcpu in vm.vcpus() {
            vcpu.reset(p.vcpu.as_ref());
            vcpu.offline(p.vcpu.as_ref());
        }
        p.devs.release_ptdev_entries(id);
        vm.vpci().deinit();
        if let Some(domain) = vm.take_iommu_domain() {
            p.iommu.destroy_domain(domain);
        }
        p.ept.destroy(id);

        let _ = self.registry.remove(id);
        vm.set_state(VmState::PoweredOff);
        self.registry.free_id(id);
    }
}
