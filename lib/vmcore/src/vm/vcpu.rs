// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::sync::Mutex;

use strum::IntoStaticStr;

use super::VmId;
use crate::platform::VcpuHw;

/// Upper bound on vCPUs per VM.
pub const MAX_VCPUS_PER_VM: usize = 8;

#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoStaticStr)]
pub enum VcpuState {
    Init,
    Running,
    Paused,
    Zombie,
    Offline,
}
impl Display for VcpuState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let name: &'static str = self.into();
        f.write_str(name)
    }
}

/// Where a vCPU begins executing when next launched.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryState {
    /// 32-bit protected mode with flat segments, as a bzImage or
    /// multiboot kernel expects.
    Protected { rip: u64, boot_params: u64 },
    /// Real-address mode, as for an AP start-up or an S3 wake vector.
    RealMode { cs_selector: u16, cs_base: u64, rip: u64 },
}
impl EntryState {
    /// Real-mode entry at a 32-bit physical `vector`, the way a wakeup vector
    /// or SIPI target is reached.
    pub fn real_mode(vector: u32) -> Self {
        let cs_selector = ((vector >> 4) & 0xffff) as u16;
        EntryState::RealMode {
            cs_selector,
            cs_base: u64::from(cs_selector) << 4,
            rip: 0,
        }
    }
}
impl Default for EntryState {
    fn default() -> Self {
        // Architectural reset vector
        EntryState::RealMode {
            cs_selector: 0xf000,
            cs_base: 0xffff_0000,
            rip: 0xfff0,
        }
    }
}

/// A virtual CPU bound to one physical core.
pub struct Vcpu {
    vm: VmId,
    vcpu_id: u16,
    pcpu_id: u16,
    state: Mutex<VcpuState>,
    entry: Mutex<EntryState>,
}

impl Vcpu {
    pub(crate) fn new(vm: VmId, vcpu_id: u16, pcpu_id: u16) -> Self {
        Self {
            vm,
            vcpu_id,
            pcpu_id,
            state: Mutex::new(VcpuState::Init),
            entry: Mutex::new(EntryState::default()),
        }
    }

    pub fn id(&self) -> u16 {
        self.vcpu_id
    }
    pub fn pcpu(&self) -> u16 {
        self.pcpu_id
    }
    pub fn is_bsp(&self) -> bool {
        self.vcpu_id == 0
    }
    pub fn state(&self) -> VcpuState {
        *self.state.lock().unwrap()
    }
    pub fn entry(&self) -> EntryState {
        *self.entry.lock().unwrap()
    }
    pub fn set_entry(&self, entry: EntryState) {
        *self.entry.lock().unwrap() = entry;
    }

    pub(crate) fn reset(&self, hw: &dyn VcpuHw) {
        hw.reset(self.vm, self.vcpu_id);
        *self.state.lock().unwrap() = VcpuState::Init;
        *self.entry.lock().unwrap() = EntryState::default();
    }
    pub(crate) fn offline(&self, hw: &dyn VcpuHw) {
        hw.offline(self.vm, self.vcpu_id);
        *self.state.lock().unwrap() = VcpuState::Offline;
    }
    pub(crate) fn pause(&self, hw: &dyn VcpuHw, reason: VcpuState) {
        let mut state = self.state.lock().unwrap();
        if *state != reason {
            hw.pause(self.vm, self.vcpu_id, reason);
            *state = reason;
        }
    }
    pub(crate) fn resume(&self, hw: &dyn VcpuHw) {
        hw.resume(self.vm, self.vcpu_id);
        *self.state.lock().unwrap() = VcpuState::Running;
    }
    pub(crate) fn init_vmcs(&self, hw: &dyn VcpuHw) -> anyhow::Result<()> {
        hw.init_vmcs(self.vm, self.vcpu_id, &self.entry())
    }
    pub(crate) fn schedule(&self, hw: &dyn VcpuHw) {
        hw.schedule(self.vm, self.vcpu_id, self.pcpu_id);
        *self.state.lock().unwrap() = VcpuState::Running;
    }
}
