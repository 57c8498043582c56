// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Software-only platform.
//!
//! Every service is kept in memory and each call is appended to an event
//! log, so callers can check both the resulting state and the order in
//! which the core drove the platform. PCI functions answer BAR sizing the
//! way hardware does, and a port bus lets guest `in`/`out` accesses be
//! issued against whatever handlers the core registered.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use vmcore_types::VmConfig;

use super::*;
use crate::common::{ReadOp, WriteOp};
use crate::hw::pci::bar::BAR_COUNT;
use crate::hw::pci::{bits, BarN};
use crate::loader::{self, ModuleImage};

/// Host-physical base of the memory reserved for secure worlds.
pub const SWORLD_BASE_HPA: u64 = 0x1_0000_0000;
/// Host-physical base of the bootargs images, one page per VM.
pub const BOOTARGS_BASE_HPA: u64 = 0x8_0000;
const SWORLD_STRIDE: u64 = 16 << 20;
const EPT_ROOT_BASE: u64 = 0x2000_0000;

/// A BAR of a simulated function.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SimBar {
    Io { size: u64, base: u64 },
    Mem32 { size: u64, base: u64 },
    /// Occupies its slot and the one following it.
    Mem64 { size: u64, base: u64 },
}

/// Config space of a simulated PCI function.
#[derive(Clone)]
pub struct SimFunction {
    cfg: [u8; bits::LEN_CFG],
    bars: [Option<SimBar>; BAR_COUNT],
}

impl SimFunction {
    fn new(vendor: u16, device: u16, header: u8, class: u8, sub: u8) -> Self {
        let mut func =
            Self { cfg: [0u8; bits::LEN_CFG], bars: [None; BAR_COUNT] };
        func.put(bits::OFF_VENDOR, 2, u32::from(vendor));
        func.put(bits::OFF_DEVICE, 2, u32::from(device));
        func.put(bits::OFF_SUBCLASS, 1, u32::from(sub));
        func.put(bits::OFF_CLASS, 1, u32::from(class));
        func.put(bits::OFF_HEADER_TYPE, 1, u32::from(header));
        func
    }

    /// A type 0 function with the given BARs programmed at their bases.
    pub fn endpoint(
        vendor: u16,
        device: u16,
        bars: [Option<SimBar>; BAR_COUNT],
    ) -> Self {
        let mut func = Self::new(
            vendor,
            device,
            bits::HEADER_TYPE_DEVICE,
            bits::CLASS_STORAGE,
            0,
        );
        func.bars = bars;
        for n in BarN::iter() {
            let (lo, hi) = match bars[n as usize] {
                None => continue,
                Some(SimBar::Io { base, .. }) => {
                    (base as u32 | bits::BAR_TYPE_IO, None)
                }
                Some(SimBar::Mem32 { base, .. }) => {
                    (base as u32 | bits::BAR_TYPE_MEM, None)
                }
                Some(SimBar::Mem64 { base, .. }) => (
                    base as u32 | bits::BAR_TYPE_MEM64,
                    Some((base >> 32) as u32),
                ),
            };
            func.put(n.offset(), 4, lo);
            if let Some(hi) = hi {
                func.put(n.offset() + 4, 4, hi);
            }
        }
        func
    }

    /// A function with a bridge header, as the host bridge slot of a VM is
    /// configured.
    pub fn bridge(vendor: u16, device: u16) -> Self {
        Self::new(
            vendor,
            device,
            bits::HEADER_TYPE_BRIDGE,
            bits::CLASS_BRIDGE,
            bits::SUBCLASS_BRIDGE_HOST,
        )
    }

    /// A function with a header layout the core does not handle.
    pub fn other(vendor: u16, device: u16, header: u8) -> Self {
        Self::new(vendor, device, header, 0xff, 0)
    }

    fn get(&self, off: u16, width: u8) -> u32 {
        let mut bytes = [0xffu8; 4];
        for (i, b) in bytes.iter_mut().take(width as usize).enumerate() {
            if let Some(reg) = self.cfg.get(off as usize + i) {
                *b = *reg;
            }
        }
        match width {
            1 => u32::from_le_bytes(bytes) & 0xff,
            2 => u32::from_le_bytes(bytes) & 0xffff,
            _ => u32::from_le_bytes(bytes),
        }
    }

    fn put(&mut self, off: u16, width: u8, val: u32) {
        for (i, b) in val.to_le_bytes().iter().take(width as usize).enumerate()
        {
            if let Some(reg) = self.cfg.get_mut(off as usize + i) {
                *reg = *b;
            }
        }
    }

    /// Apply a guest write, masking BAR registers the way the decoder does.
    fn write(&mut self, off: u16, width: u8, val: u32) {
        self.put(off, width, val);
        let Some(n) = BarN::from_offset(off) else {
            return;
        };
        let idx = n as usize;
        let dword = self.get(n.offset(), 4);
        let masked = match (self.bars[idx], idx.checked_sub(1)) {
            (Some(SimBar::Io { size, .. }), _) => {
                dword & !(size as u32 - 1) & !0x3 | bits::BAR_TYPE_IO
            }
            (Some(SimBar::Mem32 { size, .. }), _) => {
                dword & !(size as u32 - 1) & bits::BAR_MEM_BASE_MASK
            }
            (Some(SimBar::Mem64 { size, .. }), _) => {
                let mask = !(size - 1) as u32;
                dword & mask & bits::BAR_MEM_BASE_MASK | bits::BAR_TYPE_MEM64
            }
            (None, Some(prev)) => match self.bars[prev] {
                Some(SimBar::Mem64 { size, .. }) => {
                    dword & (!(size - 1) >> 32) as u32
                }
                _ => 0,
            },
            (None, None) => 0,
        };
        self.put(n.offset(), 4, masked);
    }
}

/// One call made into the platform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimEvent {
    EptCreate(VmId),
    EptMap { vm: VmId, gpa: u64, hpa: u64, len: u64, flags: EptFlags },
    EptUnmap { vm: VmId, gpa: u64, len: u64 },
    EptDestroy(VmId),
    IommuEnable,
    DomainCreate { vm: VmId, domain: DomainId },
    DomainDestroy(DomainId),
    Assign { domain: DomainId, bdf: Bdf },
    Unassign { domain: DomainId, bdf: Bdf },
    SetupCpuState(VmId),
    VcpuPrepare { vm: VmId, vcpu: u16, pcpu: u16 },
    VcpuReset { vm: VmId, vcpu: u16 },
    VcpuOffline { vm: VmId, vcpu: u16 },
    VcpuPause { vm: VmId, vcpu: u16, reason: VcpuState },
    VcpuResume { vm: VmId, vcpu: u16 },
    InitVmcs { vm: VmId, vcpu: u16, entry: EntryState },
    Schedule { vm: VmId, vcpu: u16, pcpu: u16 },
    IoBitmap(VmId),
    PioRegister { vm: VmId, base: u16, len: u16 },
    PioUnregister { vm: VmId, base: u16 },
    VpicInit(VmId),
    VioapicInit(VmId),
    VioapicReset(VmId),
    ResetIoreqs(VmId),
    ReleasePtdev(VmId),
    DestroySecureWorld(VmId),
    RebuildMemmap(VmId),
    LoadBootInfo(VmId),
    SetVcpuidEntries(VmId),
    CopyToGuest { vm: VmId, gpa: u64, src_hpa: u64, len: u64 },
}

/// Platform calls which can be made to fail.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SimFail {
    EptCreate,
    EptMap,
    DomainCreate,
    AssignDevice,
    VcpuPrepare,
    InitVmcs,
    PioRegister,
    LoadBootInfo,
    SetVcpuidEntries,
    CopyToGuest,
}

/// An EPT mapping as installed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SimMapping {
    pub hpa: u64,
    pub len: u64,
    pub flags: EptFlags,
}

struct SimDomain {
    vm: VmId,
    devices: BTreeSet<Bdf>,
}

struct PortRange {
    len: u16,
    func: Arc<PioFn>,
}

#[derive(Default)]
struct State {
    functions: BTreeMap<Bdf, SimFunction>,
    cfg_reads: BTreeMap<Bdf, Vec<(u16, u8)>>,
    cfg_writes: BTreeMap<Bdf, Vec<(u16, u8, u32)>>,
    ept: BTreeMap<VmId, BTreeMap<u64, SimMapping>>,
    iommu_enabled: bool,
    domains: BTreeMap<DomainId, SimDomain>,
    next_domain: u16,
    ports: BTreeMap<(VmId, u16), PortRange>,
    modules: BTreeMap<String, ModuleImage>,
    events: Vec<SimEvent>,
    fail: BTreeSet<SimFail>,
}

#[derive(Default)]
pub struct SimPlatform {
    state: Mutex<State>,
}

impl SimPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_function(&self, bdf: Bdf, func: SimFunction) {
        self.state.lock().unwrap().functions.insert(bdf, func);
    }
    pub fn add_boot_module(&self, tag: &str, hpa: u64, size: u64) {
        self.state
            .lock()
            .unwrap()
            .modules
            .insert(tag.to_string(), ModuleImage { hpa, size });
    }

    /// Make every later call of kind `op` fail.
    pub fn fail_on(&self, op: SimFail) {
        self.state.lock().unwrap().fail.insert(op);
    }
    pub fn clear_failures(&self) {
        self.state.lock().unwrap().fail.clear();
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.state.lock().unwrap().events.clone()
    }
    pub fn clear_events(&self) {
        self.state.lock().unwrap().events.clear();
    }

    /// Config reads made of `bdf`, as (offset, width).
    pub fn cfg_reads(&self, bdf: Bdf) -> Vec<(u16, u8)> {
        let state = self.state.lock().unwrap();
        state.cfg_reads.get(&bdf).cloned().unwrap_or_default()
    }

    /// Config writes made to `bdf`, as (offset, width, value).
    pub fn cfg_writes(&self, bdf: Bdf) -> Vec<(u16, u8, u32)> {
        let state = self.state.lock().unwrap();
        state.cfg_writes.get(&bdf).cloned().unwrap_or_default()
    }

    /// Live EPT mappings of `vm`, keyed by guest-physical address. `None`
    /// if the VM has no address table.
    pub fn ept_mappings(&self, vm: VmId) -> Option<BTreeMap<u64, SimMapping>> {
        self.state.lock().unwrap().ept.get(&vm).cloned()
    }

    pub fn iommu_enabled(&self) -> bool {
        self.state.lock().unwrap().iommu_enabled
    }
    /// IOMMU domains in use, with their owning VM.
    pub fn domains(&self) -> Vec<(DomainId, VmId)> {
        let state = self.state.lock().unwrap();
        state.domains.iter().map(|(id, d)| (*id, d.vm)).collect()
    }
    pub fn domain_devices(&self, domain: DomainId) -> Option<Vec<Bdf>> {
        let state = self.state.lock().unwrap();
        state
            .domains
            .get(&domain)
            .map(|d| d.devices.iter().copied().collect())
    }

    /// Port ranges registered for `vm`, as (base, len).
    pub fn port_ranges(&self, vm: VmId) -> Vec<(u16, u16)> {
        let state = self.state.lock().unwrap();
        state
            .ports
            .iter()
            .filter(|((owner, _), _)| *owner == vm)
            .map(|((_, base), range)| (*base, range.len))
            .collect()
    }

    fn port_handler(&self, vm: VmId, port: u16) -> Option<(u16, Arc<PioFn>)> {
        let state = self.state.lock().unwrap();
        let ((owner, base), range) =
            state.ports.range(..=(vm, port)).next_back()?;
        let end = u32::from(*base) + u32::from(range.len);
        if *owner == vm && u32::from(port) < end {
            Some((*base, range.func.clone()))
        } else {
            None
        }
    }

    /// Guest `in` of `width` bytes from `port`. Unclaimed ports read as
    /// all-ones.
    pub fn pio_in(&self, vm: VmId, port: u16, width: u8) -> u32 {
        let mut buf = [0xffu8; 4];
        let buf = &mut buf[..width as usize];
        if let Some((base, func)) = self.port_handler(vm, port) {
            let mut ro = ReadOp::from_buf((port - base) as usize, buf);
            func(port, RWOp::Read(&mut ro));
        }
        let mut bytes = [0u8; 4];
        bytes[..buf.len()].copy_from_slice(buf);
        u32::from_le_bytes(bytes)
    }

    /// Guest `out` of the low `width` bytes of `val` to `port`.
    pub fn pio_out(&self, vm: VmId, port: u16, width: u8, val: u32) {
        let bytes = val.to_le_bytes();
        if let Some((base, func)) = self.port_handler(vm, port) {
            let mut wo = WriteOp::from_buf(
                (port - base) as usize,
                &bytes[..width as usize],
            );
            func(port, RWOp::Write(&mut wo));
        }
    }

    fn record(&self, ev: SimEvent) {
        self.state.lock().unwrap().events.push(ev);
    }

    fn check(&self, op: SimFail) -> anyhow::Result<()> {
        if self.state.lock().unwrap().fail.contains(&op) {
            bail!("injected {:?} failure", op);
        }
        Ok(())
    }
}

impl AddrTable for SimPlatform {
    fn create(&self, vm: VmId) -> anyhow::Result<EptRoot> {
        self.check(SimFail::EptCreate)?;
        let mut state = self.state.lock().unwrap();
        if state.ept.contains_key(&vm) {
            bail!("{} already has an address table", vm);
        }
        state.ept.insert(vm, BTreeMap::new());
        state.events.push(SimEvent::EptCreate(vm));
        Ok(EptRoot(EPT_ROOT_BASE + u64::from(vm.get()) * 0x1000))
    }

    fn add_mapping(
        &self,
        vm: VmId,
        gpa: u64,
        hpa: u64,
        len: u64,
        flags: EptFlags,
    ) -> anyhow::Result<()> {
        self.check(SimFail::EptMap)?;
        let mut state = self.state.lock().unwrap();
        let table = state
            .ept
            .get_mut(&vm)
            .ok_or_else(|| anyhow!("{} has no address table", vm))?;
        let overlap = table
            .range(..gpa + len)
            .next_back()
            .map_or(false, |(start, m)| start + m.len > gpa);
        if overlap {
            bail!("mapping at {:#x} overlaps an existing one", gpa);
        }
        table.insert(gpa, SimMapping { hpa, len, flags });
        state.events.push(SimEvent::EptMap { vm, gpa, hpa, len, flags });
        Ok(())
    }

    fn remove_mapping(
        &self,
        vm: VmId,
        gpa: u64,
        len: u64,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let table = state
            .ept
            .get_mut(&vm)
            .ok_or_else(|| anyhow!("{} has no address table", vm))?;
        if !table.get(&gpa).map_or(false, |m| m.len == len) {
            bail!("no mapping of {:#x} bytes at {:#x}", len, gpa);
        }
        table.remove(&gpa);
        state.events.push(SimEvent::EptUnmap { vm, gpa, len });
        Ok(())
    }

    fn destroy(&self, vm: VmId) {
        let mut state = self.state.lock().unwrap();
        state.ept.remove(&vm);
        state.events.push(SimEvent::EptDestroy(vm));
    }
}

impl Iommu for SimPlatform {
    fn enable(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.iommu_enabled = true;
        state.events.push(SimEvent::IommuEnable);
        Ok(())
    }

    fn create_domain(
        &self,
        vm: VmId,
        _root: EptRoot,
    ) -> anyhow::Result<DomainId> {
        self.check(SimFail::DomainCreate)?;
        let mut state = self.state.lock().unwrap();
        let domain = DomainId(state.next_domain);
        state.next_domain += 1;
        let devices = BTreeSet::new();
        state.domains.insert(domain, SimDomain { vm, devices });
        state.events.push(SimEvent::DomainCreate { vm, domain });
        Ok(domain)
    }

    fn destroy_domain(&self, domain: DomainId) {
        let mut state = self.state.lock().unwrap();
        state.domains.remove(&domain);
        state.events.push(SimEvent::DomainDestroy(domain));
    }

    fn assign_device(&self, domain: DomainId, bdf: Bdf) -> anyhow::Result<()> {
        self.check(SimFail::AssignDevice)?;
        let mut state = self.state.lock().unwrap();
        if state.domains.values().any(|d| d.devices.contains(&bdf)) {
            bail!("{} is already assigned", bdf);
        }
        let dom = state
            .domains
            .get_mut(&domain)
            .ok_or_else(|| anyhow!("no IOMMU domain {:?}", domain))?;
        dom.devices.insert(bdf);
        state.events.push(SimEvent::Assign { domain, bdf });
        Ok(())
    }

    fn unassign_device(
        &self,
        domain: DomainId,
        bdf: Bdf,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let removed = state
            .domains
            .get_mut(&domain)
            .map_or(false, |d| d.devices.remove(&bdf));
        if !removed {
            bail!("{} is not in IOMMU domain {:?}", bdf, domain);
        }
        state.events.push(SimEvent::Unassign { domain, bdf });
        Ok(())
    }
}

impl VcpuHw for SimPlatform {
    fn setup_cpu_state(&self, vm: VmId) -> anyhow::Result<()> {
        self.record(SimEvent::SetupCpuState(vm));
        Ok(())
    }
    fn prepare(&self, vm: VmId, vcpu: u16, pcpu: u16) -> anyhow::Result<()> {
        self.check(SimFail::VcpuPrepare)?;
        self.record(SimEvent::VcpuPrepare { vm, vcpu, pcpu });
        Ok(())
    }
    fn reset(&self, vm: VmId, vcpu: u16) {
        self.record(SimEvent::VcpuReset { vm, vcpu });
    }
    fn offline(&self, vm: VmId, vcpu: u16) {
        self.record(SimEvent::VcpuOffline { vm, vcpu });
    }
    fn pause(&self, vm: VmId, vcpu: u16, reason: VcpuState) {
        self.record(SimEvent::VcpuPause { vm, vcpu, reason });
    }
    fn resume(&self, vm: VmId, vcpu: u16) {
        self.record(SimEvent::VcpuResume { vm, vcpu });
    }
    fn init_vmcs(
        &self,
        vm: VmId,
        vcpu: u16,
        entry: &EntryState,
    ) -> anyhow::Result<()> {
        self.check(SimFail::InitVmcs)?;
        self.record(SimEvent::InitVmcs { vm, vcpu, entry: *entry });
        Ok(())
    }
    fn schedule(&self, vm: VmId, vcpu: u16, pcpu: u16) {
        self.record(SimEvent::Schedule { vm, vcpu, pcpu });
    }
}

impl PhysPci for SimPlatform {
    fn read(&self, bdf: Bdf, offset: u16, width: u8) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.cfg_reads.entry(bdf).or_default().push((offset, width));
        match state.functions.get(&bdf) {
            Some(func) => func.get(offset, width),
            None => match width {
                1 => 0xff,
                2 => 0xffff,
                _ => u32::MAX,
            },
        }
    }

    fn write(&self, bdf: Bdf, offset: u16, width: u8, val: u32) {
        let mut state = self.state.lock().unwrap();
        let Some(func) = state.functions.get_mut(&bdf) else {
            return;
        };
        func.write(offset, width, val);
        state.cfg_writes.entry(bdf).or_default().push((offset, width, val));
    }

    fn enumerate(&self) -> Vec<Bdf> {
        self.state.lock().unwrap().functions.keys().copied().collect()
    }
}

impl PioRegistry for SimPlatform {
    fn setup_io_bitmap(&self, vm: VmId) -> anyhow::Result<()> {
        self.record(SimEvent::IoBitmap(vm));
        Ok(())
    }

    fn register(
        &self,
        vm: VmId,
        base: u16,
        len: u16,
        func: Arc<PioFn>,
    ) -> anyhow::Result<()> {
        self.check(SimFail::PioRegister)?;
        let mut state = self.state.lock().unwrap();
        let end = u32::from(base) + u32::from(len);
        let overlap = state.ports.iter().any(|((owner, b), r)| {
            *owner == vm
                && u32::from(*b) < end
                && u32::from(base) < u32::from(*b) + u32::from(r.len)
        });
        if overlap {
            bail!("ports {:#x}+{} already claimed for {}", base, len, vm);
        }
        state.ports.insert((vm, base), PortRange { len, func });
        state.events.push(SimEvent::PioRegister { vm, base, len });
        Ok(())
    }

    fn unregister(&self, vm: VmId, base: u16) {
        let mut state = self.state.lock().unwrap();
        if state.ports.remove(&(vm, base)).is_some() {
            state.events.push(SimEvent::PioUnregister { vm, base });
        }
    }
}

impl VirtDevices for SimPlatform {
    fn vpic_init(&self, vm: VmId) -> anyhow::Result<()> {
        self.record(SimEvent::VpicInit(vm));
        Ok(())
    }
    fn vioapic_init(&self, vm: VmId) -> anyhow::Result<()> {
        self.record(SimEvent::VioapicInit(vm));
        Ok(())
    }
    fn vioapic_reset(&self, vm: VmId) {
        self.record(SimEvent::VioapicReset(vm));
    }
    fn reset_ioreqs(&self, vm: VmId) {
        self.record(SimEvent::ResetIoreqs(vm));
    }
    fn release_ptdev_entries(&self, vm: VmId) {
        self.record(SimEvent::ReleasePtdev(vm));
    }
    fn destroy_secure_world(&self, vm: VmId) {
        self.record(SimEvent::DestroySecureWorld(vm));
    }
}

impl BootServices for SimPlatform {
    fn rebuild_memmap(&self, vm: VmId) -> anyhow::Result<()> {
        self.record(SimEvent::RebuildMemmap(vm));
        Ok(())
    }

    fn load_boot_info(
        &self,
        vm: VmId,
        config: &VmConfig,
    ) -> anyhow::Result<SwInfo> {
        self.check(SimFail::LoadBootInfo)?;
        let modules = self.state.lock().unwrap().modules.clone();
        let bootargs_hpa =
            BOOTARGS_BASE_HPA + u64::from(vm.get()) * crate::common::PAGE_SIZE;
        let sw = loader::layout_modules(config, bootargs_hpa, |tag| {
            modules.get(tag).copied()
        })?;
        self.record(SimEvent::LoadBootInfo(vm));
        Ok(sw)
    }

    fn set_vcpuid_entries(&self, vm: VmId) -> anyhow::Result<()> {
        self.check(SimFail::SetVcpuidEntries)?;
        self.record(SimEvent::SetVcpuidEntries(vm));
        Ok(())
    }

    fn secure_world_base(&self, vm: VmId) -> u64 {
        SWORLD_BASE_HPA + u64::from(vm.get()) * SWORLD_STRIDE
    }

    fn copy_to_guest(
        &self,
        vm: VmId,
        gpa: u64,
        src_hpa: u64,
        len: u64,
    ) -> anyhow::Result<()> {
        self.check(SimFail::CopyToGuest)?;
        self.record(SimEvent::CopyToGuest { vm, gpa, src_hpa, len });
        Ok(())
    }
}
