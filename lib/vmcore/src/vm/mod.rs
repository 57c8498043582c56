// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VM control blocks and the structures which own them.

use std::fmt::{Debug, Display, Formatter, Result as FmtResult};
use std::sync::{Arc, Mutex};

use slog::Logger;
use strum::IntoStaticStr;
use thiserror::Error;
use uuid::Uuid;
use vmcore_types::VmConfig;

use crate::hw::pci::Bdf;
use crate::loader::SwInfo;
use crate::platform::{DomainId, EptRoot};
use crate::vpci::Vpci;

pub mod id;
pub mod registry;
pub mod vcpu;

pub use id::VmId;
pub use vcpu::{Vcpu, MAX_VCPUS_PER_VM};

/// Size of the VM identity pool.
pub const MAX_VM: usize = 8;

#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoStaticStr)]
pub enum VmState {
    PoweredOff,
    Created,
    Started,
    Paused,
}
impl Display for VmState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let name: &'static str = self.into();
        f.write_str(name)
    }
}

/// Errors surfaced by VM lifecycle and vPCI operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no free VM identity")]
    ResourceExhausted,

    #[error("cannot {op} a VM in state {state}")]
    InvalidState { op: &'static str, state: VmState },

    #[error("failed to load guest software")]
    LoadFailure(#[source] anyhow::Error),

    #[error("failed to initialize PCI device {vbdf}")]
    DeviceInitFailure {
        vbdf: Bdf,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("{op} failed")]
    Platform {
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

/// Wrap a platform service failure with the step that hit it.
pub(crate) fn platform_err(
    op: &'static str,
) -> impl FnOnce(anyhow::Error) -> Error {
    move |source| Error::Platform { op, source }
}

/// Secure-world (trusted execution) status of a VM.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SecureWorld {
    pub supported: bool,
    pub active: bool,
}

/// A virtual machine.
///
/// Built by the [Hypervisor](crate::Hypervisor) and owned by its registry
/// from creation until shutdown.
pub struct Vm {
    id: VmId,
    config: Arc<VmConfig>,
    state: Mutex<VmState>,
    vcpus: Mutex<Vec<Arc<Vcpu>>>,
    ept_root: EptRoot,
    vpci: Arc<Vpci>,
    iommu: Arc<Mutex<Option<DomainId>>>,
    sworld: Mutex<SecureWorld>,
    sw: Mutex<SwInfo>,
    guid: Uuid,
    snoopy_mem: bool,
    log: Logger,
}

impl Vm {
    pub(crate) fn new(
        id: VmId,
        config: Arc<VmConfig>,
        ept_root: EptRoot,
        vpci: Arc<Vpci>,
        iommu: Arc<Mutex<Option<DomainId>>>,
        log: Logger,
    ) -> Self {
        let guid =
            if config.is_service_os() { Uuid::nil() } else { config.guid };
        let snoopy_mem = !config.is_service_os();
        Self {
            id,
            config,
            state: Mutex::new(VmState::PoweredOff),
            vcpus: Mutex::new(Vec::new()),
            ept_root,
            vpci,
            iommu,
            sworld: Mutex::new(SecureWorld::default()),
            sw: Mutex::new(SwInfo::default()),
            guid,
            snoopy_mem,
            log,
        }
    }

    pub fn id(&self) -> VmId {
        self.id
    }
    pub fn name(&self) -> &str {
        &self.config.name
    }
    pub fn config(&self) -> &Arc<VmConfig> {
        &self.config
    }
    pub fn is_service_os(&self) -> bool {
        self.config.is_service_os()
    }
    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn state(&self) -> VmState {
        *self.state.lock().unwrap()
    }
    pub(crate) fn set_state(&self, state: VmState) {
        *self.state.lock().unwrap() = state;
    }
    /// Fail with [Error::InvalidState] unless the VM is in `want`.
    pub(crate) fn require_state(
        &self,
        op: &'static str,
        want: VmState,
    ) -> Result<(), Error> {
        match self.state() {
            state if state == want => Ok(()),
            state => Err(Error::InvalidState { op, state }),
        }
    }

    /// vCPUs in identity order.
    pub fn vcpus(&self) -> Vec<Arc<Vcpu>> {
        self.vcpus.lock().unwrap().clone()
    }
    pub fn vcpu(&self, vcpu_id: u16) -> Option<Arc<Vcpu>> {
        self.vcpus.lock().unwrap().get(vcpu_id as usize).cloned()
    }
    pub(crate) fn add_vcpu(&self, pcpu: u16) -> Result<Arc<Vcpu>, Error> {
        let mut vcpus = self.vcpus.lock().unwrap();
        if vcpus.len() >= MAX_VCPUS_PER_VM {
            return Err(Error::InvalidParameter(format!(
                "{} already has {} vCPUs",
                self.id, MAX_VCPUS_PER_VM
            )));
        }
        let vcpu = Arc::new(Vcpu::new(self.id, vcpus.len() as u16, pcpu));
        vcpus.push(vcpu.clone());
        Ok(vcpu)
    }

    pub fn ept_root(&self) -> EptRoot {
        self.ept_root
    }
    pub fn vpci(&self) -> &Arc<Vpci> {
        &self.vpci
    }
    pub fn iommu_domain(&self) -> Option<DomainId> {
        *self.iommu.lock().unwrap()
    }
    pub(crate) fn take_iommu_domain(&self) -> Option<DomainId> {
        self.iommu.lock().unwrap().take()
    }
    pub(crate) fn set_iommu_domain(&self, domain: DomainId) {
        *self.iommu.lock().unwrap() = Some(domain);
    }

    pub fn secure_world(&self) -> SecureWorld {
        *self.sworld.lock().unwrap()
    }
    pub(crate) fn update_secure_world(
        &self,
        f: impl FnOnce(&mut SecureWorld),
    ) {
        f(&mut self.sworld.lock().unwrap())
    }

    pub fn sw_info(&self) -> SwInfo {
        self.sw.lock().unwrap().clone()
    }
    pub(crate) fn set_sw_info(&self, sw: SwInfo) {
        *self.sw.lock().unwrap() = sw;
    }

    pub fn guid(&self) -> Uuid {
        self.guid
    }
    /// Whether guest memory accesses by devices are snooped by the caches.
    pub fn snoopy_mem(&self) -> bool {
        self.snoopy_mem
    }
}
impl Debug for Vm {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Vm")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
