// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::{Arc, Mutex};

use super::id::{IdAllocator, VmId};
use super::{Vm, MAX_VM};

/// Fixed table of VM slots, indexed by identity.
///
/// A VM is reachable only once it has been published into the slot matching
/// its identity, and only while that identity remains allocated.
pub struct Registry {
    ids: IdAllocator,
    slots: [Mutex<Option<Arc<Vm>>>; MAX_VM],
}

impl Registry {
    pub fn new() -> Self {
        Self {
            ids: IdAllocator::new(),
            slots: std::array::from_fn(|_| Mutex::new(None)),
        }
    }

    pub(crate) fn alloc_id(&self) -> Option<VmId> {
        self.ids.alloc()
    }
    pub(crate) fn free_id(&self, id: VmId) {
        self.ids.free(id)
    }

    pub(crate) fn publish(&self, vm: Arc<Vm>) {
        let mut slot = self.slots[vm.id().get() as usize].lock().unwrap();
        assert!(slot.is_none(), "{} slot already occupied", vm.id());
        *slot = Some(vm);
    }

    pub(crate) fn remove(&self, id: VmId) -> Option<Arc<Vm>> {
        self.slots[id.get() as usize].lock().unwrap().take()
    }

    pub fn get(&self, id: VmId) -> Option<Arc<Vm>> {
        if !self.ids.is_allocated(id) {
            return None;
        }
        self.slots[id.get() as usize].lock().unwrap().clone()
    }

    /// Every published VM, in identity order.
    pub fn live(&self) -> Vec<Arc<Vm>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.lock().unwrap().clone())
            .collect()
    }
}
impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
