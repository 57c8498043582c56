// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::sync::atomic::{AtomicU64, Ordering};

use super::MAX_VM;

/// Identity of a VM, unique among live VMs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmId(u16);
impl VmId {
    /// Returns [`Option::None`] if `n` is outside the identity pool.
    pub const fn new(n: u16) -> Option<Self> {
        if (n as usize) < MAX_VM {
            Some(Self(n))
        } else {
            None
        }
    }
    pub const fn get(&self) -> u16 {
        self.0
    }
    const fn bit(&self) -> u64 {
        1 << self.0
    }
}
impl Display for VmId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "vm{}", self.0)
    }
}

/// Pool of VM identities, kept as a bitmap of those in use.
///
/// Allocation and release are lock-free. Callers must not release an
/// identity while anything still acts on the VM holding it.
pub struct IdAllocator {
    map: AtomicU64,
}
impl IdAllocator {
    pub const fn new() -> Self {
        Self { map: AtomicU64::new(0) }
    }

    /// Claim the lowest free identity, or `None` if all are in use.
    pub fn alloc(&self) -> Option<VmId> {
        loop {
            let cur = self.map.load(Ordering::Acquire);
            let id = VmId::new((!cur).trailing_zeros() as u16)?;
            let prev = self.map.fetch_or(id.bit(), Ordering::AcqRel);
            if prev & id.bit() == 0 {
                return Some(id);
            }
            // Lost the race for that bit; rescan.
        }
    }

    pub fn free(&self, id: VmId) {
        self.map.fetch_and(!id.bit(), Ordering::AcqRel);
    }

    pub fn is_allocated(&self, id: VmId) -> bool {
        self.map.load(Ordering::Acquire) & id.bit() != 0
    }
}
impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
