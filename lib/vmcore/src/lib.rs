// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![allow(clippy::style)]

#[macro_use]
extern crate bitflags;

pub extern crate vmcore_types;

pub mod common;
pub mod hw;
pub mod hypervisor;
pub mod loader;
pub mod platform;
pub mod vm;
pub mod vpci;

pub use hypervisor::Hypervisor;
pub use vm::{Error, Vm, VmId, VmState};
