// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeSet;

use slog::{error, info};
use vmcore_types::VmConfig;

use super::vdev::Vdev;
use super::{DevCtx, VpciMode};
use crate::hw::pci::Bdf;
use crate::vm::Error;

/// Behavior which differs between the partition and sharing layouts.
///
/// The mode is fixed for the whole hypervisor, so every VM's vPCI dispatches
/// through the same variant.
pub(crate) trait ModeStrategy {
    /// Build the devices of a VM from its pass-through list. `claimed` holds
    /// physical functions owned by other VMs.
    fn init(
        &self,
        ctx: &DevCtx,
        config: &VmConfig,
        claimed: &BTreeSet<Bdf>,
    ) -> Vec<Vdev>;
    fn deinit(&self, ctx: &DevCtx, devices: &mut [Vdev]);
    fn find_vdev<'a>(
        &self,
        devices: &'a mut [Vdev],
        vbdf: Bdf,
    ) -> Option<&'a mut Vdev>;
    fn cfg_read(
        &self,
        ctx: &DevCtx,
        devices: &mut [Vdev],
        vbdf: Bdf,
        offset: u16,
        width: u8,
    ) -> Option<u32>;
    fn cfg_write(
        &self,
        ctx: &DevCtx,
        devices: &mut [Vdev],
        vbdf: Bdf,
        offset: u16,
        width: u8,
        val: u32,
    ) -> Option<()>;
}

impl ModeStrategy for VpciMode {
    fn init(
        &self,
        ctx: &DevCtx,
        config: &VmConfig,
        claimed: &BTreeSet<Bdf>,
    ) -> Vec<Vdev> {
        let mut devices: Vec<Vdev> = Vec::new();

        for ptdev in config.pci_ptdevs.iter() {
            let (vbdf, pbdf) = (Bdf::from(ptdev.vbdf), Bdf::from(ptdev.pbdf));
            devices.push(attach(ctx, vbdf, pbdf, ptdev.name.clone()));
        }

        if *self == VpciMode::Sharing && config.is_service_os() {
            // Everything nobody else claimed shows up at its physical address
            for pbdf in ctx.pci.enumerate() {
                if claimed.contains(&pbdf)
                    || devices
                        .iter()
                        .any(|d| d.vbdf == pbdf || d.pbdf == Some(pbdf))
                {
                    continue;
                }
                devices.push(attach(ctx, pbdf, pbdf, None));
            }
        }

        info!(ctx.log, "vPCI initialized";
            "mode" => ?self, "devices" => devices.len());
        devices
    }

    fn deinit(&self, ctx: &DevCtx, devices: &mut [Vdev]) {
        for vdev in devices.iter_mut() {
            if let Err(e) = vdev.deinit(ctx) {
                error!(ctx.log, "device teardown failed";
                    "vbdf" => %vdev.vbdf, "error" => ?e);
            }
        }
    }

    fn find_vdev<'a>(
        &self,
        devices: &'a mut [Vdev],
        vbdf: Bdf,
    ) -> Option<&'a mut Vdev> {
        devices.iter_mut().find(|d| d.vbdf == vbdf)
    }

    fn cfg_read(
        &self,
        ctx: &DevCtx,
        devices: &mut [Vdev],
        vbdf: Bdf,
        offset: u16,
        width: u8,
    ) -> Option<u32> {
        self.find_vdev(devices, vbdf)?.cfg_read(ctx, offset, width)
    }

    fn cfg_write(
        &self,
        ctx: &DevCtx,
        devices: &mut [Vdev],
        vbdf: Bdf,
        offset: u16,
        width: u8,
        val: u32,
    ) -> Option<()> {
        self.find_vdev(devices, vbdf)?.cfg_write(ctx, offset, width, val)
    }
}

/// Bind and initialize one device. A device whose initialization fails keeps
/// its slot.
fn attach(ctx: &DevCtx, vbdf: Bdf, pbdf: Bdf, name: Option<String>) -> Vdev {
    let mut vdev = Vdev::bind(ctx, vbdf, pbdf, name);
    if let Err(source) = vdev.init(ctx) {
        let err = Error::DeviceInitFailure { vbdf, source };
        error!(ctx.log, "device initialization failed"; "error" => ?err);
    }
    vdev
}
