// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use anyhow::{anyhow, Context};
use clap::Parser;
use slog::{error, info, o, Drain};
use vmcore::platform::sim::SimPlatform;
use vmcore::platform::Platform;
use vmcore::Hypervisor;

mod board;

fn build_log(level: slog::Level) -> (slog::Logger, slog_async::AsyncGuard) {
    let (drain, guard) = if atty::is(atty::Stream::Stderr) {
        let decorator = slog_term::TermDecorator::new().stderr().build();
        let drain = slog_term::CompactFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain).build_with_guard()
    } else {
        let decorator = slog_term::PlainDecorator::new(std::io::stderr());
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain).build_with_guard()
    };
    let drain = slog::LevelFilter::new(drain, level).fuse();
    (slog::Logger::root(drain, o!()), guard)
}

fn parse_level(s: &str) -> Result<slog::Level, String> {
    s.parse().map_err(|_| format!("unknown log level '{}'", s))
}

#[derive(clap::Parser)]
/// Boot the VMs of a board description on a simulated platform.
struct Args {
    /// Board configuration (TOML).
    #[clap(value_name = "CONFIG", action)]
    config: PathBuf,

    /// Minimum level of log records to emit.
    #[clap(short, long, default_value = "info", value_parser = parse_level)]
    log_level: slog::Level,

    /// Leave the VMs running instead of tearing them down before exit.
    #[clap(long, action)]
    no_shutdown: bool,
}

fn main() -> anyhow::Result<()> {
    let Args { config, log_level, no_shutdown } = Args::parse();
    let (log, _log_async_guard) = build_log(log_level);

    let config = vmcore_config_toml::parse(&config)
        .with_context(|| format!("failed to parse {}", config.display()))?;

    let sim = board::build(&config, &log);
    let hv = Hypervisor::new(
        config.vm.clone(),
        config.main.vpci_mode,
        Platform::from_provider(sim.clone()),
        &log,
    );
    info!(log, "board ready";
        "mode" => ?hv.vpci_mode(),
        "pcpus" => config.main.pcpus,
        "vms" => hv.configs().len());

    // Every core runs its own boot path, as each physical CPU would.
    let failures: Vec<anyhow::Error> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..config.main.pcpus)
            .map(|pcpu| {
                let hv = &hv;
                (pcpu, s.spawn(move || hv.prepare_vm(pcpu)))
            })
            .collect();
        workers
            .into_iter()
            .filter_map(|(pcpu, worker)| match worker.join() {
                Ok(Ok(_)) => None,
                Ok(Err(e)) => Some(
                    anyhow::Error::new(e)
                        .context(format!("boot on pcpu {} failed", pcpu)),
                ),
                Err(_) => {
                    Some(anyhow!("boot thread for pcpu {} panicked", pcpu))
                }
            })
            .collect()
    });
    for e in failures.iter() {
        error!(log, "VM preparation failed"; "error" => ?e);
    }

    print_tables(&hv, &sim);

    if !no_shutdown {
        for summary in hv.list_vms() {
            let vm = hv
                .get_vm_from_identity(summary.id)
                .ok_or_else(|| anyhow!("{} vanished", summary.id))?;
            hv.pause_vm(&vm)
                .with_context(|| format!("failed to pause {}", vm.id()))?;
            hv.shutdown_vm(&vm)
                .with_context(|| format!("failed to shut down {}", vm.id()))?;
        }
        info!(log, "all VMs shut down");
    }

    match failures.into_iter().next() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn print_tables(hv: &Hypervisor, sim: &SimPlatform) {
    println!("{:<6} {:<24} {:<10}", "VM", "NAME", "STATE");
    for vm in hv.list_vms() {
        println!(
            "{:<6} {:<24} {:<10}",
            vm.id.to_string(),
            vm.name,
            vm.state.to_string()
        );
    }

    println!();
    println!("{:<6} {:<6} {:<6} {:<10}", "VM", "VCPU", "PCPU", "STATE");
    for vcpu in hv.list_vcpus() {
        println!(
            "{:<6} {:<6} {:<6} {:<10}",
            vcpu.vm.to_string(),
            vcpu.vcpu_id,
            vcpu.pcpu_id,
            vcpu.run_state.to_string()
        );
    }

    for vm in hv.list_vms() {
        println!();
        println!("{} PCI bus 0:", vm.id);
        for found in board::scan_bus0(sim, vm.id) {
            println!(
                "  {} {:04x}:{:04x} bar0={:#010x}",
                found.bdf, found.vendor, found.device, found.bar0
            );
        }
    }
}
