//! qrun - launch QEMU VMs with TAP, bridge, netmap and vhost-user networking

use clap::Parser;
use color_eyre::{Report, Result};

mod command_run;
mod common_opts;
mod host_check;
mod interfaces;
mod launch;
mod network;
mod pci;
mod qemu;
mod runner;
mod utils;

/// Launch a QEMU virtual machine.
///
/// Compiles the options into a QEMU command line, creates the host TAP
/// devices and bridges the data interfaces need, moves passthrough PCI
/// devices to the passthrough driver, runs QEMU and undoes the host changes
/// once it exits. With `--dry-run` only the command line is printed.
#[derive(Parser)]
#[command(version)]
struct Cli {
    #[clap(flatten)]
    opts: launch::LaunchOpts,
}

/// Install and configure the tracing/logging system.
///
/// Logs go to stderr, filtered by RUST_LOG and defaulting to 'info'.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let format = fmt::format().without_time().with_target(false).compact();

    let fmt_layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();
    launch::run(cli.opts)?;
    tracing::debug!("exiting");
    Ok(())
}
