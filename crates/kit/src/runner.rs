//! Hypervisor process execution.

use std::process::{ExitStatus, Stdio};

use color_eyre::eyre::Context;
use color_eyre::Result;
use tracing::{error, info};

use crate::qemu::QemuCommandLine;

/// Spawn the hypervisor and block until it exits.
///
/// Stdio is inherited unless `quiet`, in which case the guest console
/// output is discarded.
pub fn run_hypervisor(cmdline: &QemuCommandLine, quiet: bool) -> Result<ExitStatus> {
    let mut cmd = cmdline.to_command();
    if quiet {
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
    }
    info!("Starting {}", cmdline.program);
    tracing::debug!("exec: {cmdline}");
    cmd.status()
        .with_context(|| format!("Failed to execute {}", cmdline.program))
}

/// Run the hypervisor, reporting rather than propagating any failure.
///
/// Returns whether it exited successfully.
pub fn run_and_report(cmdline: &QemuCommandLine, quiet: bool) -> bool {
    match run_hypervisor(cmdline, quiet) {
        Ok(status) if status.success() => {
            info!("{} exited", cmdline.program);
            true
        }
        Ok(status) => {
            error!("QEMU terminated with {status}");
            false
        }
        Err(e) => {
            error!("QEMU terminated with an exception: {e:#}");
            false
        }
    }
}
