//! Launch a VM: compile the QEMU command line, plumb the host, run, clean up.
//!
//! The sequence is fixed:
//!
//! 1. validate options and complete the interface lists
//! 2. check the host for KVM (and nested KVM when asked)
//! 3. compile the command line; with `--dry-run` print it and stop here
//! 4. move passthrough PCI devices to the passthrough driver
//! 5. create bridges and TAP devices
//! 6. run QEMU and wait for it
//! 7. tear down TAP devices and give PCI devices back to their drivers
//!
//! Step 7 runs whatever the outcome of step 6. An interrupt delivered while
//! waiting on QEMU terminates this process and skips it.

use std::io::Write;

use camino::Utf8PathBuf;
use clap::{ArgAction, Parser, ValueEnum};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::common_opts::MemoryOpts;
use crate::host_check::HostModules;
use crate::interfaces::{InterfaceLists, InterfaceSpec, NicModel};
use crate::network::{HostCommand, HostExecutor, NetworkPlan, SystemExecutor};
use crate::pci::{
    self, PassthroughBinding, PassthroughDriver, PciAddress, PciHost, PciSysfs, SystemPci,
};
use crate::qemu::{self, QemuCommandLine, DEFAULT_QEMU};
use crate::runner;
use crate::utils::parse_memory_to_mb;

/// How the VM console is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OutputMode {
    /// Graphical window
    #[default]
    Window,
    /// Serial console on the terminal
    Stdio,
    /// No display at all
    #[value(name = "none")]
    #[serde(rename = "none")]
    Hidden,
}

/// Options for launching a VM.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct LaunchOpts {
    #[clap(long, help = "Only show the generated QEMU command line")]
    pub dry_run: bool,

    #[clap(
        long,
        requires = "dry_run",
        help = "With --dry-run, print the full launch plan as JSON"
    )]
    pub json: bool,

    #[clap(long, default_value = DEFAULT_QEMU, help = "QEMU binary to run")]
    pub qemu: String,

    #[clap(short = 'i', long, help = "Path to the VM disk image")]
    pub image: Option<Utf8PathBuf>,

    #[clap(long, help = "Path to an installation ISO; boots from it in a window")]
    pub install_from_iso: Option<Utf8PathBuf>,

    #[clap(
        short = 'o',
        long,
        value_enum,
        default_value_t = OutputMode::Window,
        help = "How to access VM console I/O"
    )]
    pub vm_output_mode: OutputMode,

    #[clap(
        short = 'p',
        long,
        default_value_t = 20000,
        help = "SSH forwarding base port (the VM index is added)"
    )]
    pub ssh_base_port: u16,

    #[clap(
        long,
        default_value_t = 2,
        value_parser = clap::value_parser!(u32).range(1..),
        help = "Number of CPUs for the VM"
    )]
    pub num_cpus: u32,

    #[clap(flatten)]
    pub memory: MemoryOpts,

    #[clap(long = "temp", help = "Enable non persistent disk mode")]
    pub temp_mode: bool,

    #[clap(
        short = 'm',
        long,
        default_value_t = 1,
        help = "An index for the VM, used for the management port and MAC addresses"
    )]
    pub mgmt_idx: u8,

    #[clap(
        long,
        value_enum,
        default_value_t = NicModel::E1000,
        help = "NIC model to use for the management interface"
    )]
    pub mgmt_nic: NicModel,

    #[clap(
        long = "no-mgmt",
        action = ArgAction::SetFalse,
        help = "Don't add the management network"
    )]
    pub mgmtnet: bool,

    #[clap(
        long,
        value_name = "HOSTPORT:VMPORT",
        help = "Additional port forwarding on the management network"
    )]
    pub hostfwd: Vec<String>,

    #[clap(flatten)]
    pub interfaces: InterfaceLists,

    #[clap(
        long = "unix-socket",
        help = "Unix socket for the next vhost-user backend (repeatable)"
    )]
    pub unix_socket: Vec<Utf8PathBuf>,

    #[clap(
        long = "no-unix-server",
        action = ArgAction::SetFalse,
        help = "With vhost-user, act as a unix socket client rather than server"
    )]
    pub unix_server: bool,

    #[clap(
        long = "no-bridging",
        action = ArgAction::SetFalse,
        help = "Don't attach TAP devices to a bridge"
    )]
    pub bridging: bool,

    #[clap(
        long = "no-kvm",
        action = ArgAction::SetFalse,
        help = "Disable KVM, falling back to userspace emulation"
    )]
    pub kvm: bool,

    #[clap(long, help = "Enable vhost-net optimization")]
    pub vhost_net: bool,

    #[clap(
        long = "no-mrg-rx-bufs",
        action = ArgAction::SetFalse,
        help = "Disable virtio-net mergeable RX buffers"
    )]
    pub mrg_rx_bufs: bool,

    #[clap(
        long = "no-ioeventfd",
        action = ArgAction::SetFalse,
        help = "Disable ioeventfd optimization"
    )]
    pub ioeventfd: bool,

    #[clap(
        long,
        default_value_t = 1,
        value_parser = clap::value_parser!(u32).range(1..=64),
        help = "Number of queues in a TAP device"
    )]
    pub num_queues: u32,

    #[clap(long, help = "Enable NIC interrupt mitigation")]
    pub interrupt_mitigation: bool,

    #[clap(long, help = "Enable netmap passthrough")]
    pub passthrough: bool,

    #[clap(long, help = "Kernel for direct boot")]
    pub kernel: Option<Utf8PathBuf>,

    #[clap(long, help = "Initramfs for direct boot")]
    pub initramfs: Option<Utf8PathBuf>,

    #[clap(long, help = "Redirect serial console to a TCP port")]
    pub console_tcp: bool,

    #[clap(
        long,
        default_value_t = 30000,
        help = "Base TCP port for the serial console (the VM index is added)"
    )]
    pub console_base_port: u16,

    #[clap(long, help = "Redirect serial console to a local file")]
    pub console_file: Option<Utf8PathBuf>,

    #[clap(long, help = "Enable nested KVM for the VM")]
    pub nested_kvm: bool,

    #[clap(long, help = "Additional QEMU device")]
    pub device: Option<String>,

    #[clap(
        long,
        allow_hyphen_values = true,
        help = "Additional QEMU arguments (can be anything)"
    )]
    pub plus: Option<String>,

    #[clap(
        long = "pci-passthrough",
        value_name = "xx:yy.z",
        help = "Pass a host PCI device through to the VM (repeatable)"
    )]
    pub pci_passthrough: Vec<String>,

    #[clap(
        long,
        value_enum,
        default_value_t = PassthroughDriver::VfioPci,
        help = "Driver to use for PCI passthrough"
    )]
    pub pci_passthrough_driver: PassthroughDriver,

    #[clap(
        long = "no-sudo",
        action = ArgAction::SetFalse,
        help = "Run host networking commands directly instead of through sudo"
    )]
    pub sudo: bool,

    #[clap(short = 'q', long, help = "Discard QEMU's stdout and stderr")]
    pub quiet: bool,
}

impl LaunchOpts {
    /// Console mode after the overrides: serial redirection hides the
    /// display, installing from an ISO needs a window.
    pub fn effective_output_mode(&self) -> OutputMode {
        if self.console_file.is_some() || self.console_tcp {
            OutputMode::Hidden
        } else if self.install_from_iso.is_some() {
            OutputMode::Window
        } else {
            self.vm_output_mode
        }
    }

    /// Whether disk writes are discarded; never while installing.
    pub fn snapshot(&self) -> bool {
        self.temp_mode && self.install_from_iso.is_none()
    }

    pub fn pci_addresses(&self) -> Result<Vec<PciAddress>> {
        self.pci_passthrough.iter().map(|s| s.parse()).collect()
    }

    pub fn interface_specs(&self) -> Result<Vec<InterfaceSpec>> {
        self.interfaces.to_specs(self.mgmt_idx, &self.unix_socket)
    }

    /// Format checks that the argument parser cannot express.
    pub fn validate(&self) -> Result<()> {
        parse_memory_to_mb(&self.memory.memory)
            .with_context(|| format!("Invalid --memory '{}'", self.memory))?;
        if self.mgmtnet && self.mgmt_nic == NicModel::PtnetPci {
            return Err(eyre!("ptnet-pci cannot be used for the management interface"));
        }
        Ok(())
    }
}

/// Everything a launch would do, for `--dry-run --json`.
#[derive(Debug, Serialize)]
struct LaunchPlan<'a> {
    program: &'a str,
    args: Vec<String>,
    command_line: String,
    interfaces: &'a [InterfaceSpec],
    setup: Vec<String>,
    teardown: Vec<String>,
    pci_passthrough: &'a [PciAddress],
    pci_passthrough_driver: PassthroughDriver,
}

fn command_strings(cmds: &[HostCommand]) -> Vec<String> {
    cmds.iter().map(ToString::to_string).collect()
}

fn print_dry_run(
    out: &mut impl Write,
    opts: &LaunchOpts,
    cmdline: &QemuCommandLine,
    ifaces: &[InterfaceSpec],
    plan: &NetworkPlan,
    pci: &[PciAddress],
) -> Result<()> {
    if !opts.json {
        writeln!(out, "{cmdline}")?;
        return Ok(());
    }
    let launch_plan = LaunchPlan {
        program: &cmdline.program,
        args: cmdline.args(),
        command_line: cmdline.to_string(),
        interfaces: ifaces,
        setup: command_strings(&plan.setup_commands()),
        teardown: command_strings(&plan.teardown_commands()),
        pci_passthrough: pci,
        pci_passthrough_driver: opts.pci_passthrough_driver,
    };
    serde_json::to_writer_pretty(&mut *out, &launch_plan)?;
    writeln!(out)?;
    Ok(())
}

fn restore_pci(bindings: Vec<PassthroughBinding>, sysfs: &PciSysfs) {
    for b in bindings.iter().rev() {
        if let Err(e) = b.restore(sysfs) {
            error!("{e:#}");
        }
    }
}

fn attach_pci(
    opts: &LaunchOpts,
    pci: &[PciAddress],
    host: &impl PciHost,
) -> Result<Vec<PassthroughBinding>> {
    let mut bindings = Vec::with_capacity(pci.len());
    for addr in pci {
        match pci::attach(host, addr, opts.pci_passthrough_driver) {
            Ok(b) => bindings.push(b),
            Err(e) => {
                restore_pci(bindings, host.sysfs());
                return Err(e);
            }
        }
    }
    Ok(bindings)
}

/// Launch with explicit host collaborators.
///
/// `run_vm` runs the hypervisor and reports whether it exited successfully;
/// its failure is not an error of the launch.
pub(crate) fn run_with(
    opts: &LaunchOpts,
    modules: &HostModules,
    pci_host: &impl PciHost,
    exec: &mut impl HostExecutor,
    out: &mut impl Write,
    run_vm: impl FnOnce(&QemuCommandLine) -> bool,
) -> Result<()> {
    opts.validate()?;
    let ifaces = opts.interface_specs()?;
    if opts.kvm {
        modules.check_kvm()?;
    }
    if opts.nested_kvm {
        modules.check_nested_kvm()?;
    }

    let cmdline = qemu::build_command_line(opts, &ifaces)?;
    let plan = NetworkPlan::new(&ifaces, opts.bridging, opts.num_queues);
    let pci = opts.pci_addresses()?;

    if opts.dry_run {
        return print_dry_run(out, opts, &cmdline, &ifaces, &plan, &pci);
    }

    let bindings = attach_pci(opts, &pci, pci_host)?;
    let network = match plan.provision(exec) {
        Ok(n) => n,
        Err(e) => {
            restore_pci(bindings, pci_host.sysfs());
            return Err(e);
        }
    };

    debug!("Launching: {cmdline}");
    if !run_vm(&cmdline) {
        info!("Cleaning up after failed QEMU run");
    }

    network.teardown(exec);
    restore_pci(bindings, pci_host.sysfs());
    Ok(())
}

/// Launch a VM on this host.
pub fn run(opts: LaunchOpts) -> Result<()> {
    let mut exec = SystemExecutor { sudo: opts.sudo };
    let pci_host = SystemPci {
        sysfs: PciSysfs::default(),
        sudo: opts.sudo,
    };
    let mut stdout = std::io::stdout().lock();
    let quiet = opts.quiet;
    run_with(
        &opts,
        &HostModules::default(),
        &pci_host,
        &mut exec,
        &mut stdout,
        |cmdline| runner::run_and_report(cmdline, quiet),
    )
}
