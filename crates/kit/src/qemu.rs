//! QEMU command line construction.
//!
//! The command line is built as a list of [`QemuFlag`] records (flag name,
//! optional leading value, comma-separated sub-options) and serialized once,
//! either as an argv for execution or as a shell-quoted string for display.
//! Flag order is significant and fixed by [`build_command_line`]:
//! boot, CPU/memory and console flags come first, then the management
//! network, then each data interface as a device flag immediately followed
//! by its backend flag(s), then passthrough devices and free-form extras.

use std::fmt;
use std::process::Command;
use std::str::FromStr;

use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use serde::Serialize;
use tracing::warn;

use crate::interfaces::{Backend, InterfaceSpec, NicModel};
use crate::launch::{LaunchOpts, OutputMode};

/// Hypervisor binary used unless `--qemu` says otherwise.
pub const DEFAULT_QEMU: &str = "qemu-system-x86_64";

/// Locally administered vendor prefix for every generated MAC address.
const MAC_PREFIX: &str = "00:AA:BB:CC";

/// Netdev id of the management interface.
const MGMT_NETDEV: &str = "mgmt";

/// Socket backends listen on / connect to this base port plus the interface index.
const SOCKET_BASE_PORT: u16 = 4000;

/// Guest SSH port forwarded from the host.
const GUEST_SSH_PORT: u16 = 22;

/// One `name=value` or bare `name` entry in a flag's comma-separated list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SubOption {
    Pair(String, String),
    Flag(String),
}

impl fmt::Display for SubOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pair(k, v) => write!(f, "{k}={v}"),
            Self::Flag(k) => f.write_str(k),
        }
    }
}

/// A single QEMU flag, e.g. `-device e1000,netdev=mgmt,mac=...`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QemuFlag {
    /// Flag name without the leading dash
    pub name: String,
    /// Leading positional value (`e1000` in `-device e1000,...`)
    pub value: Option<String>,
    pub options: Vec<SubOption>,
}

impl QemuFlag {
    /// A flag without argument, like `-enable-kvm`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
            options: Vec::new(),
        }
    }

    pub fn with_value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            ..Self::new(name)
        }
    }

    pub fn opt(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.options.push(SubOption::Pair(key.into(), value.to_string()));
        self
    }

    pub fn flag(mut self, key: impl Into<String>) -> Self {
        self.options.push(SubOption::Flag(key.into()));
        self
    }

    /// Value of the first `key=...` sub-option.
    #[cfg(test)]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.iter().find_map(|o| match o {
            SubOption::Pair(k, v) if k == key => Some(v.as_str()),
            _ => None,
        })
    }

    /// The flag's argument: value and sub-options joined with commas.
    pub fn argument(&self) -> Option<String> {
        let parts: Vec<String> = self
            .value
            .iter()
            .cloned()
            .chain(self.options.iter().map(ToString::to_string))
            .collect();
        (!parts.is_empty()).then(|| parts.join(","))
    }

    pub fn to_args(&self) -> Vec<String> {
        std::iter::once(format!("-{}", self.name))
            .chain(self.argument())
            .collect()
    }
}

/// A complete hypervisor invocation.
#[derive(Debug, Clone, Serialize)]
pub struct QemuCommandLine {
    pub program: String,
    /// Disk image, passed positionally before any flag
    pub image: Option<String>,
    pub flags: Vec<QemuFlag>,
    /// Free-form arguments appended verbatim
    pub extra: Vec<String>,
}

impl QemuCommandLine {
    /// Arguments after the program name.
    pub fn args(&self) -> Vec<String> {
        self.image
            .iter()
            .cloned()
            .chain(self.flags.iter().flat_map(QemuFlag::to_args))
            .chain(self.extra.iter().cloned())
            .collect()
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args());
        cmd
    }

    /// Flags with the given name, in command line order.
    #[cfg(test)]
    pub fn flags_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a QemuFlag> + 'a {
        self.flags.iter().filter(move |f| f.name == name)
    }
}

impl fmt::Display for QemuCommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in self.args() {
            let quoted = shlex::try_quote(&arg).unwrap_or_else(|_| arg.as_str().into());
            write!(f, " {quoted}")?;
        }
        Ok(())
    }
}

/// Extra port forwarding from host to guest, `HOSTPORT:VMPORT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: u16,
    pub guest_port: u16,
}

impl FromStr for PortMapping {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        let (host_part, guest_part) = s.split_once(':').ok_or_else(|| {
            eyre!(
                "Invalid port format '{}'. Expected format: host_port:guest_port",
                s
            )
        })?;

        let host_port = host_part.trim().parse::<u16>().map_err(|_| {
            eyre!(
                "Invalid host port '{}'. Must be a number between 0 and 65535",
                host_part
            )
        })?;

        let guest_port = guest_part.trim().parse::<u16>().map_err(|_| {
            eyre!(
                "Invalid guest port '{}'. Must be a number between 0 and 65535",
                guest_part
            )
        })?;

        Ok(Self {
            host_port,
            guest_port,
        })
    }
}

fn on_off(b: bool) -> &'static str {
    if b {
        "on"
    } else {
        "off"
    }
}

fn mac_address(vm_idx: u8, suffix: &str) -> String {
    format!("{MAC_PREFIX}:{vm_idx:02x}:{suffix}")
}

fn hostfwd(host_port: u16, guest_port: u16) -> String {
    format!("tcp::{host_port}-:{guest_port}")
}

/// `base + mgmt_idx`, which must still be a valid port.
fn port_for_vm(base: u16, mgmt_idx: u8, what: &str) -> Result<u16> {
    base.checked_add(mgmt_idx.into())
        .ok_or_else(|| eyre!("{what} base port {base} + VM index {mgmt_idx} exceeds 65535"))
}

fn push_boot_flags(opts: &LaunchOpts, flags: &mut Vec<QemuFlag>) {
    if let Some(kernel) = &opts.kernel {
        flags.push(QemuFlag::with_value("kernel", kernel.as_str()));
        flags.push(QemuFlag::with_value("append", "console=ttyS0"));
    }
    if let Some(initramfs) = &opts.initramfs {
        flags.push(QemuFlag::with_value("initrd", initramfs.as_str()));
    }
}

fn push_console_flags(opts: &LaunchOpts, flags: &mut Vec<QemuFlag>) -> Result<()> {
    flags.push(QemuFlag::with_value("vga", "std"));
    match opts.effective_output_mode() {
        OutputMode::Window => {}
        OutputMode::Stdio => flags.push(QemuFlag::new("nographic")),
        OutputMode::Hidden => flags.push(QemuFlag::with_value("display", "none")),
    }

    if opts.snapshot() {
        flags.push(QemuFlag::new("snapshot"));
    }

    if let Some(iso) = &opts.install_from_iso {
        flags.push(QemuFlag::with_value("cdrom", iso.as_str()));
        flags.push(QemuFlag::new("boot").opt("order", "dc"));
    }

    if let Some(file) = &opts.console_file {
        flags.push(QemuFlag::with_value("serial", format!("file:{file}")));
    } else if opts.console_tcp {
        let port = port_for_vm(opts.console_base_port, opts.mgmt_idx, "Console")?;
        flags.push(
            QemuFlag::with_value("serial", format!("tcp:127.0.0.1:{port}"))
                .flag("server")
                .flag("nowait"),
        );
    }
    Ok(())
}

/// vhost-user needs guest memory shared with the backend process.
fn push_shared_memory(opts: &LaunchOpts, ifaces: &[InterfaceSpec], flags: &mut Vec<QemuFlag>) {
    if !ifaces.iter().any(|i| i.backend == Backend::VhostUser) {
        return;
    }
    flags.push(QemuFlag::with_value("numa", "node").opt("memdev", "mem0"));
    flags.push(
        QemuFlag::with_value("object", "memory-backend-file")
            .opt("id", "mem0")
            .opt("size", &opts.memory.memory)
            .opt("mem-path", "/dev/hugepages")
            .opt("share", "on"),
    );
}

fn push_mgmt_flags(opts: &LaunchOpts, flags: &mut Vec<QemuFlag>) -> Result<()> {
    if !opts.mgmtnet {
        return Ok(());
    }
    flags.push(
        QemuFlag::with_value("device", opts.mgmt_nic.to_string())
            .opt("netdev", MGMT_NETDEV)
            .opt("mac", mac_address(opts.mgmt_idx, "99")),
    );

    let ssh_port = port_for_vm(opts.ssh_base_port, opts.mgmt_idx, "SSH")?;
    let mut netdev = QemuFlag::with_value("netdev", "user")
        .opt("id", MGMT_NETDEV)
        .opt("hostfwd", hostfwd(ssh_port, GUEST_SSH_PORT));
    for spec in &opts.hostfwd {
        match spec.parse::<PortMapping>() {
            Ok(m) => netdev = netdev.opt("hostfwd", hostfwd(m.host_port, m.guest_port)),
            Err(e) => warn!("Invalid hostfwd \"{spec}\", skipping: {e}"),
        }
    }
    flags.push(netdev);
    Ok(())
}

/// The `-device` flag of a data interface.
pub fn device_flag(opts: &LaunchOpts, spec: &InterfaceSpec) -> QemuFlag {
    let mut dev = QemuFlag::with_value("device", spec.frontend.to_string())
        .opt("netdev", spec.netdev_id())
        .opt("mac", mac_address(opts.mgmt_idx, &format!("{:02x}", spec.idx)));
    if spec.frontend.supports_ioeventfd() {
        dev = dev.opt("ioeventfd", on_off(opts.ioeventfd));
    }
    if spec.frontend.supports_mitigation() {
        dev = dev.opt("mitigation", on_off(opts.interrupt_mitigation));
    }
    if spec.frontend == NicModel::VirtioNetPci {
        dev = dev.opt("mrg_rxbuf", on_off(opts.mrg_rx_bufs));
        if opts.num_queues > 1 {
            // The guest still has to enable them: ethtool -L eth0 combined N
            dev = dev.opt("mq", "on").opt("vectors", 2 * opts.num_queues + 1);
        }
    }
    dev
}

/// The backend flag(s) of a data interface; vhost-user also needs a `-chardev`.
pub fn backend_flags(opts: &LaunchOpts, spec: &InterfaceSpec) -> Result<Vec<QemuFlag>> {
    spec.validate()?;
    let id = spec.netdev_id();
    let flags = match spec.backend {
        Backend::Nat => vec![QemuFlag::with_value("netdev", "user")
            .opt("net", format!("10.79.{}.0/24", spec.idx))
            .opt("id", id)],
        Backend::SocketListen | Backend::SocketConnect => {
            let mode = if spec.backend == Backend::SocketListen {
                "listen"
            } else {
                "connect"
            };
            let port = SOCKET_BASE_PORT + u16::from(spec.idx);
            vec![QemuFlag::with_value("netdev", "socket")
                .opt(mode, format!("127.0.0.1:{port}"))
                .opt("id", id)]
        }
        Backend::VhostUser => {
            let chardev_id = format!("char{}", spec.idx);
            let path = spec
                .unix_socket
                .as_ref()
                .ok_or_else(|| eyre!("vhost-user interface {} has no unix socket", spec.idx))?;
            let mut chardev = QemuFlag::with_value("chardev", "socket")
                .opt("id", &chardev_id)
                .opt("path", path);
            if opts.unix_server {
                chardev = chardev.flag("server");
            }
            vec![
                QemuFlag::new("netdev")
                    .opt("type", "vhost-user")
                    .opt("id", id)
                    .opt("chardev", chardev_id),
                chardev,
            ]
        }
        Backend::Tap => {
            let mut netdev = QemuFlag::with_value("netdev", "tap")
                .opt("ifname", spec.host_ifname())
                .opt("id", id);
            if spec.frontend == NicModel::VirtioNetPci {
                netdev = netdev.opt("vhost", on_off(opts.vhost_net));
            }
            netdev = netdev.opt("script", "no").opt("downscript", "no");
            if opts.num_queues > 1 {
                netdev = netdev.opt("queues", opts.num_queues);
            }
            vec![netdev]
        }
        Backend::Netmap | Backend::NetmapPipeMaster | Backend::NetmapPipeSlave => {
            let mut netdev = QemuFlag::with_value("netdev", "netmap")
                .opt("ifname", spec.host_ifname())
                .opt("id", id);
            if opts.passthrough || spec.frontend == NicModel::PtnetPci {
                netdev = netdev.opt("passthrough", "on");
            }
            vec![netdev]
        }
    };
    Ok(flags)
}

/// Compile the options and interfaces into a QEMU invocation.
///
/// Pure: no host state is read or changed.
pub fn build_command_line(opts: &LaunchOpts, ifaces: &[InterfaceSpec]) -> Result<QemuCommandLine> {
    let mut flags = Vec::new();

    push_boot_flags(opts, &mut flags);
    if opts.kvm {
        flags.push(QemuFlag::new("enable-kvm"));
    }
    flags.push(QemuFlag::with_value("smp", opts.num_cpus.to_string()));
    flags.push(QemuFlag::with_value("m", &opts.memory.memory));
    push_console_flags(opts, &mut flags)?;
    push_shared_memory(opts, ifaces, &mut flags);
    push_mgmt_flags(opts, &mut flags)?;

    for spec in ifaces {
        flags.push(device_flag(opts, spec));
        flags.extend(backend_flags(opts, spec)?);
    }

    if let Some(device) = &opts.device {
        flags.push(QemuFlag::with_value("device", device));
    }

    let driver = opts.pci_passthrough_driver;
    for addr in opts.pci_addresses()? {
        flags.push(QemuFlag::with_value("device", driver.qemu_device()).opt("host", addr));
    }

    if opts.nested_kvm {
        flags.push(QemuFlag::with_value("cpu", "host"));
    }

    let extra = match &opts.plus {
        Some(plus) => shlex::split(plus)
            .ok_or_else(|| eyre!("Unable to split extra arguments: {plus}"))
            .context("Parsing --plus")?,
        None => Vec::new(),
    };

    Ok(QemuCommandLine {
        program: opts.qemu.clone(),
        image: opts.image.as_ref().map(|p| p.to_string()),
        flags,
        extra,
    })
}
