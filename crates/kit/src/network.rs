//! Host network provisioning for TAP backends.
//!
//! Every TAP interface gets a host tap device, optionally attached to a
//! bridge `brNN`. Setup and teardown are planned up front as lists of
//! [`HostCommand`]s so the teardown is, by construction, the mirror of the
//! setup: same device name, same bridge, inverse operations, reverse order.

use std::fmt;
use std::process::Command;

use color_eyre::eyre::Context;
use color_eyre::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::command_run::{CommandFailed, CommandRun};
use crate::interfaces::{bridge_name, Backend, InterfaceSpec};

/// An external host command, e.g. `ip link set tap1_2 up`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl HostCommand {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_owned(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for a in &self.args {
            write!(f, " {a}")?;
        }
        Ok(())
    }
}

/// Runs host commands; the seam between planning and the real system.
pub trait HostExecutor {
    fn exec(&mut self, cmd: &HostCommand) -> Result<()>;
}

/// Runs commands on this host, through `sudo` unless told otherwise.
#[derive(Debug, Clone, Copy)]
pub struct SystemExecutor {
    pub sudo: bool,
}

impl HostExecutor for SystemExecutor {
    fn exec(&mut self, cmd: &HostCommand) -> Result<()> {
        let mut c = if self.sudo {
            let mut c = Command::new("sudo");
            c.arg(&cmd.program);
            c
        } else {
            Command::new(&cmd.program)
        };
        c.args(&cmd.args);
        debug!("{}{cmd}", if self.sudo { "sudo " } else { "" });
        c.run().with_context(|| format!("Running '{cmd}'"))
    }
}

/// One host tap device backing a data interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TapDevice {
    pub ifname: String,
    /// Bridge to attach to; `None` with `--no-bridging`
    pub bridge: Option<String>,
    pub multi_queue: bool,
}

impl TapDevice {
    fn tuntap(&self, op: &str) -> HostCommand {
        let mut args = vec!["tuntap", op, "mode", "tap", "name", self.ifname.as_str()];
        if self.multi_queue {
            args.push("multi_queue");
        }
        HostCommand::new("ip", args)
    }

    /// Create-if-absent and bring up the bridge. The first command's
    /// "already exists" failure counts as success.
    pub fn bridge_commands(&self) -> Vec<HostCommand> {
        let Some(br) = self.bridge.as_deref() else {
            return Vec::new();
        };
        vec![
            HostCommand::new("brctl", ["addbr", br]),
            HostCommand::new("ip", ["link", "set", br, "up"]),
        ]
    }

    /// Create the tap device, bring it up, attach it to its bridge.
    pub fn create_commands(&self) -> Vec<HostCommand> {
        let mut cmds = vec![
            self.tuntap("add"),
            HostCommand::new("ip", ["link", "set", self.ifname.as_str(), "up"]),
        ];
        if let Some(br) = self.bridge.as_deref() {
            cmds.push(HostCommand::new("brctl", ["addif", br, self.ifname.as_str()]));
        }
        cmds
    }

    /// Exact mirror of [`Self::create_commands`]. Bridges are shared and left alone.
    pub fn teardown_commands(&self) -> Vec<HostCommand> {
        let mut cmds = Vec::new();
        if let Some(br) = self.bridge.as_deref() {
            cmds.push(HostCommand::new("brctl", ["delif", br, self.ifname.as_str()]));
        }
        cmds.push(HostCommand::new("ip", ["link", "set", self.ifname.as_str(), "down"]));
        cmds.push(self.tuntap("del"));
        cmds
    }

    fn ensure_bridge(&self, exec: &mut impl HostExecutor) -> Result<()> {
        let mut cmds = self.bridge_commands().into_iter();
        let Some(addbr) = cmds.next() else {
            return Ok(());
        };
        if let Err(e) = exec.exec(&addbr) {
            match e.downcast_ref::<CommandFailed>() {
                Some(f) if f.already_exists() => {
                    debug!("Bridge {} already exists", addbr.args[1]);
                }
                _ => return Err(e),
            }
        }
        for cmd in cmds {
            exec.exec(&cmd)?;
        }
        Ok(())
    }

    fn teardown(&self, exec: &mut impl HostExecutor) {
        for cmd in self.teardown_commands() {
            if let Err(e) = exec.exec(&cmd) {
                warn!("Teardown of {} failed: {e:#}", self.ifname);
            }
        }
    }
}

/// Host network changes needed by a set of interfaces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetworkPlan {
    pub taps: Vec<TapDevice>,
}

impl NetworkPlan {
    pub fn new(ifaces: &[InterfaceSpec], bridging: bool, num_queues: u32) -> Self {
        let taps = ifaces
            .iter()
            .filter(|i| i.backend == Backend::Tap)
            .map(|i| TapDevice {
                ifname: i.host_ifname(),
                bridge: bridging.then(|| bridge_name(i.br_idx)),
                multi_queue: num_queues > 1,
            })
            .collect();
        Self { taps }
    }

    pub fn is_empty(&self) -> bool {
        self.taps.is_empty()
    }

    /// Everything [`Self::provision`] runs, in order.
    pub fn setup_commands(&self) -> Vec<HostCommand> {
        self.taps
            .iter()
            .flat_map(|t| t.bridge_commands().into_iter().chain(t.create_commands()))
            .collect()
    }

    /// Everything [`ProvisionedNetwork::teardown`] runs, in order.
    pub fn teardown_commands(&self) -> Vec<HostCommand> {
        self.taps
            .iter()
            .rev()
            .flat_map(TapDevice::teardown_commands)
            .collect()
    }

    /// Create bridges and tap devices.
    ///
    /// On failure, devices created so far are torn down before the error is
    /// returned.
    pub fn provision(&self, exec: &mut impl HostExecutor) -> Result<ProvisionedNetwork> {
        let mut done = ProvisionedNetwork::default();
        if self.is_empty() {
            debug!("No TAP devices to create");
        }
        for tap in &self.taps {
            if let Err(e) = Self::provision_one(tap, exec, &mut done) {
                done.teardown(exec);
                return Err(e);
            }
        }
        Ok(done)
    }

    fn provision_one(
        tap: &TapDevice,
        exec: &mut impl HostExecutor,
        done: &mut ProvisionedNetwork,
    ) -> Result<()> {
        tap.ensure_bridge(exec)?;
        let mut cmds = tap.create_commands().into_iter();
        if let Some(create) = cmds.next() {
            exec.exec(&create)
                .with_context(|| format!("Failed to create the TAP device '{}'", tap.ifname))?;
        }
        done.taps.push(tap.clone());
        for cmd in cmds {
            exec.exec(&cmd)?;
        }
        match &tap.bridge {
            Some(br) => info!("Created TAP device {} on bridge {br}", tap.ifname),
            None => info!("Created TAP device {}", tap.ifname),
        }
        Ok(())
    }
}

/// Tap devices that exist on the host and must be torn down.
#[derive(Debug, Default)]
#[must_use = "provisioned devices must be torn down"]
pub struct ProvisionedNetwork {
    taps: Vec<TapDevice>,
}

impl ProvisionedNetwork {
    /// Remove the devices in reverse creation order. Best effort: failures
    /// are logged and the remaining commands still run.
    pub fn teardown(self, exec: &mut impl HostExecutor) {
        for tap in self.taps.iter().rev() {
            tap.teardown(exec);
            debug!("Removed TAP device {}", tap.ifname);
        }
    }
}
