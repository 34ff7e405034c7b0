//! Host PCI passthrough: driver introspection and rebinding through sysfs.
//!
//! A device handed to the guest is unbound from its current kernel driver
//! and bound to a passthrough-capable one (`vfio-pci` or `pci-stub`). The
//! original driver is recorded in a [`PassthroughBinding`] so the device can
//! be handed back after the hypervisor exits.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::process::Command;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use clap::ValueEnum;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::command_run::CommandRun;

/// PCI domain prefix; only domain 0 devices are addressable.
const PCI_DOMAIN: &str = "0000";

/// A host PCI address in `bus:device.function` form, e.g. `03:00.1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PciAddress(String);

impl PciAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The address with the domain prefix, as sysfs names it.
    pub fn sysfs_name(&self) -> String {
        format!("{PCI_DOMAIN}:{}", self.0)
    }
}

impl FromStr for PciAddress {
    type Err = color_eyre::Report;

    /// Accepts exactly `XX:YY.Z` with hexadecimal digits.
    fn from_str(s: &str) -> Result<Self> {
        let b = s.as_bytes();
        let hex = |i: usize| b[i].is_ascii_hexdigit();
        let valid = b.len() == 7
            && hex(0)
            && hex(1)
            && b[2] == b':'
            && hex(3)
            && hex(4)
            && b[5] == b'.'
            && hex(6);
        if !valid {
            return Err(eyre!(
                "Invalid PCI device identifier '{}'. Expected format: xx:yy.z (hexadecimal)",
                s
            ));
        }
        Ok(Self(s.to_owned()))
    }
}

impl TryFrom<String> for PciAddress {
    type Error = color_eyre::Report;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<PciAddress> for String {
    fn from(a: PciAddress) -> Self {
        a.0
    }
}

impl std::fmt::Display for PciAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kernel driver used to hand a device to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
#[clap(rename_all = "kebab-case")]
pub enum PassthroughDriver {
    /// Legacy KVM device assignment
    PciStub,
    /// VFIO (default)
    VfioPci,
}

impl PassthroughDriver {
    /// Name of the driver under `/sys/bus/pci/drivers`.
    pub fn sysfs_name(self) -> &'static str {
        match self {
            Self::PciStub => "pci-stub",
            Self::VfioPci => "vfio-pci",
        }
    }

    /// QEMU device model that consumes a device bound to this driver.
    pub fn qemu_device(self) -> &'static str {
        match self {
            Self::PciStub => "pci-assign",
            Self::VfioPci => "vfio-pci",
        }
    }

    /// Kernel modules to load before binding.
    pub fn modules(self) -> &'static [&'static str] {
        match self {
            Self::PciStub => &["pci_stub"],
            Self::VfioPci => &["vfio", "vfio_pci", "vfio_virqfd"],
        }
    }
}

/// Vendor and device IDs, hexadecimal without prefix (e.g. `8086`, `10d3`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PciIds {
    pub vendor: String,
    pub device: String,
}

/// Find `addr` in `lspci -n` output.
///
/// Lines look like `03:00.0 0200: 8086:10d3 (rev 01)`.
pub fn find_pci_ids(lspci_output: &str, addr: &PciAddress) -> Option<PciIds> {
    lspci_output.lines().find_map(|line| {
        let mut columns = line.split_whitespace();
        let slot = columns.next()?;
        // Tolerate `lspci -D` output which carries the domain
        let slot = slot.strip_prefix("0000:").unwrap_or(slot);
        if !slot.eq_ignore_ascii_case(addr.as_str()) {
            return None;
        }
        let _class = columns.next()?;
        let (vendor, device) = columns.next()?.split_once(':')?;
        Some(PciIds {
            vendor: vendor.to_owned(),
            device: device.to_owned(),
        })
    })
}

/// Access to the PCI bus under a sysfs root (normally `/sys`).
#[derive(Debug, Clone)]
pub struct PciSysfs {
    root: Utf8PathBuf,
}

impl Default for PciSysfs {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl PciSysfs {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn device_dir(&self, addr: &PciAddress) -> Utf8PathBuf {
        self.root.join("bus/pci/devices").join(addr.sysfs_name())
    }

    fn driver_dir(&self, driver: &str) -> Utf8PathBuf {
        self.root.join("bus/pci/drivers").join(driver)
    }

    /// Name of the driver currently bound to `addr`, if any.
    pub fn current_driver(&self, addr: &PciAddress) -> Option<String> {
        let link = self.device_dir(addr).join("driver");
        let target = std::fs::read_link(&link).ok()?;
        let target = Utf8PathBuf::try_from(target).ok()?;
        target.file_name().map(ToOwned::to_owned)
    }

    fn write(&self, path: &Utf8Path, value: &str) -> Result<()> {
        debug!("echo \"{value}\" > {path}");
        let mut f = OpenOptions::new()
            .write(true)
            .open(path)
            .with_context(|| format!("Opening {path}"))?;
        f.write_all(value.as_bytes())
            .with_context(|| format!("Writing '{value}' to {path}"))?;
        Ok(())
    }

    /// Detach `addr` from whatever driver it is bound to.
    ///
    /// Returns false when the device was not bound to any driver.
    pub fn unbind(&self, addr: &PciAddress) -> bool {
        let path = self.device_dir(addr).join("driver/unbind");
        match self.write(&path, &addr.sysfs_name()) {
            Ok(()) => true,
            Err(e) => {
                info!("Device {addr} not bound to any driver");
                debug!("unbind: {e:#}");
                false
            }
        }
    }

    /// Bind `addr` to `driver`: register the vendor/device ID pair with the
    /// driver, falling back to an explicit bind of the address.
    pub fn bind(&self, addr: &PciAddress, ids: &PciIds, driver: &str) -> Result<()> {
        let dir = self.driver_dir(driver);
        let new_id = self.write(
            &dir.join("new_id"),
            &format!("{} {}", ids.vendor, ids.device),
        );
        let Err(new_id_err) = new_id else {
            return Ok(());
        };
        // The driver may already know these IDs (EEXIST); bind the slot directly
        debug!("new_id: {new_id_err:#}");
        self.write(&dir.join("bind"), &addr.sysfs_name())
            .map_err(|bind_err| {
                eyre!(
                    "Failed to bind vendor/devid {}:{} to driver {}: {:#}; {:#}",
                    ids.vendor,
                    ids.device,
                    driver,
                    new_id_err,
                    bind_err
                )
            })
    }
}

/// A device moved to a passthrough driver, with what is needed to move it back.
#[derive(Debug, Clone, Serialize)]
pub struct PassthroughBinding {
    pub address: PciAddress,
    pub ids: PciIds,
    pub original_driver: Option<String>,
    pub driver: PassthroughDriver,
}

/// Host-side services needed to move a device to a passthrough driver.
pub trait PciHost {
    fn sysfs(&self) -> &PciSysfs;

    /// Vendor and device IDs of `addr`.
    fn pci_ids(&self, addr: &PciAddress) -> Result<PciIds>;

    /// Load the kernel modules `driver` needs. Failures are only logged.
    fn load_modules(&self, driver: PassthroughDriver);
}

/// The real host: `/sys`, `lspci -n` and `modprobe`.
#[derive(Debug, Clone, Default)]
pub struct SystemPci {
    pub sysfs: PciSysfs,
    pub sudo: bool,
}

impl PciHost for SystemPci {
    fn sysfs(&self) -> &PciSysfs {
        &self.sysfs
    }

    fn pci_ids(&self, addr: &PciAddress) -> Result<PciIds> {
        let out = Command::new("lspci")
            .arg("-n")
            .run_get_string()
            .context("Failed to execute 'lspci' command")?;
        find_pci_ids(&out, addr)
            .ok_or_else(|| eyre!("Cannot find PCI device {addr} on the PCI subsystem"))
    }

    fn load_modules(&self, driver: PassthroughDriver) {
        for module in driver.modules() {
            let mut cmd = if self.sudo {
                let mut c = Command::new("sudo");
                c.arg("modprobe");
                c
            } else {
                Command::new("modprobe")
            };
            if let Err(e) = cmd.arg(module).run() {
                warn!("Failed to load kernel module {module}: {e:#}");
            }
        }
    }
}

/// Move `addr` from its current driver to `driver`, recording the original.
///
/// When binding to `driver` fails the device is handed back to its original
/// driver before the error is returned.
pub fn attach(
    host: &impl PciHost,
    addr: &PciAddress,
    driver: PassthroughDriver,
) -> Result<PassthroughBinding> {
    let sysfs = host.sysfs();
    let original_driver = sysfs.current_driver(addr);
    let ids = host.pci_ids(addr)?;
    host.load_modules(driver);
    if let Err(e) = rebind(sysfs, addr, &ids, driver.sysfs_name()) {
        if let Some(original) = original_driver.as_deref() {
            match rebind(sysfs, addr, &ids, original) {
                Ok(()) => info!("PCI device {addr} returned to {original}"),
                Err(re) => error!("Failed to return PCI device {addr} to {original}: {re:#}"),
            }
        }
        return Err(e);
    }
    Ok(PassthroughBinding {
        address: addr.clone(),
        ids,
        original_driver,
        driver,
    })
}

/// Unbind `addr` and bind it to `driver`.
pub fn rebind(sysfs: &PciSysfs, addr: &PciAddress, ids: &PciIds, driver: &str) -> Result<()> {
    sysfs.unbind(addr);
    sysfs.bind(addr, ids, driver)?;
    info!(
        "PCI device {addr} (vendor {} devid {}) bound to {driver}",
        ids.vendor, ids.device
    );
    Ok(())
}

impl PassthroughBinding {
    /// Hand the device back to the driver it had before [`attach`].
    pub fn restore(&self, sysfs: &PciSysfs) -> Result<()> {
        let Some(original) = self.original_driver.as_deref() else {
            info!(
                "PCI device {} had no driver before passthrough; leaving it on {}",
                self.address,
                self.driver.sysfs_name()
            );
            return Ok(());
        };
        rebind(sysfs, &self.address, &self.ids, original)
            .with_context(|| format!("Restoring PCI device {} to {original}", self.address))
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_parse_pci_address_valid() {
        for s in ["00:1f.3", "03:00.0", "AB:cd.F", "ff:FF.7"] {
            let a: PciAddress = s.parse().unwrap();
            assert_eq!(a.as_str(), s);
        }
        let a: PciAddress = "03:00.1".parse().unwrap();
        assert_eq!(a.sysfs_name(), "0000:03:00.1");
    }

    #[test]
    fn test_parse_pci_address_invalid() {
        for s in [
            "",
            "3:00.0",
            "03:00.00",
            "0000:03:00.0",
            "03-00.0",
            "03:00:0",
            "g3:00.0",
            "03:00.0 ",
            "03:0x.0",
        ] {
            let r = s.parse::<PciAddress>();
            assert!(r.is_err(), "{s:?} should be rejected");
        }
        assert!("zz:00.0"
            .parse::<PciAddress>()
            .unwrap_err()
            .to_string()
            .contains("Invalid PCI device identifier"));
    }

    const LSPCI: &str = indoc! {"
        00:00.0 0600: 8086:1237 (rev 02)
        00:1f.2 0106: 8086:2922 (rev 02)
        03:00.0 0200: 8086:10d3
        03:00.1 0200: 15b3:1015 (rev 01)
    "};

    #[test]
    fn test_find_pci_ids() {
        let ids = find_pci_ids(LSPCI, &"03:00.0".parse().unwrap()).unwrap();
        assert_eq!(ids.vendor, "8086");
        assert_eq!(ids.device, "10d3");
        let ids = find_pci_ids(LSPCI, &"03:00.1".parse().unwrap()).unwrap();
        assert_eq!(
            ids,
            PciIds {
                vendor: "15b3".into(),
                device: "1015".into()
            }
        );
        assert!(find_pci_ids(LSPCI, &"04:00.0".parse().unwrap()).is_none());
        let with_domain = "0000:00:1f.2 0106: 8086:2922 (rev 02)\n";
        assert!(find_pci_ids(with_domain, &"00:1F.2".parse().unwrap()).is_some());
    }

    #[test]
    fn test_driver_names() {
        assert_eq!(PassthroughDriver::VfioPci.sysfs_name(), "vfio-pci");
        assert_eq!(PassthroughDriver::VfioPci.qemu_device(), "vfio-pci");
        assert_eq!(PassthroughDriver::PciStub.qemu_device(), "pci-assign");
        assert_eq!(PassthroughDriver::PciStub.modules(), &["pci_stub"]);
    }

    #[test]
    fn test_sysfs_rebind() -> Result<()> {
        let td = tempfile::tempdir()?;
        let td = Utf8Path::from_path(td.path()).unwrap();
        let addr: PciAddress = "03:00.0".parse()?;
        let sysfs = fake_sysfs(td, &addr, &["e1000e", "vfio-pci"])?;
        assert_eq!(sysfs.current_driver(&addr).as_deref(), Some("e1000e"));

        let ids = PciIds {
            vendor: "8086".into(),
            device: "10d3".into(),
        };
        rebind(&sysfs, &addr, &ids, "vfio-pci")?;
        let drivers = td.join("bus/pci/drivers");
        assert_eq!(
            std::fs::read_to_string(drivers.join("e1000e/unbind"))?,
            "0000:03:00.0"
        );
        assert_eq!(
            std::fs::read_to_string(drivers.join("vfio-pci/new_id"))?,
            "8086 10d3"
        );

        let binding = PassthroughBinding {
            address: addr.clone(),
            ids,
            original_driver: sysfs.current_driver(&addr),
            driver: PassthroughDriver::VfioPci,
        };
        binding.restore(&sysfs)?;
        assert_eq!(
            std::fs::read_to_string(drivers.join("e1000e/new_id"))?,
            "8086 10d3"
        );
        Ok(())
    }

    #[test]
    fn test_sysfs_unbound_device() -> Result<()> {
        let td = tempfile::tempdir()?;
        let td = Utf8Path::from_path(td.path()).unwrap();
        let addr: PciAddress = "05:00.0".parse()?;
        let sysfs = PciSysfs::new(td);
        assert_eq!(sysfs.current_driver(&addr), None);
        assert!(!sysfs.unbind(&addr));

        // No driver directory at all: binding must fail loudly
        let ids = PciIds {
            vendor: "1af4".into(),
            device: "1000".into(),
        };
        let err = rebind(&sysfs, &addr, &ids, "vfio-pci").unwrap_err();
        assert!(err.to_string().contains("Failed to bind vendor/devid 1af4:1000"));

        let binding = PassthroughBinding {
            address: addr,
            ids,
            original_driver: None,
            driver: PassthroughDriver::VfioPci,
        };
        binding.restore(&sysfs)?;
        Ok(())
    }

    #[test]
    fn test_bind_falls_back_to_slot() -> Result<()> {
        let td = tempfile::tempdir()?;
        let td = Utf8Path::from_path(td.path()).unwrap();
        let addr: PciAddress = "03:00.0".parse()?;
        let dir = td.join("bus/pci/drivers/pci-stub");
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("bind"), "")?;
        let sysfs = PciSysfs::new(td);
        let ids = PciIds {
            vendor: "8086".into(),
            device: "10d3".into(),
        };
        sysfs.bind(&addr, &ids, "pci-stub")?;
        assert_eq!(std::fs::read_to_string(dir.join("bind"))?, "0000:03:00.0");
        Ok(())
    }

    #[test]
    fn test_attach() -> Result<()> {
        let td = tempfile::tempdir()?;
        let td = Utf8Path::from_path(td.path()).unwrap();
        let addr: PciAddress = "03:00.1".parse()?;
        let host = FakePci {
            sysfs: fake_sysfs(td, &addr, &["mlx5_core", "vfio-pci"])?,
            lspci: LSPCI,
        };
        let binding = attach(&host, &addr, PassthroughDriver::VfioPci)?;
        assert_eq!(binding.original_driver.as_deref(), Some("mlx5_core"));
        assert_eq!(binding.ids.vendor, "15b3");
        assert_eq!(read_driver_file(td, "mlx5_core", "unbind"), "0000:03:00.1");
        assert_eq!(read_driver_file(td, "vfio-pci", "new_id"), "15b3 1015");

        let missing: PciAddress = "04:00.0".parse()?;
        let err = attach(&host, &missing, PassthroughDriver::VfioPci).unwrap_err();
        assert!(err.to_string().contains("Cannot find PCI device 04:00.0"));
        Ok(())
    }

    #[test]
    fn test_failed_attach_returns_device() -> Result<()> {
        let td = tempfile::tempdir()?;
        let td = Utf8Path::from_path(td.path()).unwrap();
        let addr: PciAddress = "03:00.0".parse()?;
        // No vfio-pci driver directory: the bind cannot succeed
        let host = FakePci {
            sysfs: fake_sysfs(td, &addr, &["e1000e"])?,
            lspci: LSPCI,
        };
        let err = attach(&host, &addr, PassthroughDriver::VfioPci).unwrap_err();
        assert!(err.to_string().contains("Failed to bind vendor/devid 8086:10d3"));
        assert_eq!(read_driver_file(td, "e1000e", "unbind"), "0000:03:00.0");
        assert_eq!(read_driver_file(td, "e1000e", "new_id"), "8086 10d3");
        Ok(())
    }
}
