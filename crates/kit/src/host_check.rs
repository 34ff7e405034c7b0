//! Host virtualization support detection.
//!
//! Checks the loaded KVM modules under `/sys/module` before a VM is
//! launched with `-enable-kvm` or `-cpu host` for nested virtualization.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::eyre;
use color_eyre::Result;
use tracing::debug;

const KVM_MODULES: [&str; 2] = ["kvm_intel", "kvm_amd"];

/// View of `/sys/module` (or a test replacement).
#[derive(Debug, Clone)]
pub struct HostModules {
    root: Utf8PathBuf,
}

impl Default for HostModules {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl HostModules {
    pub fn new(sysfs_root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: sysfs_root.into(),
        }
    }

    fn module_dir(&self, module: &str) -> Utf8PathBuf {
        self.root.join("module").join(module)
    }

    /// Fails unless a vendor KVM module is loaded.
    pub fn check_kvm(&self) -> Result<()> {
        let loaded = KVM_MODULES
            .iter()
            .find(|m| self.module_dir(m).is_dir());
        match loaded {
            Some(m) => {
                debug!("KVM available via {m}");
                Ok(())
            }
            None => Err(eyre!("KVM is not present")),
        }
    }

    /// Fails unless nested virtualization is enabled in a vendor KVM module.
    pub fn check_nested_kvm(&self) -> Result<()> {
        let enabled = KVM_MODULES.iter().any(|m| {
            let path = self.module_dir(m).join("parameters/nested");
            nested_enabled(&path)
        });
        if enabled {
            Ok(())
        } else {
            Err(eyre!("Nested KVM is not enabled"))
        }
    }
}

/// kvm_intel reports `Y`/`N`, kvm_amd `1`/`0`.
fn nested_enabled(path: &Utf8Path) -> bool {
    std::fs::read_to_string(path)
        .map(|v| matches!(v.trim().to_uppercase().as_str(), "Y" | "1"))
        .unwrap_or(false)
}
