//! Data network interfaces: NIC models, backends, and the per-interface
//! option lists.
//!
//! Interfaces are described on the command line by parallel, repeatable
//! flags (`--idx`, `--br-idx`, `--backend-type`, `--frontend-type`,
//! `--netmap`). The lists may have different lengths; [`InterfaceLists::completed`]
//! pads them to a common length so that the entries at the same position
//! describe one interface. Position in the list is the interface identity:
//! it is never reordered.

use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};
use color_eyre::eyre::eyre;
use color_eyre::Result;
use serde::{Deserialize, Serialize};

/// Bridge index used when no `--br-idx` is given.
pub const DEFAULT_BRIDGE_INDEX: u8 = 1;

/// Netmap port used when no `--netmap` is given; selects a VALE switch port.
pub const DEFAULT_NETMAP_PORT: &str = "vale";

/// Virtual NIC model exposed to the guest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, strum::Display,
)]
pub enum NicModel {
    #[value(name = "e1000")]
    #[strum(serialize = "e1000")]
    #[serde(rename = "e1000")]
    E1000,
    #[value(name = "e1000e")]
    #[strum(serialize = "e1000e")]
    #[serde(rename = "e1000e")]
    E1000e,
    #[value(name = "virtio-net-pci")]
    #[strum(serialize = "virtio-net-pci")]
    #[serde(rename = "virtio-net-pci")]
    VirtioNetPci,
    #[value(name = "pcnet")]
    #[strum(serialize = "pcnet")]
    #[serde(rename = "pcnet")]
    Pcnet,
    #[value(name = "ne2k_pci")]
    #[strum(serialize = "ne2k_pci")]
    #[serde(rename = "ne2k_pci")]
    Ne2kPci,
    #[value(name = "rtl8139")]
    #[strum(serialize = "rtl8139")]
    #[serde(rename = "rtl8139")]
    Rtl8139,
    #[value(name = "e1000-paravirt")]
    #[strum(serialize = "e1000-paravirt")]
    #[serde(rename = "e1000-paravirt")]
    E1000Paravirt,
    /// Netmap passthrough NIC; only usable with a netmap backend
    #[value(name = "ptnet-pci")]
    #[strum(serialize = "ptnet-pci")]
    #[serde(rename = "ptnet-pci")]
    PtnetPci,
    #[value(name = "vmxnet3")]
    #[strum(serialize = "vmxnet3")]
    #[serde(rename = "vmxnet3")]
    Vmxnet3,
}

impl NicModel {
    /// Models that take the `ioeventfd=` device property.
    pub fn supports_ioeventfd(self) -> bool {
        matches!(self, Self::VirtioNetPci | Self::E1000Paravirt)
    }

    /// Models that take the `mitigation=` device property.
    pub fn supports_mitigation(self) -> bool {
        matches!(self, Self::E1000 | Self::E1000Paravirt)
    }
}

/// Host-side transport behind a data interface.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
#[clap(rename_all = "kebab-case")]
pub enum Backend {
    /// User-mode NAT
    Nat,
    /// Host TAP device, optionally attached to a bridge
    Tap,
    /// Netmap port (VALE switch port by default)
    Netmap,
    /// Master end of a netmap pipe
    NetmapPipeMaster,
    /// Slave end of a netmap pipe
    NetmapPipeSlave,
    /// Listening socket on 127.0.0.1
    SocketListen,
    /// Socket connecting to 127.0.0.1
    SocketConnect,
    /// vhost-user over a unix socket
    VhostUser,
}

impl Backend {
    pub fn is_netmap(self) -> bool {
        matches!(
            self,
            Self::Netmap | Self::NetmapPipeMaster | Self::NetmapPipeSlave
        )
    }
}

/// Name of the host bridge with the given index, e.g. `br02`.
pub fn bridge_name(br_idx: u8) -> String {
    format!("br{br_idx:02}")
}

/// Repeatable per-interface options, as given on the command line.
#[derive(Parser, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceLists {
    #[clap(
        short = 'n',
        long = "idx",
        help = "Port index to be used with TAP and VALE (repeatable, one per interface)"
    )]
    pub idx: Vec<u8>,

    #[clap(
        long = "br-idx",
        help = "Bridge index to be used with TAP and VALE (repeatable)"
    )]
    pub br_idx: Vec<u8>,

    #[clap(
        short = 'b',
        long = "backend-type",
        value_enum,
        help = "Network backend (repeatable)"
    )]
    pub backend: Vec<Backend>,

    #[clap(
        short = 'f',
        long = "frontend-type",
        value_enum,
        help = "Network frontend NIC model (repeatable)"
    )]
    pub frontend: Vec<NicModel>,

    #[clap(
        long = "netmap",
        value_name = "PORT",
        help = "Name of the netmap port to open, or 'vale' for a VALE switch port (repeatable)"
    )]
    pub netmap: Vec<String>,
}

/// Pad `list` to `n` entries: seed with `seed` when empty, then extend with `next(last)`.
fn pad_with<T: Clone>(
    list: &mut Vec<T>,
    n: usize,
    seed: T,
    mut next: impl FnMut(&T) -> Result<T>,
) -> Result<()> {
    if n == 0 {
        return Ok(());
    }
    if list.is_empty() {
        list.push(seed);
    }
    while list.len() < n {
        // Non-empty: seeded above
        let last = &list[list.len() - 1];
        let value = next(last)?;
        list.push(value);
    }
    Ok(())
}

impl InterfaceLists {
    /// Number of data interfaces described by these lists.
    ///
    /// Netmap port names only qualify interfaces, they never create one.
    pub fn len(&self) -> usize {
        self.idx
            .len()
            .max(self.br_idx.len())
            .max(self.backend.len())
            .max(self.frontend.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pad every list to [`Self::len`] entries.
    ///
    /// Indices continue from the last supplied value (or `mgmt_idx`) by +1;
    /// every other list repeats its last value (or a fixed default).
    pub fn completed(&self, mgmt_idx: u8) -> Result<InterfaceLists> {
        if self.is_empty() {
            return Ok(self.clone());
        }
        let n = self.len();
        let mut r = self.clone();
        pad_with(&mut r.idx, n, mgmt_idx, |last| {
            last.checked_add(1)
                .ok_or_else(|| eyre!("Interface index overflows past 255 after {last}"))
        })?;
        pad_with(&mut r.br_idx, n, DEFAULT_BRIDGE_INDEX, |last| Ok(*last))?;
        pad_with(&mut r.backend, n, Backend::Tap, |last| Ok(*last))?;
        pad_with(&mut r.frontend, n, NicModel::E1000, |last| Ok(*last))?;
        pad_with(&mut r.netmap, n, DEFAULT_NETMAP_PORT.to_owned(), |last| {
            Ok(last.clone())
        })?;
        Ok(r)
    }

    /// Complete the lists and zip them into interface specs.
    ///
    /// vhost-user interfaces take their socket path from `unix_sockets` in
    /// order; once those run out they get `/var/run/vm<VM>-<IDX>.socket`.
    pub fn to_specs(
        &self,
        mgmt_idx: u8,
        unix_sockets: &[Utf8PathBuf],
    ) -> Result<Vec<InterfaceSpec>> {
        let lists = self.completed(mgmt_idx)?;
        let mut sockets = unix_sockets.iter();
        let mut specs = Vec::with_capacity(lists.len());
        for i in 0..lists.len() {
            let backend = lists.backend[i];
            let idx = lists.idx[i];
            let unix_socket = (backend == Backend::VhostUser).then(|| {
                sockets
                    .next()
                    .cloned()
                    .unwrap_or_else(|| format!("/var/run/vm{mgmt_idx}-{idx}.socket").into())
            });
            specs.push(InterfaceSpec {
                idx,
                br_idx: lists.br_idx[i],
                frontend: lists.frontend[i],
                backend,
                netmap_port: lists.netmap[i].clone(),
                unix_socket,
            });
        }
        Ok(specs)
    }
}

/// One fully-resolved data interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceSpec {
    pub idx: u8,
    pub br_idx: u8,
    pub frontend: NicModel,
    pub backend: Backend,
    pub netmap_port: String,
    pub unix_socket: Option<Utf8PathBuf>,
}

impl InterfaceSpec {
    /// QEMU netdev id, shared by the device and backend flags.
    pub fn netdev_id(&self) -> String {
        format!("data{}", self.idx)
    }

    /// Host interface name used by TAP and netmap backends.
    pub fn host_ifname(&self) -> String {
        if self.backend.is_netmap() {
            let port = if self.netmap_port == DEFAULT_NETMAP_PORT {
                format!("vale{}:{}", self.br_idx, self.idx)
            } else {
                self.netmap_port.clone()
            };
            return match self.backend {
                Backend::NetmapPipeMaster => format!("{port}{{1"),
                Backend::NetmapPipeSlave => format!("{port}}}1"),
                _ => port,
            };
        }
        format!("{}{}_{}", self.backend, self.br_idx, self.idx)
    }

    /// Check that the frontend and backend can be combined.
    pub fn validate(&self) -> Result<()> {
        if self.backend == Backend::VhostUser && self.frontend != NicModel::VirtioNetPci {
            return Err(eyre!(
                "vhost-user backend requires virtio-net-pci frontend (interface {} uses {})",
                self.idx,
                self.frontend
            ));
        }
        if self.frontend == NicModel::PtnetPci && !self.backend.is_netmap() {
            return Err(eyre!(
                "ptnet-pci frontend requires a netmap backend (interface {} uses {})",
                self.idx,
                self.backend
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lists(idx: &[u8], br: &[u8], be: &[Backend], fe: &[NicModel]) -> InterfaceLists {
        InterfaceLists {
            idx: idx.to_vec(),
            br_idx: br.to_vec(),
            backend: be.to_vec(),
            frontend: fe.to_vec(),
            netmap: vec![],
        }
    }

    #[test]
    fn test_complete_empty() -> Result<()> {
        let l = InterfaceLists::default().completed(4)?;
        assert_eq!(l, InterfaceLists::default());
        assert!(InterfaceLists::default().to_specs(4, &[])?.is_empty());
        Ok(())
    }

    #[test]
    fn test_complete_defaults() -> Result<()> {
        // One backend given, everything else defaulted
        let l = lists(&[], &[], &[Backend::Nat], &[]).completed(7)?;
        assert_eq!(l.idx, vec![7]);
        assert_eq!(l.br_idx, vec![DEFAULT_BRIDGE_INDEX]);
        assert_eq!(l.backend, vec![Backend::Nat]);
        assert_eq!(l.frontend, vec![NicModel::E1000]);
        assert_eq!(l.netmap, vec![DEFAULT_NETMAP_PORT.to_owned()]);
        Ok(())
    }

    #[test]
    fn test_complete_pads_independently() -> Result<()> {
        let l = lists(
            &[3],
            &[2, 5],
            &[Backend::Tap, Backend::Nat, Backend::SocketListen, Backend::Tap],
            &[NicModel::VirtioNetPci],
        )
        .completed(1)?;
        assert_eq!(l.idx, vec![3, 4, 5, 6]);
        assert_eq!(l.br_idx, vec![2, 5, 5, 5]);
        assert_eq!(
            l.backend,
            vec![Backend::Tap, Backend::Nat, Backend::SocketListen, Backend::Tap]
        );
        assert_eq!(l.frontend, vec![NicModel::VirtioNetPci; 4]);
        assert_eq!(l.netmap.len(), 4);
        Ok(())
    }

    #[test]
    fn test_complete_property() -> Result<()> {
        // Every prefix length combination up to 3 entries per list
        let idx_src = [10u8, 20, 30];
        let br_src = [1u8, 2, 3];
        let be_src = [Backend::Tap, Backend::Nat, Backend::Netmap];
        let fe_src = [NicModel::E1000, NicModel::Rtl8139, NicModel::Vmxnet3];
        for a in 0..=3 {
            for b in 0..=3 {
                for c in 0..=3 {
                    for d in 0..=3 {
                        let input = lists(&idx_src[..a], &br_src[..b], &be_src[..c], &fe_src[..d]);
                        let n = a.max(b).max(c).max(d);
                        let out = input.completed(9)?;
                        assert_eq!(out.idx.len(), n);
                        assert_eq!(out.br_idx.len(), n);
                        assert_eq!(out.backend.len(), n);
                        assert_eq!(out.frontend.len(), n);
                        assert_eq!(out.netmap.len(), n);
                        // Supplied prefixes are kept verbatim
                        assert_eq!(&out.idx[..a], &idx_src[..a]);
                        assert_eq!(&out.br_idx[..b], &br_src[..b]);
                        for i in a.max(1)..n {
                            assert_eq!(out.idx[i], out.idx[i - 1] + 1);
                        }
                        for i in b.max(1)..n {
                            assert_eq!(out.br_idx[i], out.br_idx[i - 1]);
                        }
                        for i in c.max(1)..n {
                            assert_eq!(out.backend[i], out.backend[i - 1]);
                        }
                        for i in d.max(1)..n {
                            assert_eq!(out.frontend[i], out.frontend[i - 1]);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_complete_index_overflow() {
        let r = lists(&[255], &[], &[Backend::Tap, Backend::Tap], &[]).completed(1);
        assert!(r.is_err());
        assert!(r.unwrap_err().to_string().contains("overflows"));
    }

    #[test]
    fn test_vhost_user_sockets() -> Result<()> {
        let l = lists(
            &[1],
            &[],
            &[Backend::VhostUser, Backend::Tap, Backend::VhostUser, Backend::VhostUser],
            &[NicModel::VirtioNetPci],
        );
        let specs = l.to_specs(2, &["/tmp/a.sock".into(), "/tmp/b.sock".into()])?;
        let sock = |i: usize| specs[i].unix_socket.as_ref().map(|p| p.as_str());
        assert_eq!(sock(0), Some("/tmp/a.sock"));
        assert_eq!(sock(1), None);
        assert_eq!(sock(2), Some("/tmp/b.sock"));
        assert_eq!(sock(3), Some("/var/run/vm2-4.socket"));
        Ok(())
    }

    #[test]
    fn test_host_ifname() -> Result<()> {
        let mut l = lists(
            &[3],
            &[2],
            &[
                Backend::Tap,
                Backend::Netmap,
                Backend::NetmapPipeMaster,
                Backend::NetmapPipeSlave,
                Backend::Netmap,
            ],
            &[],
        );
        l.netmap = vec![
            "vale".into(),
            "vale".into(),
            "vale".into(),
            "vale".into(),
            "eth1".into(),
        ];
        let names: Vec<_> = l.to_specs(1, &[])?.iter().map(|s| s.host_ifname()).collect();
        assert_eq!(
            names,
            vec!["tap2_3", "vale2:4", "vale2:5{1", "vale2:6}1", "eth1"]
        );
        Ok(())
    }

    #[test]
    fn test_validate_combinations() {
        let spec = |backend, frontend| InterfaceSpec {
            idx: 1,
            br_idx: 1,
            frontend,
            backend,
            netmap_port: DEFAULT_NETMAP_PORT.into(),
            unix_socket: None,
        };
        assert!(spec(Backend::VhostUser, NicModel::VirtioNetPci).validate().is_ok());
        let err = spec(Backend::VhostUser, NicModel::E1000).validate().unwrap_err();
        assert!(err.to_string().contains("requires virtio-net-pci"));
        assert!(spec(Backend::Netmap, NicModel::PtnetPci).validate().is_ok());
        assert!(spec(Backend::Tap, NicModel::PtnetPci).validate().is_err());
        assert!(spec(Backend::Tap, NicModel::Pcnet).validate().is_ok());
    }

    #[test]
    fn test_names() {
        assert_eq!(NicModel::Ne2kPci.to_string(), "ne2k_pci");
        assert_eq!(NicModel::VirtioNetPci.to_string(), "virtio-net-pci");
        assert_eq!(Backend::NetmapPipeMaster.to_string(), "netmap-pipe-master");
        assert_eq!(
            NicModel::from_str("e1000-paravirt", false),
            Ok(NicModel::E1000Paravirt)
        );
        assert_eq!(Backend::from_str("vhost-user", false), Ok(Backend::VhostUser));
        assert!(Backend::from_str("vde", false).is_err());
        assert_eq!(bridge_name(2), "br02");
        assert_eq!(bridge_name(12), "br12");
    }
}
