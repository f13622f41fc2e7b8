//! Source NAT for pod subnets.
//!
//! Two interchangeable backends implement [`Masquerade`]: iptables, with one
//! NAT chain per network, and nftables, with one commented rule per instance
//! in a shared chain. [`MasqueradeManager`] picks a backend for installs and
//! tears down on both, since rules may have been installed by either.

pub mod exec;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;
pub mod iptables;
pub mod nftables;

use std::fmt;
use std::str::FromStr;

use ipnet::IpNet;
use thiserror::Error;

use crate::error::{NetworkError, NetworkResult};

pub use iptables::{IptablesCli, IptablesMasq, IptablesOps};
pub use nftables::{NftCli, NftOps, NftablesMasq, Transaction};

/// Firewall backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MasqBackend {
    /// `iptables` / `ip6tables`.
    Iptables,
    /// `nft`.
    Nftables,
}

impl MasqBackend {
    /// Configuration name of the backend.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Iptables => "iptables",
            Self::Nftables => "nftables",
        }
    }
}

impl fmt::Display for MasqBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MasqBackend {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "iptables" => Ok(Self::Iptables),
            "nftables" => Ok(Self::Nftables),
            other => Err(NetworkError::config(format!("unsupported ip backend: {other}"))),
        }
    }
}

/// Address family of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IpFamily {
    /// IPv4.
    V4,
    /// IPv6.
    V6,
}

impl IpFamily {
    /// Family of `net`.
    #[must_use]
    pub const fn of(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => Self::V4,
            IpNet::V6(_) => Self::V6,
        }
    }

    /// Multicast destinations that are never masqueraded.
    #[must_use]
    pub const fn multicast(self) -> &'static str {
        match self {
            Self::V4 => "224.0.0.0/4",
            Self::V6 => "ff00::/8",
        }
    }
}

/// Who a set of masquerade rules belongs to.
///
/// The iptables backend keys on `network` and `id` only; nftables also
/// includes the interface name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MasqIdentity {
    /// Network name.
    pub network: String,
    /// Interface name, may be empty.
    pub if_name: String,
    /// Instance (container) id, may be empty.
    pub id: String,
}

impl MasqIdentity {
    /// Identity for one interface of one instance.
    pub fn new(network: impl Into<String>, if_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            if_name: if_name.into(),
            id: id.into(),
        }
    }

    /// Identity shared by everything on a network, as used for bridge gateways.
    pub fn network(network: impl Into<String>) -> Self {
        Self::new(network, "", "")
    }
}

/// Failure reported by a firewall tool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The rule, chain or table does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Any other failure.
    #[error("{0}")]
    Failed(String),
}

impl BackendError {
    /// Whether the failure means the object is absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// One firewall backend's masquerade lifecycle.
pub trait Masquerade: Send + Sync {
    /// Which backend this is.
    fn backend(&self) -> MasqBackend;

    /// Whether the host can use this backend.
    fn supported(&self) -> bool;

    /// Masquerade traffic from each address in `nets` leaving its subnet.
    ///
    /// Installing again for the same identity replaces the earlier rules.
    ///
    /// # Errors
    ///
    /// [`NetworkError::Firewall`] naming the failed step.
    fn install(&self, nets: &[IpNet], identity: &MasqIdentity) -> NetworkResult<()>;

    /// Remove what [`Masquerade::install`] added for `identity`. Missing rules
    /// are not an error.
    ///
    /// # Errors
    ///
    /// [`NetworkError::Firewall`] naming the failed step.
    fn teardown(&self, nets: &[IpNet], identity: &MasqIdentity) -> NetworkResult<()>;
}

/// Chooses a backend for installs and cleans up on all of them.
pub struct MasqueradeManager {
    iptables: Box<dyn Masquerade>,
    nftables: Box<dyn Masquerade>,
}

impl fmt::Debug for MasqueradeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasqueradeManager").finish_non_exhaustive()
    }
}

impl Default for MasqueradeManager {
    fn default() -> Self {
        Self::system()
    }
}

impl MasqueradeManager {
    /// Manager driving the host's `iptables` and `nft` binaries.
    #[must_use]
    pub fn system() -> Self {
        Self::new(
            IptablesMasq::new(IptablesCli::new()),
            NftablesMasq::new(NftCli::new()),
        )
    }

    /// Manager over explicit backends.
    pub fn new(iptables: impl Masquerade + 'static, nftables: impl Masquerade + 'static) -> Self {
        Self {
            iptables: Box::new(iptables),
            nftables: Box::new(nftables),
        }
    }

    /// The backend to install with.
    ///
    /// Without a request, iptables is preferred unless only nftables is
    /// supported on this host.
    #[must_use]
    pub fn select(&self, requested: Option<MasqBackend>) -> &dyn Masquerade {
        let backend = requested.unwrap_or_else(|| {
            if !self.iptables.supported() && self.nftables.supported() {
                MasqBackend::Nftables
            } else {
                MasqBackend::Iptables
            }
        });
        match backend {
            MasqBackend::Iptables => self.iptables.as_ref(),
            MasqBackend::Nftables => self.nftables.as_ref(),
        }
    }

    /// Install masquerade rules for `nets` on the selected backend.
    ///
    /// # Errors
    ///
    /// The backend's failure.
    pub fn setup_ip_masq_for_networks(
        &self,
        backend: Option<MasqBackend>,
        nets: &[IpNet],
        identity: &MasqIdentity,
    ) -> NetworkResult<()> {
        let masq = self.select(backend);
        tracing::debug!(
            backend = %masq.backend(),
            network = %identity.network,
            nets = nets.len(),
            "Installing masquerade rules"
        );
        masq.install(nets, identity)?;
        tracing::info!(backend = %masq.backend(), network = %identity.network, "Masquerade rules installed");
        Ok(())
    }

    /// Tear down masquerade rules for `identity` on every backend.
    ///
    /// A failure counts only if that backend is supported on this host.
    ///
    /// # Errors
    ///
    /// [`NetworkError::Teardown`] with one message per failed backend.
    pub fn teardown_ip_masq_for_networks(&self, nets: &[IpNet], identity: &MasqIdentity) -> NetworkResult<()> {
        let mut errors = Vec::new();
        for masq in [self.iptables.as_ref(), self.nftables.as_ref()] {
            if let Err(e) = masq.teardown(nets, identity) {
                if masq.supported() {
                    errors.push(e.to_string());
                } else {
                    tracing::debug!(
                        backend = %masq.backend(),
                        error = %e,
                        "Ignoring teardown failure on unsupported backend"
                    );
                }
            }
        }

        if errors.is_empty() {
            tracing::debug!(network = %identity.network, "Masquerade rules removed");
            Ok(())
        } else {
            Err(NetworkError::Teardown { errors })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::{FakeIptables, FakeNft};
    use super::*;

    fn manager(ipt_supported: bool, nft_supported: bool) -> (FakeIptables, FakeNft, MasqueradeManager) {
        let ipt = FakeIptables::new();
        ipt.set_supported(ipt_supported);
        let nft = FakeNft::new();
        nft.set_supported(nft_supported);
        let manager = MasqueradeManager::new(
            IptablesMasq::new(ipt.clone()),
            NftablesMasq::new(nft.clone()),
        );
        (ipt, nft, manager)
    }

    #[test]
    fn backend_names_parse() {
        assert_eq!("iptables".parse::<MasqBackend>().unwrap(), MasqBackend::Iptables);
        assert_eq!("nftables".parse::<MasqBackend>().unwrap(), MasqBackend::Nftables);
        let err = "bpf".parse::<MasqBackend>().unwrap_err();
        assert_eq!(err.to_string(), "Invalid network configuration: unsupported ip backend: bpf");
    }

    #[test]
    fn auto_select_prefers_iptables() {
        let (_, _, m) = manager(true, true);
        assert_eq!(m.select(None).backend(), MasqBackend::Iptables);

        let (_, _, m) = manager(false, true);
        assert_eq!(m.select(None).backend(), MasqBackend::Nftables);

        let (_, _, m) = manager(false, false);
        assert_eq!(m.select(None).backend(), MasqBackend::Iptables);

        let (_, _, m) = manager(true, true);
        assert_eq!(m.select(Some(MasqBackend::Nftables)).backend(), MasqBackend::Nftables);
    }

    #[test]
    fn teardown_swallows_unsupported_backend_failures() {
        let (_ipt, nft, m) = manager(true, false);
        nft.fail_all("nft: command not found");
        let nets: [IpNet; 1] = ["10.244.0.1/24".parse().unwrap()];
        m.teardown_ip_masq_for_networks(&nets, &MasqIdentity::network("pods"))
            .unwrap();
    }

    #[test]
    fn teardown_surfaces_supported_backend_failures() {
        let (ipt, nft, m) = manager(true, true);
        ipt.fail_all("iptables: permission denied");
        nft.fail_all("nft: permission denied");
        let nets: [IpNet; 1] = ["10.244.0.1/24".parse().unwrap()];
        let err = m
            .teardown_ip_masq_for_networks(&nets, &MasqIdentity::network("pods"))
            .unwrap_err();
        let NetworkError::Teardown { errors } = err else {
            panic!("expected teardown error");
        };
        assert_eq!(errors.len(), 2);
    }
}
