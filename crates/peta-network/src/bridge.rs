//! Bridge reconciliation.
//!
//! [`BridgeReconciler::setup`] converges the host towards a [`BridgeConfig`]
//! and is safe to call repeatedly with the same input: an existing bridge is
//! modified in place and gateway addresses are only added when missing.
//! Steps run strictly in order and the first failure aborts the call.

use ipnet::IpNet;

use crate::config::{BridgeConfig, BridgePlan};
use crate::error::{NetworkError, NetworkResult};
use crate::forward::{enable_ip4_forward, enable_ip6_forward};
use crate::ipam::indexed_ip;
use crate::link::del_link_by_name_addr;
use crate::masq::{MasqIdentity, MasqueradeManager};
use crate::netlink::{BridgeSpec, Link, LinkKind, LinkSpec, Netlink, SafeHandle};
use crate::sysctl::Sysctl;

/// A link confirmed to be a Linux bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bridge {
    link: Link,
    vlan_filtering: Option<bool>,
}

impl Bridge {
    /// The underlying link.
    #[must_use]
    pub const fn link(&self) -> &Link {
        &self.link
    }

    /// Device name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.link.name
    }

    /// Interface index.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.link.index
    }

    /// MTU reported by the kernel.
    #[must_use]
    pub const fn mtu(&self) -> u32 {
        self.link.mtu
    }

    /// 802.1Q filtering state, when the kernel reported it.
    #[must_use]
    pub const fn vlan_filtering(&self) -> Option<bool> {
        self.vlan_filtering
    }
}

impl TryFrom<Link> for Bridge {
    type Error = NetworkError;

    fn try_from(link: Link) -> Result<Self, Self::Error> {
        match link.kind {
            LinkKind::Bridge { vlan_filtering } => Ok(Self {
                link,
                vlan_filtering,
            }),
            ref other => Err(NetworkError::NotABridge {
                kind: other.to_string(),
                name: link.name,
            }),
        }
    }
}

/// Gateway for `subnet`: its first host address with the subnet's prefix.
///
/// # Errors
///
/// [`NetworkError::Ipam`] if the subnet has no room for a gateway.
pub fn calc_gateway(subnet: &IpNet) -> NetworkResult<IpNet> {
    let gw = indexed_ip(&subnet.trunc(), 1)?;
    IpNet::new(gw, subnet.prefix_len())
        .map_err(|e| NetworkError::config(format!("error getting gateway for subnet {subnet}: {e}")))
}

/// Applies bridge configurations to the host.
#[derive(Debug)]
pub struct BridgeReconciler<N> {
    handle: SafeHandle<N>,
    sysctl: Sysctl,
    masq: MasqueradeManager,
}

impl<N: Netlink> BridgeReconciler<N> {
    /// Reconciler over a netlink handle, sysctl root and masquerade manager.
    pub const fn new(handle: SafeHandle<N>, sysctl: Sysctl, masq: MasqueradeManager) -> Self {
        Self {
            handle,
            sysctl,
            masq,
        }
    }

    /// The netlink handle.
    pub const fn handle(&self) -> &SafeHandle<N> {
        &self.handle
    }

    /// The sysctl accessor.
    pub const fn sysctl(&self) -> &Sysctl {
        &self.sysctl
    }

    /// The masquerade manager.
    pub const fn masquerade(&self) -> &MasqueradeManager {
        &self.masq
    }

    /// Ensure the bridge described by `conf` exists and is configured.
    ///
    /// # Errors
    ///
    /// [`NetworkError::Config`] before any change for invalid input; otherwise
    /// the failing step's error.
    pub async fn setup(&self, conf: &BridgeConfig) -> NetworkResult<Bridge> {
        let plan = conf.validate()?;

        if plan.layer3 {
            enable_ip4_forward(&self.sysctl)?;
            enable_ip6_forward(&self.sysctl)?;
        }

        let bridge = self.ensure_bridge(&plan).await?;

        if plan.layer3 {
            let gateways = self.ensure_gateways(&bridge, &plan).await?;
            if plan.masquerade {
                self.masq.setup_ip_masq_for_networks(
                    plan.masq_backend,
                    &gateways,
                    &MasqIdentity::network(&plan.network),
                )?;
            }
        }

        tracing::info!(name = %bridge.name(), index = bridge.index(), "Bridge ready");
        Ok(bridge)
    }

    /// Delete the bridge and, for a masquerading layer 3 network, its rules
    /// on every backend. A missing bridge is not an error.
    ///
    /// # Errors
    ///
    /// The link deletion failure, or [`NetworkError::Teardown`].
    pub async fn remove(&self, conf: &BridgeConfig) -> NetworkResult<()> {
        let name = conf.bridge_name();
        let addrs = match del_link_by_name_addr(&self.handle, name).await {
            Ok(addrs) => addrs,
            Err(e) if e.is_link_not_found() => {
                tracing::debug!(name, "Bridge already absent");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        if conf.is_layer3() && conf.ip_masq {
            self.masq
                .teardown_ip_masq_for_networks(&addrs, &MasqIdentity::network(&conf.net.name))?;
        }

        tracing::info!(name, "Bridge removed");
        Ok(())
    }

    async fn ensure_bridge(&self, plan: &BridgePlan) -> NetworkResult<Bridge> {
        let name = plan.bridge.as_str();
        let spec = LinkSpec::Bridge(BridgeSpec {
            name: name.to_string(),
            mtu: plan.mtu,
            vlan_filtering: plan.vlan_filtering.then_some(true),
        });

        tracing::debug!(name, mtu = plan.mtu, vlan_filtering = plan.vlan_filtering, "Ensuring bridge");
        match self.handle.link_add(&spec).await {
            Ok(()) => tracing::debug!(name, "Created bridge"),
            Err(e) if e.is_exists() => {
                self.handle
                    .link_modify(&spec)
                    .await
                    .map_err(|e| NetworkError::netlink("modify bridge", name, e))?;
                tracing::debug!(name, "Updated existing bridge");
            }
            Err(e) => return Err(NetworkError::netlink("create bridge", name, e)),
        }

        if plan.promisc {
            let link = self.lookup(name).await?;
            self.handle
                .set_promisc_on(&link)
                .await
                .map_err(|e| NetworkError::netlink("set promiscuous mode", name, e))?;
        }

        // Re-read so an existing link of another type is caught and the
        // kernel's attributes are returned.
        let mut bridge = Bridge::try_from(self.lookup(name).await?)?;

        let accept_ra = format!("net/ipv6/conf/{name}/accept_ra");
        if let Err(e) = self.sysctl.set(&accept_ra, "0") {
            tracing::warn!(name, error = %e, "Could not disable router advertisements on bridge");
        }

        self.handle
            .link_set_up(bridge.link())
            .await
            .map_err(|e| NetworkError::netlink("set bridge up", name, e))?;
        bridge.link.up = true;

        Ok(bridge)
    }

    /// Assign missing gateway addresses and return every gateway of the plan.
    async fn ensure_gateways(&self, bridge: &Bridge, plan: &BridgePlan) -> NetworkResult<Vec<IpNet>> {
        let existing = self
            .handle
            .addr_str_list(bridge.link())
            .await
            .map_err(|e| NetworkError::netlink("list addresses", bridge.name(), e))?;

        let mut gateways = Vec::with_capacity(plan.pod_cidrs.len());
        for subnet in &plan.pod_cidrs {
            let gw = calc_gateway(subnet)?;
            gateways.push(gw);
            if existing.contains(&gw.to_string()) {
                tracing::debug!(name = %bridge.name(), gateway = %gw, "Gateway already assigned");
                continue;
            }

            self.handle
                .addr_add(bridge.link(), gw)
                .await
                .map_err(|e| NetworkError::netlink("add gateway address", gw.addr().to_string(), e))?;
            tracing::debug!(name = %bridge.name(), gateway = %gw, "Added gateway address");
        }
        Ok(gateways)
    }

    async fn lookup(&self, name: &str) -> NetworkResult<Link> {
        crate::link::link_by_name(&self.handle, name).await
    }
}
