//! Kernel link, address and route access over netlink.
//!
//! [`Netlink`] is the raw request surface; [`SafeHandle`] wraps any
//! implementation and retries dump requests the kernel reports as
//! interrupted. The production implementation is [`RtNetlink`]; tests use
//! the in-memory `fake::FakeNetlink` from the `test-util` feature.

#[cfg(any(test, feature = "test-util"))]
pub mod fake;
mod rtnl;

use std::collections::BTreeMap;
use std::future::Future;
use std::net::IpAddr;

use async_trait::async_trait;
use ipnet::IpNet;
use thiserror::Error;

pub use rtnl::RtNetlink;

/// Upper bound on attempts for an interrupted dump.
pub const MAX_ATTEMPTS: usize = 5;

/// Netlink request failures.
#[derive(Error, Debug)]
pub enum NetlinkError {
    /// A dump was invalidated by a concurrent change and returned nothing usable.
    #[error("netlink dump interrupted")]
    DumpInterrupted,

    /// The kernel rejected the request with an errno.
    #[error("{message} (errno {code})")]
    Errno {
        /// Positive errno value.
        code: i32,
        /// Kernel or library description.
        message: String,
    },

    /// Socket-level failure.
    #[error("netlink socket error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other library failure.
    #[error("{0}")]
    Other(String),
}

impl NetlinkError {
    /// Build an errno error with the libc description.
    #[must_use]
    pub fn errno(code: i32) -> Self {
        Self::Errno {
            code,
            message: std::io::Error::from_raw_os_error(code).to_string(),
        }
    }

    /// The errno, if the kernel returned one.
    #[must_use]
    pub const fn code(&self) -> Option<i32> {
        match self {
            Self::Errno { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The object already exists (`EEXIST`).
    #[must_use]
    pub const fn is_exists(&self) -> bool {
        matches!(self, Self::Errno { code, .. } if *code == libc::EEXIST)
    }

    /// The link or address does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Errno { code, .. }
            if *code == libc::ENODEV || *code == libc::ENOENT || *code == libc::EADDRNOTAVAIL)
    }
}

/// A dump result that may have been interrupted part-way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dumped<T> {
    /// Whatever the kernel returned.
    pub value: T,
    /// Whether the kernel flagged the dump as inconsistent.
    pub interrupted: bool,
}

impl<T> Dumped<T> {
    /// A consistent result.
    pub const fn complete(value: T) -> Self {
        Self {
            value,
            interrupted: false,
        }
    }

    /// A partial result from an interrupted dump.
    pub const fn partial(value: T) -> Self {
        Self {
            value,
            interrupted: true,
        }
    }
}

/// Link type as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    /// Linux bridge.
    Bridge {
        /// 802.1Q filtering state, when reported.
        vlan_filtering: Option<bool>,
    },
    /// 802.1Q sub-interface.
    Vlan {
        /// VLAN tag.
        id: u16,
    },
    /// Virtual ethernet pair end.
    Veth,
    /// Any other typed link.
    Other(String),
    /// Physical or untyped link.
    Device,
}

impl std::fmt::Display for LinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bridge { .. } => f.write_str("bridge"),
            Self::Vlan { .. } => f.write_str("vlan"),
            Self::Veth => f.write_str("veth"),
            Self::Other(kind) => f.write_str(kind),
            Self::Device => f.write_str("device"),
        }
    }
}

/// A kernel network link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Interface index.
    pub index: u32,
    /// Interface name.
    pub name: String,
    /// MTU in bytes.
    pub mtu: u32,
    /// Link type.
    pub kind: LinkKind,
    /// Administratively up.
    pub up: bool,
    /// Promiscuous mode enabled.
    pub promiscuous: bool,
    /// Parent link index (VLAN master), if any.
    pub parent_index: Option<u32>,
}

/// An address assigned to a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Addr {
    /// Link index the address lives on.
    pub index: u32,
    /// Address with its prefix length (host bits preserved).
    pub net: IpNet,
}

/// A routing table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination prefix; `None` for the default route.
    pub destination: Option<IpNet>,
    /// Next hop.
    pub gateway: Option<IpAddr>,
    /// Output interface index.
    pub output_index: Option<u32>,
    /// Routing table id.
    pub table: u32,
}

/// Address family selector for route dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// IPv4 routes.
    V4,
    /// IPv6 routes.
    V6,
}

/// VLANs configured on bridge ports, keyed by interface index.
pub type BridgeVlans = BTreeMap<u32, Vec<u16>>;

/// Bridge creation or modification request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSpec {
    /// Bridge name.
    pub name: String,
    /// MTU; 0 keeps the kernel default.
    pub mtu: u32,
    /// Enable or disable 802.1Q filtering; `None` leaves it unchanged.
    pub vlan_filtering: Option<bool>,
}

/// VLAN sub-interface creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlanSpec {
    /// Sub-interface name.
    pub name: String,
    /// Index of the master link.
    pub parent_index: u32,
    /// VLAN tag.
    pub vlan_id: u16,
    /// MTU; 0 inherits from the master.
    pub mtu: u32,
}

/// A link to create or modify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSpec {
    /// Linux bridge.
    Bridge(BridgeSpec),
    /// 802.1Q sub-interface.
    Vlan(VlanSpec),
}

impl LinkSpec {
    /// Name of the link this request targets.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Bridge(spec) => &spec.name,
            Self::Vlan(spec) => &spec.name,
        }
    }
}

/// Raw netlink requests.
///
/// Dump-style reads return [`Dumped`] so an interruption can be reported
/// together with the partial result.
#[async_trait]
pub trait Netlink: Send + Sync {
    /// Look up a link by name. A missing link is an `ENODEV` errno.
    async fn link_by_name(&self, name: &str) -> Result<Dumped<Link>, NetlinkError>;

    /// Dump all links.
    async fn link_list(&self) -> Result<Dumped<Vec<Link>>, NetlinkError>;

    /// Dump addresses, optionally restricted to one link.
    async fn addr_list(&self, index: Option<u32>) -> Result<Dumped<Vec<Addr>>, NetlinkError>;

    /// Dump routes of one family.
    async fn route_list(&self, family: Family) -> Result<Dumped<Vec<Route>>, NetlinkError>;

    /// Dump bridge port VLANs.
    async fn bridge_vlan_list(&self) -> Result<Dumped<BridgeVlans>, NetlinkError>;

    /// Create a link; fails with `EEXIST` if the name is taken.
    async fn link_add(&self, spec: &LinkSpec) -> Result<(), NetlinkError>;

    /// Modify an existing link in place.
    async fn link_modify(&self, spec: &LinkSpec) -> Result<(), NetlinkError>;

    /// Bring a link administratively up.
    async fn link_set_up(&self, index: u32) -> Result<(), NetlinkError>;

    /// Enable promiscuous mode.
    async fn link_set_promisc_on(&self, index: u32) -> Result<(), NetlinkError>;

    /// Delete a link.
    async fn link_del(&self, index: u32) -> Result<(), NetlinkError>;

    /// Assign an address to a link.
    async fn addr_add(&self, index: u32, net: IpNet) -> Result<(), NetlinkError>;
}

/// Retries interrupted dumps on top of any [`Netlink`] implementation.
///
/// Each dump is attempted up to [`MAX_ATTEMPTS`] times while the kernel
/// reports it as interrupted. Other errors are returned immediately. Once
/// the attempts are used up the interruption is discarded and the last
/// partial result is returned.
#[derive(Debug)]
pub struct SafeHandle<N> {
    inner: N,
}

impl<N: Netlink> SafeHandle<N> {
    /// Wrap a netlink implementation.
    pub const fn new(inner: N) -> Self {
        Self { inner }
    }

    /// The wrapped implementation.
    pub const fn inner(&self) -> &N {
        &self.inner
    }

    /// Look up a link by name.
    ///
    /// # Errors
    ///
    /// Returns the kernel error; use [`NetlinkError::is_not_found`] to detect
    /// a missing link.
    pub async fn link_by_name(&self, name: &str) -> Result<Link, NetlinkError> {
        retry_on_intr("link by name", || self.inner.link_by_name(name)).await
    }

    /// List all links.
    ///
    /// # Errors
    ///
    /// Returns the kernel error if the dump fails for a reason other than interruption.
    pub async fn link_list(&self) -> Result<Vec<Link>, NetlinkError> {
        retry_on_intr("link list", || self.inner.link_list()).await
    }

    /// List the addresses of a link.
    ///
    /// # Errors
    ///
    /// Returns the kernel error if the dump fails for a reason other than interruption.
    pub async fn addr_list(&self, link: &Link) -> Result<Vec<Addr>, NetlinkError> {
        retry_on_intr("address list", || self.inner.addr_list(Some(link.index))).await
    }

    /// List the addresses of a link as `ip/prefix` strings.
    ///
    /// # Errors
    ///
    /// Same as [`SafeHandle::addr_list`].
    pub async fn addr_str_list(&self, link: &Link) -> Result<Vec<String>, NetlinkError> {
        Ok(self
            .addr_list(link)
            .await?
            .iter()
            .map(|a| a.net.to_string())
            .collect())
    }

    /// List routes of one family.
    ///
    /// # Errors
    ///
    /// Returns the kernel error if the dump fails for a reason other than interruption.
    pub async fn route_list(&self, family: Family) -> Result<Vec<Route>, NetlinkError> {
        retry_on_intr("route list", || self.inner.route_list(family)).await
    }

    /// List bridge port VLANs.
    ///
    /// # Errors
    ///
    /// Returns the kernel error if the dump fails for a reason other than interruption.
    pub async fn bridge_vlan_list(&self) -> Result<BridgeVlans, NetlinkError> {
        retry_on_intr("bridge vlan list", || self.inner.bridge_vlan_list()).await
    }

    /// Create a link.
    ///
    /// # Errors
    ///
    /// Returns the kernel error unchanged, including `EEXIST`.
    pub async fn link_add(&self, spec: &LinkSpec) -> Result<(), NetlinkError> {
        self.inner.link_add(spec).await
    }

    /// Modify a link in place.
    ///
    /// # Errors
    ///
    /// Returns the kernel error unchanged.
    pub async fn link_modify(&self, spec: &LinkSpec) -> Result<(), NetlinkError> {
        self.inner.link_modify(spec).await
    }

    /// Bring a link up.
    ///
    /// # Errors
    ///
    /// Returns the kernel error unchanged.
    pub async fn link_set_up(&self, link: &Link) -> Result<(), NetlinkError> {
        self.inner.link_set_up(link.index).await
    }

    /// Enable promiscuous mode on a link.
    ///
    /// # Errors
    ///
    /// Returns the kernel error unchanged.
    pub async fn set_promisc_on(&self, link: &Link) -> Result<(), NetlinkError> {
        self.inner.link_set_promisc_on(link.index).await
    }

    /// Delete a link.
    ///
    /// # Errors
    ///
    /// Returns the kernel error unchanged.
    pub async fn link_del(&self, link: &Link) -> Result<(), NetlinkError> {
        self.inner.link_del(link.index).await
    }

    /// Assign an address to a link.
    ///
    /// # Errors
    ///
    /// Returns the kernel error unchanged, including `EEXIST`.
    pub async fn addr_add(&self, link: &Link, net: IpNet) -> Result<(), NetlinkError> {
        self.inner.addr_add(link.index, net).await
    }
}

async fn retry_on_intr<T, F, Fut>(what: &'static str, mut call: F) -> Result<T, NetlinkError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Dumped<T>, NetlinkError>>,
{
    let mut last = None;
    for attempt in 1..=MAX_ATTEMPTS {
        match call().await {
            Ok(dumped) if !dumped.interrupted => return Ok(dumped.value),
            Ok(dumped) => last = Some(dumped.value),
            Err(NetlinkError::DumpInterrupted) => {}
            Err(e) => return Err(e),
        }
        tracing::debug!(what, attempt, "Netlink dump interrupted, retrying");
    }

    tracing::warn!(
        what,
        attempts = MAX_ATTEMPTS,
        "Netlink call interrupted after max attempts, discarding interruption"
    );
    last.ok_or(NetlinkError::DumpInterrupted)
}
