//! # peta-network
//!
//! Host network provisioning for PETA workloads.
//!
//! This crate provides the pieces a node needs to hand out addresses and
//! wire them to the outside world:
//! - Bitmap-backed IP address pools with persisted snapshots
//! - Idempotent bridge reconciliation with gateway addressing
//! - 802.1Q VLAN sub-interfaces
//! - Source NAT through iptables or nftables

#![warn(missing_docs)]

pub mod bridge;
pub mod config;
pub mod error;
pub mod forward;
pub mod ipam;
pub mod link;
pub mod masq;
pub mod netlink;
pub mod sysctl;
pub mod thread;
pub mod vlan;

pub use bridge::{Bridge, BridgeReconciler, calc_gateway};
pub use config::{BridgeConfig, BridgePlan, NetConf, VlanTrunk};
pub use error::{NetworkError, NetworkResult};
pub use forward::{enable_forward, enable_ip4_forward, enable_ip6_forward};
pub use ipam::{AllocationBitmap, CidrRange, HostScopeAllocator, IpamError, SnapshotStore};
pub use link::{del_link_by_name, del_link_by_name_addr, link_by_name};
pub use masq::{MasqBackend, MasqIdentity, Masquerade, MasqueradeManager};
pub use netlink::{Link, LinkKind, Netlink, NetlinkError, RtNetlink, SafeHandle};
pub use sysctl::Sysctl;
pub use thread::run_pinned;
pub use vlan::{VlanConfig, create_vlan, delete_vlan};
