//! Host-scope address allocator.
//!
//! Hands out addresses from a single node-local CIDR and remembers which
//! workload owns each one.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::IpamError;
use super::range::{CidrRange, count_ips_in_cidr, indexed_ip};

/// Name of an address pool.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pool(String);

impl Pool {
    /// Create a pool name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The pool every host-scope allocation belongs to.
    #[must_use]
    pub fn host_scope() -> Self {
        Self::new("host-scope")
    }

    /// Pool name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::host_scope()
    }
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a successful allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationResult {
    /// The allocated address.
    pub ip: IpAddr,
    /// Pool the address came from.
    pub pool: Pool,
    /// CIDRs the address has direct access to.
    pub cidrs: Vec<IpNet>,
    /// Gateway to use for this address (first usable address of the CIDR).
    pub gateway_ip: Option<IpAddr>,
    /// Owner recorded for the address.
    pub owner: String,
}

/// Allocates addresses out of one node-local CIDR.
#[derive(Debug)]
pub struct HostScopeAllocator {
    cidr: IpNet,
    range: CidrRange,
    owners: RwLock<BTreeMap<IpAddr, String>>,
}

impl HostScopeAllocator {
    /// Create an allocator over `cidr`.
    #[must_use]
    pub fn new(cidr: IpNet) -> Self {
        Self {
            cidr: cidr.trunc(),
            range: CidrRange::new(cidr),
            owners: RwLock::new(BTreeMap::new()),
        }
    }

    /// The underlying range, e.g. for snapshotting.
    #[must_use]
    pub const fn range(&self) -> &CidrRange {
        &self.range
    }

    /// Allocate a specific address.
    ///
    /// # Errors
    ///
    /// Propagates [`IpamError::NotInRange`] and [`IpamError::Allocated`].
    pub fn allocate(&self, ip: IpAddr, owner: &str, pool: &Pool) -> Result<AllocationResult, IpamError> {
        self.range.allocate(ip)?;
        self.owners.write().insert(ip, owner.to_string());
        tracing::debug!(%ip, owner, %pool, "Allocated address");
        Ok(self.result(ip, owner, pool))
    }

    /// Allocate the next free address.
    ///
    /// # Errors
    ///
    /// [`IpamError::Full`] when the range is exhausted.
    pub fn allocate_next(&self, owner: &str, pool: &Pool) -> Result<AllocationResult, IpamError> {
        let ip = self.range.allocate_next()?;
        self.owners.write().insert(ip, owner.to_string());
        tracing::debug!(%ip, owner, %pool, "Allocated next address");
        Ok(self.result(ip, owner, pool))
    }

    /// Release an address. Releasing an unknown address is a no-op.
    pub fn release(&self, ip: IpAddr, pool: &Pool) {
        self.range.release(ip);
        if self.owners.write().remove(&ip).is_some() {
            tracing::debug!(%ip, %pool, "Released address");
        }
    }

    /// All allocated addresses per pool, with their owners, plus a status line.
    ///
    /// Addresses restored from a snapshot have no recorded owner and map to
    /// an empty string.
    #[must_use]
    pub fn dump(&self) -> (BTreeMap<Pool, BTreeMap<String, String>>, String) {
        let owners = self.owners.read();
        let mut alloc = BTreeMap::new();
        self.range.for_each(|ip| {
            let owner = owners.get(&ip).cloned().unwrap_or_default();
            alloc.insert(ip.to_string(), owner);
        });

        let status = format!(
            "{}/{} allocated from {}",
            alloc.len(),
            self.capacity(),
            self.cidr
        );
        (BTreeMap::from([(Pool::host_scope(), alloc)]), status)
    }

    /// Total number of addresses in the CIDR, excluding network and broadcast.
    #[must_use]
    pub fn capacity(&self) -> u128 {
        count_ips_in_cidr(&self.cidr)
    }

    fn result(&self, ip: IpAddr, owner: &str, pool: &Pool) -> AllocationResult {
        AllocationResult {
            ip,
            pool: pool.clone(),
            cidrs: vec![self.cidr],
            gateway_ip: indexed_ip(&self.cidr, 1).ok(),
            owner: owner.to_string(),
        }
    }
}
