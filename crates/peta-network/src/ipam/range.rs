//! CIDR ranges backed by an allocation bitmap.
//!
//! For `10.0.0.0/24` the layout is:
//!
//! ```text
//! network             broadcast
//! 10.0.0.0            10.0.0.255
//! |                            |
//! 0  1  2  3  ...    253 254 255
//!    |                    |
//!    base                 base + max - 1
//!    offset 0             last offset
//! ```
//!
//! The network and broadcast addresses are never allocatable.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;

use super::IpamError;
use super::bitmap::{AllocationBitmap, Allocator, Snapshottable};

/// IPv6 ranges are capped at this many slots to bound the bitmap.
const MAX_V6_RANGE: u64 = 1 << 16;

/// A contiguous block of IPs that can be allocated atomically.
#[derive(Debug)]
pub struct CidrRange {
    net: IpNet,
    base: u128,
    max: usize,
    alloc: AllocationBitmap,
}

impl CidrRange {
    /// Build a range over `cidr`. The host part of `cidr` is ignored.
    ///
    /// Network and broadcast addresses are excluded when the subnet has
    /// more than two addresses.
    #[must_use]
    pub fn new(cidr: IpNet) -> Self {
        let net = cidr.trunc();
        let mut base = ip_to_u128(net.network());
        let mut size = range_size(&net);

        if size > 2 {
            size -= 2;
            base += 1;
        }

        // range_size is at most 2^32 for v4 and 2^16 for v6.
        let max = usize::try_from(size).unwrap_or(usize::MAX);

        Self {
            net,
            base,
            max,
            alloc: AllocationBitmap::new(max, net.to_string()),
        }
    }

    /// The subnet covered by the range.
    #[must_use]
    pub const fn cidr(&self) -> IpNet {
        self.net
    }

    /// First usable address.
    #[must_use]
    pub fn base(&self) -> IpAddr {
        u128_to_ip(self.base, &self.net).unwrap_or_else(|| self.net.network())
    }

    /// Number of usable addresses.
    #[must_use]
    pub const fn max(&self) -> usize {
        self.max
    }

    /// Addresses left in the range.
    #[must_use]
    pub fn free(&self) -> usize {
        self.alloc.free()
    }

    /// Addresses in use.
    #[must_use]
    pub fn used(&self) -> usize {
        self.max - self.alloc.free()
    }

    /// Reserve `ip`.
    ///
    /// # Errors
    ///
    /// [`IpamError::NotInRange`] if `ip` is not a usable address of this
    /// range, [`IpamError::Allocated`] if it is already taken.
    pub fn allocate(&self, ip: IpAddr) -> Result<(), IpamError> {
        let offset = self.offset_of(ip).ok_or_else(|| IpamError::NotInRange {
            valid_range: self.net.to_string(),
        })?;

        if !self.alloc.allocate(offset) {
            return Err(IpamError::Allocated);
        }
        Ok(())
    }

    /// Reserve any free address.
    ///
    /// # Errors
    ///
    /// [`IpamError::Full`] if no addresses are left.
    pub fn allocate_next(&self) -> Result<IpAddr, IpamError> {
        let offset = self.alloc.allocate_next().ok_or(IpamError::Full)?;
        u128_to_ip(self.base + offset as u128, &self.net).ok_or(IpamError::Full)
    }

    /// Return `ip` to the pool. Free or out-of-range addresses are ignored.
    pub fn release(&self, ip: IpAddr) {
        if let Some(offset) = self.offset_of(ip) {
            self.alloc.release(offset);
        }
    }

    /// Whether `ip` is allocated, i.e. [`CidrRange::allocate`] would fail
    /// with [`IpamError::Allocated`].
    #[must_use]
    pub fn has(&self, ip: IpAddr) -> bool {
        self.offset_of(ip).is_some_and(|o| self.alloc.has(o))
    }

    /// Call `f` for every allocated address in ascending order.
    pub fn for_each(&self, mut f: impl FnMut(IpAddr)) {
        let net = self.net;
        self.alloc.for_each(&mut |offset| {
            // The network address itself is never stored.
            if let Ok(ip) = indexed_ip(&net, offset as u128 + 1) {
                f(ip);
            }
        });
    }

    /// Save the current allocation state.
    #[must_use]
    pub fn snapshot(&self) -> (String, Vec<u8>) {
        self.alloc.snapshot()
    }

    /// Restore state captured by [`CidrRange::snapshot`].
    ///
    /// # Errors
    ///
    /// [`IpamError::MismatchedNetwork`] if `net` is not exactly this
    /// range's subnet; the range is left unchanged.
    pub fn restore(&self, net: &IpNet, data: &[u8]) -> Result<(), IpamError> {
        if *net != self.net {
            return Err(IpamError::MismatchedNetwork);
        }
        self.alloc.restore(&net.to_string(), data)
    }

    fn offset_of(&self, ip: IpAddr) -> Option<usize> {
        if !self.net.contains(&ip) {
            return None;
        }
        let offset = ip_to_u128(ip).checked_sub(self.base)?;
        usize::try_from(offset).ok().filter(|&o| o < self.max)
    }
}

/// Number of addresses the allocator will track for `subnet`.
///
/// Host-only subnets (/31, /32, /127, /128) have size 0. IPv6 subnets are
/// capped at 65536.
#[must_use]
pub fn range_size(subnet: &IpNet) -> u64 {
    let host_bits = u32::from(subnet.max_prefix_len() - subnet.prefix_len());
    match subnet {
        _ if host_bits <= 1 => 0,
        IpNet::V6(_) if host_bits >= 16 => MAX_V6_RANGE,
        _ => 1 << host_bits,
    }
}

/// Addresses in `net` excluding network and broadcast.
///
/// Returns 0 for a full-length prefix.
#[must_use]
pub fn count_ips_in_cidr(net: &IpNet) -> u128 {
    let host_bits = u32::from(net.max_prefix_len() - net.prefix_len());
    match host_bits {
        0 => 0,
        128 => u128::MAX - 1,
        bits => (1u128 << bits) - 2,
    }
}

/// The address `index` places after the network address of `subnet`.
///
/// # Errors
///
/// [`IpamError::IndexOutOfSubnet`] if the result is not inside `subnet`.
pub fn indexed_ip(subnet: &IpNet, index: u128) -> Result<IpAddr, IpamError> {
    let out_of_subnet = || IpamError::IndexOutOfSubnet {
        index,
        subnet: subnet.to_string(),
    };

    let value = ip_to_u128(subnet.network())
        .checked_add(index)
        .ok_or_else(out_of_subnet)?;
    let ip = u128_to_ip(value, subnet).ok_or_else(out_of_subnet)?;
    if !subnet.contains(&ip) {
        return Err(out_of_subnet());
    }
    Ok(ip)
}

fn ip_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn u128_to_ip(value: u128, family: &IpNet) -> Option<IpAddr> {
    match family {
        IpNet::V4(_) => u32::try_from(value).ok().map(|v| IpAddr::V4(Ipv4Addr::from(v))),
        IpNet::V6(_) => Some(IpAddr::V6(Ipv6Addr::from(value))),
    }
}
