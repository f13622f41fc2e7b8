//! IP forwarding toggles.

use std::net::IpAddr;

use crate::error::NetworkResult;
use crate::sysctl::Sysctl;

/// IPv4 forwarding sysctl.
pub const IPV4_FORWARD: &str = "net.ipv4.ip_forward";
/// IPv6 forwarding sysctl.
pub const IPV6_FORWARD: &str = "net.ipv6.conf.all.forwarding";

/// Enable IPv4 forwarding.
///
/// # Errors
///
/// Returns an error if the sysctl cannot be read or written.
pub fn enable_ip4_forward(sysctl: &Sysctl) -> NetworkResult<()> {
    echo1(sysctl, IPV4_FORWARD)
}

/// Enable IPv6 forwarding.
///
/// # Errors
///
/// Returns an error if the sysctl cannot be read or written.
pub fn enable_ip6_forward(sysctl: &Sysctl) -> NetworkResult<()> {
    echo1(sysctl, IPV6_FORWARD)
}

/// Enable forwarding for each address family present in `ips`.
///
/// # Errors
///
/// Returns the first sysctl failure.
pub fn enable_forward(sysctl: &Sysctl, ips: &[IpAddr]) -> NetworkResult<()> {
    if ips.iter().any(IpAddr::is_ipv4) {
        enable_ip4_forward(sysctl)?;
    }
    if ips.iter().any(IpAddr::is_ipv6) {
        enable_ip6_forward(sysctl)?;
    }
    Ok(())
}

fn echo1(sysctl: &Sysctl, name: &str) -> NetworkResult<()> {
    // Skip the write when already enabled; /proc/sys may be read-only.
    if sysctl.get(name)? == "1" {
        return Ok(());
    }
    sysctl.set(name, "1")
}
