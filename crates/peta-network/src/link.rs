//! Link lookup and removal helpers.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::{NetworkError, NetworkResult};
use crate::netlink::{Link, Netlink, SafeHandle};

/// Look up a link by name.
///
/// # Errors
///
/// [`NetworkError::LinkNotFound`] if absent, otherwise the netlink failure.
pub async fn link_by_name<N: Netlink>(handle: &SafeHandle<N>, name: &str) -> NetworkResult<Link> {
    handle.link_by_name(name).await.map_err(|e| {
        if e.is_not_found() {
            NetworkError::LinkNotFound {
                name: name.to_string(),
            }
        } else {
            NetworkError::netlink("lookup link", name, e)
        }
    })
}

/// Delete the named link.
///
/// # Errors
///
/// [`NetworkError::LinkNotFound`] if absent, otherwise the netlink failure.
pub async fn del_link_by_name<N: Netlink>(handle: &SafeHandle<N>, name: &str) -> NetworkResult<()> {
    let link = link_by_name(handle, name).await?;
    handle
        .link_del(&link)
        .await
        .map_err(|e| NetworkError::netlink("delete link", name, e))?;
    tracing::debug!(name, index = link.index, "Deleted link");
    Ok(())
}

/// Delete the named link and return the global unicast addresses it held.
///
/// # Errors
///
/// [`NetworkError::LinkNotFound`] if absent, otherwise the netlink failure.
pub async fn del_link_by_name_addr<N: Netlink>(
    handle: &SafeHandle<N>,
    name: &str,
) -> NetworkResult<Vec<IpNet>> {
    let link = link_by_name(handle, name).await?;
    let addrs = handle
        .addr_list(&link)
        .await
        .map_err(|e| NetworkError::netlink("list addresses", name, e))?;
    handle
        .link_del(&link)
        .await
        .map_err(|e| NetworkError::netlink("delete link", name, e))?;

    let kept: Vec<IpNet> = addrs
        .into_iter()
        .map(|a| a.net)
        .filter(|net| is_global_unicast(net.addr()))
        .collect();
    tracing::debug!(name, addresses = kept.len(), "Deleted link");
    Ok(kept)
}

/// Whether `ip` is routable unicast: not unspecified, loopback, multicast,
/// link-local or the IPv4 limited broadcast.
#[must_use]
pub fn is_global_unicast(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_multicast()
                || v4.is_link_local()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            !(v6.is_unspecified()
                || v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unicast_link_local())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::fake::FakeNetlink;

    #[test]
    fn global_unicast_classification() {
        for ip in ["10.0.0.1", "8.8.8.8", "fd00::1", "2001:db8::1"] {
            assert!(is_global_unicast(ip.parse().unwrap()), "{ip}");
        }
        for ip in ["0.0.0.0", "127.0.0.1", "169.254.1.1", "224.0.0.1", "255.255.255.255", "::1", "fe80::1", "ff02::1"] {
            assert!(!is_global_unicast(ip.parse().unwrap()), "{ip}");
        }
    }

    #[tokio::test]
    async fn delete_returns_routable_addresses() {
        let fake = FakeNetlink::new();
        let index = fake.insert_device("cni0", 1500);
        let handle = SafeHandle::new(fake);
        for addr in ["10.22.0.1/24", "fe80::1/64"] {
            handle.inner().addr_add(index, addr.parse().unwrap()).await.unwrap();
        }

        let addrs = del_link_by_name_addr(&handle, "cni0").await.unwrap();
        assert_eq!(addrs, vec!["10.22.0.1/24".parse::<IpNet>().unwrap()]);
        assert!(handle.inner().link("cni0").is_none());
    }

    #[tokio::test]
    async fn delete_missing_is_link_not_found() {
        let handle = SafeHandle::new(FakeNetlink::new());
        let err = del_link_by_name(&handle, "nope0").await.unwrap_err();
        assert!(err.is_link_not_found());
    }
}
