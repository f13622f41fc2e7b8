//! In-memory [`Netlink`] for tests.
//!
//! Mirrors the kernel's errno behavior for the requests this crate makes:
//! `EEXIST` on duplicate names and addresses, `ENODEV` on unknown links and
//! `EOPNOTSUPP` when modifying a link into a different type.

use std::collections::BTreeMap;

use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::Mutex;

use super::{
    Addr, BridgeVlans, Dumped, Family, Link, LinkKind, LinkSpec, Netlink, NetlinkError, Route,
};

const DEFAULT_MTU: u32 = 1500;

#[derive(Debug, Default)]
struct State {
    links: BTreeMap<u32, Link>,
    addrs: Vec<Addr>,
    routes: Vec<Route>,
    bridge_vlans: BridgeVlans,
    next_index: u32,
    interrupt_budget: usize,
    dump_calls: usize,
    failures: BTreeMap<&'static str, i32>,
}

impl State {
    fn by_name(&self, name: &str) -> Option<&Link> {
        self.links.values().find(|l| l.name == name)
    }

    fn by_name_mut(&mut self, name: &str) -> Option<&mut Link> {
        self.links.values_mut().find(|l| l.name == name)
    }

    fn insert(&mut self, mut link: Link) -> u32 {
        self.next_index += 1;
        link.index = self.next_index;
        self.links.insert(link.index, link);
        self.next_index
    }

    fn dump<T>(&mut self, value: T) -> Dumped<T> {
        self.dump_calls += 1;
        if self.interrupt_budget > 0 {
            self.interrupt_budget -= 1;
            Dumped::partial(value)
        } else {
            Dumped::complete(value)
        }
    }

    fn check(&self, op: &'static str) -> Result<(), NetlinkError> {
        match self.failures.get(op) {
            Some(&code) => Err(NetlinkError::errno(code)),
            None => Ok(()),
        }
    }

    fn link_mut(&mut self, index: u32) -> Result<&mut Link, NetlinkError> {
        self.links
            .get_mut(&index)
            .ok_or_else(|| NetlinkError::errno(libc::ENODEV))
    }
}

/// A fake kernel link table.
#[derive(Debug, Default)]
pub struct FakeNetlink {
    state: Mutex<State>,
}

impl FakeNetlink {
    /// An empty link table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plain device such as a physical NIC, returning its index.
    pub fn insert_device(&self, name: &str, mtu: u32) -> u32 {
        self.state.lock().insert(Link {
            index: 0,
            name: name.to_string(),
            mtu,
            kind: LinkKind::Device,
            up: true,
            promiscuous: false,
            parent_index: None,
        })
    }

    /// Add a route to the table returned by route dumps.
    pub fn insert_route(&self, route: Route) {
        self.state.lock().routes.push(route);
    }

    /// Record VLANs on a bridge port.
    pub fn insert_bridge_vlans(&self, index: u32, vids: Vec<u16>) {
        self.state.lock().bridge_vlans.insert(index, vids);
    }

    /// Flag the next `n` dumps as interrupted.
    pub fn interrupt_dumps(&self, n: usize) {
        self.state.lock().interrupt_budget = n;
    }

    /// Make every call of `op` (a [`Netlink`] method name) fail with `errno`.
    pub fn fail(&self, op: &'static str, errno: i32) {
        self.state.lock().failures.insert(op, errno);
    }

    /// Number of dump requests served so far.
    #[must_use]
    pub fn dump_calls(&self) -> usize {
        self.state.lock().dump_calls
    }

    /// Look up a link by name without going through a dump.
    #[must_use]
    pub fn link(&self, name: &str) -> Option<Link> {
        self.state.lock().by_name(name).cloned()
    }

    /// All links.
    #[must_use]
    pub fn links(&self) -> Vec<Link> {
        self.state.lock().links.values().cloned().collect()
    }

    /// Addresses on the named link.
    #[must_use]
    pub fn addresses(&self, name: &str) -> Vec<IpNet> {
        let state = self.state.lock();
        let Some(index) = state.by_name(name).map(|l| l.index) else {
            return Vec::new();
        };
        state
            .addrs
            .iter()
            .filter(|a| a.index == index)
            .map(|a| a.net)
            .collect()
    }
}

fn same_type(kind: &LinkKind, spec: &LinkSpec) -> bool {
    matches!(
        (kind, spec),
        (LinkKind::Bridge { .. }, LinkSpec::Bridge(_)) | (LinkKind::Vlan { .. }, LinkSpec::Vlan(_))
    )
}

#[async_trait]
impl Netlink for FakeNetlink {
    async fn link_by_name(&self, name: &str) -> Result<Dumped<Link>, NetlinkError> {
        let mut state = self.state.lock();
        state.check("link_by_name")?;
        let link = state.by_name(name).cloned();
        let dumped = state.dump(());
        match link {
            Some(link) => Ok(Dumped {
                value: link,
                interrupted: dumped.interrupted,
            }),
            None => Err(NetlinkError::errno(libc::ENODEV)),
        }
    }

    async fn link_list(&self) -> Result<Dumped<Vec<Link>>, NetlinkError> {
        let mut state = self.state.lock();
        state.check("link_list")?;
        let links = state.links.values().cloned().collect();
        Ok(state.dump(links))
    }

    async fn addr_list(&self, index: Option<u32>) -> Result<Dumped<Vec<Addr>>, NetlinkError> {
        let mut state = self.state.lock();
        state.check("addr_list")?;
        let addrs = state
            .addrs
            .iter()
            .filter(|a| index.is_none_or(|i| a.index == i))
            .copied()
            .collect();
        Ok(state.dump(addrs))
    }

    async fn route_list(&self, family: Family) -> Result<Dumped<Vec<Route>>, NetlinkError> {
        let mut state = self.state.lock();
        state.check("route_list")?;
        let routes = state
            .routes
            .iter()
            .filter(|r| {
                let v4 = match (r.destination, r.gateway) {
                    (Some(dst), _) => dst.addr().is_ipv4(),
                    (None, Some(gw)) => gw.is_ipv4(),
                    (None, None) => true,
                };
                v4 == (family == Family::V4)
            })
            .cloned()
            .collect();
        Ok(state.dump(routes))
    }

    async fn bridge_vlan_list(&self) -> Result<Dumped<BridgeVlans>, NetlinkError> {
        let mut state = self.state.lock();
        state.check("bridge_vlan_list")?;
        let vlans = state.bridge_vlans.clone();
        Ok(state.dump(vlans))
    }

    async fn link_add(&self, spec: &LinkSpec) -> Result<(), NetlinkError> {
        let mut state = self.state.lock();
        state.check("link_add")?;
        if state.by_name(spec.name()).is_some() {
            return Err(NetlinkError::errno(libc::EEXIST));
        }

        let link = match spec {
            LinkSpec::Bridge(b) => Link {
                index: 0,
                name: b.name.clone(),
                mtu: if b.mtu > 0 { b.mtu } else { DEFAULT_MTU },
                kind: LinkKind::Bridge {
                    vlan_filtering: Some(b.vlan_filtering.unwrap_or(false)),
                },
                up: false,
                promiscuous: false,
                parent_index: None,
            },
            LinkSpec::Vlan(v) => {
                let parent = state
                    .links
                    .get(&v.parent_index)
                    .ok_or_else(|| NetlinkError::errno(libc::ENODEV))?;
                if v.mtu > parent.mtu {
                    return Err(NetlinkError::errno(libc::ERANGE));
                }
                Link {
                    index: 0,
                    name: v.name.clone(),
                    mtu: if v.mtu > 0 { v.mtu } else { parent.mtu },
                    kind: LinkKind::Vlan { id: v.vlan_id },
                    up: false,
                    promiscuous: false,
                    parent_index: Some(v.parent_index),
                }
            }
        };
        state.insert(link);
        Ok(())
    }

    async fn link_modify(&self, spec: &LinkSpec) -> Result<(), NetlinkError> {
        let mut state = self.state.lock();
        state.check("link_modify")?;
        let link = state
            .by_name_mut(spec.name())
            .ok_or_else(|| NetlinkError::errno(libc::ENODEV))?;
        if !same_type(&link.kind, spec) {
            return Err(NetlinkError::errno(libc::EOPNOTSUPP));
        }

        match spec {
            LinkSpec::Bridge(b) => {
                if b.mtu > 0 {
                    link.mtu = b.mtu;
                }
                if let (Some(on), LinkKind::Bridge { vlan_filtering }) =
                    (b.vlan_filtering, &mut link.kind)
                {
                    *vlan_filtering = Some(on);
                }
            }
            LinkSpec::Vlan(v) => {
                if v.mtu > 0 {
                    link.mtu = v.mtu;
                }
            }
        }
        Ok(())
    }

    async fn link_set_up(&self, index: u32) -> Result<(), NetlinkError> {
        let mut state = self.state.lock();
        state.check("link_set_up")?;
        state.link_mut(index)?.up = true;
        Ok(())
    }

    async fn link_set_promisc_on(&self, index: u32) -> Result<(), NetlinkError> {
        let mut state = self.state.lock();
        state.check("link_set_promisc_on")?;
        state.link_mut(index)?.promiscuous = true;
        Ok(())
    }

    async fn link_del(&self, index: u32) -> Result<(), NetlinkError> {
        let mut state = self.state.lock();
        state.check("link_del")?;
        if state.links.remove(&index).is_none() {
            return Err(NetlinkError::errno(libc::ENODEV));
        }
        state.addrs.retain(|a| a.index != index);
        state.bridge_vlans.remove(&index);
        Ok(())
    }

    async fn addr_add(&self, index: u32, net: IpNet) -> Result<(), NetlinkError> {
        let mut state = self.state.lock();
        state.check("addr_add")?;
        state.link_mut(index)?;
        if state.addrs.iter().any(|a| a.index == index && a.net == net) {
            return Err(NetlinkError::errno(libc::EEXIST));
        }
        state.addrs.push(Addr { index, net });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::{BridgeSpec, VlanSpec};

    fn bridge(name: &str) -> LinkSpec {
        LinkSpec::Bridge(BridgeSpec {
            name: name.to_string(),
            mtu: 0,
            vlan_filtering: None,
        })
    }

    #[tokio::test]
    async fn duplicate_add_is_eexist() {
        let fake = FakeNetlink::new();
        fake.link_add(&bridge("br0")).await.unwrap();
        let err = fake.link_add(&bridge("br0")).await.unwrap_err();
        assert!(err.is_exists());
    }

    #[tokio::test]
    async fn modify_rejects_type_change() {
        let fake = FakeNetlink::new();
        let eth = fake.insert_device("eth0", 1500);
        fake.link_add(&LinkSpec::Vlan(VlanSpec {
            name: "br0".to_string(),
            parent_index: eth,
            vlan_id: 10,
            mtu: 0,
        }))
        .await
        .unwrap();

        let err = fake.link_modify(&bridge("br0")).await.unwrap_err();
        assert!(matches!(err, NetlinkError::Errno { code, .. } if code == libc::EOPNOTSUPP));
    }

    #[tokio::test]
    async fn delete_drops_addresses() {
        let fake = FakeNetlink::new();
        let eth = fake.insert_device("eth0", 1500);
        fake.addr_add(eth, "10.0.0.2/24".parse().unwrap()).await.unwrap();
        fake.link_del(eth).await.unwrap();
        assert!(fake.addr_list(None).await.unwrap().value.is_empty());
    }
}
