//! [`Netlink`] over an rtnetlink socket.

use std::net::IpAddr;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use ipnet::IpNet;
use netlink_packet_core::{
    NLM_F_DUMP, NLM_F_DUMP_INTR, NLM_F_REQUEST, NetlinkMessage, NetlinkPayload,
};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::{
    AfSpecBridge, InfoBridge, InfoData, InfoKind, InfoVlan, LinkAttribute, LinkExtentMask,
    LinkFlags, LinkInfo, LinkMessage,
};
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
use tokio::task::JoinHandle;

use super::{
    Addr, BridgeSpec, BridgeVlans, Dumped, Family, Link, LinkKind, LinkSpec, Netlink,
    NetlinkError, Route, VlanSpec,
};

/// Netlink access through a persistent rtnetlink connection.
///
/// The connection task runs on the current tokio runtime and is aborted on
/// drop. Namespace-sensitive callers should create the handle inside
/// [`crate::thread::run_pinned`].
pub struct RtNetlink {
    handle: rtnetlink::Handle,
    connection: JoinHandle<()>,
}

impl std::fmt::Debug for RtNetlink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtNetlink").finish_non_exhaustive()
    }
}

impl RtNetlink {
    /// Open a netlink socket and spawn its connection task.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be opened.
    pub fn new() -> Result<Self, NetlinkError> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        let connection = tokio::spawn(connection);
        tracing::debug!("Opened rtnetlink connection");
        Ok(Self { handle, connection })
    }
}

impl Drop for RtNetlink {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

fn classify(err: rtnetlink::Error) -> NetlinkError {
    match err {
        rtnetlink::Error::NetlinkError(msg) => classify_code(msg.raw_code()),
        other => NetlinkError::Other(other.to_string()),
    }
}

fn classify_code(raw: i32) -> NetlinkError {
    let code = -raw;
    if code == libc::EINTR {
        NetlinkError::DumpInterrupted
    } else {
        NetlinkError::errno(code)
    }
}

/// Accumulates the replies of one dump request.
///
/// The kernel reports an inconsistent dump by setting `NLM_F_DUMP_INTR` on
/// the multipart headers and keeps sending the rest, so the flag is tracked
/// per message rather than read from an error.
struct DumpCollector<T, P> {
    parse: P,
    items: Vec<T>,
    interrupted: bool,
}

impl<T, P> DumpCollector<T, P>
where
    P: FnMut(RouteNetlinkMessage) -> Option<T>,
{
    const fn new(parse: P) -> Self {
        Self {
            parse,
            items: Vec::new(),
            interrupted: false,
        }
    }

    fn push(&mut self, msg: NetlinkMessage<RouteNetlinkMessage>) -> Result<(), NetlinkError> {
        if msg.header.flags & NLM_F_DUMP_INTR != 0 {
            self.interrupted = true;
        }
        match msg.payload {
            NetlinkPayload::InnerMessage(inner) => self.items.extend((self.parse)(inner)),
            NetlinkPayload::Error(err) if err.code.is_some() => {
                match classify_code(err.raw_code()) {
                    NetlinkError::DumpInterrupted => self.interrupted = true,
                    other => return Err(other),
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn finish(self) -> Dumped<Vec<T>> {
        if self.interrupted {
            Dumped::partial(self.items)
        } else {
            Dumped::complete(self.items)
        }
    }
}

impl RtNetlink {
    /// Send `request` as a dump and drain every reply.
    async fn dump<T: Send>(
        &self,
        request: RouteNetlinkMessage,
        parse: impl FnMut(RouteNetlinkMessage) -> Option<T> + Send,
    ) -> Result<Dumped<Vec<T>>, NetlinkError> {
        let mut req = NetlinkMessage::from(request);
        req.header.flags = NLM_F_REQUEST | NLM_F_DUMP;

        let mut handle = self.handle.clone();
        let responses = handle.request(req).map_err(classify)?;
        let mut responses = std::pin::pin!(responses);
        let mut collector = DumpCollector::new(parse);
        while let Some(msg) = responses.next().await {
            collector.push(msg)?;
        }
        Ok(collector.finish())
    }
}

fn parse_link(msg: LinkMessage) -> Link {
    let mut link = Link {
        index: msg.header.index,
        name: String::new(),
        mtu: 0,
        kind: LinkKind::Device,
        up: msg.header.flags.contains(LinkFlags::Up),
        promiscuous: msg.header.flags.contains(LinkFlags::Promisc),
        parent_index: None,
    };

    for attr in msg.attributes {
        match attr {
            LinkAttribute::IfName(name) => link.name = name,
            LinkAttribute::Mtu(mtu) => link.mtu = mtu,
            LinkAttribute::Link(parent) => link.parent_index = Some(parent),
            LinkAttribute::LinkInfo(infos) => link.kind = parse_kind(infos),
            _ => {}
        }
    }
    link
}

fn parse_kind(infos: Vec<LinkInfo>) -> LinkKind {
    let mut kind = None;
    let mut data = None;
    for info in infos {
        match info {
            LinkInfo::Kind(k) => kind = Some(k),
            LinkInfo::Data(d) => data = Some(d),
            _ => {}
        }
    }

    match kind {
        Some(InfoKind::Bridge) => {
            let vlan_filtering = match data {
                Some(InfoData::Bridge(opts)) => opts.into_iter().find_map(|o| match o {
                    InfoBridge::VlanFiltering(on) => Some(on),
                    _ => None,
                }),
                _ => None,
            };
            LinkKind::Bridge { vlan_filtering }
        }
        Some(InfoKind::Vlan) => {
            let id = match data {
                Some(InfoData::Vlan(opts)) => opts
                    .into_iter()
                    .find_map(|o| match o {
                        InfoVlan::Id(id) => Some(id),
                        _ => None,
                    })
                    .unwrap_or_default(),
                _ => 0,
            };
            LinkKind::Vlan { id }
        }
        Some(InfoKind::Veth) => LinkKind::Veth,
        Some(InfoKind::Other(name)) => LinkKind::Other(name),
        Some(other) => LinkKind::Other(format!("{other:?}").to_lowercase()),
        None => LinkKind::Device,
    }
}

fn parse_addr(msg: AddressMessage) -> Option<Addr> {
    let mut address = None;
    let mut local = None;
    for attr in msg.attributes {
        match attr {
            AddressAttribute::Address(ip) => address = Some(ip),
            AddressAttribute::Local(ip) => local = Some(ip),
            _ => {}
        }
    }
    // IFA_LOCAL is the interface address on point-to-point links.
    let ip = local.or(address)?;
    let net = IpNet::new(ip, msg.header.prefix_len).ok()?;
    Some(Addr {
        index: msg.header.index,
        net,
    })
}

fn route_addr(addr: RouteAddress) -> Option<IpAddr> {
    match addr {
        RouteAddress::Inet(v4) => Some(IpAddr::V4(v4)),
        RouteAddress::Inet6(v6) => Some(IpAddr::V6(v6)),
        _ => None,
    }
}

fn parse_route(msg: RouteMessage) -> Route {
    let prefix = msg.header.destination_prefix_length;
    let mut route = Route {
        destination: None,
        gateway: None,
        output_index: None,
        table: u32::from(msg.header.table),
    };
    for attr in msg.attributes {
        match attr {
            RouteAttribute::Destination(addr) => {
                route.destination = route_addr(addr).and_then(|ip| IpNet::new(ip, prefix).ok());
            }
            RouteAttribute::Gateway(addr) => route.gateway = route_addr(addr),
            RouteAttribute::Oif(index) => route.output_index = Some(index),
            RouteAttribute::Table(table) => route.table = table,
            _ => {}
        }
    }
    route
}

fn bridge_message(spec: &BridgeSpec) -> LinkMessage {
    let mut msg = LinkMessage::default();
    msg.attributes.push(LinkAttribute::IfName(spec.name.clone()));
    if spec.mtu > 0 {
        msg.attributes.push(LinkAttribute::Mtu(spec.mtu));
    }
    let mut info = vec![LinkInfo::Kind(InfoKind::Bridge)];
    if let Some(on) = spec.vlan_filtering {
        info.push(LinkInfo::Data(InfoData::Bridge(vec![
            InfoBridge::VlanFiltering(on),
        ])));
    }
    msg.attributes.push(LinkAttribute::LinkInfo(info));
    msg
}

fn vlan_message(spec: &VlanSpec) -> LinkMessage {
    let mut msg = LinkMessage::default();
    msg.attributes.push(LinkAttribute::IfName(spec.name.clone()));
    msg.attributes.push(LinkAttribute::Link(spec.parent_index));
    if spec.mtu > 0 {
        msg.attributes.push(LinkAttribute::Mtu(spec.mtu));
    }
    msg.attributes.push(LinkAttribute::LinkInfo(vec![
        LinkInfo::Kind(InfoKind::Vlan),
        LinkInfo::Data(InfoData::Vlan(vec![InfoVlan::Id(spec.vlan_id)])),
    ]));
    msg
}

fn link_message(spec: &LinkSpec) -> LinkMessage {
    match spec {
        LinkSpec::Bridge(b) => bridge_message(b),
        LinkSpec::Vlan(v) => vlan_message(v),
    }
}

fn flag_message(index: u32, flag: LinkFlags) -> LinkMessage {
    let mut msg = LinkMessage::default();
    msg.header.index = index;
    msg.header.flags |= flag;
    msg.header.change_mask |= flag;
    msg
}

#[async_trait]
impl Netlink for RtNetlink {
    async fn link_by_name(&self, name: &str) -> Result<Dumped<Link>, NetlinkError> {
        let mut links = std::pin::pin!(
            self.handle
                .link()
                .get()
                .match_name(name.to_string())
                .execute()
                .into_stream()
        );
        match links.try_next().await {
            Ok(Some(msg)) => Ok(Dumped::complete(parse_link(msg))),
            Ok(None) => Err(NetlinkError::errno(libc::ENODEV)),
            Err(e) => Err(classify(e)),
        }
    }

    async fn link_list(&self) -> Result<Dumped<Vec<Link>>, NetlinkError> {
        self.dump(RouteNetlinkMessage::GetLink(LinkMessage::default()), |msg| match msg {
            RouteNetlinkMessage::NewLink(link) => Some(parse_link(link)),
            _ => None,
        })
        .await
    }

    async fn addr_list(&self, index: Option<u32>) -> Result<Dumped<Vec<Addr>>, NetlinkError> {
        // Address dumps cannot be filtered by the kernel; filter on receipt.
        self.dump(
            RouteNetlinkMessage::GetAddress(AddressMessage::default()),
            move |msg| match msg {
                RouteNetlinkMessage::NewAddress(addr) => {
                    parse_addr(addr).filter(|a| index.is_none_or(|i| a.index == i))
                }
                _ => None,
            },
        )
        .await
    }

    async fn route_list(&self, family: Family) -> Result<Dumped<Vec<Route>>, NetlinkError> {
        let mut msg = RouteMessage::default();
        msg.header.address_family = match family {
            Family::V4 => AddressFamily::Inet,
            Family::V6 => AddressFamily::Inet6,
        };
        self.dump(RouteNetlinkMessage::GetRoute(msg), |msg| match msg {
            RouteNetlinkMessage::NewRoute(route) => Some(parse_route(route)),
            _ => None,
        })
        .await
    }

    async fn bridge_vlan_list(&self) -> Result<Dumped<BridgeVlans>, NetlinkError> {
        let mut request = LinkMessage::default();
        request.header.interface_family = AddressFamily::Bridge;
        request
            .attributes
            .push(LinkAttribute::ExtMask(vec![LinkExtentMask::Brvlan]));

        let dumped = self.dump(RouteNetlinkMessage::GetLink(request), |msg| {
            let RouteNetlinkMessage::NewLink(msg) = msg else {
                return None;
            };
            let index = msg.header.index;
            let vids: Vec<u16> = msg
                .attributes
                .into_iter()
                .filter_map(|attr| match attr {
                    LinkAttribute::AfSpecBridge(specs) => Some(specs),
                    _ => None,
                })
                .flatten()
                .filter_map(|spec| match spec {
                    AfSpecBridge::VlanInfo(info) => Some(info.vid),
                    _ => None,
                })
                .collect();
            (!vids.is_empty()).then_some((index, vids))
        })
        .await?;

        Ok(Dumped {
            value: dumped.value.into_iter().collect(),
            interrupted: dumped.interrupted,
        })
    }

    async fn link_add(&self, spec: &LinkSpec) -> Result<(), NetlinkError> {
        self.handle
            .link()
            .add(link_message(spec))
            .execute()
            .await
            .map_err(classify)
    }

    async fn link_modify(&self, spec: &LinkSpec) -> Result<(), NetlinkError> {
        self.handle
            .link()
            .add(link_message(spec))
            .replace()
            .execute()
            .await
            .map_err(classify)
    }

    async fn link_set_up(&self, index: u32) -> Result<(), NetlinkError> {
        self.handle
            .link()
            .set(flag_message(index, LinkFlags::Up))
            .execute()
            .await
            .map_err(classify)
    }

    async fn link_set_promisc_on(&self, index: u32) -> Result<(), NetlinkError> {
        self.handle
            .link()
            .set(flag_message(index, LinkFlags::Promisc))
            .execute()
            .await
            .map_err(classify)
    }

    async fn link_del(&self, index: u32) -> Result<(), NetlinkError> {
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(classify)
    }

    async fn addr_add(&self, index: u32, net: IpNet) -> Result<(), NetlinkError> {
        self.handle
            .address()
            .add(index, net.addr(), net.prefix_len())
            .execute()
            .await
            .map_err(classify)
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroI32;

    use netlink_packet_core::{DoneMessage, ErrorMessage, NLM_F_MULTIPART, NetlinkHeader};

    use super::*;

    fn link_reply(index: u32, flags: u16) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut link = LinkMessage::default();
        link.header.index = index;
        link.attributes.push(LinkAttribute::IfName(format!("eth{index}")));
        let mut msg = NetlinkMessage::from(RouteNetlinkMessage::NewLink(link));
        msg.header.flags = flags;
        msg
    }

    fn error_reply(errno: i32) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut err = ErrorMessage::default();
        err.code = NonZeroI32::new(-errno);
        NetlinkMessage::new(NetlinkHeader::default(), NetlinkPayload::Error(err))
    }

    fn links() -> DumpCollector<Link, impl FnMut(RouteNetlinkMessage) -> Option<Link>> {
        DumpCollector::new(|msg| match msg {
            RouteNetlinkMessage::NewLink(link) => Some(parse_link(link)),
            _ => None,
        })
    }

    #[test]
    fn clean_dump_is_complete() {
        let mut collector = links();
        collector.push(link_reply(1, NLM_F_MULTIPART)).unwrap();
        collector.push(link_reply(2, NLM_F_MULTIPART)).unwrap();

        let dumped = collector.finish();
        assert!(!dumped.interrupted);
        assert_eq!(dumped.value.len(), 2);
    }

    #[test]
    fn dump_intr_header_flag_marks_partial() {
        let mut collector = links();
        collector.push(link_reply(1, NLM_F_MULTIPART)).unwrap();
        collector
            .push(link_reply(2, NLM_F_MULTIPART | NLM_F_DUMP_INTR))
            .unwrap();
        collector.push(link_reply(3, NLM_F_MULTIPART)).unwrap();

        let dumped = collector.finish();
        assert!(dumped.interrupted);
        let names: Vec<_> = dumped.value.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, ["eth1", "eth2", "eth3"]);
    }

    #[test]
    fn eintr_reply_marks_partial() {
        let mut collector = links();
        collector.push(link_reply(1, NLM_F_MULTIPART)).unwrap();
        collector.push(error_reply(libc::EINTR)).unwrap();

        let dumped = collector.finish();
        assert!(dumped.interrupted);
        assert_eq!(dumped.value.len(), 1);
    }

    #[test]
    fn other_errors_abort_the_dump() {
        let mut collector = links();
        let err = collector.push(error_reply(libc::EPERM)).unwrap_err();
        assert_eq!(err.code(), Some(libc::EPERM));
    }

    #[test]
    fn ack_and_done_are_ignored() {
        let mut collector = links();
        collector
            .push(NetlinkMessage::new(
                NetlinkHeader::default(),
                NetlinkPayload::Error(ErrorMessage::default()),
            ))
            .unwrap();
        collector
            .push(NetlinkMessage::new(
                NetlinkHeader::default(),
                NetlinkPayload::Done(DoneMessage::default()),
            ))
            .unwrap();

        let dumped = collector.finish();
        assert!(!dumped.interrupted);
        assert!(dumped.value.is_empty());
    }
}
