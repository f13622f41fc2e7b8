//! Integration tests for bridge reconciliation against in-memory kernel and
//! firewall state.

use std::error::Error;
use std::path::Path;

use ipnet::IpNet;
use peta_network::masq::fake::{FakeIptables, FakeNft};
use peta_network::masq::iptables::{NAT_TABLE, POSTROUTING, chain_name};
use peta_network::masq::nftables::MASQ_CHAIN;
use peta_network::masq::{IpFamily, IptablesMasq, MasqBackend, MasqIdentity, NftablesMasq};
use peta_network::netlink::fake::FakeNetlink;
use peta_network::{BridgeConfig, BridgeReconciler, MasqueradeManager, NetworkError, SafeHandle, Sysctl};
use tempfile::TempDir;

struct Host {
    _sysctl_root: TempDir,
    iptables: FakeIptables,
    nft: FakeNft,
    reconciler: BridgeReconciler<FakeNetlink>,
}

fn write_sysctl(root: &Path, name: &str, value: &str) -> std::io::Result<()> {
    let path = root.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, value)
}

fn host() -> Result<Host, Box<dyn Error>> {
    let root = TempDir::new()?;
    write_sysctl(root.path(), "net/ipv4/ip_forward", "0\n")?;
    write_sysctl(root.path(), "net/ipv6/conf/all/forwarding", "0\n")?;
    write_sysctl(root.path(), "net/ipv6/conf/peta0/accept_ra", "1\n")?;

    let iptables = FakeIptables::new();
    let nft = FakeNft::new();
    let masq = MasqueradeManager::new(
        IptablesMasq::new(iptables.clone()),
        NftablesMasq::new(nft.clone()),
    );
    let reconciler = BridgeReconciler::new(
        SafeHandle::new(FakeNetlink::new()),
        Sysctl::new(root.path()),
        masq,
    );

    Ok(Host {
        _sysctl_root: root,
        iptables,
        nft,
        reconciler,
    })
}

fn pods_config(backend: &str) -> Result<BridgeConfig, Box<dyn Error>> {
    let json = format!(
        r#"{{
            "cniVersion": "1.0.0",
            "name": "pods",
            "type": "bridge",
            "bridge": "peta0",
            "isGateway": true,
            "ipMasq": true,
            "ipMasqBackend": "{backend}",
            "mtu": 1450,
            "ipam": {{"type": "host-scope", "podCIDR": ["10.244.3.0/24", "fd00:244:3::/64"]}}
        }}"#
    );
    Ok(BridgeConfig::from_json(&json)?)
}

fn net(s: &str) -> IpNet {
    s.parse().unwrap()
}

#[test_log::test(tokio::test)]
async fn ensure_twice_converges() -> Result<(), Box<dyn Error>> {
    let host = host()?;
    let conf = pods_config("iptables")?;
    let kernel = host.reconciler.handle().inner();

    let first = host.reconciler.setup(&conf).await?;
    let addrs_after_first = kernel.addresses("peta0");
    let second = host.reconciler.setup(&conf).await?;

    assert_eq!(first.index(), second.index());
    assert_eq!(kernel.links().len(), 1);
    assert_eq!(kernel.addresses("peta0"), addrs_after_first);
    assert_eq!(
        addrs_after_first,
        vec![net("10.244.3.1/24"), net("fd00:244:3::1/64")]
    );
    assert_eq!(second.mtu(), 1450);

    let chain = chain_name("pods", "");
    assert_eq!(host.iptables.rules(IpFamily::V4, NAT_TABLE, &chain).len(), 2);
    assert_eq!(host.iptables.rules(IpFamily::V4, NAT_TABLE, POSTROUTING).len(), 1);
    assert_eq!(host.iptables.rules(IpFamily::V6, NAT_TABLE, POSTROUTING).len(), 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn nftables_backend_is_honored() -> Result<(), Box<dyn Error>> {
    let host = host()?;
    host.reconciler.setup(&pods_config("nftables")?).await?;

    assert_eq!(host.nft.rules(MASQ_CHAIN).len(), 2);
    assert!(host.iptables.rules(IpFamily::V4, NAT_TABLE, POSTROUTING).is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn remove_tears_down_both_backends() -> Result<(), Box<dyn Error>> {
    let host = host()?;
    host.reconciler.setup(&pods_config("iptables")?).await?;
    // Rules left behind by an earlier nftables deployment of the same network.
    host.reconciler.masquerade().setup_ip_masq_for_networks(
        Some(MasqBackend::Nftables),
        &[net("10.244.3.1/24")],
        &MasqIdentity::network("pods"),
    )?;
    assert_eq!(host.nft.rules(MASQ_CHAIN).len(), 1);

    host.reconciler.remove(&pods_config("iptables")?).await?;

    assert!(host.reconciler.handle().inner().link("peta0").is_none());
    assert!(!host
        .iptables
        .has_chain(IpFamily::V4, NAT_TABLE, &chain_name("pods", "")));
    assert!(host.iptables.rules(IpFamily::V4, NAT_TABLE, POSTROUTING).is_empty());
    assert!(host.nft.rules(MASQ_CHAIN).is_empty());

    // A second remove finds nothing to do.
    host.reconciler.remove(&pods_config("iptables")?).await?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn masquerade_failure_is_fatal() -> Result<(), Box<dyn Error>> {
    let host = host()?;
    host.iptables.fail_all("iptables: Permission denied (you must be root)");

    let err = host
        .reconciler
        .setup(&pods_config("iptables")?)
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::Firewall { backend: "iptables", .. }));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn unknown_backend_rejected_before_mutation() -> Result<(), Box<dyn Error>> {
    let host = host()?;
    let err = host
        .reconciler
        .setup(&pods_config("ebpf")?)
        .await
        .unwrap_err();

    assert!(matches!(err, NetworkError::Config { .. }));
    assert!(host.reconciler.handle().inner().links().is_empty());
    assert_eq!(host.reconciler.sysctl().get("net.ipv4.ip_forward")?, "0");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn interrupted_dumps_are_retried() -> Result<(), Box<dyn Error>> {
    let host = host()?;
    let kernel = host.reconciler.handle().inner();
    kernel.interrupt_dumps(2);

    host.reconciler.setup(&pods_config("iptables")?).await?;
    assert_eq!(kernel.addresses("peta0").len(), 2);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn masquerade_enabled_on_existing_bridge() -> Result<(), Box<dyn Error>> {
    let host = host()?;
    let mut conf = pods_config("iptables")?;
    conf.ip_masq = false;
    host.reconciler.setup(&conf).await?;
    assert!(host.iptables.rules(IpFamily::V4, NAT_TABLE, POSTROUTING).is_empty());

    // Same bridge and gateways, masquerade now requested.
    conf.ip_masq = true;
    host.reconciler.setup(&conf).await?;

    assert_eq!(host.iptables.rules(IpFamily::V4, NAT_TABLE, POSTROUTING).len(), 1);
    assert_eq!(host.iptables.rules(IpFamily::V6, NAT_TABLE, POSTROUTING).len(), 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn retry_after_masquerade_failure_installs_rules() -> Result<(), Box<dyn Error>> {
    let host = host()?;
    let conf = pods_config("nftables")?;
    host.nft.fail_all("netlink: Error: Could not process rule: Operation not permitted");
    assert!(host.reconciler.setup(&conf).await.is_err());
    // The gateways were assigned before the firewall step failed.
    assert_eq!(host.reconciler.handle().inner().addresses("peta0").len(), 2);

    host.nft.recover();
    host.reconciler.setup(&conf).await?;
    assert_eq!(host.nft.rules(MASQ_CHAIN).len(), 2);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn router_advertisements_disabled_on_bridge() -> Result<(), Box<dyn Error>> {
    let host = host()?;
    let sysctl = host.reconciler.sysctl();
    assert_eq!(sysctl.get("net.ipv6.conf.peta0.accept_ra")?, "1");

    host.reconciler.setup(&pods_config("iptables")?).await?;
    assert_eq!(sysctl.get("net.ipv6.conf.peta0.accept_ra")?, "0");
    Ok(())
}
