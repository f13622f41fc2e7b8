//! Integration tests for address pools surviving a restart.

use std::collections::BTreeSet;
use std::error::Error;
use std::net::IpAddr;

use ipnet::IpNet;
use peta_common::PetaPaths;
use peta_network::ipam::Pool;
use peta_network::{BridgeConfig, HostScopeAllocator, IpamError, NetworkError, SnapshotStore};
use tempfile::TempDir;

#[test]
fn allocations_survive_restart() -> Result<(), Box<dyn Error>> {
    let temp = TempDir::new()?;
    let store = SnapshotStore::new(PetaPaths::with_root(temp.path()));
    let cidr: IpNet = "10.88.0.0/28".parse()?;
    let pool = Pool::host_scope();

    let before = HostScopeAllocator::new(cidr);
    let fixed: IpAddr = "10.88.0.9".parse()?;
    before.allocate(fixed, "db", &pool)?;
    let mut taken = BTreeSet::from([fixed]);
    for owner in ["a", "b", "c"] {
        taken.insert(before.allocate_next(owner, &pool)?.ip);
    }
    store.save("pods", before.range())?;

    // Restarted process: fresh allocator, state comes from disk.
    let after = HostScopeAllocator::new(cidr);
    assert!(store.load("pods", after.range())?);

    let mut restored = BTreeSet::new();
    after.range().for_each(|ip| {
        restored.insert(ip);
    });
    assert_eq!(restored, taken);
    assert_eq!(after.allocate(fixed, "other", &pool), Err(IpamError::Allocated));

    let (_, status) = after.dump();
    assert_eq!(status, "4/14 allocated from 10.88.0.0/28");
    Ok(())
}

#[test]
fn exhausted_pool_reports_full_until_release() -> Result<(), Box<dyn Error>> {
    let alloc = HostScopeAllocator::new("192.168.50.0/29".parse()?);
    let pool = Pool::host_scope();

    let mut ips = Vec::new();
    for i in 0..6 {
        ips.push(alloc.allocate_next(&format!("w{i}"), &pool)?.ip);
    }
    assert_eq!(alloc.allocate_next("late", &pool), Err(IpamError::Full));

    alloc.release(ips[2], &pool);
    assert_eq!(alloc.allocate_next("late", &pool)?.ip, ips[2]);
    Ok(())
}

#[test]
fn snapshot_for_other_subnet_is_rejected() -> Result<(), Box<dyn Error>> {
    let temp = TempDir::new()?;
    let store = SnapshotStore::new(PetaPaths::with_root(temp.path()));

    let old = HostScopeAllocator::new("10.1.0.0/24".parse()?);
    old.allocate_next("x", &Pool::host_scope())?;
    store.save("pods", old.range())?;

    // The network was reconfigured with a different CIDR.
    let new = HostScopeAllocator::new("10.2.0.0/24".parse()?);
    let err = store.load("pods", new.range()).unwrap_err();
    assert!(matches!(err, NetworkError::Ipam(IpamError::MismatchedNetwork)));
    assert_eq!(new.range().used(), 0);

    store.delete("pods")?;
    assert!(!store.load("pods", new.range())?);
    Ok(())
}

#[test]
fn network_config_file_round_trip() -> Result<(), Box<dyn Error>> {
    let temp = TempDir::new()?;
    let paths = PetaPaths::with_root(temp.path());
    paths.create_dirs()?;

    let path = paths.network_config("pods");
    std::fs::write(
        &path,
        r#"{"name": "pods", "type": "bridge", "bridge": "peta0",
            "ipam": {"type": "host-scope", "podCIDR": ["10.244.0.0/24"]}}"#,
    )?;

    let conf = BridgeConfig::load(&paths, "pods")?;
    let plan = conf.validate()?;
    assert_eq!(plan.bridge, "peta0");
    assert!(plan.layer3);
    assert_eq!(plan.pod_cidrs, vec!["10.244.0.0/24".parse::<IpNet>()?]);

    // A file whose contents name another network is refused.
    std::fs::write(paths.network_config("edge"), r#"{"name": "pods"}"#)?;
    let err = BridgeConfig::load(&paths, "edge").unwrap_err();
    assert!(matches!(err, NetworkError::Config { .. }));
    assert!(err.to_string().contains(r#"expected "edge""#));
    Ok(())
}
