//! 802.1Q sub-interfaces on a host link.

use serde::{Deserialize, Serialize};

use crate::config::MAX_VLAN_ID;
use crate::error::{NetworkError, NetworkResult};
use crate::link::{del_link_by_name, link_by_name};
use crate::netlink::{Link, LinkSpec, Netlink, SafeHandle, VlanSpec};

/// A VLAN sub-interface request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VlanConfig {
    /// Host interface the VLAN is stacked on.
    pub master: String,

    /// 802.1Q tag, 0 to 4094.
    #[serde(rename = "vlanId")]
    pub vlan_id: i64,

    /// MTU; 0 inherits the master's. Must not exceed the master's MTU.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub mtu: i64,
}

const fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl VlanConfig {
    /// Request a VLAN on `master`.
    pub fn new(master: impl Into<String>, vlan_id: i64) -> Self {
        Self {
            master: master.into(),
            vlan_id,
            mtu: 0,
        }
    }

    /// Set the MTU.
    #[must_use]
    pub const fn with_mtu(mut self, mtu: i64) -> Self {
        self.mtu = mtu;
        self
    }
}

/// Create VLAN interface `if_name` on the configured master.
///
/// # Errors
///
/// [`NetworkError::Config`] for a missing master, an out-of-range VLAN id
/// or an MTU above the master's; [`NetworkError::LinkNotFound`] if the
/// master does not exist; otherwise the netlink failure.
pub async fn create_vlan<N: Netlink>(
    handle: &SafeHandle<N>,
    if_name: &str,
    conf: &VlanConfig,
) -> NetworkResult<Link> {
    if conf.master.is_empty() {
        return Err(NetworkError::config(
            "\"master\" field is required. It specifies the host interface name to create the VLAN for",
        ));
    }

    let vlan_id = u16::try_from(conf.vlan_id)
        .ok()
        .filter(|id| i64::from(*id) <= MAX_VLAN_ID)
        .ok_or_else(|| {
            NetworkError::config(format!(
                "invalid VLAN ID {} (must be between 0 and {MAX_VLAN_ID} inclusive)",
                conf.vlan_id
            ))
        })?;

    let master = link_by_name(handle, &conf.master).await?;
    let mtu = u32::try_from(conf.mtu)
        .ok()
        .filter(|mtu| *mtu <= master.mtu)
        .ok_or_else(|| {
            NetworkError::config(format!(
                "invalid MTU {}, must be [0, master MTU({})]",
                conf.mtu, master.mtu
            ))
        })?;

    tracing::debug!(
        name = if_name,
        master = %master.name,
        vlan_id,
        mtu,
        "Creating VLAN interface"
    );
    handle
        .link_add(&LinkSpec::Vlan(VlanSpec {
            name: if_name.to_string(),
            parent_index: master.index,
            vlan_id,
            mtu,
        }))
        .await
        .map_err(|e| NetworkError::netlink("create vlan", if_name, e))?;

    let link = link_by_name(handle, if_name).await?;
    tracing::info!(name = if_name, master = %master.name, vlan_id, "VLAN interface created");
    Ok(link)
}

/// Delete VLAN interface `if_name`. A missing interface is not an error.
///
/// # Errors
///
/// The netlink failure for anything other than a missing link.
pub async fn delete_vlan<N: Netlink>(handle: &SafeHandle<N>, if_name: &str) -> NetworkResult<()> {
    match del_link_by_name(handle, if_name).await {
        Err(e) if e.is_link_not_found() => {
            tracing::debug!(name = if_name, "VLAN interface already gone");
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::LinkKind;
    use crate::netlink::fake::FakeNetlink;

    fn handle_with_eth0(mtu: u32) -> (SafeHandle<FakeNetlink>, u32) {
        let fake = FakeNetlink::new();
        let index = fake.insert_device("eth0", mtu);
        (SafeHandle::new(fake), index)
    }

    #[tokio::test]
    async fn creates_vlan_on_master() {
        let (handle, eth0) = handle_with_eth0(9000);
        let link = create_vlan(&handle, "eth0.100", &VlanConfig::new("eth0", 100).with_mtu(1500))
            .await
            .unwrap();

        assert_eq!(link.kind, LinkKind::Vlan { id: 100 });
        assert_eq!(link.parent_index, Some(eth0));
        assert_eq!(link.mtu, 1500);
    }

    #[tokio::test]
    async fn zero_mtu_inherits_master() {
        let (handle, _) = handle_with_eth0(1400);
        let link = create_vlan(&handle, "v0", &VlanConfig::new("eth0", 0))
            .await
            .unwrap();
        assert_eq!(link.mtu, 1400);
    }

    #[tokio::test]
    async fn rejects_bad_requests_before_mutation() {
        let (handle, _) = handle_with_eth0(1500);

        let err = create_vlan(&handle, "v", &VlanConfig::new("", 10)).await.unwrap_err();
        assert!(err.to_string().contains("\"master\" field is required"));

        for id in [-1, 4095] {
            let err = create_vlan(&handle, "v", &VlanConfig::new("eth0", id)).await.unwrap_err();
            assert!(matches!(err, NetworkError::Config { .. }), "{id}");
        }

        let err = create_vlan(&handle, "v", &VlanConfig::new("eth0", 10).with_mtu(9000))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("master MTU(1500)"));

        let err = create_vlan(&handle, "v", &VlanConfig::new("eth0", 10).with_mtu(-5))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::Config { .. }));

        assert_eq!(handle.inner().links().len(), 1);
    }

    #[tokio::test]
    async fn missing_master_is_link_not_found() {
        let (handle, _) = handle_with_eth0(1500);
        let err = create_vlan(&handle, "v", &VlanConfig::new("bond0", 10))
            .await
            .unwrap_err();
        assert!(err.is_link_not_found());
    }

    #[tokio::test]
    async fn delete_tolerates_missing() {
        let (handle, _) = handle_with_eth0(1500);
        create_vlan(&handle, "eth0.5", &VlanConfig::new("eth0", 5)).await.unwrap();

        delete_vlan(&handle, "eth0.5").await.unwrap();
        assert!(handle.inner().link("eth0.5").is_none());
        delete_vlan(&handle, "eth0.5").await.unwrap();
    }

    #[test]
    fn config_field_names() {
        let conf: VlanConfig =
            serde_json::from_str(r#"{"master": "eth0", "vlanId": 42, "mtu": 1400}"#).unwrap();
        assert_eq!(conf, VlanConfig::new("eth0", 42).with_mtu(1400));
    }
}
