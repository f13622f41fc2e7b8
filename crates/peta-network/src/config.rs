//! Declarative bridge network configuration.
//!
//! Field names follow the CNI bridge plugin so existing network files load
//! unchanged. [`BridgeConfig::validate`] turns the raw document into a
//! [`BridgePlan`]; every configuration error surfaces there, before any
//! kernel state is touched.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use ipnet::IpNet;
use peta_common::PetaPaths;
use serde::{Deserialize, Serialize};

use crate::error::{NetworkError, NetworkResult};
use crate::masq::MasqBackend;

/// Bridge name used when none is configured.
pub const DEFAULT_BRIDGE: &str = "br0";

/// Highest usable 802.1Q VLAN id.
pub const MAX_VLAN_ID: i64 = 4094;

/// Fields shared by every network configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    /// CNI spec version.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cni_version: String,

    /// Network name; also the masquerade identity.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Plugin type.
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub plugin: String,

    /// Capability switches.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capabilities: BTreeMap<String, bool>,

    /// Address management block.
    #[serde(default)]
    pub ipam: Ipam,
}

/// Address management block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipam {
    /// IPAM type (e.g. `host-local`). Empty means layer 2 only.
    #[serde(default, rename = "type")]
    pub kind: String,

    /// Pool sizing and CIDRs.
    #[serde(flatten)]
    pub spec: IpamSpec,
}

impl Ipam {
    /// Whether no IPAM is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kind.is_empty()
    }
}

/// Pool definition for a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpamSpec {
    /// CIDRs available to the node.
    #[serde(default, rename = "podCIDR")]
    pub pod_cidr: Vec<String>,

    /// Minimum addresses to allocate at bootstrap.
    #[serde(default)]
    pub min_allocate: u32,

    /// Maximum addresses the node may hold.
    #[serde(default)]
    pub max_allocate: u32,

    /// Addresses kept available ahead of demand.
    #[serde(default)]
    pub pre_allocate: u32,

    /// Extra addresses allowed beyond the pre-allocation watermark.
    #[serde(default)]
    pub max_above_watermark: u32,
}

/// One VLAN trunk entry: a single id, an inclusive range, or both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanTrunk {
    /// Range start.
    #[serde(default, rename = "minID", skip_serializing_if = "Option::is_none")]
    pub min_id: Option<i64>,

    /// Range end, inclusive.
    #[serde(default, rename = "maxID", skip_serializing_if = "Option::is_none")]
    pub max_id: Option<i64>,

    /// Single VLAN id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
}

/// CNI runtime arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Args {
    /// Plugin arguments.
    #[serde(default)]
    pub cni: CniArgs,
}

/// Plugin arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniArgs {
    /// Requested MAC address.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac: String,
}

/// Values injected by the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// MAC override.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac: String,
}

/// Declared bridge network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Common network fields.
    #[serde(flatten)]
    pub net: NetConf,

    /// Bridge device name.
    #[serde(default, rename = "bridge")]
    pub bridge: String,

    /// Assign the gateway address to the bridge.
    #[serde(default)]
    pub is_gateway: bool,

    /// Make the bridge the host's default gateway. Implies `is_gateway`.
    #[serde(default)]
    pub is_default_gateway: bool,

    /// Replace an existing address instead of failing.
    #[serde(default)]
    pub force_address: bool,

    /// Install masquerade rules for the pod CIDRs.
    #[serde(default)]
    pub ip_masq: bool,

    /// `iptables` or `nftables`; unset picks automatically.
    #[serde(
        default,
        alias = "IPMasqBackend",
        skip_serializing_if = "Option::is_none"
    )]
    pub ip_masq_backend: Option<String>,

    /// Bridge MTU; 0 keeps the kernel default.
    #[serde(default)]
    pub mtu: u32,

    /// Hairpin mode on bridge ports.
    #[serde(default)]
    pub hairpin_mode: bool,

    /// Promiscuous mode on the bridge.
    #[serde(default)]
    pub promisc_mode: bool,

    /// Access VLAN id, 0 for none.
    #[serde(default)]
    pub vlan: i64,

    /// Trunk VLANs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_trunk: Option<Vec<VlanTrunk>>,

    /// Keep VLAN 1 on ports when filtering.
    #[serde(default)]
    pub preserve_default_vlan: bool,

    /// MAC spoof checking.
    #[serde(default, rename = "macspoofchk", skip_serializing_if = "is_false")]
    pub mac_spoof_check: bool,

    /// IPv6 duplicate address detection.
    #[serde(default, rename = "enabledad", skip_serializing_if = "is_false")]
    pub enable_dad: bool,

    /// Skip the container-side interface.
    #[serde(default, skip_serializing_if = "is_false")]
    pub disable_container_interface: bool,

    /// Isolate bridge ports from each other.
    #[serde(default, skip_serializing_if = "is_false")]
    pub port_isolation: bool,

    /// CNI args.
    #[serde(default)]
    pub args: Args,

    /// Runtime-provided values.
    #[serde(default)]
    pub runtime_config: RuntimeConfig,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_false(b: &bool) -> bool {
    !*b
}

/// A validated bridge configuration, ready to reconcile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgePlan {
    /// Network name used as the masquerade identity.
    pub network: String,
    /// Bridge device name.
    pub bridge: String,
    /// MTU; 0 keeps the kernel default.
    pub mtu: u32,
    /// Enable promiscuous mode.
    pub promisc: bool,
    /// Hairpin mode on ports.
    pub hairpin: bool,
    /// Assign gateway addresses.
    pub is_gateway: bool,
    /// Default gateway mode.
    pub is_default_gateway: bool,
    /// Access VLAN.
    pub vlan: u16,
    /// Expanded, sorted trunk VLANs.
    pub vlans: Vec<u16>,
    /// Enable 802.1Q filtering on the bridge.
    pub vlan_filtering: bool,
    /// Keep VLAN 1 on ports.
    pub preserve_default_vlan: bool,
    /// Validated MAC override.
    pub mac: Option<String>,
    /// Pod CIDRs when layer 3 (IPAM configured); empty otherwise.
    pub pod_cidrs: Vec<IpNet>,
    /// Whether IPAM is configured.
    pub layer3: bool,
    /// Install masquerade rules.
    pub masquerade: bool,
    /// Requested masquerade backend; `None` selects automatically.
    pub masq_backend: Option<MasqBackend>,
}

impl BridgeConfig {
    /// Parse a JSON document.
    ///
    /// # Errors
    ///
    /// Returns a serialization error for malformed input.
    pub fn from_json(content: &str) -> NetworkResult<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Parse a YAML document.
    ///
    /// # Errors
    ///
    /// Returns a serialization error for malformed input.
    pub fn from_yaml(content: &str) -> NetworkResult<Self> {
        // Through a JSON value so flattened fields see the same shapes as JSON.
        let value: serde_json::Value = serde_yaml::from_str(content)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Load a file, choosing the format by extension (`.yaml`/`.yml`, else JSON).
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or malformed.
    pub fn from_file(path: &Path) -> NetworkResult<Self> {
        let content = fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();

        match ext.as_str() {
            "yaml" | "yml" => Self::from_yaml(&content),
            _ => Self::from_json(&content),
        }
    }

    /// Load the declared configuration of `network` from its file under
    /// `paths`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or malformed, or if it
    /// declares a different network name.
    pub fn load(paths: &PetaPaths, network: &str) -> NetworkResult<Self> {
        let path = paths.network_config(network);
        let conf = Self::from_file(&path)?;
        if conf.net.name != network {
            return Err(NetworkError::config(format!(
                "{} declares network {:?}, expected {network:?}",
                path.display(),
                conf.net.name
            )));
        }
        tracing::debug!(network, path = %path.display(), "Loaded network configuration");
        Ok(conf)
    }

    /// Bridge name with the default applied.
    #[must_use]
    pub fn bridge_name(&self) -> &str {
        if self.bridge.is_empty() {
            DEFAULT_BRIDGE
        } else {
            &self.bridge
        }
    }

    /// Whether IPAM is configured, which puts the bridge in layer 3 mode.
    #[must_use]
    pub fn is_layer3(&self) -> bool {
        !self.net.ipam.is_empty()
    }

    /// Check the configuration and resolve defaults.
    ///
    /// # Errors
    ///
    /// [`NetworkError::Config`] for conflicting flags, out-of-range VLAN ids,
    /// malformed trunks, CIDRs or MAC, or an unknown masquerade backend.
    pub fn validate(&self) -> NetworkResult<BridgePlan> {
        if !(0..=MAX_VLAN_ID).contains(&self.vlan) {
            return Err(NetworkError::config(format!(
                "invalid VLAN ID {} (must be between 0 and {MAX_VLAN_ID})",
                self.vlan
            )));
        }

        let vlan = u16::try_from(self.vlan).map_err(|_| {
            NetworkError::config(format!("invalid VLAN ID {}", self.vlan))
        })?;

        let vlans = match &self.vlan_trunk {
            Some(trunk) => collect_vlan_trunk(trunk).map_err(|e| {
                NetworkError::config(format!("failed to parse vlan trunks: {e}"))
            })?,
            None => Vec::new(),
        };

        let mac = match self.runtime_config.mac.as_str() {
            "" => None,
            mac => {
                parse_mac(mac).ok_or_else(|| {
                    NetworkError::config(format!("invalid runtime MAC address {mac:?}"))
                })?;
                Some(mac.to_string())
            }
        };

        let layer3 = self.is_layer3();
        if layer3 && self.disable_container_interface {
            return Err(NetworkError::config(
                "cannot use IPAM when DisableContainerInterface flag is set",
            ));
        }

        if self.hairpin_mode && self.promisc_mode {
            return Err(NetworkError::config(
                "cannot set hairpin mode and promiscuous mode at the same time",
            ));
        }

        let pod_cidrs = if layer3 {
            self.net
                .ipam
                .spec
                .pod_cidr
                .iter()
                .map(|cidr| {
                    cidr.parse::<IpNet>().map_err(|e| {
                        NetworkError::config(format!("error parsing subnet {cidr:?}: {e}"))
                    })
                })
                .collect::<NetworkResult<Vec<_>>>()?
        } else {
            Vec::new()
        };

        let masq_backend = self
            .ip_masq_backend
            .as_deref()
            .map(str::parse::<MasqBackend>)
            .transpose()?;

        Ok(BridgePlan {
            network: self.net.name.clone(),
            bridge: self.bridge_name().to_string(),
            mtu: self.mtu,
            promisc: self.promisc_mode,
            hairpin: self.hairpin_mode,
            is_gateway: self.is_gateway || self.is_default_gateway,
            is_default_gateway: self.is_default_gateway,
            vlan,
            vlans,
            vlan_filtering: self.vlan != 0 || self.vlan_trunk.is_some(),
            preserve_default_vlan: self.preserve_default_vlan,
            mac,
            pod_cidrs,
            layer3,
            masquerade: self.ip_masq,
            masq_backend,
        })
    }
}

/// Expand trunk entries into a sorted, deduplicated VLAN list.
///
/// Ranges need both ends, each within 1..=4094 and `min <= max`. A single
/// `id` must be within 1..=4094.
///
/// # Errors
///
/// Returns a message describing the first invalid entry.
pub fn collect_vlan_trunk(trunk: &[VlanTrunk]) -> Result<Vec<u16>, String> {
    let valid = |v: i64| (1..=MAX_VLAN_ID).contains(&v);
    let mut vlans = BTreeSet::new();

    for item in trunk {
        match (item.min_id, item.max_id) {
            (Some(min), Some(max)) => {
                if !valid(min) {
                    return Err("incorrect trunk minID parameter".to_string());
                }
                if !valid(max) {
                    return Err("incorrect trunk maxID parameter".to_string());
                }
                if max < min {
                    return Err("minID is greater than maxID in trunk parameter".to_string());
                }
                vlans.extend(min..=max);
            }
            (None, Some(_)) => {
                return Err(
                    "minID and maxID should be configured simultaneously, minID is missing"
                        .to_string(),
                );
            }
            (Some(_), None) => {
                return Err(
                    "minID and maxID should be configured simultaneously, maxID is missing"
                        .to_string(),
                );
            }
            (None, None) => {}
        }

        if let Some(id) = item.id {
            if !valid(id) {
                return Err("incorrect trunk id parameter".to_string());
            }
            vlans.insert(id);
        }
    }

    Ok(vlans
        .into_iter()
        .filter_map(|v| u16::try_from(v).ok())
        .collect())
}

/// Parse a colon- or dash-separated 6-octet MAC address.
#[must_use]
pub fn parse_mac(mac: &str) -> Option<[u8; 6]> {
    let sep = if mac.contains('-') { '-' } else { ':' };
    let mut out = [0u8; 6];
    let mut parts = mac.split(sep);
    for byte in &mut out {
        let part = parts.next()?;
        if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    parts.next().is_none().then_some(out)
}
