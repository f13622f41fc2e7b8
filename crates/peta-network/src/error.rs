//! Error types for network provisioning.

use miette::Diagnostic;
use peta_common::PetaError;
use thiserror::Error;

use crate::ipam::IpamError;
use crate::netlink::NetlinkError;

/// Result type alias using [`NetworkError`].
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Errors returned by bridge, VLAN, forwarding and masquerade operations.
///
/// Every kernel or firewall failure names the step that failed and the
/// resource it was acting on.
#[derive(Error, Diagnostic, Debug)]
pub enum NetworkError {
    /// The declared configuration is invalid. Raised before any mutation.
    #[error("Invalid network configuration: {message}")]
    #[diagnostic(code(peta::network::config))]
    Config {
        /// What is wrong with the configuration.
        message: String,
    },

    /// A netlink request failed.
    #[error("{operation} {target:?} failed: {source}")]
    #[diagnostic(code(peta::network::netlink))]
    Netlink {
        /// The operation that was attempted (e.g. "create bridge").
        operation: &'static str,
        /// The link or address the operation targeted.
        target: String,
        /// Underlying netlink failure.
        #[source]
        source: NetlinkError,
    },

    /// The named link does not exist.
    #[error("Link not found: {name}")]
    #[diagnostic(code(peta::network::link_not_found))]
    LinkNotFound {
        /// The link name that was looked up.
        name: String,
    },

    /// A link with the requested name exists but has a different type.
    #[error("{name:?} already exists but is not a bridge (kind: {kind})")]
    #[diagnostic(
        code(peta::network::not_a_bridge),
        help("Delete the existing link or choose a different bridge name")
    )]
    NotABridge {
        /// The link name.
        name: String,
        /// The kind the kernel reported for it.
        kind: String,
    },

    /// Reading or writing a sysctl failed.
    #[error("sysctl {key} failed: {source}")]
    #[diagnostic(code(peta::network::sysctl))]
    Sysctl {
        /// Normalized sysctl key (e.g. `net/ipv4/ip_forward`).
        key: String,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// A firewall backend command failed.
    #[error("{backend} {operation} failed: {message}")]
    #[diagnostic(code(peta::network::firewall))]
    Firewall {
        /// Backend name (`iptables` or `nftables`).
        backend: &'static str,
        /// The operation that was attempted.
        operation: String,
        /// Backend diagnostic output.
        message: String,
    },

    /// Teardown failed on one or more backends.
    #[error("masquerade teardown failed:\n{}", .errors.join("\n"))]
    #[diagnostic(code(peta::network::teardown))]
    Teardown {
        /// One message per failed backend/network.
        errors: Vec<String>,
    },

    /// Address allocation failed.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Ipam(#[from] IpamError),

    /// Shared error (I/O, serialization).
    #[error(transparent)]
    #[diagnostic(transparent)]
    Common(#[from] PetaError),
}

impl NetworkError {
    /// Build a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Wrap a netlink failure with the step and resource it belongs to.
    pub fn netlink(operation: &'static str, target: impl Into<String>, source: NetlinkError) -> Self {
        Self::Netlink {
            operation,
            target: target.into(),
            source,
        }
    }

    /// Whether this error means the target link is absent.
    #[must_use]
    pub const fn is_link_not_found(&self) -> bool {
        matches!(self, Self::LinkNotFound { .. })
    }
}

impl From<serde_json::Error> for NetworkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Common(err.into())
    }
}

impl From<serde_yaml::Error> for NetworkError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Common(err.into())
    }
}

impl From<std::io::Error> for NetworkError {
    fn from(err: std::io::Error) -> Self {
        Self::Common(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netlink_error_names_step_and_target() {
        let err = NetworkError::netlink(
            "create bridge",
            "br0",
            NetlinkError::Errno {
                code: libc::EPERM,
                message: "Operation not permitted".to_string(),
            },
        );
        let text = err.to_string();
        assert!(text.contains("create bridge"));
        assert!(text.contains("\"br0\""));
    }

    #[test]
    fn teardown_joins_messages() {
        let err = NetworkError::Teardown {
            errors: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(err.to_string(), "masquerade teardown failed:\na\nb");
    }

    #[test]
    fn link_not_found_is_distinguishable() {
        let err = NetworkError::LinkNotFound {
            name: "vlan100".to_string(),
        };
        assert!(err.is_link_not_found());
        assert!(!NetworkError::config("x").is_link_not_found());
    }
}
