//! Range snapshot persistence.
//!
//! Snapshots are written as JSON next to the rest of the PETA state so a
//! restarted process can resume with the same allocations.

use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ipnet::IpNet;
use peta_common::{PetaError, PetaPaths};
use serde::{Deserialize, Serialize};

use super::range::CidrRange;
use crate::error::NetworkResult;

/// On-disk form of a range snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSnapshot {
    /// Subnet the snapshot was taken from.
    pub range: IpNet,
    /// Base64 of the raw allocation bytes.
    pub data: String,
}

impl RangeSnapshot {
    /// Capture the current state of `range`.
    #[must_use]
    pub fn capture(range: &CidrRange) -> Self {
        let (_, data) = range.snapshot();
        Self {
            range: range.cidr(),
            data: STANDARD.encode(data),
        }
    }

    /// Apply this snapshot to `range`.
    ///
    /// # Errors
    ///
    /// Fails if the data is not valid base64 or the subnets differ.
    pub fn apply(&self, range: &CidrRange) -> NetworkResult<()> {
        let data = STANDARD
            .decode(&self.data)
            .map_err(|e| PetaError::Serialization(format!("invalid snapshot data: {e}")))?;
        range.restore(&self.range, &data)?;
        Ok(())
    }
}

/// Loads and saves range snapshots keyed by network name.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    paths: PetaPaths,
}

impl SnapshotStore {
    /// Create a store rooted at `paths`.
    #[must_use]
    pub const fn new(paths: PetaPaths) -> Self {
        Self { paths }
    }

    /// Path of the snapshot file for `network`.
    #[must_use]
    pub fn path(&self, network: &str) -> PathBuf {
        self.paths.ipam_snapshot(network)
    }

    /// Persist the state of `range` under `network`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, network: &str, range: &CidrRange) -> NetworkResult<()> {
        let path = self.path(network);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(&RangeSnapshot::capture(range))?;
        // Write-then-rename so a crash never leaves a truncated snapshot.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;

        tracing::debug!(network, path = %path.display(), "Saved IPAM snapshot");
        Ok(())
    }

    /// Restore `range` from the snapshot saved under `network`.
    ///
    /// Returns `false` if no snapshot exists.
    ///
    /// # Errors
    ///
    /// Fails if the file is unreadable or belongs to a different subnet.
    pub fn load(&self, network: &str, range: &CidrRange) -> NetworkResult<bool> {
        let path = self.path(network);
        if !path.exists() {
            return Ok(false);
        }

        let json = std::fs::read_to_string(&path)?;
        let snapshot: RangeSnapshot = serde_json::from_str(&json)?;
        snapshot.apply(range)?;

        tracing::debug!(
            network,
            path = %path.display(),
            used = range.used(),
            "Loaded IPAM snapshot"
        );
        Ok(true)
    }

    /// Remove the snapshot for `network`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn delete(&self, network: &str) -> NetworkResult<()> {
        let path = self.path(network);
        if path.exists() {
            std::fs::remove_file(&path)?;
            tracing::debug!(network, path = %path.display(), "Deleted IPAM snapshot");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkError;
    use crate::ipam::IpamError;
    use std::net::IpAddr;
    use tempfile::tempdir;

    #[test]
    fn save_and_load_survives_restart() {
        let temp = tempdir().unwrap();
        let store = SnapshotStore::new(PetaPaths::with_root(temp.path()));
        let cidr: IpNet = "10.40.0.0/24".parse().unwrap();

        let range = CidrRange::new(cidr);
        let ip: IpAddr = "10.40.0.77".parse().unwrap();
        range.allocate(ip).unwrap();
        store.save("peta-cni", &range).unwrap();

        let restarted = CidrRange::new(cidr);
        assert!(store.load("peta-cni", &restarted).unwrap());
        assert!(restarted.has(ip));
        assert_eq!(restarted.used(), 1);
    }

    #[test]
    fn load_missing_is_false() {
        let temp = tempdir().unwrap();
        let store = SnapshotStore::new(PetaPaths::with_root(temp.path()));
        let range = CidrRange::new("10.40.0.0/24".parse().unwrap());
        assert!(!store.load("nothing", &range).unwrap());
    }

    #[test]
    fn load_into_resized_range_fails() {
        let temp = tempdir().unwrap();
        let store = SnapshotStore::new(PetaPaths::with_root(temp.path()));
        let range = CidrRange::new("10.40.0.0/24".parse().unwrap());
        range.allocate_next().unwrap();
        store.save("net", &range).unwrap();

        let resized = CidrRange::new("10.40.0.0/23".parse().unwrap());
        let err = store.load("net", &resized).unwrap_err();
        assert!(matches!(
            err,
            NetworkError::Ipam(IpamError::MismatchedNetwork)
        ));
        assert_eq!(resized.used(), 0);

        store.delete("net").unwrap();
        assert!(!store.path("net").exists());
    }
}
