//! Standard filesystem paths for PETA.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for PETA state.
pub static PETA_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("PETA_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/peta"))
});

/// Standard paths used by the network core.
#[derive(Debug, Clone)]
pub struct PetaPaths {
    /// Root data directory (default: /var/lib/peta).
    pub root: PathBuf,
}

impl PetaPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding persisted IPAM snapshots.
    #[must_use]
    pub fn ipam(&self) -> PathBuf {
        self.root.join("ipam")
    }

    /// Snapshot file for one network's address range.
    #[must_use]
    pub fn ipam_snapshot(&self, network: &str) -> PathBuf {
        self.ipam().join(format!("{network}.json"))
    }

    /// Directory for declared network configurations.
    #[must_use]
    pub fn networks(&self) -> PathBuf {
        self.root.join("networks")
    }

    /// Declared configuration file for a network.
    #[must_use]
    pub fn network_config(&self, network: &str) -> PathBuf {
        self.networks().join(format!("{network}.json"))
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.ipam())?;
        std::fs::create_dir_all(self.networks())?;
        tracing::debug!(root = %self.root.display(), "Created PETA directories");
        Ok(())
    }
}

impl Default for PetaPaths {
    fn default() -> Self {
        Self::with_root(PETA_ROOT.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_root() {
        let paths = PetaPaths::with_root("/tmp/peta-test");
        assert_eq!(paths.ipam(), PathBuf::from("/tmp/peta-test/ipam"));
        assert_eq!(paths.networks(), PathBuf::from("/tmp/peta-test/networks"));
    }

    #[test]
    fn snapshot_path() {
        let paths = PetaPaths::with_root("/tmp/peta-test");
        assert_eq!(
            paths.ipam_snapshot("peta-cni"),
            PathBuf::from("/tmp/peta-test/ipam/peta-cni.json")
        );
        assert_eq!(
            paths.network_config("peta-cni"),
            PathBuf::from("/tmp/peta-test/networks/peta-cni.json")
        );
    }
}
