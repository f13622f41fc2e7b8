//! Kernel parameter access through `/proc/sys`.

use std::path::{Path, PathBuf};

use crate::error::{NetworkError, NetworkResult};

/// Default sysctl mount point.
pub const PROC_SYS: &str = "/proc/sys";

/// Reads and writes kernel parameters under a sysctl root.
///
/// Names may be given in dotted (`net.ipv4.ip_forward`) or slashed
/// (`net/ipv4/ip_forward`) form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sysctl {
    root: PathBuf,
}

impl Default for Sysctl {
    fn default() -> Self {
        Self::new(PROC_SYS)
    }
}

impl Sysctl {
    /// Access sysctls under `root` instead of `/proc/sys`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The sysctl root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file backing `name`.
    #[must_use]
    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(normalize(name))
    }

    /// Read a parameter, without the trailing newline.
    ///
    /// # Errors
    ///
    /// [`NetworkError::Sysctl`] if the file cannot be read.
    pub fn get(&self, name: &str) -> NetworkResult<String> {
        let key = normalize(name);
        let value = std::fs::read_to_string(self.root.join(&key))
            .map_err(|source| NetworkError::Sysctl { key, source })?;
        Ok(value.trim_end().to_string())
    }

    /// Write a parameter.
    ///
    /// # Errors
    ///
    /// [`NetworkError::Sysctl`] if the file cannot be written.
    pub fn set(&self, name: &str, value: &str) -> NetworkResult<()> {
        let key = normalize(name);
        std::fs::write(self.root.join(&key), value)
            .map_err(|source| NetworkError::Sysctl { key: key.clone(), source })?;
        tracing::debug!(key = %key, value, "Set sysctl");
        Ok(())
    }
}

/// Convert a sysctl name to its path form.
///
/// If the first separator is a dot, dots and slashes are swapped, so
/// `net.ipv4.conf.eth0/100.rp_filter` becomes
/// `net/ipv4/conf/eth0.100/rp_filter`. Names already in slash form are
/// returned unchanged.
#[must_use]
pub fn normalize(name: &str) -> String {
    match name.find(['.', '/']) {
        Some(i) if name.as_bytes()[i] == b'.' => name
            .chars()
            .map(|c| match c {
                '.' => '/',
                '/' => '.',
                c => c,
            })
            .collect(),
        _ => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn normalize_dotted_and_slashed() {
        assert_eq!(normalize("net.ipv4.ip_forward"), "net/ipv4/ip_forward");
        assert_eq!(
            normalize("net.ipv4.conf.eth0/100.rp_filter"),
            "net/ipv4/conf/eth0.100/rp_filter"
        );
        assert_eq!(
            normalize("net/ipv4/conf/eth0.100/rp_filter"),
            "net/ipv4/conf/eth0.100/rp_filter"
        );
        assert_eq!(normalize("kernel"), "kernel");
    }

    #[test]
    fn get_and_set_under_root() {
        let temp = tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("net/ipv4")).unwrap();
        std::fs::write(temp.path().join("net/ipv4/ip_forward"), "0\n").unwrap();

        let sysctl = Sysctl::new(temp.path());
        assert_eq!(sysctl.get("net.ipv4.ip_forward").unwrap(), "0");
        sysctl.set("net.ipv4.ip_forward", "1").unwrap();
        assert_eq!(sysctl.get("net/ipv4/ip_forward").unwrap(), "1");
    }

    #[test]
    fn missing_key_names_it() {
        let temp = tempdir().unwrap();
        let err = Sysctl::new(temp.path()).get("net.ipv6.conf.all.forwarding").unwrap_err();
        assert!(err.to_string().contains("net/ipv6/conf/all/forwarding"));
    }
}
