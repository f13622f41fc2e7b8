//! Deterministic identifiers derived from SHA-512.
//!
//! Firewall chains and rule comments must be findable again by a later
//! teardown call, so their names are pure functions of the owning
//! network and instance.

use sha2::{Digest, Sha512};

/// Length of a full SHA-512 digest in hex characters.
pub const MAX_HASH_LEN: usize = 128;

/// Return a string of exactly `length` characters that starts with `prefix`
/// and is padded with the hex SHA-512 digest of `to_hash`.
///
/// Returns `None` if the prefix does not leave room for any hash characters
/// or if `length` exceeds [`MAX_HASH_LEN`].
#[must_use]
pub fn format_hash_with_prefix(length: usize, prefix: &str, to_hash: &str) -> Option<String> {
    if prefix.len() >= length || length > MAX_HASH_LEN {
        return None;
    }

    let digest = hex::encode(Sha512::digest(to_hash.as_bytes()));
    let mut out = String::with_capacity(length);
    out.push_str(prefix);
    out.push_str(&digest[..length - prefix.len()]);
    Some(out)
}
