//! IP address management.
//!
//! A [`CidrRange`] maps a subnet onto an [`AllocationBitmap`]; the
//! [`HostScopeAllocator`] adds ownership bookkeeping on top, and
//! [`SnapshotStore`] persists range state across restarts.

pub mod allocator;
pub mod bitmap;
pub mod range;
pub mod store;

use miette::Diagnostic;
use thiserror::Error;

pub use allocator::{AllocationResult, HostScopeAllocator, Pool};
pub use bitmap::{AllocationBitmap, Allocator, BitStrategy, RandomScan, Snapshottable};
pub use range::{CidrRange, count_ips_in_cidr, indexed_ip, range_size};
pub use store::{RangeSnapshot, SnapshotStore};

/// Address allocation errors.
#[derive(Error, Diagnostic, Debug, Clone, PartialEq, Eq)]
pub enum IpamError {
    /// No usable addresses remain.
    #[error("range is full")]
    #[diagnostic(code(peta::ipam::full))]
    Full,

    /// The requested address is already taken.
    #[error("provided IP is already allocated")]
    #[diagnostic(code(peta::ipam::allocated))]
    Allocated,

    /// The address lies outside the usable part of the range.
    #[error("provided IP is not in the valid range. The range of valid IPs is {valid_range}")]
    #[diagnostic(code(peta::ipam::not_in_range))]
    NotInRange {
        /// The CIDR the range covers.
        valid_range: String,
    },

    /// A snapshot was restored against a different subnet.
    #[error("the provided network does not match the current range")]
    #[diagnostic(code(peta::ipam::mismatched_network))]
    MismatchedNetwork,

    /// A bitmap snapshot carries a different range tag.
    #[error("the provided range {actual:?} does not match the current range {expected:?}")]
    #[diagnostic(code(peta::ipam::range_mismatch))]
    RangeMismatch {
        /// Tag of the bitmap being restored into.
        expected: String,
        /// Tag carried by the snapshot.
        actual: String,
    },

    /// An indexed address would fall outside its subnet.
    #[error("can't generate IP with index {index} from subnet {subnet}: subnet too small")]
    #[diagnostic(code(peta::ipam::index_out_of_subnet))]
    IndexOutOfSubnet {
        /// Requested index.
        index: u128,
        /// The subnet.
        subnet: String,
    },
}
