//! # peta-common
//!
//! Shared utilities and types for the PETA network core.
//!
//! This crate provides common functionality used across all PETA crates:
//! - Standard filesystem paths
//! - Deterministic identifier hashing
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod hash;
pub mod paths;

pub use error::{PetaError, PetaResult};
pub use hash::{MAX_HASH_LEN, format_hash_with_prefix};
pub use paths::PetaPaths;
