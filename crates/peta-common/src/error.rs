//! Common error types for PETA.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`PetaError`].
pub type PetaResult<T> = Result<T, PetaError>;

/// Common errors across PETA crates.
#[derive(Error, Diagnostic, Debug)]
pub enum PetaError {
    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(peta::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(peta::serialization))]
    Serialization(String),
}

impl From<serde_json::Error> for PetaError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for PetaError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
