//! Error types for nodehub

use thiserror::Error;

use crate::dispatch::DispatchError;
use crate::manifest::ManifestError;
use crate::supervisor::SupervisorError;

/// Result type alias for nodehub operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in nodehub
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Manifest loading error
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Process supervision error
    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    /// Request dispatch error
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
