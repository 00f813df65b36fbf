//! Node manifests
//!
//! Each node type is described by a YAML manifest, found either as
//! `<dir>/<node>/node.yaml` or `<dir>/<name>.node.yaml`. Manifests are
//! validated as a set: one bad file fails the whole load.

pub mod descriptor;
pub mod discovery;
pub mod registry;

use std::path::PathBuf;

use thiserror::Error;

pub use descriptor::{NodeDescriptor, ResourceLimits};
pub use discovery::{default_manifest_dirs, discover_manifests};
pub use registry::Registry;

/// Errors raised while loading manifests
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Manifest file could not be read
    #[error("failed to read manifest {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Manifest is not valid YAML for the expected shape
    #[error("failed to parse manifest {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Required field absent or empty
    #[error("manifest {} is missing required field '{field}'", .path.display())]
    MissingField { path: PathBuf, field: &'static str },

    /// Field present but unusable
    #[error("manifest {} has invalid field '{field}': {reason}", .path.display())]
    InvalidField {
        path: PathBuf,
        field: &'static str,
        reason: String,
    },

    /// Protocol major version differs from ours
    #[error("manifest {} declares unsupported protocol version '{version}'", .path.display())]
    UnsupportedProtocol { path: PathBuf, version: String },

    /// Two manifests declare the same node id
    #[error(
        "node id '{id}' is declared by both {} and {}",
        .first.display(),
        .second.display()
    )]
    DuplicateId {
        id: String,
        first: PathBuf,
        second: PathBuf,
    },

    /// Two nodes would bind the same socket
    #[error("nodes '{first}' and '{second}' both render socket path '{path}'")]
    DuplicateSocketPath {
        first: String,
        second: String,
        path: String,
    },
}
