//! TOML configuration file loading
//!
//! Supports `~/.config/nodehub/config.toml` (or the file named by
//! `NODEHUB_CONFIG`) as a persistent config source. All fields are
//! optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodehubConfigFile {
    /// Where to look for node manifests
    #[serde(default)]
    pub manifests: ManifestsFileConfig,

    /// Runtime directory for sockets
    #[serde(default)]
    pub runtime: RuntimeFileConfig,

    /// Process supervision timings
    #[serde(default)]
    pub supervisor: SupervisorFileConfig,

    /// Request dispatch settings
    #[serde(default)]
    pub dispatch: DispatchFileConfig,

    /// Health monitoring settings
    #[serde(default)]
    pub health: HealthFileConfig,
}

/// Manifest search configuration
#[derive(Debug, Default, Deserialize)]
pub struct ManifestsFileConfig {
    /// Directories scanned for manifests, in order
    pub dirs: Option<Vec<String>>,
}

/// Runtime directory configuration
#[derive(Debug, Default, Deserialize)]
pub struct RuntimeFileConfig {
    /// Directory substituted for `{runtime_dir}` in socket templates
    pub dir: Option<String>,
}

/// Supervisor configuration
#[derive(Debug, Default, Deserialize)]
pub struct SupervisorFileConfig {
    /// How long a launched node has to accept connections
    pub startup_timeout_ms: Option<u64>,
    /// Grace period for cooperative shutdown
    pub shutdown_grace_ms: Option<u64>,
}

/// Dispatcher configuration
#[derive(Debug, Default, Deserialize)]
pub struct DispatchFileConfig {
    /// Default per-call timeout
    pub request_timeout_ms: Option<u64>,
}

/// Health monitor configuration
#[derive(Debug, Default, Deserialize)]
pub struct HealthFileConfig {
    /// Time between health rounds
    pub interval_ms: Option<u64>,
    /// Timeout for a single health call
    pub timeout_ms: Option<u64>,
    /// Consecutive failures before a node is unhealthy
    pub unhealthy_threshold: Option<u32>,
    /// Further consecutive failures before a node is crashed
    pub crash_threshold: Option<u32>,
}

/// Read and parse a config file
///
/// # Errors
///
/// Returns an error if the file can't be read or isn't valid TOML for
/// this schema
pub fn read_config_file(path: &Path) -> Result<NodehubConfigFile> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Load the TOML config file from `NODEHUB_CONFIG` or the standard path
///
/// Returns `NodehubConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> NodehubConfigFile {
    let path = std::env::var("NODEHUB_CONFIG")
        .ok()
        .map(PathBuf::from)
        .or_else(config_file_path);

    let Some(path) = path else {
        return NodehubConfigFile::default();
    };

    if !path.exists() {
        return NodehubConfigFile::default();
    }

    match read_config_file(&path) {
        Ok(config) => {
            tracing::info!(path = %path.display(), "loaded config file");
            config
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            NodehubConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/nodehub/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("nodehub").join("config.toml"))
}
