//! Configuration management for nodehub
//!
//! Values come from built-in defaults, overlaid by the TOML file (see
//! [`file`]), overlaid by `NODEHUB_*` environment variables.

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::manifest::default_manifest_dirs;
use crate::{Error, Result};

use self::file::NodehubConfigFile;

/// nodehub configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directories scanned for node manifests
    pub manifest_dirs: Vec<PathBuf>,

    /// Directory substituted for `{runtime_dir}` in socket templates
    pub runtime_dir: PathBuf,

    /// Process supervision timings
    pub supervisor: SupervisorConfig,

    /// Request dispatch settings
    pub dispatch: DispatchConfig,

    /// Health monitoring settings
    pub health: HealthConfig,
}

/// Process supervision timings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// How long a launched node has to accept connections
    pub startup_timeout: Duration,

    /// Grace period for cooperative shutdown before SIGTERM
    pub shutdown_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// Request dispatch settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Default per-call timeout
    pub request_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Health monitoring settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    /// Time between health rounds
    pub interval: Duration,

    /// Timeout for a single health call
    pub timeout: Duration,

    /// Consecutive failures before a node is marked unhealthy (N)
    pub unhealthy_threshold: u32,

    /// Further consecutive failures before a node is marked crashed (M)
    pub crash_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(1),
            unhealthy_threshold: 3,
            crash_threshold: 3,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            manifest_dirs: default_manifest_dirs(),
            runtime_dir: default_runtime_dir(),
            supervisor: SupervisorConfig::default(),
            dispatch: DispatchConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the config file and process environment
    ///
    /// # Errors
    ///
    /// Returns error if an environment variable holds an unparseable value
    pub fn load() -> Result<Self> {
        Self::from_sources(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value can't be parsed or a threshold is zero
    pub fn from_sources(
        file: NodehubConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let defaults = Self::default();

        let manifest_dirs = env("NODEHUB_MANIFEST_DIRS")
            .map(|raw| std::env::split_paths(&raw).collect())
            .or_else(|| {
                file.manifests
                    .dirs
                    .map(|dirs| dirs.into_iter().map(PathBuf::from).collect())
            })
            .unwrap_or(defaults.manifest_dirs);

        let runtime_dir = env("NODEHUB_RUNTIME_DIR")
            .or(file.runtime.dir)
            .map_or(defaults.runtime_dir, PathBuf::from);

        let supervisor = SupervisorConfig {
            startup_timeout: millis(&env, "NODEHUB_STARTUP_TIMEOUT_MS")?
                .or(file.supervisor.startup_timeout_ms.map(Duration::from_millis))
                .unwrap_or(defaults.supervisor.startup_timeout),
            shutdown_grace: millis(&env, "NODEHUB_SHUTDOWN_GRACE_MS")?
                .or(file.supervisor.shutdown_grace_ms.map(Duration::from_millis))
                .unwrap_or(defaults.supervisor.shutdown_grace),
        };

        let dispatch = DispatchConfig {
            request_timeout: millis(&env, "NODEHUB_REQUEST_TIMEOUT_MS")?
                .or(file.dispatch.request_timeout_ms.map(Duration::from_millis))
                .unwrap_or(defaults.dispatch.request_timeout),
        };

        let health = HealthConfig {
            interval: millis(&env, "NODEHUB_HEALTH_INTERVAL_MS")?
                .or(file.health.interval_ms.map(Duration::from_millis))
                .unwrap_or(defaults.health.interval),
            timeout: millis(&env, "NODEHUB_HEALTH_TIMEOUT_MS")?
                .or(file.health.timeout_ms.map(Duration::from_millis))
                .unwrap_or(defaults.health.timeout),
            unhealthy_threshold: count(&env, "NODEHUB_UNHEALTHY_THRESHOLD")?
                .or(file.health.unhealthy_threshold)
                .unwrap_or(defaults.health.unhealthy_threshold),
            crash_threshold: count(&env, "NODEHUB_CRASH_THRESHOLD")?
                .or(file.health.crash_threshold)
                .unwrap_or(defaults.health.crash_threshold),
        };

        if health.unhealthy_threshold == 0 || health.crash_threshold == 0 {
            return Err(Error::Config(
                "health thresholds must be at least 1".to_string(),
            ));
        }
        if health.interval.is_zero() {
            return Err(Error::Config(
                "health interval must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            manifest_dirs,
            runtime_dir,
            supervisor,
            dispatch,
            health,
        })
    }

    /// Replace the manifest search directories
    #[must_use]
    pub fn with_manifest_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.manifest_dirs = dirs;
        self
    }

    /// Replace the runtime directory
    #[must_use]
    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }
}

/// `$XDG_RUNTIME_DIR/nodehub`, falling back to the temp dir
#[must_use]
pub fn default_runtime_dir() -> PathBuf {
    directories::BaseDirs::new()
        .and_then(|d| d.runtime_dir().map(Path::to_path_buf))
        .map_or_else(|| std::env::temp_dir().join("nodehub"), |d| d.join("nodehub"))
}

fn millis(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    env(key)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| Error::Config(format!("{key}='{raw}': {e}")))
        })
        .transpose()
}

fn count(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u32>> {
    env(key)
        .map(|raw| {
            raw.trim()
                .parse::<u32>()
                .map_err(|e| Error::Config(format!("{key}='{raw}': {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::file::HealthFileConfig;
    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_sources() {
        let config = Config::from_sources(NodehubConfigFile::default(), env_from(&[])).unwrap();
        assert_eq!(config.supervisor, SupervisorConfig::default());
        assert_eq!(config.dispatch.request_timeout, Duration::from_secs(30));
        assert_eq!(config.health, HealthConfig::default());
        assert!(!config.manifest_dirs.is_empty());
    }

    #[test]
    fn env_overrides_file() {
        let file = NodehubConfigFile {
            health: HealthFileConfig {
                interval_ms: Some(500),
                unhealthy_threshold: Some(5),
                ..HealthFileConfig::default()
            },
            ..NodehubConfigFile::default()
        };
        let env = env_from(&[
            ("NODEHUB_HEALTH_INTERVAL_MS", "250"),
            ("NODEHUB_RUNTIME_DIR", "/run/test"),
            ("NODEHUB_MANIFEST_DIRS", "/a:/b"),
        ]);

        let config = Config::from_sources(file, env).unwrap();
        assert_eq!(config.health.interval, Duration::from_millis(250));
        assert_eq!(config.health.unhealthy_threshold, 5);
        assert_eq!(config.runtime_dir, PathBuf::from("/run/test"));
        assert_eq!(
            config.manifest_dirs,
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );
    }

    #[test]
    fn unparseable_env_is_config_error() {
        let err = Config::from_sources(
            NodehubConfigFile::default(),
            env_from(&[("NODEHUB_REQUEST_TIMEOUT_MS", "soon")]),
        )
        .unwrap_err();
        let Error::Config(msg) = err else {
            panic!("unexpected error: {err}");
        };
        assert!(msg.contains("NODEHUB_REQUEST_TIMEOUT_MS"));
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let err = Config::from_sources(
            NodehubConfigFile::default(),
            env_from(&[("NODEHUB_CRASH_THRESHOLD", "0")]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
