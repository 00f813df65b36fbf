//! Node manifest format (`node.yaml`)

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::ManifestError;
use crate::protocol;

/// Immutable description of one node type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    /// Unique node identifier (e.g. "echo")
    pub id: String,
    /// Program to spawn; relative paths were resolved against the
    /// manifest's directory, bare names are looked up on `PATH` at launch
    pub executable_path: PathBuf,
    /// Protocol tag the node speaks
    pub protocol_version: String,
    /// Socket path with `{id}` and `{runtime_dir}` placeholders
    pub socket_path_template: String,
    /// Methods the node advertises
    pub methods: BTreeSet<String>,
    /// Human-readable name
    pub name: Option<String>,
    /// Node version string
    pub version: Option<String>,
    /// Short description
    pub description: Option<String>,
    /// Extra arguments passed after the socket path
    pub args: Vec<String>,
    /// Extra environment for the child process
    pub env: BTreeMap<String, String>,
    /// Working directory for the child process
    pub working_dir: Option<PathBuf>,
    /// Per-node override of the supervisor's startup timeout
    pub startup_timeout: Option<Duration>,
    /// Limits applied to the process before it starts
    pub resources: ResourceLimits,
    /// File this descriptor was loaded from
    pub manifest_path: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
struct RawManifest {
    id: Option<String>,
    executable: Option<String>,
    protocol_version: Option<RawScalar>,
    socket_path_template: Option<String>,
    methods: Option<Vec<String>>,
    name: Option<String>,
    version: Option<RawScalar>,
    description: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    working_dir: Option<String>,
    startup_timeout_ms: Option<u64>,
    #[serde(default)]
    resources: RawResources,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResources {
    memory: Option<RawScalar>,
    max_file_descriptors: Option<u64>,
    cpu_time_secs: Option<u64>,
    nice: Option<i32>,
    core_dumps: Option<bool>,
}

/// `version: 1.0` or `memory: 256` arrive as YAML numbers when unquoted
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawScalar {
    Text(String),
    Number(serde_yaml::Number),
}

/// Per-process resource limits from the manifest's `resources` block
///
/// Unset fields leave the inherited limit alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Address space cap in bytes (`RLIMIT_AS`)
    pub memory_bytes: Option<u64>,
    /// Open file cap (`RLIMIT_NOFILE`)
    pub max_file_descriptors: Option<u64>,
    /// CPU time cap in seconds (`RLIMIT_CPU`)
    pub cpu_time_secs: Option<u64>,
    /// Scheduling niceness, -20 to 19
    pub nice: Option<i32>,
    /// Allow (raise to the hard limit) or forbid core dumps
    pub core_dumps: Option<bool>,
}

impl ResourceLimits {
    /// Whether no limit is set
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.memory_bytes.is_none()
            && self.max_file_descriptors.is_none()
            && self.cpu_time_secs.is_none()
            && self.nice.is_none()
            && self.core_dumps.is_none()
    }
}

impl RawScalar {
    fn into_string(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Number(number) => number.to_string(),
        }
    }
}

impl NodeDescriptor {
    /// Read and validate a manifest file
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError`] if the file can't be read, isn't valid
    /// YAML, or fails validation
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content, path)
    }

    /// Parse and validate manifest text that was read from `manifest_path`
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError`] naming `manifest_path` if the text isn't
    /// valid YAML or a required field is missing, empty, or invalid
    pub fn from_yaml(source: &str, manifest_path: &Path) -> Result<Self, ManifestError> {
        let raw: RawManifest =
            serde_yaml::from_str(source).map_err(|source| ManifestError::Parse {
                path: manifest_path.to_path_buf(),
                source,
            })?;

        let missing = |field: &'static str| ManifestError::MissingField {
            path: manifest_path.to_path_buf(),
            field,
        };
        let invalid = |field: &'static str, reason: String| ManifestError::InvalidField {
            path: manifest_path.to_path_buf(),
            field,
            reason,
        };

        let id = non_empty(raw.id).ok_or_else(|| missing("id"))?;
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid(
                "id",
                format!("'{id}' may only contain letters, digits, '-', '_' and '.'"),
            ));
        }

        let executable = non_empty(raw.executable).ok_or_else(|| missing("executable"))?;
        let protocol_version = non_empty(raw.protocol_version.map(RawScalar::into_string))
            .ok_or_else(|| missing("protocol_version"))?;
        let socket_path_template =
            non_empty(raw.socket_path_template).ok_or_else(|| missing("socket_path_template"))?;

        let methods = raw.methods.unwrap_or_default();
        if methods.is_empty() {
            return Err(missing("methods"));
        }
        if methods.iter().any(|m| m.trim().is_empty()) {
            return Err(invalid("methods", "method names must be non-empty".to_string()));
        }

        if !protocol::is_compatible(&protocol_version) {
            return Err(ManifestError::UnsupportedProtocol {
                path: manifest_path.to_path_buf(),
                version: protocol_version,
            });
        }

        let resources = parse_resources(raw.resources)
            .map_err(|(field, reason)| invalid(field, reason))?;

        let base_dir = manifest_path.parent().unwrap_or_else(|| Path::new("."));

        Ok(Self {
            id,
            executable_path: resolve_relative(base_dir, &executable),
            protocol_version,
            socket_path_template,
            methods: methods.into_iter().collect(),
            name: raw.name,
            version: raw.version.map(RawScalar::into_string),
            description: raw.description,
            args: raw.args,
            env: raw.env,
            working_dir: raw.working_dir.map(|dir| base_dir.join(dir)),
            startup_timeout: raw.startup_timeout_ms.map(Duration::from_millis),
            resources,
            manifest_path: manifest_path.to_path_buf(),
        })
    }

    /// Render this node's socket path
    ///
    /// `{id}` and `{runtime_dir}` are substituted; a relative result lands
    /// inside `runtime_dir`. `.` and `..` components are folded away so
    /// equal files compare equal.
    #[must_use]
    pub fn socket_path(&self, runtime_dir: &Path) -> PathBuf {
        let rendered = self
            .socket_path_template
            .replace("{id}", &self.id)
            .replace("{runtime_dir}", &runtime_dir.to_string_lossy());
        let path = PathBuf::from(rendered);
        if path.is_absolute() {
            normalize(&path)
        } else {
            normalize(&runtime_dir.join(path))
        }
    }

    /// Whether the node advertises `method`
    #[must_use]
    pub fn advertises(&self, method: &str) -> bool {
        self.methods.contains(method)
    }

    /// Locate the program to spawn
    ///
    /// # Errors
    ///
    /// Returns an error if a bare program name is not found on `PATH`
    pub fn resolve_executable(&self) -> Result<PathBuf, which::Error> {
        if self.executable_path.components().count() > 1 {
            Ok(self.executable_path.clone())
        } else {
            which::which(&self.executable_path)
        }
    }

    /// Display name, falling back to the id
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

fn parse_resources(raw: RawResources) -> Result<ResourceLimits, (&'static str, String)> {
    let memory_bytes = raw
        .memory
        .map(|memory| parse_memory(&memory.into_string()))
        .transpose()
        .map_err(|reason| ("resources.memory", reason))?;

    if raw.max_file_descriptors == Some(0) {
        return Err((
            "resources.max_file_descriptors",
            "must be greater than zero".to_string(),
        ));
    }
    if raw.cpu_time_secs == Some(0) {
        return Err((
            "resources.cpu_time_secs",
            "must be greater than zero".to_string(),
        ));
    }
    if let Some(nice) = raw.nice.filter(|nice| !(-20..=19).contains(nice)) {
        return Err(("resources.nice", format!("{nice} is outside -20..=19")));
    }

    Ok(ResourceLimits {
        memory_bytes,
        max_file_descriptors: raw.max_file_descriptors,
        cpu_time_secs: raw.cpu_time_secs,
        nice: raw.nice,
        core_dumps: raw.core_dumps,
    })
}

/// Parse `256MB`, `1GB`, `512KB` or a bare number of megabytes
fn parse_memory(text: &str) -> Result<u64, String> {
    let text = text.trim();
    let split = text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);

    let value: u64 = digits
        .parse()
        .map_err(|_| format!("'{text}' is not a size like 256MB"))?;
    if value == 0 {
        return Err("must be greater than zero".to_string());
    }

    let scale: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "KB" | "K" => 1 << 10,
        "" | "MB" | "M" => 1 << 20,
        "GB" | "G" => 1 << 30,
        _ => return Err(format!("'{text}' has an unknown unit (use KB, MB or GB)")),
    };
    value
        .checked_mul(scale)
        .ok_or_else(|| format!("'{text}' is too large"))
}

/// Fold `.` and `..` components without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut normal = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normal.pop();
            }
            other => normal.push(other),
        }
    }
    normal
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Paths with a directory part are relative to the manifest; bare names
/// stay bare for `PATH` lookup
fn resolve_relative(base_dir: &Path, executable: &str) -> PathBuf {
    let path = Path::new(executable);
    if path.is_absolute() || path.components().count() == 1 {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}
