//! Immutable registry of node descriptors

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::discovery::discover_manifests;
use super::{ManifestError, NodeDescriptor};

/// Stand-in runtime directory for comparing socket paths at load time
const RUNTIME_DIR_STANDIN: &str = "/{runtime_dir}";

/// All node types known to the orchestrator
///
/// Built once and never mutated; a reload builds a new registry.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    nodes: HashMap<String, Arc<NodeDescriptor>>,
    /// Ids in sorted order
    order: Vec<String>,
}

impl Registry {
    /// Load every manifest file in `paths`
    ///
    /// # Errors
    ///
    /// Returns the first [`ManifestError`] encountered; a single malformed
    /// manifest fails the whole load
    pub fn load(paths: &[PathBuf]) -> Result<Self, ManifestError> {
        let descriptors = paths
            .iter()
            .map(|path| NodeDescriptor::from_file(path))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_descriptors(descriptors)
    }

    /// Discover manifests in `dirs` and load them
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError`] if any discovered manifest is invalid
    pub fn from_dirs(dirs: &[PathBuf]) -> Result<Self, ManifestError> {
        Self::load(&discover_manifests(dirs))
    }

    /// Build a registry from already parsed descriptors
    ///
    /// # Errors
    ///
    /// Returns `DuplicateId` if two descriptors share an id, or
    /// `DuplicateSocketPath` if two would bind the same socket
    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = NodeDescriptor>,
    ) -> Result<Self, ManifestError> {
        let mut nodes: HashMap<String, Arc<NodeDescriptor>> = HashMap::new();
        let mut sockets: HashMap<PathBuf, String> = HashMap::new();

        for descriptor in descriptors {
            if let Some(existing) = nodes.get(&descriptor.id) {
                return Err(ManifestError::DuplicateId {
                    id: descriptor.id.clone(),
                    first: existing.manifest_path.clone(),
                    second: descriptor.manifest_path,
                });
            }

            let socket = descriptor.socket_path(Path::new(RUNTIME_DIR_STANDIN));
            if let Some(other) = sockets.insert(socket.clone(), descriptor.id.clone()) {
                return Err(ManifestError::DuplicateSocketPath {
                    first: other,
                    second: descriptor.id,
                    path: socket.display().to_string(),
                });
            }

            tracing::debug!(
                node_id = %descriptor.id,
                path = %descriptor.manifest_path.display(),
                "registered node descriptor"
            );
            nodes.insert(descriptor.id.clone(), Arc::new(descriptor));
        }

        let mut order: Vec<String> = nodes.keys().cloned().collect();
        order.sort();

        Ok(Self { nodes, order })
    }

    /// Get a descriptor by id
    #[must_use]
    pub fn lookup(&self, id: &str) -> Option<&Arc<NodeDescriptor>> {
        self.nodes.get(id)
    }

    /// All descriptors ordered by id
    #[must_use]
    pub fn list(&self) -> Vec<&Arc<NodeDescriptor>> {
        self.order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .collect()
    }

    /// Number of registered node types
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn manifest(id: &str, template: &str) -> String {
        format!(
            "id: {id}\nexecutable: ./run\nprotocol_version: \"1.0\"\nsocket_path_template: \"{template}\"\nmethods: [node.health]\n"
        )
    }

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn load_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![
            write(dir.path(), "b.node.yaml", &manifest("beta", "{id}.sock")),
            write(dir.path(), "a.node.yaml", &manifest("alpha", "{id}.sock")),
        ];

        let registry = Registry::load(&paths).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup("alpha").unwrap().id, "alpha");
        assert!(registry.lookup("gamma").is_none());

        let ids: Vec<&str> = registry.list().iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "beta"]);
    }

    #[test]
    fn duplicate_id_names_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let first = write(dir.path(), "one.node.yaml", &manifest("same", "one.sock"));
        let second = write(dir.path(), "two.node.yaml", &manifest("same", "two.sock"));

        let err = Registry::load(&[first.clone(), second.clone()]).unwrap_err();
        match err {
            ManifestError::DuplicateId {
                id,
                first: a,
                second: b,
            } => {
                assert_eq!(id, "same");
                assert_eq!(a, first);
                assert_eq!(b, second);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn shared_socket_template_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![
            write(dir.path(), "a.node.yaml", &manifest("alpha", "shared.sock")),
            write(dir.path(), "b.node.yaml", &manifest("beta", "shared.sock")),
        ];
        assert!(matches!(
            Registry::load(&paths),
            Err(ManifestError::DuplicateSocketPath { .. })
        ));
    }

    #[test]
    fn equivalent_socket_templates_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let alpha = manifest("alpha", "{runtime_dir}/shared.sock");
        let beta = manifest("beta", "./shared.sock");
        let paths = vec![
            write(dir.path(), "a.node.yaml", &alpha),
            write(dir.path(), "b.node.yaml", &beta),
        ];
        let err = Registry::load(&paths).unwrap_err();
        let ManifestError::DuplicateSocketPath { first, second, .. } = err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!((first.as_str(), second.as_str()), ("alpha", "beta"));

        let alpha = manifest("alpha", "{runtime_dir}/{id}.sock");
        let beta = manifest("beta", "{id}.sock");
        let paths = vec![
            write(dir.path(), "a.node.yaml", &alpha),
            write(dir.path(), "b.node.yaml", &beta),
        ];
        assert_eq!(Registry::load(&paths).unwrap().len(), 2);
    }

    #[test]
    fn one_bad_manifest_fails_the_load() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![
            write(dir.path(), "a.node.yaml", &manifest("alpha", "{id}.sock")),
            write(dir.path(), "b.node.yaml", "id: beta\n"),
        ];
        let err = Registry::load(&paths).unwrap_err();
        assert!(matches!(err, ManifestError::MissingField { .. }));
        assert!(err.to_string().contains("b.node.yaml"));
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = Registry::load(&[PathBuf::from("/nonexistent/node.yaml")]).unwrap_err();
        assert!(matches!(err, ManifestError::Read { .. }));
    }

    #[test]
    fn from_dirs_discovers() {
        let dir = tempfile::tempdir().unwrap();
        let node_dir = dir.path().join("echo");
        std::fs::create_dir(&node_dir).unwrap();
        write(&node_dir, "node.yaml", &manifest("echo", "{id}.sock"));

        let registry = Registry::from_dirs(&[dir.path().to_path_buf()]).unwrap();
        let echo = registry.lookup("echo").unwrap();
        assert_eq!(echo.executable_path, node_dir.join("run"));
    }

    #[test]
    fn empty_registry() {
        let registry = Registry::from_dirs(&[]).unwrap();
        assert!(registry.is_empty());
        assert!(registry.list().is_empty());
    }
}
