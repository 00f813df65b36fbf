//! Manifest discovery - scan directories for `node.yaml` files

use std::path::PathBuf;

/// Manifest file name inside a node's own directory
pub const MANIFEST_FILE: &str = "node.yaml";

/// Suffix for manifests placed directly in a search directory
pub const MANIFEST_SUFFIX: &str = ".node.yaml";

/// Scan directories for node manifests
///
/// Finds `<dir>/<node>/node.yaml` and `<dir>/<name>.node.yaml`. Paths are
/// returned sorted within each directory, directories in the given order.
/// Nothing is parsed here.
#[must_use]
pub fn discover_manifests(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut results = Vec::new();

    for dir in dirs {
        if !dir.is_dir() {
            tracing::debug!(path = %dir.display(), "manifest directory does not exist, skipping");
            continue;
        }

        let Ok(entries) = std::fs::read_dir(dir) else {
            tracing::warn!(path = %dir.display(), "failed to read manifest directory");
            continue;
        };

        let mut found = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                let manifest_path = path.join(MANIFEST_FILE);
                if manifest_path.is_file() {
                    found.push(manifest_path);
                }
            } else if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(MANIFEST_SUFFIX))
            {
                found.push(path);
            }
        }

        found.sort();
        for path in &found {
            tracing::debug!(path = %path.display(), "discovered node manifest");
        }
        results.extend(found);
    }

    results
}

/// Default manifest search directories
#[must_use]
pub fn default_manifest_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        dirs.push(config_dir.join("nodehub").join("nodes"));
    }

    dirs.push(PathBuf::from("nodes"));

    dirs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover_manifests(&[dir.path().to_path_buf()]).is_empty());
    }

    #[test]
    fn discover_both_layouts_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let node_dir = dir.path().join("zeta");
        std::fs::create_dir(&node_dir).unwrap();
        std::fs::write(node_dir.join(MANIFEST_FILE), "id: zeta").unwrap();
        std::fs::write(dir.path().join("alpha.node.yaml"), "id: alpha").unwrap();
        std::fs::write(dir.path().join("notes.yaml"), "ignored").unwrap();
        std::fs::create_dir(dir.path().join("empty")).unwrap();

        let results = discover_manifests(&[dir.path().to_path_buf()]);
        assert_eq!(
            results,
            vec![
                dir.path().join("alpha.node.yaml"),
                node_dir.join(MANIFEST_FILE)
            ]
        );
    }

    #[test]
    fn skip_nonexistent_dir() {
        assert!(discover_manifests(&[PathBuf::from("/nonexistent/path")]).is_empty());
    }

    #[test]
    fn default_dirs_not_empty() {
        assert!(!default_manifest_dirs().is_empty());
    }
}
