// crates/core/src/discovery.rs
//! Project discovery: find directories that contain a `.ralph/` state dir.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::error::DiscoveryError;
use crate::paths::STATE_DIR;
use crate::project::resolve_path;

/// Directory names never descended into while scanning.
pub const IGNORED_DIRS: [&str; 7] = [
    ".git",
    ".mypy_cache",
    ".pytest_cache",
    ".ruff_cache",
    ".venv",
    "__pycache__",
    "node_modules",
];

fn is_ignored(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|name| IGNORED_DIRS.contains(&name))
            .unwrap_or(false)
}

/// Scan `roots` for project directories.
///
/// A project is any directory with a `.ralph/` child. The scan does not
/// descend into `.ralph/` itself or into [`IGNORED_DIRS`]. Missing roots
/// are skipped. Results are resolved, deduplicated and sorted.
pub fn discover_project_paths(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut discovered = BTreeSet::new();

    for root in roots {
        let root = resolve_path(root);
        if !root.is_dir() {
            debug!(root = %root.display(), "Skipping missing project root");
            continue;
        }

        let mut walker = WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !is_ignored(e));

        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!(error = %e, "Skipping unreadable entry during discovery");
                    continue;
                }
            };
            if entry.file_type().is_dir() && entry.file_name() == STATE_DIR {
                if let Some(parent) = entry.path().parent() {
                    discovered.insert(resolve_path(parent));
                }
                walker.skip_current_dir();
            }
        }
    }

    discovered.into_iter().collect()
}

/// Validate a path offered for explicit registration.
///
/// Returns the resolved path when it is an existing directory containing
/// a `.ralph/` directory.
pub fn validate_project_directory(path: &Path) -> Result<PathBuf, DiscoveryError> {
    let resolved = resolve_path(path);
    let meta = std::fs::metadata(&resolved).map_err(|e| DiscoveryError::io(&resolved, e))?;
    if !meta.is_dir() {
        return Err(DiscoveryError::NotFound { path: resolved });
    }
    if !resolved.join(STATE_DIR).is_dir() {
        return Err(DiscoveryError::NotAProject { path: resolved });
    }
    Ok(resolved)
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &Path) -> Result<PathBuf, DiscoveryError> {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .ok_or(DiscoveryError::HomeDirNotFound),
        Err(_) => Ok(path.to_path_buf()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn make_project(root: &Path, rel: &str) -> PathBuf {
        let dir = root.join(rel);
        fs::create_dir_all(dir.join(".ralph")).unwrap();
        dir
    }

    #[test]
    fn test_discovers_nested_projects() {
        let tmp = tempfile::tempdir().unwrap();
        let a = make_project(tmp.path(), "alpha");
        let b = make_project(tmp.path(), "group/beta");
        fs::create_dir_all(tmp.path().join("plain")).unwrap();

        let found = discover_project_paths(&[tmp.path().to_path_buf()]);
        assert_eq!(found, vec![resolve_path(&a), resolve_path(&b)]);
    }

    #[test]
    fn test_skips_ignored_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        make_project(tmp.path(), "node_modules/pkg");
        make_project(tmp.path(), ".git/hidden");
        let real = make_project(tmp.path(), "real");

        let found = discover_project_paths(&[tmp.path().to_path_buf()]);
        assert_eq!(found, vec![resolve_path(&real)]);
    }

    #[test]
    fn test_does_not_descend_into_state_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let outer = make_project(tmp.path(), "outer");
        fs::create_dir_all(outer.join(".ralph/inner/.ralph")).unwrap();

        let found = discover_project_paths(&[tmp.path().to_path_buf()]);
        assert_eq!(found, vec![resolve_path(&outer)]);
    }

    #[test]
    fn test_missing_root_is_skipped() {
        let found = discover_project_paths(&[PathBuf::from("/definitely/not/here")]);
        assert!(found.is_empty());
    }

    #[test]
    fn test_duplicate_roots_are_deduplicated() {
        let tmp = tempfile::tempdir().unwrap();
        make_project(tmp.path(), "alpha");
        let root = tmp.path().to_path_buf();
        let found = discover_project_paths(&[root.clone(), root]);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_validate_project_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let project = make_project(tmp.path(), "ok");
        assert_eq!(
            validate_project_directory(&project).unwrap(),
            resolve_path(&project)
        );

        let plain = tmp.path().join("plain");
        fs::create_dir_all(&plain).unwrap();
        assert!(matches!(
            validate_project_directory(&plain),
            Err(DiscoveryError::NotAProject { .. })
        ));

        assert!(matches!(
            validate_project_directory(&tmp.path().join("missing")),
            Err(DiscoveryError::NotFound { .. })
        ));
    }
}
