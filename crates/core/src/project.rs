//! Project identity and summary read model.

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::paths::ProjectPaths;

static NON_SLUG_CHARS: OnceLock<Regex> = OnceLock::new();

fn non_slug_chars() -> &'static Regex {
    NON_SLUG_CHARS.get_or_init(|| Regex::new(r"[^a-z0-9-]+").expect("valid regex"))
}

/// Lifecycle status of a project's agent loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Running,
    Paused,
    Stopped,
    Complete,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary returned by the project list endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub status: ProjectStatus,
}

/// Resolve a path to an absolute, symlink-free form, falling back to the
/// path as given when it cannot be canonicalized (e.g. it does not exist).
pub fn resolve_path(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        }
    })
}

/// Build a stable project id: `<slug>-<hash6>`.
///
/// The slug comes from the directory name; the hash is the first six hex
/// characters of SHA-256 over the full resolved path, so same-named
/// directories under different roots get distinct ids.
pub fn project_id_from_path(project_path: &Path) -> String {
    let resolved = resolve_path(project_path);
    let name = project_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let lowered = name.to_lowercase().replace('_', "-");
    let slug = non_slug_chars().replace_all(lowered.trim(), "-");
    let slug = slug.trim_matches('-');
    let slug = if slug.is_empty() { "project" } else { slug };

    let digest = Sha256::digest(resolved.to_string_lossy().as_bytes());
    let hash = hex::encode(digest);
    format!("{}-{}", slug, &hash[..6])
}

/// Display name for a project: its directory name.
pub fn project_name(project_path: &Path) -> String {
    project_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| project_path.display().to_string())
}

/// Build a summary for a project, evaluating its current status.
pub fn build_project_summary(project_path: &Path) -> ProjectSummary {
    let paths = ProjectPaths::new(project_path);
    ProjectSummary {
        id: project_id_from_path(project_path),
        name: project_name(project_path),
        path: project_path.to_path_buf(),
        status: crate::status::detect_project_status(&paths),
    }
}
