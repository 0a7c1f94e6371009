//! Project registry: discovered projects merged with explicit registrations.
//!
//! Registrations persist as a JSON array of paths in `<data_dir>/projects.json`.
//! Directory scans are cached for a short TTL since every list request and
//! every watch refresh needs the full set.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use ralph_dashboard_core::paths::registry_file;
use ralph_dashboard_core::{
    build_project_summary, discover_project_paths, project_id_from_path, resolve_path,
    validate_project_directory, DiscoveryError, ProjectSummary,
};

/// How long a discovery scan result is reused.
pub const DISCOVERY_CACHE_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Invalid(#[from] DiscoveryError),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize registry: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A project known to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectEntry {
    pub id: String,
    pub root: PathBuf,
}

struct CachedScan {
    at: Instant,
    paths: Vec<PathBuf>,
}

pub struct ProjectRegistry {
    roots: Vec<PathBuf>,
    registry_file: PathBuf,
    ttl: Duration,
    cache: Mutex<Option<CachedScan>>,
    /// Serializes read-modify-write of the registry file.
    write_lock: tokio::sync::Mutex<()>,
}

impl ProjectRegistry {
    pub fn new(roots: Vec<PathBuf>, data_dir: &Path) -> Self {
        Self {
            roots,
            registry_file: registry_file(data_dir),
            ttl: DISCOVERY_CACHE_TTL,
            cache: Mutex::new(None),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Explicitly registered paths. A missing or malformed file is empty.
    pub async fn registered_paths(&self) -> Vec<PathBuf> {
        let content = match tokio::fs::read_to_string(&self.registry_file).await {
            Ok(c) => c,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.registry_file.display(), error = %e, "Failed to read project registry");
                }
                return Vec::new();
            }
        };
        match serde_json::from_str::<Vec<PathBuf>>(&content) {
            Ok(paths) => normalize(paths),
            Err(e) => {
                warn!(path = %self.registry_file.display(), error = %e, "Ignoring malformed project registry");
                Vec::new()
            }
        }
    }

    async fn save(&self, paths: Vec<PathBuf>) -> Result<(), RegistryError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| RegistryError::Io { path, source }
        };
        if let Some(parent) = self.registry_file.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err(parent))?;
        }
        let json = serde_json::to_string_pretty(&normalize(paths))?;
        let tmp = self.registry_file.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(io_err(&tmp))?;
        tokio::fs::rename(&tmp, &self.registry_file)
            .await
            .map_err(io_err(&self.registry_file))?;
        Ok(())
    }

    /// Register a project directory. Idempotent; returns the resolved path.
    pub async fn register(&self, path: &Path) -> Result<PathBuf, RegistryError> {
        let candidate = path.to_path_buf();
        let resolved = tokio::task::spawn_blocking(move || validate_project_directory(&candidate))
            .await
            .map_err(|e| RegistryError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::other(e),
            })??;

        let _guard = self.write_lock.lock().await;
        let mut existing = self.registered_paths().await;
        if !existing.contains(&resolved) {
            existing.push(resolved.clone());
            self.save(existing).await?;
            info!(path = %resolved.display(), "Registered project");
        }
        self.invalidate();
        Ok(resolved)
    }

    /// Remove a registration by project id. Returns whether one was removed.
    ///
    /// Discovered projects stay visible; only explicit registrations can be
    /// removed.
    pub async fn unregister(&self, project_id: &str) -> Result<bool, RegistryError> {
        let _guard = self.write_lock.lock().await;
        let existing = self.registered_paths().await;
        let before = existing.len();
        let remaining: Vec<PathBuf> = existing
            .into_iter()
            .filter(|p| project_id_from_path(p) != project_id)
            .collect();
        let removed = remaining.len() != before;
        if removed {
            self.save(remaining).await?;
            info!(project_id = %project_id, "Unregistered project");
        }
        self.invalidate();
        Ok(removed)
    }

    /// Force the next listing to rescan the roots.
    pub fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = None;
        }
    }

    fn cached(&self) -> Option<Vec<PathBuf>> {
        let cache = self.cache.lock().ok()?;
        cache
            .as_ref()
            .filter(|c| c.at.elapsed() < self.ttl)
            .map(|c| c.paths.clone())
    }

    /// All project roots: discovered under the scan roots plus registered,
    /// resolved, deduplicated and sorted.
    pub async fn all_paths(&self) -> Vec<PathBuf> {
        if let Some(paths) = self.cached() {
            return paths;
        }

        let roots = self.roots.clone();
        let discovered = match tokio::task::spawn_blocking(move || discover_project_paths(&roots)).await {
            Ok(paths) => paths,
            Err(e) => {
                warn!(error = %e, "Project discovery task failed");
                Vec::new()
            }
        };
        let mut all = discovered;
        all.extend(self.registered_paths().await);
        let paths = normalize(all);
        debug!(count = paths.len(), "Project discovery complete");

        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some(CachedScan {
                at: Instant::now(),
                paths: paths.clone(),
            });
        }
        paths
    }

    /// All projects with their ids.
    pub async fn entries(&self) -> Vec<ProjectEntry> {
        let paths = self.all_paths().await;
        tokio::task::spawn_blocking(move || {
            paths
                .into_iter()
                .map(|root| ProjectEntry {
                    id: project_id_from_path(&root),
                    root,
                })
                .collect()
        })
        .await
        .unwrap_or_default()
    }

    /// Root directory of the project with this id.
    pub async fn resolve(&self, project_id: &str) -> Option<PathBuf> {
        self.entries()
            .await
            .into_iter()
            .find(|e| e.id == project_id)
            .map(|e| e.root)
    }

    /// Summaries with freshly evaluated status.
    pub async fn summaries(&self) -> Vec<ProjectSummary> {
        let paths = self.all_paths().await;
        tokio::task::spawn_blocking(move || paths.iter().map(|p| build_project_summary(p)).collect())
            .await
            .unwrap_or_default()
    }
}

fn normalize(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = paths.iter().map(|p| resolve_path(p)).collect();
    out.sort();
    out.dedup();
    out
}
