//! Runtime settings: environment variables, overridable by CLI flags.

use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use ralph_dashboard_core::discovery::expand_home;
use ralph_dashboard_core::paths::{app_data_dir, default_project_dir};
use ralph_dashboard_core::project::resolve_path;

/// Default port for the server.
pub const DEFAULT_PORT: u16 = 8420;
const PLACEHOLDER_SECRET: &str = "replace-this-secret-key";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("RALPH_SECRET_KEY must be set")]
    MissingSecret,

    #[error("RALPH_SECRET_KEY must be set to a secure random value, not the placeholder")]
    PlaceholderSecret,

    #[error("No project directories configured")]
    NoProjectDirs,

    #[error("Could not determine a data directory; set RALPH_DATA_DIR")]
    NoDataDir,

    #[error("Invalid path {path}: {message}")]
    InvalidPath { path: PathBuf, message: String },
}

#[derive(Parser, Debug, Default)]
#[command(name = "ralph-dashboard", about = "Realtime dashboard for Ralph agent loops")]
pub struct Args {
    /// Port to listen on.
    #[arg(long, env = "RALPH_PORT")]
    pub port: Option<u16>,

    /// Roots scanned for projects (path-separator or comma separated).
    #[arg(long, env = "RALPH_PROJECT_DIRS")]
    pub project_dirs: Option<String>,

    /// HS256 signing key for access tokens.
    #[arg(long, env = "RALPH_SECRET_KEY", hide_env_values = true)]
    pub secret_key: Option<String>,

    /// Directory holding `projects.json`.
    #[arg(long, env = "RALPH_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Loop script used when a project has no `ralph.sh`.
    #[arg(long, env = "RALPH_FALLBACK_SCRIPT")]
    pub fallback_script: Option<PathBuf>,

    #[arg(long, env = "RALPH_DEBOUNCE_MS", default_value_t = 300)]
    pub debounce_ms: u64,

    #[arg(long, env = "RALPH_QUEUE_CAPACITY", default_value_t = 1024)]
    pub queue_capacity: usize,

    /// Upper bound on log bytes read per change event.
    #[arg(long, env = "RALPH_LOG_READ_CAP", default_value_t = 256 * 1024)]
    pub log_read_cap: u64,

    #[arg(long, env = "RALPH_STOP_GRACE_SECS", default_value_t = 3)]
    pub stop_grace_secs: u64,

    #[arg(long, env = "RALPH_REFRESH_SECS", default_value_t = 30)]
    pub refresh_secs: u64,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub project_dirs: Vec<PathBuf>,
    pub secret_key: String,
    pub data_dir: PathBuf,
    pub fallback_script: Option<PathBuf>,
    pub debounce: Duration,
    pub queue_capacity: usize,
    pub log_read_cap: u64,
    pub stop_grace: Duration,
    pub refresh_interval: Duration,
}

impl Settings {
    /// Settings with defaults for everything but the secret and storage.
    pub fn new(secret_key: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            port: DEFAULT_PORT,
            project_dirs: Vec::new(),
            secret_key: secret_key.into(),
            data_dir: data_dir.into(),
            fallback_script: None,
            debounce: Duration::from_millis(300),
            queue_capacity: 1024,
            log_read_cap: 256 * 1024,
            stop_grace: Duration::from_secs(3),
            refresh_interval: Duration::from_secs(30),
        }
    }

    pub fn with_project_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.project_dirs = dirs;
        self
    }

    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let secret_key = validate_secret(args.secret_key)?;

        let project_dirs = match args.project_dirs.as_deref() {
            Some(raw) => normalize_dirs(parse_project_dirs(raw))?,
            None => default_project_dir().into_iter().collect(),
        };
        if project_dirs.is_empty() {
            return Err(ConfigError::NoProjectDirs);
        }

        let data_dir = match args.data_dir {
            Some(dir) => absolute(&dir)?,
            None => app_data_dir().ok_or(ConfigError::NoDataDir)?,
        };
        let fallback_script = args.fallback_script.map(|p| absolute(&p)).transpose()?;

        Ok(Self {
            port: args.port.unwrap_or(DEFAULT_PORT),
            project_dirs,
            secret_key,
            data_dir,
            fallback_script,
            debounce: Duration::from_millis(args.debounce_ms),
            queue_capacity: args.queue_capacity.max(1),
            log_read_cap: args.log_read_cap.max(1),
            stop_grace: Duration::from_secs(args.stop_grace_secs),
            refresh_interval: Duration::from_secs(args.refresh_secs.max(1)),
        })
    }
}

fn validate_secret(secret: Option<String>) -> Result<String, ConfigError> {
    match secret {
        None => Err(ConfigError::MissingSecret),
        Some(s) if s.trim().is_empty() => Err(ConfigError::MissingSecret),
        Some(s) if s == PLACEHOLDER_SECRET => Err(ConfigError::PlaceholderSecret),
        Some(s) => Ok(s),
    }
}

/// Split a directory list on the platform path separator, or on commas
/// when there is no path separator and the value contains a comma.
pub fn parse_project_dirs(raw: &str) -> Vec<PathBuf> {
    let parts: Vec<PathBuf> = std::env::split_paths(raw).collect();
    let parts = if parts.len() == 1 && raw.contains(',') {
        raw.split(',').map(PathBuf::from).collect()
    } else {
        parts
    };
    parts
        .into_iter()
        .filter_map(|p| {
            let trimmed = p.to_string_lossy().trim().to_string();
            (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
        })
        .collect()
}

fn absolute(path: &Path) -> Result<PathBuf, ConfigError> {
    let expanded = expand_home(path).map_err(|e| ConfigError::InvalidPath {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(resolve_path(&expanded))
}

fn normalize_dirs(dirs: Vec<PathBuf>) -> Result<Vec<PathBuf>, ConfigError> {
    let mut out: Vec<PathBuf> = Vec::new();
    for dir in dirs {
        let resolved = absolute(&dir)?;
        if !out.contains(&resolved) {
            out.push(resolved);
        }
    }
    Ok(out)
}
