//! Centralized path functions for project state files and app storage.
//!
//! Single source of truth for every file name the agent loop and the
//! dashboard agree on. Nothing outside this module should join `.ralph`
//! or a state file name by hand.

use std::path::{Path, PathBuf};

/// Per-project state directory.
pub const STATE_DIR: &str = ".ralph";
/// Task plan at the project root.
pub const PLAN_FILE: &str = "IMPLEMENTATION_PLAN.md";
pub const AGENTS_FILE: &str = "AGENTS.md";
pub const PROMPT_FILE: &str = "PROMPT.md";
pub const SPECS_DIR: &str = "specs";

pub const LOG_FILE: &str = "ralph.log";
pub const LEDGER_FILE: &str = "iterations.jsonl";
pub const PID_FILE: &str = "ralph.pid";
pub const PAUSE_FILE: &str = "pause";
pub const PENDING_NOTIFICATION_FILE: &str = "pending-notification.txt";
pub const LAST_NOTIFICATION_FILE: &str = "last-notification.txt";
pub const NOTIFICATIONS_DIR: &str = "notifications";
pub const NOTIFICATION_EVENTS_FILE: &str = "events.jsonl";
pub const INJECT_FILE: &str = "inject.md";
pub const CONFIG_FILE: &str = "config.json";
pub const LOOP_SCRIPT: &str = "ralph.sh";

/// Root-level files whose changes are relevant to the dashboard.
pub const WATCHED_ROOT_FILES: [&str; 3] = [PLAN_FILE, AGENTS_FILE, PROMPT_FILE];

/// Files directly under `.ralph/` whose changes are relevant to the dashboard.
pub const WATCHED_STATE_FILES: [&str; 5] = [
    LOG_FILE,
    LEDGER_FILE,
    PENDING_NOTIFICATION_FILE,
    PID_FILE,
    PAUSE_FILE,
];

/// Resolved locations of one project's files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPaths {
    root: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    pub fn specs_dir(&self) -> PathBuf {
        self.root.join(SPECS_DIR)
    }

    pub fn plan(&self) -> PathBuf {
        self.root.join(PLAN_FILE)
    }

    pub fn log(&self) -> PathBuf {
        self.state_dir().join(LOG_FILE)
    }

    pub fn ledger(&self) -> PathBuf {
        self.state_dir().join(LEDGER_FILE)
    }

    pub fn pid(&self) -> PathBuf {
        self.state_dir().join(PID_FILE)
    }

    pub fn pause(&self) -> PathBuf {
        self.state_dir().join(PAUSE_FILE)
    }

    pub fn pending_notification(&self) -> PathBuf {
        self.state_dir().join(PENDING_NOTIFICATION_FILE)
    }

    pub fn last_notification(&self) -> PathBuf {
        self.state_dir().join(LAST_NOTIFICATION_FILE)
    }

    pub fn notifications_dir(&self) -> PathBuf {
        self.state_dir().join(NOTIFICATIONS_DIR)
    }

    pub fn archived_notifications_dir(&self) -> PathBuf {
        self.state_dir().join("archive").join(NOTIFICATIONS_DIR)
    }

    pub fn notification_events(&self) -> PathBuf {
        self.notifications_dir().join(NOTIFICATION_EVENTS_FILE)
    }

    pub fn inject(&self) -> PathBuf {
        self.state_dir().join(INJECT_FILE)
    }

    pub fn config(&self) -> PathBuf {
        self.state_dir().join(CONFIG_FILE)
    }

    pub fn loop_script(&self) -> PathBuf {
        self.root.join(LOOP_SCRIPT)
    }
}

/// App data root: `~/.config/ralph-dashboard/` on Linux, the platform
/// config dir elsewhere.
pub fn app_data_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("ralph-dashboard"))
}

/// Explicitly registered project paths: `<data_dir>/projects.json`.
pub fn registry_file(data_dir: &Path) -> PathBuf {
    data_dir.join("projects.json")
}

/// Default scan root when none is configured: `~/projects`.
pub fn default_project_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join("projects"))
}
