//! Change dispatcher: turns watcher events into domain events.
//!
//! Every handler re-reads the relevant file from disk, compares against the
//! last observation kept per project, and emits only on a real change.
//! Handler failures are logged and swallowed.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use ralph_dashboard_core::log_parser::{parse_iteration_header, read_log};
use ralph_dashboard_core::notification::{read_notification_file, NotificationKey};
use ralph_dashboard_core::paths::{
    LEDGER_FILE, LOG_FILE, PAUSE_FILE, PENDING_NOTIFICATION_FILE, PID_FILE, PLAN_FILE, STATE_DIR,
};
use ralph_dashboard_core::plan::{read_plan, PlanSnapshot};
use ralph_dashboard_core::{detect_project_status, ParseError, ProjectPaths, ProjectStatus};

use super::events::DomainEvent;
use super::hub::Hub;
use super::log_cursor::LogCursor;
use super::watcher::ChangeEvent;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Failed to read log {path}: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Last observed state of one project.
pub struct ProjectState {
    paths: ProjectPaths,
    started: HashSet<u32>,
    completed: HashSet<u32>,
    log: LogCursor,
    last_plan: Option<PlanSnapshot>,
    last_notification: Option<NotificationKey>,
    last_status: Option<ProjectStatus>,
}

impl ProjectState {
    fn new(root: &Path) -> Self {
        Self {
            paths: ProjectPaths::new(root),
            started: HashSet::new(),
            completed: HashSet::new(),
            log: LogCursor::new(),
            last_plan: None,
            last_notification: None,
            last_status: None,
        }
    }
}

/// Per-project dispatcher state, keyed by project id.
#[derive(Default)]
pub struct TrackedProjects {
    projects: HashMap<String, ProjectState>,
}

impl TrackedProjects {
    /// Start tracking a project. Existing state for the id is kept unless
    /// the root moved.
    pub fn track(&mut self, project_id: &str, root: &Path) {
        let fresh = self
            .projects
            .get(project_id)
            .map(|s| s.paths.root() != root)
            .unwrap_or(true);
        if fresh {
            self.projects
                .insert(project_id.to_string(), ProjectState::new(root));
        }
    }

    pub fn forget(&mut self, project_id: &str) -> bool {
        self.projects.remove(project_id).is_some()
    }

    pub fn is_tracked(&self, project_id: &str) -> bool {
        self.projects.contains_key(project_id)
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }
}

/// Which handler a changed path routes to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Plan,
    Notification,
    Status,
    Ledger,
    Log,
    Other(String),
}

fn route(root: &Path, path: &Path) -> Option<Route> {
    let rel = path.strip_prefix(root).ok()?;
    let rel = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

    let state_file = rel.strip_prefix(STATE_DIR).and_then(|r| r.strip_prefix('/'));
    Some(match (rel.as_str(), state_file) {
        (PLAN_FILE, _) => Route::Plan,
        (_, Some(PENDING_NOTIFICATION_FILE)) => Route::Notification,
        (_, Some(PID_FILE)) | (_, Some(PAUSE_FILE)) => Route::Status,
        (_, Some(LEDGER_FILE)) => Route::Ledger,
        (_, Some(LOG_FILE)) => Route::Log,
        _ => Route::Other(rel),
    })
}

pub struct Dispatcher {
    hub: Arc<Hub>,
    state: Mutex<TrackedProjects>,
    log_read_cap: u64,
}

impl Dispatcher {
    pub fn new(hub: Arc<Hub>, log_read_cap: u64) -> Self {
        Self {
            hub,
            state: Mutex::new(TrackedProjects::default()),
            log_read_cap: log_read_cap.max(1),
        }
    }

    /// Lock the tracked-project table. Holding the guard blocks dispatch.
    pub async fn tracked(&self) -> MutexGuard<'_, TrackedProjects> {
        self.state.lock().await
    }

    /// Handle one change. Events for untracked projects are ignored.
    pub async fn dispatch(&self, change: ChangeEvent) {
        let mut tracked = self.state.lock().await;
        let Some(state) = tracked.projects.get_mut(&change.project_id) else {
            debug!(project_id = %change.project_id, "Ignoring change for untracked project");
            return;
        };
        let Some(route) = route(state.paths.root(), &change.path) else {
            return;
        };

        let result = match route {
            Route::Plan => self.on_plan(&change.project_id, state).await,
            Route::Notification => self.on_notification(&change.project_id, state).await,
            Route::Status => self.on_status(&change.project_id, state).await,
            Route::Ledger => self.on_ledger(&change.project_id, state).await,
            Route::Log => self.on_log(&change.project_id, state).await,
            Route::Other(file) => {
                self.hub
                    .emit(&change.project_id, &DomainEvent::FileChanged { file });
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(
                project_id = %change.project_id,
                path = %change.path.display(),
                error = %e,
                "Failed to handle file change"
            );
        }
    }

    async fn on_plan(&self, project_id: &str, state: &mut ProjectState) -> Result<(), DispatchError> {
        if let Some(plan) = read_plan(&state.paths.plan()).await? {
            let snapshot = plan.snapshot();
            if state.last_plan.as_ref() != Some(&snapshot) {
                state.last_plan = Some(snapshot);
                self.hub.emit(project_id, &DomainEvent::plan_updated(&plan));
            }
        }
        self.on_status(project_id, state).await
    }

    async fn on_notification(
        &self,
        project_id: &str,
        state: &mut ProjectState,
    ) -> Result<(), DispatchError> {
        let Some(entry) = read_notification_file(&state.paths.pending_notification()).await? else {
            return Ok(());
        };
        let key = entry.key();
        if state.last_notification.as_ref() == Some(&key) {
            return Ok(());
        }
        state.last_notification = Some(key);
        self.hub.emit(project_id, &DomainEvent::notification(entry));
        Ok(())
    }

    async fn on_status(&self, project_id: &str, state: &mut ProjectState) -> Result<(), DispatchError> {
        let paths = state.paths.clone();
        let status = tokio::task::spawn_blocking(move || detect_project_status(&paths)).await?;
        if state.last_status == Some(status) {
            return Ok(());
        }
        let previous = state.last_status.replace(status);
        self.hub
            .emit(project_id, &DomainEvent::StatusChanged { status, previous });
        Ok(())
    }

    async fn on_ledger(&self, project_id: &str, state: &mut ProjectState) -> Result<(), DispatchError> {
        let path = state.paths.ledger();
        let Some(record) = ralph_dashboard_core::ledger::read_last_record(&path).await? else {
            return Ok(());
        };

        if state.started.insert(record.iteration) {
            self.hub.emit(
                project_id,
                &DomainEvent::IterationStarted {
                    iteration: record.iteration,
                    max: record.max,
                },
            );
        }
        if record.is_finished() && state.completed.insert(record.iteration) {
            self.hub
                .emit(project_id, &DomainEvent::iteration_completed(&record));
        }
        Ok(())
    }

    /// Deliver everything appended since the last read, one capped chunk
    /// per event, until the cursor reaches the end of the file.
    async fn on_log(&self, project_id: &str, state: &mut ProjectState) -> Result<(), DispatchError> {
        let path = state.paths.log();
        let mut saw_header = false;
        loop {
            let lines = match state.log.read_appended(&path, self.log_read_cap).await {
                Ok(Some(lines)) => lines,
                Ok(None) => break,
                Err(source) => {
                    state.log.reset();
                    if source.kind() == std::io::ErrorKind::NotFound {
                        return Ok(());
                    }
                    return Err(DispatchError::Log { path, source });
                }
            };
            saw_header |= lines.lines().any(|line| parse_iteration_header(line).is_some());
            self.hub
                .emit(project_id, &DomainEvent::LogAppend { lines });
        }

        if saw_header {
            self.on_log_iterations(project_id, state).await?;
        }
        Ok(())
    }

    /// A header starts an iteration and the next header completes the one
    /// before it. Shares the started and completed sets with the ledger.
    /// Runs only when a new header was appended.
    async fn on_log_iterations(
        &self,
        project_id: &str,
        state: &mut ProjectState,
    ) -> Result<(), DispatchError> {
        let blocks = read_log(&state.paths.log()).await?;
        let open = blocks.len().saturating_sub(1);
        for (index, block) in blocks.iter().enumerate() {
            if state.started.insert(block.number) {
                self.hub.emit(
                    project_id,
                    &DomainEvent::IterationStarted {
                        iteration: block.number,
                        max: block.max_iterations,
                    },
                );
            }
            if index < open && state.completed.insert(block.number) {
                self.hub
                    .emit(project_id, &DomainEvent::log_iteration_completed(block));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::watcher::ChangeKind;
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use std::fs;
    use std::io::Write;
    use tokio::sync::mpsc::UnboundedReceiver;

    const ID: &str = "demo-abc123";

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        dispatcher: Dispatcher,
        rx: UnboundedReceiver<String>,
    }

    impl Fixture {
        async fn new() -> Self {
            Self::with_cap(256 * 1024).await
        }

        async fn with_cap(log_read_cap: u64) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let root = tmp.path().canonicalize().unwrap();
            fs::create_dir_all(root.join(".ralph")).unwrap();

            let hub = Arc::new(Hub::new());
            let (conn, rx) = hub.connect();
            hub.subscribe(conn, &[ID.to_string()]);
            let dispatcher = Dispatcher::new(hub, log_read_cap);
            dispatcher.tracked().await.track(ID, &root);

            Self {
                _tmp: tmp,
                root,
                dispatcher,
                rx,
            }
        }

        async fn touch(&self, rel: &str) {
            self.dispatcher
                .dispatch(ChangeEvent {
                    project_id: ID.into(),
                    project_root: self.root.clone(),
                    path: self.root.join(rel),
                    kind: ChangeKind::Modified,
                })
                .await;
        }

        fn write(&self, rel: &str, content: &str) {
            fs::write(self.root.join(rel), content).unwrap();
        }

        fn append(&self, rel: &str, content: &str) {
            let mut f = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.root.join(rel))
                .unwrap();
            f.write_all(content.as_bytes()).unwrap();
        }

        fn drain(&mut self) -> Vec<Value> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                out.push(serde_json::from_str(&msg).unwrap());
            }
            out
        }

        fn kinds(&mut self) -> Vec<String> {
            self.drain()
                .into_iter()
                .map(|v| v["type"].as_str().unwrap().to_string())
                .collect()
        }
    }

    #[test]
    fn test_routing() {
        let root = Path::new("/p");
        assert_eq!(route(root, Path::new("/p/IMPLEMENTATION_PLAN.md")), Some(Route::Plan));
        assert_eq!(
            route(root, Path::new("/p/.ralph/pending-notification.txt")),
            Some(Route::Notification)
        );
        assert_eq!(route(root, Path::new("/p/.ralph/ralph.pid")), Some(Route::Status));
        assert_eq!(route(root, Path::new("/p/.ralph/pause")), Some(Route::Status));
        assert_eq!(route(root, Path::new("/p/.ralph/iterations.jsonl")), Some(Route::Ledger));
        assert_eq!(route(root, Path::new("/p/.ralph/ralph.log")), Some(Route::Log));
        assert_eq!(
            route(root, Path::new("/p/specs/api.md")),
            Some(Route::Other("specs/api.md".into()))
        );
        assert_eq!(route(root, Path::new("/q/AGENTS.md")), None);
    }

    #[tokio::test]
    async fn test_log_appends_concatenate_to_file_content() {
        let mut fx = Fixture::new().await;
        fx.append(".ralph/ralph.log", "first\nsec");
        fx.touch(".ralph/ralph.log").await;
        fx.append(".ralph/ralph.log", "ond\nthird\n");
        fx.touch(".ralph/ralph.log").await;
        fx.touch(".ralph/ralph.log").await;

        let payload: String = fx
            .drain()
            .iter()
            .filter(|v| v["type"] == "log_append")
            .map(|v| v["data"]["lines"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(payload, "first\nsecond\nthird\n");
    }

    #[tokio::test]
    async fn test_one_event_drains_appends_larger_than_the_cap() {
        let mut fx = Fixture::with_cap(16).await;
        fx.write(".ralph/ralph.log", "");
        fx.touch(".ralph/ralph.log").await;

        let appended = "line-one\nline-two\nline-three\nline-four\n";
        fx.append(".ralph/ralph.log", appended);
        fx.touch(".ralph/ralph.log").await;

        let payload: String = fx
            .drain()
            .iter()
            .filter(|v| v["type"] == "log_append")
            .map(|v| v["data"]["lines"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(payload, appended);
    }

    #[tokio::test]
    async fn test_log_truncation_drops_old_bytes() {
        let mut fx = Fixture::new().await;
        fx.append(".ralph/ralph.log", "old one\nold two\n");
        fx.touch(".ralph/ralph.log").await;
        fx.drain();

        fx.write(".ralph/ralph.log", "");
        fx.touch(".ralph/ralph.log").await;
        fx.append(".ralph/ralph.log", "new\n");
        fx.touch(".ralph/ralph.log").await;

        let events = fx.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["data"]["lines"], "new\n");
    }

    #[tokio::test]
    async fn test_log_header_announces_iteration_once() {
        let mut fx = Fixture::new().await;
        fx.append(".ralph/ralph.log", "[10:00:00] === Iteration 1/5 ===\nworking\n");
        fx.touch(".ralph/ralph.log").await;
        assert_eq!(fx.kinds(), vec!["log_append", "iteration_started"]);

        fx.append(
            ".ralph/iterations.jsonl",
            "{\"iteration\":1,\"max\":5,\"start\":\"2026-01-01T10:00:00Z\"}\n",
        );
        fx.touch(".ralph/iterations.jsonl").await;
        assert!(fx.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_next_log_header_completes_previous_iteration() {
        let mut fx = Fixture::new().await;
        fx.append(
            ".ralph/ralph.log",
            "=== Iteration 1 (loop 1/5) ===\nError: build failed\ntokens used\n1,500\n",
        );
        fx.touch(".ralph/ralph.log").await;
        assert_eq!(fx.kinds(), vec!["log_append", "iteration_started"]);

        fx.append(".ralph/ralph.log", "=== Iteration 2 (loop 2/5) ===\n");
        fx.touch(".ralph/ralph.log").await;
        let events = fx.drain();
        let kinds: Vec<&str> = events.iter().map(|v| v["type"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["log_append", "iteration_completed", "iteration_started"]);
        assert_eq!(events[1]["data"]["iteration"], 1);
        assert_eq!(events[1]["data"]["max"], 5);
        assert_eq!(events[1]["data"]["status"], "error");
        assert_eq!(events[1]["data"]["tokens"], 1500.0);
        assert_eq!(events[1]["data"]["errors"], serde_json::json!(["Error: build failed"]));
        assert_eq!(events[2]["data"]["iteration"], 2);

        fx.append(
            ".ralph/iterations.jsonl",
            "{\"iteration\":1,\"max\":5,\"start\":\"s\",\"end\":\"e\"}\n",
        );
        fx.touch(".ralph/iterations.jsonl").await;
        assert!(fx.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_ledger_started_and_completed_once() {
        let mut fx = Fixture::new().await;
        fx.append(
            ".ralph/iterations.jsonl",
            "{\"iteration\":3,\"max\":10,\"start\":\"2026-01-01T10:00:00Z\"}\n",
        );
        fx.touch(".ralph/iterations.jsonl").await;
        fx.touch(".ralph/iterations.jsonl").await;

        fx.append(
            ".ralph/iterations.jsonl",
            "{\"iteration\":3,\"max\":10,\"start\":\"2026-01-01T10:00:00Z\",\"end\":\"2026-01-01T10:05:00Z\",\"tokens\":1200,\"status\":\"success\"}\n",
        );
        fx.touch(".ralph/iterations.jsonl").await;
        fx.touch(".ralph/iterations.jsonl").await;

        let events = fx.drain();
        let kinds: Vec<&str> = events.iter().map(|v| v["type"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["iteration_started", "iteration_completed"]);
        assert_eq!(events[1]["data"]["iteration"], 3);
        assert_eq!(events[1]["data"]["end"], "2026-01-01T10:05:00Z");
        assert_eq!(events[1]["project"], ID);
    }

    #[tokio::test]
    async fn test_identical_plan_rewrite_is_suppressed() {
        let mut fx = Fixture::new().await;
        fx.write("IMPLEMENTATION_PLAN.md", "## Phase 1\n- [x] a\n- [ ] b\n");
        fx.touch("IMPLEMENTATION_PLAN.md").await;
        let events = fx.drain();
        assert_eq!(events[0]["type"], "plan_updated");
        assert_eq!(events[0]["data"]["tasks_done"], 1);
        assert_eq!(events[0]["data"]["tasks_total"], 2);

        fx.write("IMPLEMENTATION_PLAN.md", "## Phase 1\n- [x] a reworded\n- [ ] b\n");
        fx.touch("IMPLEMENTATION_PLAN.md").await;
        assert!(fx.kinds().iter().all(|k| k != "plan_updated"));
    }

    #[tokio::test]
    async fn test_duplicate_notification_is_suppressed() {
        let mut fx = Fixture::new().await;
        let body = r#"{"timestamp":"2026-01-01T10:00:00Z","prefix":"DONE","message":"All tasks complete","iteration":4}"#;
        fx.write(".ralph/pending-notification.txt", body);
        fx.touch(".ralph/pending-notification.txt").await;
        fx.write(".ralph/pending-notification.txt", body);
        fx.touch(".ralph/pending-notification.txt").await;

        let events = fx.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "notification");
        assert_eq!(events[0]["data"]["prefix"], "DONE");
        assert_eq!(events[0]["data"]["iteration"], 4);
    }

    #[tokio::test]
    async fn test_rewritten_legacy_notification_is_suppressed() {
        let mut fx = Fixture::new().await;
        fx.write(".ralph/pending-notification.txt", "DONE: all tasks complete");
        fx.touch(".ralph/pending-notification.txt").await;

        // Push the mtime forward so the rewrite is observably newer.
        fx.write(".ralph/pending-notification.txt", "DONE: all tasks complete");
        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(60);
        fs::File::options()
            .write(true)
            .open(fx.root.join(".ralph/pending-notification.txt"))
            .unwrap()
            .set_modified(later)
            .unwrap();
        fx.touch(".ralph/pending-notification.txt").await;

        let events = fx.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["data"]["prefix"], "DONE");
        assert_eq!(events[0]["data"]["message"], "all tasks complete");

        fx.write(".ralph/pending-notification.txt", "BLOCKED: need credentials");
        fx.touch(".ralph/pending-notification.txt").await;
        assert_eq!(fx.kinds(), vec!["notification"]);
    }

    #[tokio::test]
    async fn test_pause_transition_carries_previous() {
        let mut fx = Fixture::new().await;
        fx.write(".ralph/ralph.pid", &std::process::id().to_string());
        fx.touch(".ralph/ralph.pid").await;
        fx.write(".ralph/pause", "");
        fx.touch(".ralph/pause").await;
        fx.touch(".ralph/pause").await;

        let events = fx.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["data"], serde_json::json!({"status": "running"}));
        assert_eq!(
            events[1]["data"],
            serde_json::json!({"status": "paused", "previous": "running"})
        );
    }

    #[tokio::test]
    async fn test_other_files_report_relative_path() {
        let mut fx = Fixture::new().await;
        fs::create_dir_all(fx.root.join("specs")).unwrap();
        fx.write("specs/api.md", "# API");
        fx.touch("specs/api.md").await;

        let events = fx.drain();
        assert_eq!(events[0]["type"], "file_changed");
        assert_eq!(events[0]["data"]["file"], "specs/api.md");
    }

    #[tokio::test]
    async fn test_untracked_project_is_ignored() {
        let mut fx = Fixture::new().await;
        assert!(fx.dispatcher.tracked().await.forget(ID));
        fx.write("AGENTS.md", "x");
        fx.touch("AGENTS.md").await;
        assert!(fx.drain().is_empty());
    }

    #[tokio::test]
    async fn test_missing_log_is_not_an_error() {
        let mut fx = Fixture::new().await;
        fx.touch(".ralph/ralph.log").await;
        assert!(fx.drain().is_empty());
    }
}
