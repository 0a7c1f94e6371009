//! File system watcher for Ralph project directories.
//!
//! One OS watcher covers every tracked project. Each project contributes up
//! to three non-recursive watches:
//!
//! ```text
//! <root>/                       IMPLEMENTATION_PLAN.md, AGENTS.md, PROMPT.md
//! <root>/.ralph/                ralph.log, iterations.jsonl, ralph.pid,
//!                               pause, pending-notification.txt
//! <root>/specs/                 *.md
//! ```
//!
//! The notify callback runs on the watcher's own thread. It only maps the
//! event to its project, applies the allow-list and the per-path debounce,
//! and `try_send`s onto the bounded queue. It never blocks: a full queue
//! drops the event and bumps a counter. A small flusher thread releases
//! changes the debounce held back once their window closes.

use notify::event::{CreateKind, RemoveKind};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use ralph_dashboard_core::paths::{
    ProjectPaths, SPECS_DIR, STATE_DIR, WATCHED_ROOT_FILES, WATCHED_STATE_FILES,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
    Other,
}

/// A relevant file change inside a tracked project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub project_id: String,
    pub project_root: PathBuf,
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// A project the watch layer should cover.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchTarget {
    pub id: String,
    pub root: PathBuf,
}

/// Result of reconciling watches against the desired project set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// True if `path` is a file the dashboard cares about, relative to `root`.
///
/// Accepts the root-level plan/agents/prompt files, the state files directly
/// under `.ralph/`, and markdown files directly under `specs/`.
pub fn is_relevant_path(root: &Path, path: &Path) -> bool {
    let Ok(rel) = path.strip_prefix(root) else {
        return false;
    };
    let parts: Vec<&str> = rel
        .components()
        .map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()
        .unwrap_or_default();

    match parts.as_slice() {
        [file] => WATCHED_ROOT_FILES.contains(file),
        [dir, file] if *dir == STATE_DIR => WATCHED_STATE_FILES.contains(file),
        [dir, file] if *dir == SPECS_DIR => file.ends_with(".md") && file.len() > ".md".len(),
        _ => false,
    }
}

/// Per-path debounce with a trailing edge.
///
/// The first change to a path passes at once. Changes inside the window
/// after it are held, and the latest held change is released when the
/// window closes, so the last write of a burst is always delivered.
pub struct Debouncer {
    window: Duration,
    last: HashMap<PathBuf, Instant>,
    held: HashMap<PathBuf, ChangeEvent>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: HashMap::new(),
            held: HashMap::new(),
        }
    }

    /// Returns the change if it may be queued now, otherwise holds it.
    pub fn offer(&mut self, change: ChangeEvent, now: Instant) -> Option<ChangeEvent> {
        if let Some(prev) = self.last.get(&change.path) {
            if now.duration_since(*prev) < self.window {
                self.held.insert(change.path.clone(), change);
                return None;
            }
        }
        self.held.remove(&change.path);
        self.last.insert(change.path.clone(), now);
        if self.last.len() > 4096 {
            let window = self.window;
            let held = &self.held;
            self.last
                .retain(|path, t| held.contains_key(path) || now.duration_since(*t) < window);
        }
        Some(change)
    }

    /// Held changes whose window has closed. Releasing one opens a new
    /// window for its path.
    pub fn take_due(&mut self, now: Instant) -> Vec<ChangeEvent> {
        let window = self.window;
        let due: Vec<PathBuf> = self
            .held
            .keys()
            .filter(|path| {
                !matches!(self.last.get(*path), Some(t) if now.duration_since(*t) < window)
            })
            .cloned()
            .collect();
        due.into_iter()
            .filter_map(|path| {
                self.last.insert(path.clone(), now);
                self.held.remove(&path)
            })
            .collect()
    }
}

fn enqueue(tx: &mpsc::Sender<ChangeEvent>, dropped: &AtomicU64, change: ChangeEvent) {
    if tx.try_send(change).is_err() {
        let count = dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if count == 1 || count % 100 == 0 {
            warn!(dropped_total = count, "Change queue full; event dropped");
        }
    }
}

/// Release held changes as their windows close. Exits once the watcher
/// that owns the debouncer is gone or the queue is closed.
fn spawn_flusher(
    debouncer: Weak<Mutex<Debouncer>>,
    tx: mpsc::Sender<ChangeEvent>,
    dropped: Arc<AtomicU64>,
    tick: Duration,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("ralph-debounce".into())
        .spawn(move || loop {
            std::thread::sleep(tick);
            let Some(debouncer) = debouncer.upgrade() else {
                break;
            };
            if tx.is_closed() {
                break;
            }
            let due = debouncer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take_due(Instant::now());
            for change in due {
                enqueue(&tx, &dropped, change);
            }
        })
        .map(|_| ())
}

/// Watched directory → owning project.
type DirMap = Arc<RwLock<HashMap<PathBuf, Arc<WatchTarget>>>>;

struct ProjectWatch {
    target: Arc<WatchTarget>,
    dirs: Vec<PathBuf>,
}

pub struct WatchService {
    watcher: RecommendedWatcher,
    dirs: DirMap,
    projects: HashMap<String, ProjectWatch>,
    dropped: Arc<AtomicU64>,
}

fn map_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(CreateKind::Folder) | EventKind::Remove(RemoveKind::Folder) => None,
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        EventKind::Remove(_) => Some(ChangeKind::Removed),
        EventKind::Access(_) => None,
        EventKind::Any | EventKind::Other => Some(ChangeKind::Other),
    }
}

impl WatchService {
    /// Create the OS watcher. Relevant changes are sent through `tx`.
    pub fn new(tx: mpsc::Sender<ChangeEvent>, debounce: Duration) -> notify::Result<Self> {
        let dirs: DirMap = Arc::new(RwLock::new(HashMap::new()));
        let dropped = Arc::new(AtomicU64::new(0));

        let dir_map = dirs.clone();
        let dropped_counter = dropped.clone();
        let debouncer = Arc::new(Mutex::new(Debouncer::new(debounce)));
        if !debounce.is_zero() {
            let tick = (debounce / 4).max(Duration::from_millis(10));
            spawn_flusher(Arc::downgrade(&debouncer), tx.clone(), dropped.clone(), tick)
                .map_err(notify::Error::io)?;
        }

        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    error!("File watcher error: {}", e);
                    return;
                }
            };
            let Some(kind) = map_kind(&event.kind) else {
                return;
            };

            for path in event.paths {
                let target = {
                    let map = dir_map.read().unwrap_or_else(PoisonError::into_inner);
                    path.parent().and_then(|parent| map.get(parent).cloned())
                };
                let Some(target) = target else {
                    continue;
                };
                if !is_relevant_path(&target.root, &path) {
                    continue;
                }

                let change = ChangeEvent {
                    project_id: target.id.clone(),
                    project_root: target.root.clone(),
                    path,
                    kind,
                };
                let ready = debouncer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .offer(change, Instant::now());
                if let Some(change) = ready {
                    enqueue(&tx, &dropped_counter, change);
                }
            }
        })?;

        Ok(Self {
            watcher,
            dirs,
            projects: HashMap::new(),
            dropped,
        })
    }

    /// Total events dropped because the queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn watched_projects(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.projects.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn targets(&self) -> Vec<WatchTarget> {
        self.projects
            .values()
            .map(|w| w.target.as_ref().clone())
            .collect()
    }

    /// Reconcile active watches with `desired`.
    ///
    /// Removed projects lose their watches. New projects gain them; a
    /// project whose root cannot be watched is skipped and retried on the
    /// next call. Existing projects pick up `.ralph/` or `specs/` if those
    /// directories appeared since the last call.
    pub fn refresh(&mut self, desired: &[WatchTarget]) -> RefreshReport {
        let mut report = RefreshReport::default();
        let wanted: HashSet<&str> = desired.iter().map(|t| t.id.as_str()).collect();

        let stale: Vec<String> = self
            .projects
            .iter()
            .filter(|(id, watch)| {
                !wanted.contains(id.as_str())
                    || !desired.iter().any(|t| &t.id == *id && t.root == watch.target.root)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            self.unwatch(&id);
            report.removed.push(id);
        }

        for target in desired {
            let is_new = !self.projects.contains_key(&target.id);
            if self.watch(target) && is_new {
                report.added.push(target.id.clone());
            }
        }

        report.added.sort();
        report.removed.sort();
        report
    }

    /// Ensure every existing directory of `target` is watched. Returns
    /// whether the project is tracked afterwards.
    fn watch(&mut self, target: &WatchTarget) -> bool {
        let paths = ProjectPaths::new(&target.root);
        let candidates = [target.root.clone(), paths.state_dir(), paths.specs_dir()];
        let shared = self
            .projects
            .get(&target.id)
            .map(|w| w.target.clone())
            .unwrap_or_else(|| Arc::new(target.clone()));
        let mut watched = self
            .projects
            .get(&target.id)
            .map(|w| w.dirs.clone())
            .unwrap_or_default();

        for dir in candidates {
            if watched.contains(&dir) || !dir.is_dir() {
                continue;
            }
            match self.watcher.watch(&dir, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    self.dirs
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(dir.clone(), shared.clone());
                    watched.push(dir);
                }
                Err(e) => {
                    warn!(project_id = %target.id, dir = %dir.display(), error = %e, "Failed to watch directory");
                    if dir == target.root {
                        return self.projects.contains_key(&target.id);
                    }
                }
            }
        }

        if !watched.contains(&target.root) {
            return false;
        }
        if !self.projects.contains_key(&target.id) {
            info!(project_id = %target.id, root = %target.root.display(), "Watching project");
        }
        self.projects.insert(
            target.id.clone(),
            ProjectWatch {
                target: shared,
                dirs: watched,
            },
        );
        true
    }

    fn unwatch(&mut self, id: &str) {
        let Some(watch) = self.projects.remove(id) else {
            return;
        };
        let mut map = self.dirs.write().unwrap_or_else(PoisonError::into_inner);
        for dir in &watch.dirs {
            map.remove(dir);
            if let Err(e) = self.watcher.unwatch(dir) {
                debug!(dir = %dir.display(), error = %e, "Unwatch failed (directory likely gone)");
            }
        }
        info!(project_id = %id, "Stopped watching project");
    }
}
