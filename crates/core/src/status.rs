//! Project status detection from the PID file, pause sentinel and plan.

use tracing::{debug, warn};

use crate::paths::ProjectPaths;
use crate::plan::plan_marks_complete;
use crate::process::{is_process_alive, read_pid};
use crate::project::ProjectStatus;

/// True if the PID file names a live process.
///
/// A PID file that cannot be parsed or names a dead process is stale and
/// is removed. An empty file is left alone; its writer has not finished.
pub fn is_running(paths: &ProjectPaths) -> bool {
    let pid_file = paths.pid();
    if let Some(pid) = read_pid(&pid_file) {
        if is_process_alive(pid) {
            return true;
        }
    }
    let has_content = std::fs::read(&pid_file)
        .map(|bytes| !bytes.trim_ascii().is_empty())
        .unwrap_or(false);
    if has_content {
        debug!(path = %pid_file.display(), "Removing stale PID file");
        match std::fs::remove_file(&pid_file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %pid_file.display(), error = %e, "Failed to remove stale PID file"),
        }
    }
    false
}

fn is_plan_complete(paths: &ProjectPaths) -> bool {
    std::fs::read(paths.plan())
        .map(|bytes| plan_marks_complete(&String::from_utf8_lossy(&bytes)))
        .unwrap_or(false)
}

/// Evaluate the current status of a project.
///
/// `paused` or `running` when a live PID exists (depending on the pause
/// sentinel), otherwise `complete` if the plan says so, else `stopped`.
/// Blocking; call from a blocking context in async code.
pub fn detect_project_status(paths: &ProjectPaths) -> ProjectStatus {
    if is_running(paths) {
        if paths.pause().exists() {
            ProjectStatus::Paused
        } else {
            ProjectStatus::Running
        }
    } else if is_plan_complete(paths) {
        ProjectStatus::Complete
    } else {
        ProjectStatus::Stopped
    }
}
