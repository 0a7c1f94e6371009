//! PID file and process liveness helpers shared by status detection and
//! the process supervisor.

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::path::Path;

/// Read a PID from a file.
///
/// Returns `None` when the file is missing, unreadable, not an integer,
/// or not a positive pid.
pub fn read_pid(pid_file: &Path) -> Option<i32> {
    let content = std::fs::read_to_string(pid_file).ok()?;
    content.trim().parse::<i32>().ok().filter(|pid| *pid > 0)
}

/// True if `/proc/<pid>/stat` reports the process as a zombie.
///
/// Platforms without procfs never report zombies.
pub fn is_zombie_pid(pid: i32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // Format: `pid (comm) state ...`; comm may contain spaces or parens.
    stat.rfind(')')
        .and_then(|idx| stat[idx + 1..].split_whitespace().next())
        .map(|state| state == "Z")
        .unwrap_or(false)
}

/// True if the process exists and is not a zombie.
///
/// Uses signal 0. A permission error means the process exists but belongs
/// to another user, which counts as alive.
pub fn is_process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => !is_zombie_pid(pid),
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
