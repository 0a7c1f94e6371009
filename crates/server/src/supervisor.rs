//! Process supervisor: start, stop, pause, resume and steer a project's
//! agent loop.
//!
//! The PID file is the only record of a running loop; every operation
//! re-reads it. Liveness follows the same rules as status detection.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpgid, getpgrp, Pid};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use ralph_dashboard_core::loop_config::{read_loop_config, write_loop_config, LoopConfig, LoopOverrides};
use ralph_dashboard_core::process::{is_process_alive, read_pid};
use ralph_dashboard_core::{ParseError, ProjectPaths};

use crate::registry::ProjectRegistry;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Process already running with pid {pid}")]
    AlreadyRunning { pid: i32 },

    #[error("No ralph.sh found for project start")]
    CommandNotFound,

    #[error("Injection message cannot be empty")]
    InvalidInjection,

    #[error("Invalid config.json: {0}")]
    ConfigParse(String),

    #[error("Invalid config values: {0}")]
    ConfigValidation(String),

    #[error("Refusing to signal the dashboard's own process")]
    OwnProcess,

    #[error("Failed to launch {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Signal delivery failed: {0}")]
    Signal(#[from] Errno),
}

impl SupervisorError {
    fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| Self::Io { path, source }
    }
}

impl From<ParseError> for SupervisorError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::MalformedJson { message, .. } => Self::ConfigParse(message),
            ParseError::InvalidValue { message, .. } => Self::ConfigValidation(message),
            ParseError::NotFound { path } => Self::Io {
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
                path,
            },
            ParseError::PermissionDenied { path } => Self::Io {
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                path,
            },
            ParseError::Io { path, source } => Self::Io { path, source },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartResult {
    pub project_id: String,
    pub pid: i32,
    pub command: Vec<String>,
}

pub struct ProcessSupervisor {
    registry: Arc<ProjectRegistry>,
    fallback_script: Option<PathBuf>,
    stop_grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(
        registry: Arc<ProjectRegistry>,
        fallback_script: Option<PathBuf>,
        stop_grace: Duration,
    ) -> Self {
        Self {
            registry,
            fallback_script,
            stop_grace,
        }
    }

    async fn paths(&self, project_id: &str) -> Result<ProjectPaths, SupervisorError> {
        self.registry
            .resolve(project_id)
            .await
            .map(ProjectPaths::new)
            .ok_or_else(|| SupervisorError::ProjectNotFound(project_id.to_string()))
    }

    /// Project `ralph.sh`, else the configured fallback script.
    fn default_command(&self, paths: &ProjectPaths) -> Result<Vec<String>, SupervisorError> {
        let local = paths.loop_script();
        if local.is_file() {
            return Ok(vec![local.to_string_lossy().into_owned()]);
        }
        match &self.fallback_script {
            Some(script) if script.is_file() => Ok(vec![script.to_string_lossy().into_owned()]),
            _ => Err(SupervisorError::CommandNotFound),
        }
    }

    /// Launch the loop detached in its own process group.
    pub async fn start(
        &self,
        project_id: &str,
        command: Option<Vec<String>>,
        env: &[(String, String)],
    ) -> Result<StartResult, SupervisorError> {
        let paths = self.paths(project_id).await?;
        let state_dir = paths.state_dir();
        tokio::fs::create_dir_all(&state_dir)
            .await
            .map_err(SupervisorError::io(&state_dir))?;

        let pid_file = paths.pid();
        if let Some(pid) = read_pid(&pid_file) {
            if is_process_alive(pid) {
                return Err(SupervisorError::AlreadyRunning { pid });
            }
            debug!(project_id = %project_id, pid, "Removing stale PID file before start");
            remove_if_exists(&pid_file).await?;
        }

        let command = match command.filter(|c| !c.is_empty()) {
            Some(c) => c,
            None => self.default_command(&paths)?,
        };

        let log_path = paths.log();
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(SupervisorError::io(&log_path))?;
        let log_err = log.try_clone().map_err(SupervisorError::io(&log_path))?;

        let mut cmd = tokio::process::Command::new(&command[0]);
        cmd.args(&command[1..])
            .current_dir(paths.root())
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0);

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            command: command.join(" "),
            source,
        })?;
        let Some(pid) = child.id().map(|id| id as i32) else {
            return Err(SupervisorError::Spawn {
                command: command.join(" "),
                source: std::io::Error::other("process exited before its pid was read"),
            });
        };

        tokio::fs::write(&pid_file, pid.to_string())
            .await
            .map_err(SupervisorError::io(&pid_file))?;

        let reaped_id = project_id.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(project_id = %reaped_id, pid, %status, "Loop process exited"),
                Err(e) => warn!(project_id = %reaped_id, pid, error = %e, "Failed to reap loop process"),
            }
            // Only our own record; a later start may have replaced it.
            if read_pid(&pid_file) == Some(pid) {
                if let Err(e) = remove_if_exists(&pid_file).await {
                    warn!(project_id = %reaped_id, error = %e, "Failed to remove PID file of exited loop");
                }
            }
        });

        info!(project_id = %project_id, pid, command = %command.join(" "), "Started loop");
        Ok(StartResult {
            project_id: project_id.to_string(),
            pid,
            command,
        })
    }

    /// Start with the stored loop config merged with `overrides`.
    pub async fn start_loop(
        &self,
        project_id: &str,
        overrides: &LoopOverrides,
    ) -> Result<StartResult, SupervisorError> {
        let config = self.read_config(project_id).await?.merged(overrides);
        config.validate().map_err(SupervisorError::ConfigValidation)?;

        let paths = self.paths(project_id).await?;
        let mut command = self.default_command(&paths)?;
        command.push(config.max_iterations.to_string());
        self.start(project_id, Some(command), &config.env()).await
    }

    /// Stop with the configured grace period.
    pub async fn stop(&self, project_id: &str) -> Result<bool, SupervisorError> {
        self.stop_with_grace(project_id, self.stop_grace).await
    }

    /// SIGTERM the loop's process group, escalating to SIGKILL after
    /// `grace`. Returns false when nothing was running.
    pub async fn stop_with_grace(
        &self,
        project_id: &str,
        grace: Duration,
    ) -> Result<bool, SupervisorError> {
        let paths = self.paths(project_id).await?;
        let pid_file = paths.pid();

        let Some(pid) = read_pid(&pid_file) else {
            remove_if_exists(&pid_file).await?;
            return Ok(false);
        };
        if !is_process_alive(pid) {
            remove_if_exists(&pid_file).await?;
            return Ok(false);
        }
        if pid == std::process::id() as i32 {
            return Err(SupervisorError::OwnProcess);
        }

        signal_loop(pid, Signal::SIGTERM)?;
        if !wait_for_exit(pid, grace).await {
            warn!(project_id = %project_id, pid, "Loop ignored SIGTERM; sending SIGKILL");
            signal_loop(pid, Signal::SIGKILL)?;
            wait_for_exit(pid, KILL_WAIT).await;
        }

        remove_if_exists(&pid_file).await?;
        info!(project_id = %project_id, pid, "Stopped loop");
        Ok(true)
    }

    /// Create the pause sentinel. Returns true when newly paused.
    pub async fn pause(&self, project_id: &str) -> Result<bool, SupervisorError> {
        let paths = self.paths(project_id).await?;
        let state_dir = paths.state_dir();
        tokio::fs::create_dir_all(&state_dir)
            .await
            .map_err(SupervisorError::io(&state_dir))?;
        let pause = paths.pause();
        if pause.exists() {
            return Ok(false);
        }
        tokio::fs::write(&pause, b"")
            .await
            .map_err(SupervisorError::io(&pause))?;
        Ok(true)
    }

    /// Remove the pause sentinel. Returns true when a pause was cleared.
    pub async fn resume(&self, project_id: &str) -> Result<bool, SupervisorError> {
        let paths = self.paths(project_id).await?;
        let pause = paths.pause();
        if !pause.is_file() {
            return Ok(false);
        }
        remove_if_exists(&pause).await
    }

    /// Append an instruction to `.ralph/inject.md` for the next iteration.
    /// Returns the file's new content.
    pub async fn inject(&self, project_id: &str, message: &str) -> Result<String, SupervisorError> {
        let content = message.trim();
        if content.is_empty() {
            return Err(SupervisorError::InvalidInjection);
        }

        let paths = self.paths(project_id).await?;
        let state_dir = paths.state_dir();
        tokio::fs::create_dir_all(&state_dir)
            .await
            .map_err(SupervisorError::io(&state_dir))?;

        let inject = paths.inject();
        let existing = match tokio::fs::read_to_string(&inject).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(SupervisorError::io(&inject)(e)),
        };
        let existing = existing.trim_end();
        let payload = if existing.is_empty() {
            format!("{}\n", content)
        } else {
            format!("{}\n\n{}\n", existing, content)
        };

        tokio::fs::write(&inject, &payload)
            .await
            .map_err(SupervisorError::io(&inject))?;
        Ok(payload)
    }

    pub async fn read_config(&self, project_id: &str) -> Result<LoopConfig, SupervisorError> {
        let path = self.paths(project_id).await?.config();
        Ok(tokio::task::spawn_blocking(move || read_loop_config(&path))
            .await
            .map_err(|e| SupervisorError::Io {
                path: PathBuf::new(),
                source: std::io::Error::other(e),
            })??)
    }

    pub async fn write_config(
        &self,
        project_id: &str,
        config: LoopConfig,
    ) -> Result<LoopConfig, SupervisorError> {
        let path = self.paths(project_id).await?.config();
        tokio::task::spawn_blocking(move || write_loop_config(&path, &config).map(|()| config))
            .await
            .map_err(|e| SupervisorError::Io {
                path: PathBuf::new(),
                source: std::io::Error::other(e),
            })?
            .map_err(SupervisorError::from)
    }
}

async fn remove_if_exists(path: &Path) -> Result<bool, SupervisorError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(SupervisorError::io(path)(e)),
    }
}

/// Signal the loop's process group, or only the pid when it shares our group.
fn signal_loop(pid: i32, signal: Signal) -> Result<(), SupervisorError> {
    let target = Pid::from_raw(pid);
    let result = match getpgid(Some(target)) {
        Ok(pgid) if pgid != getpgrp() => killpg(pgid, signal),
        _ => kill(target, signal),
    };
    match result {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(SupervisorError::Signal(e)),
    }
}

async fn wait_for_exit(pid: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !is_process_alive(pid) {
            return true;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    !is_process_alive(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ralph_dashboard_core::project_id_from_path;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    struct Fixture {
        _scan: tempfile::TempDir,
        _data: tempfile::TempDir,
        root: PathBuf,
        id: String,
        supervisor: ProcessSupervisor,
    }

    fn fixture() -> Fixture {
        let scan = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let root = scan.path().canonicalize().unwrap().join("control-project");
        fs::create_dir_all(root.join(".ralph")).unwrap();
        let registry = Arc::new(ProjectRegistry::new(vec![scan.path().to_path_buf()], data.path()));
        Fixture {
            id: project_id_from_path(&root),
            root,
            supervisor: ProcessSupervisor::new(registry, None, Duration::from_secs(3)),
            _scan: scan,
            _data: data,
        }
    }

    fn write_script(path: &Path, body: &str) {
        fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn test_unknown_project() {
        let fx = fixture();
        assert!(matches!(
            fx.supervisor.pause("nope-000000").await,
            Err(SupervisorError::ProjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_without_pid_file_is_not_running() {
        let fx = fixture();
        assert!(!fx.supervisor.stop(&fx.id).await.unwrap());
        assert!(!fx.root.join(".ralph/ralph.pid").exists());
    }

    #[tokio::test]
    async fn test_stop_removes_garbage_pid_file() {
        let fx = fixture();
        fs::write(fx.root.join(".ralph/ralph.pid"), "not-a-pid").unwrap();
        assert!(!fx.supervisor.stop(&fx.id).await.unwrap());
        assert!(!fx.root.join(".ralph/ralph.pid").exists());
    }

    #[tokio::test]
    async fn test_stop_refuses_own_process() {
        let fx = fixture();
        fs::write(fx.root.join(".ralph/ralph.pid"), std::process::id().to_string()).unwrap();
        assert!(matches!(
            fx.supervisor.stop(&fx.id).await,
            Err(SupervisorError::OwnProcess)
        ));
    }

    #[tokio::test]
    async fn test_start_without_script_fails() {
        let fx = fixture();
        assert!(matches!(
            fx.supervisor.start(&fx.id, None, &[]).await,
            Err(SupervisorError::CommandNotFound)
        ));
    }

    #[tokio::test]
    async fn test_start_rejects_live_pid() {
        let fx = fixture();
        fs::write(fx.root.join(".ralph/ralph.pid"), std::process::id().to_string()).unwrap();
        assert!(matches!(
            fx.supervisor.start(&fx.id, None, &[]).await,
            Err(SupervisorError::AlreadyRunning { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let fx = fixture();
        write_script(&fx.root.join("ralph.sh"), "echo \"loop $1 $RALPH_CLI\"\nexec sleep 30");
        fs::write(
            fx.root.join(".ralph/config.json"),
            r#"{"max_iterations": 7, "cli": "codex"}"#,
        )
        .unwrap();

        let result = fx
            .supervisor
            .start_loop(&fx.id, &LoopOverrides::default())
            .await
            .unwrap();
        assert_eq!(result.command.last().map(String::as_str), Some("7"));
        let recorded: i32 = fs::read_to_string(fx.root.join(".ralph/ralph.pid"))
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(recorded, result.pid);
        assert!(is_process_alive(result.pid));

        assert!(matches!(
            fx.supervisor.start(&fx.id, None, &[]).await,
            Err(SupervisorError::AlreadyRunning { .. })
        ));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(fx.supervisor.stop(&fx.id).await.unwrap());
        assert!(!fx.root.join(".ralph/ralph.pid").exists());
        assert!(!is_process_alive(result.pid));

        let log = fs::read_to_string(fx.root.join(".ralph/ralph.log")).unwrap();
        assert!(log.contains("loop 7 codex"));
    }

    #[tokio::test]
    async fn test_stop_escalates_to_sigkill() {
        let fx = fixture();
        write_script(&fx.root.join("ralph.sh"), "trap '' TERM\nwhile true; do sleep 1; done");

        let result = fx.supervisor.start(&fx.id, None, &[]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(fx
            .supervisor
            .stop_with_grace(&fx.id, Duration::from_millis(300))
            .await
            .unwrap());
        assert!(!is_process_alive(result.pid));
    }

    #[tokio::test]
    async fn test_exited_loop_clears_its_pid_file() {
        let fx = fixture();
        write_script(&fx.root.join("ralph.sh"), "echo done");
        let pid_file = fx.root.join(".ralph/ralph.pid");

        fx.supervisor.start(&fx.id, None, &[]).await.unwrap();
        for _ in 0..50 {
            if !pid_file.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(!pid_file.exists());
        assert!(!fx.supervisor.stop(&fx.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_pause_and_resume_are_idempotent() {
        let fx = fixture();
        assert!(fx.supervisor.pause(&fx.id).await.unwrap());
        assert!(!fx.supervisor.pause(&fx.id).await.unwrap());
        assert!(fx.root.join(".ralph/pause").exists());

        assert!(fx.supervisor.resume(&fx.id).await.unwrap());
        assert!(!fx.supervisor.resume(&fx.id).await.unwrap());
        assert!(!fx.root.join(".ralph/pause").exists());
    }

    #[tokio::test]
    async fn test_inject_appends_with_blank_line() {
        let fx = fixture();
        assert!(matches!(
            fx.supervisor.inject(&fx.id, "   ").await,
            Err(SupervisorError::InvalidInjection)
        ));

        fx.supervisor.inject(&fx.id, "do X").await.unwrap();
        let combined = fx.supervisor.inject(&fx.id, "  do Y \n").await.unwrap();
        assert_eq!(combined, "do X\n\ndo Y\n");
        assert_eq!(
            fs::read_to_string(fx.root.join(".ralph/inject.md")).unwrap(),
            combined
        );
    }

    #[tokio::test]
    async fn test_config_round_trip_and_errors() {
        let fx = fixture();
        assert_eq!(fx.supervisor.read_config(&fx.id).await.unwrap(), LoopConfig::default());

        let config = LoopConfig {
            max_iterations: 42,
            ..LoopConfig::default()
        };
        fx.supervisor.write_config(&fx.id, config.clone()).await.unwrap();
        assert_eq!(fx.supervisor.read_config(&fx.id).await.unwrap(), config);

        let bad = LoopConfig {
            max_iterations: 0,
            ..LoopConfig::default()
        };
        assert!(matches!(
            fx.supervisor.write_config(&fx.id, bad).await,
            Err(SupervisorError::ConfigValidation(_))
        ));

        fs::write(fx.root.join(".ralph/config.json"), "[1, 2]").unwrap();
        assert!(matches!(
            fx.supervisor.read_config(&fx.id).await,
            Err(SupervisorError::ConfigParse(_))
        ));
    }
}
