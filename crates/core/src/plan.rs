// crates/core/src/plan.rs
//! Parser for `IMPLEMENTATION_PLAN.md`.
//!
//! The plan is markdown: `## ` headings open phases, `- [ ]` / `- [x]`
//! checkbox items are tasks of the current phase, and the first
//! `STATUS: <value>` line (case-insensitive) is the plan status. Tasks
//! before the first phase heading are ignored.

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;

use crate::error::ParseError;

static PHASE_RE: OnceLock<Regex> = OnceLock::new();
static TASK_RE: OnceLock<Regex> = OnceLock::new();
static TASK_ID_RE: OnceLock<Regex> = OnceLock::new();
static STATUS_RE: OnceLock<Regex> = OnceLock::new();

fn phase_re() -> &'static Regex {
    PHASE_RE.get_or_init(|| Regex::new(r"^##\s+(?P<name>.+?)\s*$").expect("valid regex"))
}

fn task_re() -> &'static Regex {
    TASK_RE.get_or_init(|| {
        Regex::new(r"^(?P<indent>\s*)-\s+\[(?P<done>[xX ])\]\s+(?P<content>.+?)\s*$")
            .expect("valid regex")
    })
}

fn task_id_re() -> &'static Regex {
    TASK_ID_RE.get_or_init(|| {
        Regex::new(r"^(?P<id>\d+(?:\.\d+)*):\s*(?P<description>.+)$").expect("valid regex")
    })
}

fn status_re() -> &'static Regex {
    STATUS_RE.get_or_init(|| Regex::new(r"(?i)^STATUS:\s*(?P<status>.+?)\s*$").expect("valid regex"))
}

/// Progress of a single phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    InProgress,
    Complete,
}

impl PhaseStatus {
    fn from_counts(done: usize, total: usize) -> Self {
        if total == 0 {
            Self::Pending
        } else if done == total {
            Self::Complete
        } else if done > 0 {
            Self::InProgress
        } else {
            Self::Pending
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanTask {
    pub id: Option<String>,
    pub description: String,
    pub done: bool,
    pub indent: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanPhase {
    pub name: String,
    pub tasks: Vec<PlanTask>,
    pub done: usize,
    pub total: usize,
    pub status: PhaseStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplementationPlan {
    pub status: Option<String>,
    pub phases: Vec<PlanPhase>,
    pub tasks_done: usize,
    pub tasks_total: usize,
}

/// Structural fingerprint of a plan used to suppress duplicate updates.
///
/// Two plans with the same fingerprint differ at most in task wording or
/// non-task text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanSnapshot {
    pub tasks_done: usize,
    pub tasks_total: usize,
    pub phases: Vec<(String, usize, usize, PhaseStatus)>,
}

impl ImplementationPlan {
    pub fn snapshot(&self) -> PlanSnapshot {
        PlanSnapshot {
            tasks_done: self.tasks_done,
            tasks_total: self.tasks_total,
            phases: self
                .phases
                .iter()
                .map(|p| (p.name.clone(), p.done, p.total, p.status))
                .collect(),
        }
    }
}

/// Parse plan markdown into phases and tasks.
pub fn parse_plan(content: &str) -> ImplementationPlan {
    let mut status: Option<String> = None;
    let mut phases: Vec<PlanPhase> = Vec::new();

    for line in content.lines() {
        if status.is_none() {
            if let Some(caps) = status_re().captures(line.trim()) {
                status = Some(caps["status"].trim().to_string());
                continue;
            }
        }

        if let Some(caps) = phase_re().captures(line) {
            phases.push(PlanPhase {
                name: caps["name"].trim().to_string(),
                tasks: Vec::new(),
                done: 0,
                total: 0,
                status: PhaseStatus::Pending,
            });
            continue;
        }

        let Some(caps) = task_re().captures(line) else {
            continue;
        };
        let Some(phase) = phases.last_mut() else {
            continue;
        };

        let content = caps["content"].trim();
        let (id, description) = match task_id_re().captures(content) {
            Some(id_caps) => (
                Some(id_caps["id"].to_string()),
                id_caps["description"].trim().to_string(),
            ),
            None => (None, content.to_string()),
        };
        phase.tasks.push(PlanTask {
            id,
            description,
            done: caps["done"].eq_ignore_ascii_case("x"),
            indent: caps["indent"].len(),
        });
    }

    let mut tasks_done = 0;
    let mut tasks_total = 0;
    for phase in &mut phases {
        phase.total = phase.tasks.len();
        phase.done = phase.tasks.iter().filter(|t| t.done).count();
        phase.status = PhaseStatus::from_counts(phase.done, phase.total);
        tasks_done += phase.done;
        tasks_total += phase.total;
    }

    ImplementationPlan {
        status,
        phases,
        tasks_done,
        tasks_total,
    }
}

/// Read and parse a plan file. Returns `Ok(None)` when the file is absent.
pub async fn read_plan(path: &Path) -> Result<Option<ImplementationPlan>, ParseError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(parse_plan(&String::from_utf8_lossy(&bytes)))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ParseError::io(path, e)),
    }
}

/// True if any line of the plan, trimmed, equals `STATUS: COMPLETE`
/// (case-insensitive).
pub fn plan_marks_complete(content: &str) -> bool {
    content
        .lines()
        .any(|line| line.trim().eq_ignore_ascii_case("STATUS: COMPLETE"))
}
