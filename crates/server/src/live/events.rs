//! Domain events pushed to realtime clients.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use ralph_dashboard_core::ledger::IterationRecord;
use ralph_dashboard_core::log_parser::LogIteration;
use ralph_dashboard_core::notification::NotificationEntry;
use ralph_dashboard_core::plan::{ImplementationPlan, PhaseStatus};
use ralph_dashboard_core::ProjectStatus;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseProgress {
    pub name: String,
    pub done: usize,
    pub total: usize,
    pub status: PhaseStatus,
}

/// One event per kind of observable project change.
///
/// Serialized adjacently tagged: `{"type": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DomainEvent {
    /// New complete log lines, terminators included, concatenated.
    LogAppend { lines: String },
    IterationStarted { iteration: u32, max: u32 },
    IterationCompleted {
        iteration: u32,
        max: u32,
        start: String,
        end: Option<String>,
        tokens: Option<f64>,
        status: Option<String>,
        errors: Vec<String>,
    },
    PlanUpdated {
        tasks_done: usize,
        tasks_total: usize,
        phases: Vec<PhaseProgress>,
        status: Option<String>,
    },
    Notification {
        prefix: Option<String>,
        message: String,
        iteration: Option<i64>,
        details: Option<String>,
        status: Option<String>,
        source: Option<String>,
    },
    StatusChanged {
        status: ProjectStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        previous: Option<ProjectStatus>,
    },
    /// Any other watched file changed; `file` is relative to the project root.
    FileChanged { file: String },
}

impl DomainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LogAppend { .. } => "log_append",
            Self::IterationStarted { .. } => "iteration_started",
            Self::IterationCompleted { .. } => "iteration_completed",
            Self::PlanUpdated { .. } => "plan_updated",
            Self::Notification { .. } => "notification",
            Self::StatusChanged { .. } => "status_changed",
            Self::FileChanged { .. } => "file_changed",
        }
    }

    pub fn plan_updated(plan: &ImplementationPlan) -> Self {
        Self::PlanUpdated {
            tasks_done: plan.tasks_done,
            tasks_total: plan.tasks_total,
            phases: plan
                .phases
                .iter()
                .map(|p| PhaseProgress {
                    name: p.name.clone(),
                    done: p.done,
                    total: p.total,
                    status: p.status,
                })
                .collect(),
            status: plan.status.clone(),
        }
    }

    pub fn iteration_completed(record: &IterationRecord) -> Self {
        Self::IterationCompleted {
            iteration: record.iteration,
            max: record.max,
            start: record.start.clone(),
            end: record.end.clone(),
            tokens: record.tokens,
            status: record.status.clone(),
            errors: record.errors.clone(),
        }
    }

    /// Completion inferred from the log, once the next header closed the block.
    pub fn log_iteration_completed(block: &LogIteration) -> Self {
        let status = if block.has_errors { "error" } else { "success" };
        Self::IterationCompleted {
            iteration: block.number,
            max: block.max_iterations,
            start: block.start_timestamp.clone().unwrap_or_default(),
            end: block.end_timestamp.clone(),
            tokens: block.tokens_used,
            status: Some(status.to_string()),
            errors: block.error_lines.clone(),
        }
    }

    pub fn notification(entry: NotificationEntry) -> Self {
        Self::Notification {
            prefix: entry.prefix,
            message: entry.message,
            iteration: entry.iteration,
            details: entry.details,
            status: entry.status,
            source: entry.source,
        }
    }
}

/// Wire envelope: `{type, project, timestamp, data}`.
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    #[serde(flatten)]
    pub event: &'a DomainEvent,
    pub project: Option<&'a str>,
    pub timestamp: String,
}

impl<'a> Envelope<'a> {
    pub fn new(event: &'a DomainEvent, project: Option<&'a str>) -> Self {
        Self {
            event,
            project,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_shape() {
        let event = DomainEvent::FileChanged {
            file: "specs/api.md".into(),
        };
        let value = serde_json::to_value(Envelope::new(&event, Some("demo-abc123"))).unwrap();
        assert_eq!(value["type"], "file_changed");
        assert_eq!(value["project"], "demo-abc123");
        assert_eq!(value["data"], json!({"file": "specs/api.md"}));
        let ts = value["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
        assert!(ts.ends_with('Z'));
    }

    #[test]
    fn test_status_changed_omits_missing_previous() {
        let first = DomainEvent::StatusChanged {
            status: ProjectStatus::Running,
            previous: None,
        };
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            json!({"type": "status_changed", "data": {"status": "running"}})
        );

        let next = DomainEvent::StatusChanged {
            status: ProjectStatus::Paused,
            previous: Some(ProjectStatus::Running),
        };
        assert_eq!(
            serde_json::to_value(&next).unwrap()["data"],
            json!({"status": "paused", "previous": "running"})
        );
    }

    #[test]
    fn test_kind_matches_serialized_tag() {
        let event = DomainEvent::IterationStarted { iteration: 2, max: 9 };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], event.kind());
        assert_eq!(value["data"], json!({"iteration": 2, "max": 9}));
    }
}
