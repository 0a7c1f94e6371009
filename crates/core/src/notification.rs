// crates/core/src/notification.rs
//! Notification files written by the agent loop.
//!
//! A notification is either a JSON object (`message`, `prefix`,
//! `timestamp`, `status`, `iteration`, `details`) or legacy plain text of
//! the form `PREFIX: body`. Legacy entries get status `unknown` and the
//! file mtime as their timestamp.

use chrono::{DateTime, Utc};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;

use crate::error::ParseError;
use crate::paths::ProjectPaths;

static MESSAGE_PREFIX_RE: OnceLock<Regex> = OnceLock::new();

fn message_prefix_re() -> &'static Regex {
    MESSAGE_PREFIX_RE
        .get_or_init(|| Regex::new(r"^(?P<prefix>[A-Z_]+):\s*(?P<body>.+)$").expect("valid regex"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEntry {
    pub timestamp: String,
    pub prefix: Option<String>,
    pub message: String,
    pub status: Option<String>,
    pub iteration: Option<i64>,
    pub details: Option<String>,
    pub source: Option<String>,
    /// The timestamp came from the file mtime rather than the content.
    #[serde(skip)]
    pub timestamp_from_mtime: bool,
}

/// Identity of a notification for duplicate suppression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NotificationKey {
    pub timestamp: String,
    pub message: String,
    pub prefix: Option<String>,
    pub iteration: Option<i64>,
}

impl NotificationEntry {
    /// Key for duplicate suppression. An mtime-derived timestamp is left
    /// out so that rewriting identical content does not count as new.
    pub fn key(&self) -> NotificationKey {
        NotificationKey {
            timestamp: if self.timestamp_from_mtime {
                String::new()
            } else {
                self.timestamp.clone()
            },
            message: self.message.clone(),
            prefix: self.prefix.clone(),
            iteration: self.iteration,
        }
    }
}

/// Split `PREFIX: body` into its parts. Text without a prefix is returned
/// trimmed with no prefix.
pub fn split_prefix(raw: &str) -> (Option<String>, String) {
    let message = raw.trim();
    match message_prefix_re().captures(message) {
        Some(caps) => (Some(caps["prefix"].to_string()), caps["body"].to_string()),
        None => (None, message.to_string()),
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn entry_from_payload(payload: &Map<String, Value>, source: &str, fallback_ts: &str) -> NotificationEntry {
    let raw_message = payload.get("message").map(value_to_string).unwrap_or_default();
    let (parsed_prefix, message) = split_prefix(&raw_message);
    let prefix = match payload.get("prefix") {
        Some(Value::String(p)) if !p.trim().is_empty() => Some(p.trim().to_string()),
        _ => parsed_prefix,
    };
    let (timestamp, timestamp_from_mtime) = match payload.get("timestamp") {
        None | Some(Value::Null) => (fallback_ts.to_string(), true),
        Some(Value::String(s)) if s.is_empty() => (fallback_ts.to_string(), true),
        Some(v) => (value_to_string(v), false),
    };
    let non_null = |key: &str| payload.get(key).filter(|v| !v.is_null());

    NotificationEntry {
        timestamp,
        prefix,
        message,
        status: non_null("status").map(value_to_string),
        iteration: non_null("iteration").and_then(coerce_int),
        details: non_null("details").map(value_to_string),
        source: Some(source.to_string()),
        timestamp_from_mtime,
    }
}

/// Parse the contents of a single notification file.
///
/// Returns `None` for blank content or JSON that is not an object.
pub fn parse_notification(content: &str, source: &str, fallback_ts: &str) -> Option<NotificationEntry> {
    let content = content.trim();
    if content.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(content) {
        Ok(Value::Object(map)) => Some(entry_from_payload(&map, source, fallback_ts)),
        Ok(_) => None,
        Err(_) => {
            let (prefix, message) = split_prefix(content);
            Some(NotificationEntry {
                timestamp: fallback_ts.to_string(),
                prefix,
                message,
                status: Some("unknown".to_string()),
                iteration: None,
                details: None,
                source: Some(source.to_string()),
                timestamp_from_mtime: true,
            })
        }
    }
}

/// Parse a JSON-lines notification log, skipping non-object lines.
pub fn parse_notification_lines(content: &str, source: &str, fallback_ts: &str) -> Vec<NotificationEntry> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|l| match serde_json::from_str::<Value>(l) {
            Ok(Value::Object(map)) => Some(entry_from_payload(&map, source, fallback_ts)),
            _ => None,
        })
        .collect()
}

fn iso_timestamp(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Read `(content, mtime as RFC 3339)` or `None` if the file is absent.
async fn read_with_mtime(path: &Path) -> Result<Option<(String, String)>, ParseError> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(m) if m.is_file() => m,
        Ok(_) => return Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ParseError::io(path, e)),
    };
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ParseError::io(path, e)),
    };
    let mtime = meta.modified().map(iso_timestamp).unwrap_or_else(|_| Utc::now().to_rfc3339());
    Ok(Some((String::from_utf8_lossy(&bytes).into_owned(), mtime)))
}

/// Read and parse a single notification file. Absent or blank → `None`.
pub async fn read_notification_file(path: &Path) -> Result<Option<NotificationEntry>, ParseError> {
    Ok(read_with_mtime(path)
        .await?
        .and_then(|(content, mtime)| parse_notification(&content, &file_name(path), &mtime)))
}

async fn archive_candidates(paths: &ProjectPaths) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    for dir in [paths.notifications_dir(), paths.archived_notifications_dir()] {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        let mut txt = Vec::new();
        let mut json = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("txt") => txt.push(path),
                Some("json") => json.push(path),
                _ => {}
            }
        }
        txt.sort();
        json.sort();
        candidates.extend(txt);
        candidates.extend(json);
    }
    candidates
}

/// Full notification history of a project, newest first.
///
/// Sources: pending and last notification files, archived `*.txt` and
/// `*.json` files, and `notifications/events.jsonl`. Entries with the same
/// timestamp, prefix, message, iteration and details appear once.
/// Unreadable files are skipped.
pub async fn notification_history(paths: &ProjectPaths) -> Vec<NotificationEntry> {
    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    let mut push = |entry: NotificationEntry| {
        let key = (
            entry.timestamp.clone(),
            entry.prefix.clone(),
            entry.message.clone(),
            entry.iteration,
            entry.details.clone(),
        );
        if seen.insert(key) {
            entries.push(entry);
        }
    };

    let mut files = vec![paths.pending_notification(), paths.last_notification()];
    files.extend(archive_candidates(paths).await);

    for file in files {
        match read_notification_file(&file).await {
            Ok(Some(entry)) => push(entry),
            Ok(None) => {}
            Err(e) => tracing::debug!(error = %e, "Skipping unreadable notification file"),
        }
    }

    let events = paths.notification_events();
    match read_with_mtime(&events).await {
        Ok(Some((content, mtime))) => {
            for entry in parse_notification_lines(&content, &file_name(&events), &mtime) {
                push(entry);
            }
        }
        Ok(None) => {}
        Err(e) => tracing::debug!(error = %e, "Skipping unreadable notification log"),
    }

    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    entries
}
