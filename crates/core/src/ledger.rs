// crates/core/src/ledger.rs
//! Parser for `.ralph/iterations.jsonl`, the per-iteration ledger.
//!
//! One JSON object per line, appended by the agent loop when an iteration
//! starts or finishes. Blank and malformed lines are skipped.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ParseError;
use crate::tail::read_last_line;

/// One ledger line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub max: u32,
    pub start: String,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub tokens: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub tasks_completed: Vec<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub commit_message: Option<String>,
    #[serde(default)]
    pub test_passed: Option<bool>,
    #[serde(default)]
    pub test_output: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl IterationRecord {
    /// An iteration is finished once its record carries an end timestamp.
    pub fn is_finished(&self) -> bool {
        self.end.as_deref().is_some_and(|e| !e.is_empty())
    }
}

/// Parse a single ledger line. Returns `None` for blank or malformed lines.
pub fn parse_ledger_line(line: &str) -> Option<IterationRecord> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    serde_json::from_str(line).ok()
}

/// Parse a whole ledger, skipping lines that do not parse.
pub fn parse_ledger(content: &str) -> Vec<IterationRecord> {
    content.lines().filter_map(parse_ledger_line).collect()
}

/// Read and parse the full ledger. A missing file is an empty ledger.
pub async fn read_ledger(path: &Path) -> Result<Vec<IterationRecord>, ParseError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(parse_ledger(&String::from_utf8_lossy(&bytes))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(ParseError::io(path, e)),
    }
}

/// Read only the most recent ledger record via a backward tail seek.
///
/// `Ok(None)` when the file is absent, empty, or its last line is not a
/// valid record.
pub async fn read_last_record(path: &Path) -> Result<Option<IterationRecord>, ParseError> {
    match read_last_line(path).await {
        Ok(Some(line)) => Ok(parse_ledger_line(&line)),
        Ok(None) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ParseError::io(path, e)),
    }
}
