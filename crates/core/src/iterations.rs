// crates/core/src/iterations.rs
//! Iteration history of a project, merged from the ledger and the log.
//!
//! The ledger is authoritative. The log is parsed only when the ledger is
//! empty, and only if it is small enough to read whole.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::ParseError;
use crate::ledger::{read_ledger, IterationRecord};
use crate::log_parser::{read_log, LogIteration};
use crate::paths::ProjectPaths;

/// Logs above this size are not parsed for history.
pub const MAX_LOG_PARSE_BYTES: u64 = 20 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationSummary {
    pub number: u32,
    pub max_iterations: Option<u32>,
    pub start_timestamp: Option<String>,
    pub end_timestamp: Option<String>,
    pub duration_seconds: Option<f64>,
    pub tokens_used: Option<f64>,
    pub status: Option<String>,
    pub has_errors: bool,
    pub errors: Vec<String>,
    pub tasks_completed: Vec<String>,
    pub commit: Option<String>,
    pub test_passed: Option<bool>,
}

impl From<&LogIteration> for IterationSummary {
    fn from(block: &LogIteration) -> Self {
        Self {
            number: block.number,
            max_iterations: Some(block.max_iterations),
            start_timestamp: block.start_timestamp.clone(),
            end_timestamp: block.end_timestamp.clone(),
            tokens_used: block.tokens_used,
            has_errors: block.has_errors,
            errors: block.error_lines.clone(),
            ..Self::default()
        }
    }
}

impl IterationSummary {
    fn apply_record(&mut self, record: &IterationRecord) {
        self.max_iterations = Some(record.max);
        self.start_timestamp = Some(record.start.clone());
        self.end_timestamp = record.end.clone();
        self.duration_seconds = record.duration_seconds;
        self.tokens_used = record.tokens;
        self.status = record.status.clone();
        self.tasks_completed = record.tasks_completed.clone();
        self.commit = record.commit.clone();
        self.test_passed = record.test_passed;
        if !record.errors.is_empty() {
            self.errors = record.errors.clone();
        }
        self.has_errors = self.has_errors || !self.errors.is_empty();
    }
}

/// Merge log blocks and ledger records into one summary per iteration,
/// ordered by number.
///
/// Ledger numbers are used as-is when unique. A ledger whose counter
/// restarted (duplicate numbers) is numbered by row instead, from 1.
pub fn merge_iterations(log: &[LogIteration], ledger: &[IterationRecord]) -> Vec<IterationSummary> {
    let mut merged: BTreeMap<u32, IterationSummary> = log
        .iter()
        .map(|block| (block.number, IterationSummary::from(block)))
        .collect();

    let mut seen = HashSet::new();
    let restarted = !ledger.iter().all(|r| seen.insert(r.iteration));

    for (row, record) in ledger.iter().enumerate() {
        let number = if restarted { row as u32 + 1 } else { record.iteration };
        merged
            .entry(number)
            .or_insert_with(|| IterationSummary {
                number,
                ..IterationSummary::default()
            })
            .apply_record(record);
    }
    merged.into_values().collect()
}

/// Iteration history for a project. Missing files yield an empty list.
pub async fn list_iterations(paths: &ProjectPaths) -> Result<Vec<IterationSummary>, ParseError> {
    let ledger = read_ledger(&paths.ledger()).await?;
    let log = if ledger.is_empty() {
        let log_path = paths.log();
        match tokio::fs::metadata(&log_path).await {
            Ok(meta) if meta.len() <= MAX_LOG_PARSE_BYTES => read_log(&log_path).await?,
            _ => Vec::new(),
        }
    } else {
        Vec::new()
    };
    Ok(merge_iterations(&log, &ledger))
}
