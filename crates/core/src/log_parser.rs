// crates/core/src/log_parser.rs
//! Parser for `.ralph/ralph.log`.
//!
//! The agent loop writes a header line at the start of every iteration.
//! Two header formats exist in the wild and both are recognised:
//!
//! ```text
//! [14:02:11] === Iteration 5/50 ===
//! === Iteration 8 (loop 1/50) ===
//! ```
//!
//! The `[HH:MM:SS]` prefix is optional on either form. ANSI colour codes
//! are stripped before matching.

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;

use crate::error::ParseError;

static HEADER_RE: OnceLock<Regex> = OnceLock::new();
static ANSI_RE: OnceLock<Regex> = OnceLock::new();
static TOKEN_NUMBER_RE: OnceLock<Regex> = OnceLock::new();
static ERROR_LINE_RE: OnceLock<Regex> = OnceLock::new();

fn header_re() -> &'static Regex {
    HEADER_RE.get_or_init(|| {
        Regex::new(concat!(
            r"^(?:\[(?P<timestamp>\d{2}:\d{2}:\d{2})\]\s+)?",
            r"=== Iteration (?P<number>\d+)",
            r"(?:/(?P<max_old>\d+)| \(loop \d+/(?P<max_new>\d+)\))",
            r" ===$",
        ))
        .expect("valid regex")
    })
}

fn ansi_re() -> &'static Regex {
    ANSI_RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*m").expect("valid regex"))
}

fn token_number_re() -> &'static Regex {
    TOKEN_NUMBER_RE
        .get_or_init(|| Regex::new(r"[-+]?\d+(?:,\d{3})*(?:\.\d+)?").expect("valid regex"))
}

fn error_line_re() -> &'static Regex {
    ERROR_LINE_RE.get_or_init(|| {
        Regex::new(r"(?i)(⚠️|❌|\berror\b|\bexception\b|\bfailed\b|\btraceback\b|\bcrash\b)")
            .expect("valid regex")
    })
}

/// A recognised iteration header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationHeader {
    pub number: u32,
    /// Iteration cap; 0 when the header did not carry one.
    pub max: u32,
    pub timestamp: Option<String>,
}

/// One iteration block of the log, from its header up to the next header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogIteration {
    pub number: u32,
    pub max_iterations: u32,
    pub start_timestamp: Option<String>,
    pub end_timestamp: Option<String>,
    pub tokens_used: Option<f64>,
    pub has_errors: bool,
    pub error_lines: Vec<String>,
    pub raw_output: String,
}

pub fn strip_ansi(text: &str) -> String {
    ansi_re().replace_all(text, "").into_owned()
}

/// Match a single log line against both header formats.
pub fn parse_iteration_header(line: &str) -> Option<IterationHeader> {
    let cleaned = strip_ansi(line);
    let caps = header_re().captures(cleaned.trim())?;
    let number = caps["number"].parse().ok()?;
    let max = caps
        .name("max_old")
        .or_else(|| caps.name("max_new"))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);
    Some(IterationHeader {
        number,
        max,
        timestamp: caps.name("timestamp").map(|m| m.as_str().to_string()),
    })
}

/// Lines of an iteration block that look like errors.
pub fn extract_error_lines<'a>(lines: &[&'a str]) -> Vec<&'a str> {
    lines
        .iter()
        .copied()
        .filter(|line| error_line_re().is_match(line))
        .collect()
}

/// Token count from the line following a `tokens used` line.
fn parse_token_count(lines: &[&str]) -> Option<f64> {
    let index = lines
        .iter()
        .position(|l| l.trim().eq_ignore_ascii_case("tokens used"))?;
    let next = lines.get(index + 1)?.replace(',', "");
    let m = token_number_re().find(&next)?;
    m.as_str().parse().ok()
}

/// Split a log into iteration blocks.
pub fn parse_log(content: &str) -> Vec<LogIteration> {
    let lines: Vec<&str> = content.lines().collect();
    let markers: Vec<(usize, IterationHeader)> = lines
        .iter()
        .enumerate()
        .filter_map(|(i, line)| parse_iteration_header(line).map(|h| (i, h)))
        .collect();

    markers
        .iter()
        .enumerate()
        .map(|(k, (start, header))| {
            let next = markers.get(k + 1);
            let end = next.map(|(i, _)| *i).unwrap_or(lines.len());
            let chunk = &lines[*start..end];
            let error_lines: Vec<String> = extract_error_lines(chunk)
                .into_iter()
                .map(str::to_string)
                .collect();
            LogIteration {
                number: header.number,
                max_iterations: header.max,
                start_timestamp: header.timestamp.clone(),
                end_timestamp: next.and_then(|(_, h)| h.timestamp.clone()),
                tokens_used: parse_token_count(chunk),
                has_errors: !error_lines.is_empty(),
                error_lines,
                raw_output: chunk.join("\n"),
            }
        })
        .collect()
}

/// Read and parse the full log. A missing file yields no iterations.
pub async fn read_log(path: &Path) -> Result<Vec<LogIteration>, ParseError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(parse_log(&String::from_utf8_lossy(&bytes))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(ParseError::io(path, e)),
    }
}
