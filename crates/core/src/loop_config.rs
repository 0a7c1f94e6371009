//! Per-project loop settings stored in `.ralph/config.json`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use crate::error::ParseError;

pub const MIN_ITERATIONS: u32 = 1;
pub const MAX_ITERATIONS: u32 = 999;

fn default_max_iterations() -> u32 {
    20
}

fn default_cli() -> String {
    "claude".to_string()
}

/// Settings the agent loop reads at start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_cli")]
    pub cli: String,
    #[serde(default)]
    pub flags: String,
    #[serde(default)]
    pub test_command: String,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            cli: default_cli(),
            flags: String::new(),
            test_command: String::new(),
        }
    }
}

/// Request-time overrides merged on top of the stored config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopOverrides {
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub cli: Option<String>,
    #[serde(default)]
    pub flags: Option<String>,
    #[serde(default)]
    pub test_command: Option<String>,
}

impl LoopConfig {
    /// Check value ranges. Returns a human-readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        if !(MIN_ITERATIONS..=MAX_ITERATIONS).contains(&self.max_iterations) {
            return Err(format!(
                "max_iterations must be between {} and {}",
                MIN_ITERATIONS, MAX_ITERATIONS
            ));
        }
        if self.cli.trim().is_empty() {
            return Err("cli cannot be empty".to_string());
        }
        Ok(())
    }

    /// Apply overrides, trimming text values.
    pub fn merged(&self, overrides: &LoopOverrides) -> Self {
        Self {
            max_iterations: overrides.max_iterations.unwrap_or(self.max_iterations),
            cli: overrides
                .cli
                .as_deref()
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|| self.cli.clone()),
            flags: overrides
                .flags
                .as_deref()
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|| self.flags.clone()),
            test_command: overrides
                .test_command
                .as_deref()
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|| self.test_command.clone()),
        }
    }

    /// Environment passed to the loop script.
    pub fn env(&self) -> Vec<(String, String)> {
        vec![
            ("RALPH_CLI".to_string(), self.cli.clone()),
            ("RALPH_FLAGS".to_string(), self.flags.clone()),
            ("RALPH_TEST".to_string(), self.test_command.clone()),
        ]
    }
}

/// Read the loop config, or defaults when the file does not exist.
pub fn read_loop_config(path: &Path) -> Result<LoopConfig, ParseError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LoopConfig::default()),
        Err(e) => return Err(ParseError::io(path, e)),
    };
    let value: Value = serde_json::from_str(&content).map_err(|e| ParseError::json(path, &e))?;
    if !value.is_object() {
        return Err(ParseError::MalformedJson {
            path: path.to_path_buf(),
            message: "root must be an object".to_string(),
        });
    }
    let config: LoopConfig = serde_json::from_value(value).map_err(|e| ParseError::InvalidValue {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    config.validate().map_err(|message| ParseError::InvalidValue {
        path: path.to_path_buf(),
        message,
    })?;
    Ok(config)
}

/// Validate and persist the loop config as pretty JSON.
pub fn write_loop_config(path: &Path, config: &LoopConfig) -> Result<(), ParseError> {
    config.validate().map_err(|message| ParseError::InvalidValue {
        path: path.to_path_buf(),
        message,
    })?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ParseError::io(parent, e))?;
    }
    let mut json = serde_json::to_string_pretty(config).map_err(|e| ParseError::json(path, &e))?;
    json.push('\n');
    std::fs::write(path, json).map_err(|e| ParseError::io(path, e))
}
