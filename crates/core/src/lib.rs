// crates/core/src/lib.rs
//! Read models and file-format rules for Ralph project directories.
//!
//! Everything here is shared by the realtime pipeline and the HTTP read
//! endpoints: project identity and discovery, the plan, ledger, log and
//! notification parsers, PID liveness, and status detection.

pub mod discovery;
pub mod error;
pub mod iterations;
pub mod ledger;
pub mod log_parser;
pub mod loop_config;
pub mod notification;
pub mod paths;
pub mod plan;
pub mod process;
pub mod project;
pub mod status;
pub mod tail;

pub use discovery::*;
pub use error::*;
pub use paths::ProjectPaths;
pub use project::*;
pub use status::detect_project_status;
