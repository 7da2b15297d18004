use crate::error::ErrorCategory;
use crate::manifest::policy::FileAction;
use serde::Serialize;
use std::path::PathBuf;

/// JSON output mode for machine-readable build and install events
/// Uses NDJSON format (newline-delimited JSON)
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PatchEvent {
    Start {
        operation: String,
        root: PathBuf,
        channel: String,
        total_files: usize,
    },
    File {
        path: String,
        action: FileAction,
        outcome: String,
        local_bytes: u64,
        remote_bytes: u64,
    },
    Error {
        path: String,
        category: ErrorCategory,
        error: String,
    },
    Summary {
        files_total: usize,
        files_changed: usize,
        files_unchanged: usize,
        files_failed: usize,
        bytes_local: u64,
        bytes_remote: u64,
        duration_secs: f64,
        cancelled: bool,
    },
}

impl PatchEvent {
    /// Emit this event as JSON to stdout
    pub fn emit(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            println!("{}", json);
        }
    }
}
