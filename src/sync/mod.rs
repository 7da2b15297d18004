pub mod build;
pub mod install;
pub mod output;
pub mod pool;
pub mod scanner;

use crate::error::{ErrorCategory, PatchError};
use serde::Serialize;

pub use build::{BuildOptions, BuildPipeline, BuildReport};
pub use install::{FileOutcome, FileReport, InstallReport, Installer, PlannedFile};
pub use pool::{CancelToken, WorkerPool};

/// A file that failed inside a batch; siblings kept going
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub path: String,
    pub category: ErrorCategory,
    pub message: String,
}

impl FileFailure {
    pub fn new(path: impl Into<String>, error: &PatchError) -> Self {
        Self {
            path: path.into(),
            category: error.category(),
            message: error.to_string(),
        }
    }
}
