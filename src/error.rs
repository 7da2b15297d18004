use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Source file changed during the build: {path}\nExpected {expected} bytes, read {actual}.\nMake sure nothing is writing to the source tree during a build.")]
    SourceTruncated {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("Corrupt signature file: {path}\nCause: {reason}\nThe release may be incomplete; rebuild or re-upload its signatures.")]
    CorruptSignature { path: PathBuf, reason: String },

    #[error("Failed to parse manifest: {path}\nCause: {source}")]
    Manifest {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Missing signature file for {path}\nThe manifest selects a delta update but the release has no {path}.sig.\nThis is a packaging defect; rebuild the release.")]
    MissingSignature { path: PathBuf },

    #[error("Integrity check failed for {path}\nExpected: {expected}\nActual:   {actual}\nThe patched output was discarded and the installed file left untouched.")]
    IntegrityMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Transfer failed for {path}\nCause: {source}")]
    Transfer {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid hash value '{value}' for {path}")]
    InvalidHash { path: PathBuf, value: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Coarse classification used when a batch aggregates per-file failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Format,
    Integrity,
    Precondition,
    Transport,
    Io,
    Config,
    Cancelled,
}

impl PatchError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::CorruptSignature { .. }
            | Self::Manifest { .. }
            | Self::InvalidManifest(_)
            | Self::InvalidHash { .. }
            | Self::SourceTruncated { .. } => ErrorCategory::Format,
            Self::IntegrityMismatch { .. } => ErrorCategory::Integrity,
            Self::MissingSignature { .. } => ErrorCategory::Precondition,
            Self::Transfer { .. } => ErrorCategory::Transport,
            Self::Io(_) => ErrorCategory::Io,
            Self::Config(_) => ErrorCategory::Config,
            Self::Cancelled => ErrorCategory::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Format => "format",
            Self::Integrity => "integrity",
            Self::Precondition => "precondition",
            Self::Transport => "transport",
            Self::Io => "io",
            Self::Config => "config",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

pub type Result<T> = std::result::Result<T, PatchError>;

/// Format bytes for human-readable display in error messages and summaries
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn test_categories() {
        let err = PatchError::MissingSignature {
            path: PathBuf::from("a.bin"),
        };
        assert_eq!(err.category(), ErrorCategory::Precondition);

        let err = PatchError::Transfer {
            path: PathBuf::from("a.bin"),
            source: std::io::Error::other("reset"),
        };
        assert_eq!(err.category(), ErrorCategory::Transport);
        assert!(PatchError::Cancelled.is_cancelled());
    }
}
