//! Patch manifest: the JSON document listing every file of a release and the
//! policy used to bring an installation up to date with it.

pub mod policy;

use crate::delta::checksum::{fast_hash_to_string, FullHash};
use crate::delta::signature::{resolve_chunk_size, round_up8};
use crate::error::{PatchError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

pub use policy::{decide, FileAction, FsProbe, LocalProbe};

/// File name of the manifest inside a channel directory
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Extension appended to a payload path to locate its signature
pub const SIGNATURE_EXTENSION: &str = "sig";

/// Files larger than this get a chunk size scaled to their size
const LARGE_FILE_SIZE: u64 = 256 * 1024 * 1024;

/// Chunk size for files up to `LARGE_FILE_SIZE`
const SMALL_CHUNK_SIZE: u32 = 1024;

/// Release folder name format, one folder per build
const RELEASE_DIR_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Update policy declared for one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ManifestFileCommand {
    /// Patch from the release signature, falling back to a full download
    DeltaUpdate,
    /// Replace the file on every install
    AlwaysFullUpdate,
    /// Replace the file when its size or full hash differs
    UpdateIfFullHashMismatch,
    /// Install only when absent
    UpdateIfMissing,
    /// Install the first time, never touch afterwards
    NeverUpdate,
    /// Remove the file if present
    Delete,
}

impl ManifestFileCommand {
    pub const ALL: [ManifestFileCommand; 6] = [
        Self::DeltaUpdate,
        Self::AlwaysFullUpdate,
        Self::UpdateIfFullHashMismatch,
        Self::UpdateIfMissing,
        Self::NeverUpdate,
        Self::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeltaUpdate => "DeltaUpdate",
            Self::AlwaysFullUpdate => "AlwaysFullUpdate",
            Self::UpdateIfFullHashMismatch => "UpdateIfFullHashMismatch",
            Self::UpdateIfMissing => "UpdateIfMissing",
            Self::NeverUpdate => "NeverUpdate",
            Self::Delete => "Delete",
        }
    }
}

impl fmt::Display for ManifestFileCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestFileEntry {
    pub command: ManifestFileCommand,
    /// Release-relative path with `/` separators
    pub file_path: String,
    pub file_size: u64,
    /// 0 selects the default chunk size for `file_size`
    #[serde(default, skip_serializing_if = "is_zero")]
    pub chunk_size: u32,
    /// xxh3-64 of the whole file as a decimal string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fast_hash: Option<String>,
    /// SHA-256 of the whole file as hex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl ManifestFileEntry {
    pub fn new(command: ManifestFileCommand, file_path: impl Into<String>, file_size: u64) -> Self {
        Self {
            command,
            file_path: file_path.into(),
            file_size,
            chunk_size: 0,
            fast_hash: None,
            hash: None,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: u32) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_fast_hash(mut self, fast_hash: u64) -> Self {
        self.fast_hash = Some(fast_hash_to_string(fast_hash));
        self
    }

    pub fn with_hash(mut self, hash: &FullHash) -> Self {
        self.hash = Some(hash.to_hex());
        self
    }

    /// Chunk size the signature for this file was built with
    pub fn effective_chunk_size(&self) -> u32 {
        resolve_chunk_size(self.file_size, self.chunk_size)
    }

    /// Parsed `hash`, `None` when the manifest carries none
    pub fn full_hash(&self) -> Result<Option<FullHash>> {
        self.hash
            .as_deref()
            .map(|value| {
                value.parse::<FullHash>().map_err(|_| PatchError::InvalidHash {
                    path: PathBuf::from(&self.file_path),
                    value: value.to_string(),
                })
            })
            .transpose()
    }

    /// Parsed `fastHash`, `None` when the manifest carries none
    pub fn fast_hash_value(&self) -> Result<Option<u64>> {
        self.fast_hash
            .as_deref()
            .map(|value| {
                value.trim().parse::<u64>().map_err(|_| PatchError::InvalidHash {
                    path: PathBuf::from(&self.file_path),
                    value: value.to_string(),
                })
            })
            .transpose()
    }

    /// Release-relative path of this file's signature
    pub fn signature_path(&self) -> String {
        format!("{}.{}", self.file_path, SIGNATURE_EXTENSION)
    }

    /// Location of this file under an installation root
    pub fn local_path(&self, root: &Path) -> PathBuf {
        self.file_path
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(root.to_path_buf(), |path, part| path.join(part))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchManifest {
    #[serde(default)]
    pub version: String,
    pub date: DateTime<Utc>,
    pub channel: String,
    pub files: Vec<ManifestFileEntry>,
}

impl PatchManifest {
    /// Load and validate a manifest
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let manifest: PatchManifest =
            serde_json::from_str(&content).map_err(|source| PatchError::Manifest {
                path: path.to_path_buf(),
                source,
            })?;
        manifest.validate()?;

        tracing::debug!(
            "Loaded manifest {} ({} files, channel {})",
            path.display(),
            manifest.files.len(),
            manifest.channel
        );
        Ok(manifest)
    }

    /// Write the manifest, replacing any previous one atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)?;

        let json = serde_json::to_vec_pretty(self).map_err(|source| PatchError::Manifest {
            path: path.to_path_buf(),
            source,
        })?;

        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        temp.write_all(&json)?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| PatchError::Io(e.error))?;
        Ok(())
    }

    /// Check structural consistency: safe relative paths, no duplicates, parsable hashes
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();

        for entry in &self.files {
            if !is_safe_relative_path(&entry.file_path) {
                return Err(PatchError::InvalidManifest(format!(
                    "file path '{}' must be relative and stay inside the installation",
                    entry.file_path
                )));
            }
            if !seen.insert(entry.file_path.to_lowercase()) {
                return Err(PatchError::InvalidManifest(format!(
                    "file path '{}' is listed more than once",
                    entry.file_path
                )));
            }
            entry.full_hash()?;
            entry.fast_hash_value()?;
        }

        Ok(())
    }

    /// Name of the release folder holding this build's payload and signatures
    pub fn release_dir_name(&self) -> String {
        release_dir_name(&self.date)
    }

    pub fn entry(&self, file_path: &str) -> Option<&ManifestFileEntry> {
        self.files.iter().find(|e| e.file_path == file_path)
    }
}

fn is_safe_relative_path(path: &str) -> bool {
    !path.is_empty()
        && !path.contains('\\')
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

/// Release folder name for a build made at `date`
pub fn release_dir_name(date: &DateTime<Utc>) -> String {
    date.format(RELEASE_DIR_FORMAT).to_string()
}

/// Chunk size recorded for a file in a new manifest
pub fn recommended_chunk_size(file_size: u64) -> u32 {
    if file_size > LARGE_FILE_SIZE {
        round_up8((file_size as f64).sqrt() as u64) as u32
    } else {
        SMALL_CHUNK_SIZE
    }
}

/// Assembles a manifest for one build
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    channel: String,
    version: String,
    date: DateTime<Utc>,
    files: Vec<ManifestFileEntry>,
}

impl ManifestBuilder {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            date: Utc::now(),
            files: Vec::new(),
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn date(mut self, date: DateTime<Utc>) -> Self {
        self.date = date;
        self
    }

    pub fn entry(mut self, entry: ManifestFileEntry) -> Self {
        self.files.push(entry);
        self
    }

    pub fn entries(mut self, entries: impl IntoIterator<Item = ManifestFileEntry>) -> Self {
        self.files.extend(entries);
        self
    }

    /// Finish the manifest; entries are ordered case-insensitively by path
    pub fn build(mut self) -> PatchManifest {
        self.files.sort_by(|a, b| {
            a.file_path
                .to_lowercase()
                .cmp(&b.file_path.to_lowercase())
                .then_with(|| a.file_path.cmp(&b.file_path))
        });

        PatchManifest {
            version: self.version,
            date: self.date,
            channel: self.channel,
            files: self.files,
        }
    }
}
