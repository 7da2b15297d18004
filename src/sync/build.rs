use super::pool::{CancelToken, WorkerPool};
use super::scanner::{Scanner, SourceFile};
use super::FileFailure;
use crate::delta::signature::SignatureBuilder;
use crate::error::{PatchError, Result};
use crate::fs_util;
use crate::manifest::{
    recommended_chunk_size, release_dir_name, ManifestBuilder, ManifestFileCommand, ManifestFileEntry,
    PatchManifest, MANIFEST_FILE_NAME, SIGNATURE_EXTENSION,
};
use chrono::{DateTime, Timelike, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Files smaller than this are shipped whole, without a signature
pub const DEFAULT_SMALL_FILE_THRESHOLD: u64 = 1024;

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub channel: String,
    /// Publish root; the release lands in `<output_dir>/<channel>/`
    pub output_dir: PathBuf,
    pub small_file_threshold: u64,
    /// Release timestamp, now when unset
    pub date: Option<DateTime<Utc>>,
}

impl BuildOptions {
    pub fn new(channel: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            channel: channel.into(),
            output_dir: output_dir.into(),
            small_file_threshold: DEFAULT_SMALL_FILE_THRESHOLD,
            date: None,
        }
    }

    pub fn small_file_threshold(mut self, threshold: u64) -> Self {
        self.small_file_threshold = threshold;
        self
    }

    pub fn date(mut self, date: DateTime<Utc>) -> Self {
        self.date = Some(date);
        self
    }
}

#[derive(Debug)]
pub struct BuildReport {
    pub manifest: PatchManifest,
    pub manifest_path: PathBuf,
    /// Whether `manifest_path` was written; only a clean build publishes it
    pub manifest_written: bool,
    pub release_dir: PathBuf,
    pub signatures: usize,
    pub bytes: u64,
    pub failures: Vec<FileFailure>,
    pub cancelled: bool,
    pub duration: Duration,
}

impl BuildReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }
}

/// Stages a source tree as a release: payload copies, signatures, manifest
///
/// Layout under the output directory:
///
/// ```text
/// <channel>/manifest.json
/// <channel>/<yyyy-MM-dd-HH-mm-ss>/<path>
/// <channel>/<yyyy-MM-dd-HH-mm-ss>/<path>.sig
/// ```
pub struct BuildPipeline<'a> {
    source_root: PathBuf,
    options: BuildOptions,
    pool: &'a WorkerPool,
    cancel: &'a CancelToken,
}

impl<'a> BuildPipeline<'a> {
    pub fn new(
        source_root: impl Into<PathBuf>,
        options: BuildOptions,
        pool: &'a WorkerPool,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            source_root: source_root.into(),
            options,
            pool,
            cancel,
        }
    }

    pub fn run(&self) -> Result<BuildReport> {
        let start = Instant::now();

        if self.options.channel.is_empty() || !is_plain_name(&self.options.channel) {
            return Err(PatchError::Config(format!(
                "invalid channel name '{}'",
                self.options.channel
            )));
        }
        self.check_output_outside_source()?;

        let files = Scanner::new(&self.source_root).scan()?;
        self.stage_all(files, start)
    }

    /// Stage scanned files over the pool and write the manifest if all succeed
    fn stage_all(&self, mut files: Vec<SourceFile>, start: Instant) -> Result<BuildReport> {
        files.sort_by(|a, b| {
            a.size
                .cmp(&b.size)
                .then_with(|| a.relative_path.cmp(&b.relative_path))
        });

        let date = self.options.date.unwrap_or_else(Utc::now);
        let date = date.with_nanosecond(0).unwrap_or(date);
        let builder = ManifestBuilder::new(&self.options.channel).date(date);

        let channel_dir = self.options.output_dir.join(&self.options.channel);
        let manifest_path = channel_dir.join(MANIFEST_FILE_NAME);
        let release_dir = channel_dir.join(release_dir_name(&date));
        fs::create_dir_all(&release_dir)?;

        tracing::info!(
            "Building release {} from {} ({} files)",
            release_dir.display(),
            self.source_root.display(),
            files.len()
        );

        let results = self
            .pool
            .run(files.clone(), self.cancel, |file| self.stage_file(&file, &release_dir));

        let mut entries = Vec::new();
        let mut failures = Vec::new();
        let mut cancelled = self.cancel.is_cancelled();

        for (file, result) in files.iter().zip(results) {
            match result {
                Some(Ok(entry)) => entries.push(entry),
                Some(Err(e)) if e.is_cancelled() => cancelled = true,
                Some(Err(e)) => {
                    tracing::warn!("Failed to stage {}: {}", file.relative_path, e);
                    failures.push(FileFailure::new(&file.relative_path, &e));
                }
                None => cancelled = true,
            }
        }

        let signatures = entries
            .iter()
            .filter(|e| e.command == ManifestFileCommand::DeltaUpdate)
            .count();
        let bytes = entries.iter().map(|e| e.file_size).sum();
        let manifest = builder.entries(entries).build();

        let manifest_written = failures.is_empty() && !cancelled;
        if manifest_written {
            manifest.save(&manifest_path)?;
            tracing::info!(
                "Wrote {} ({} files, {} signatures)",
                manifest_path.display(),
                manifest.files.len(),
                signatures
            );
        } else {
            tracing::warn!(
                "Build incomplete ({} failures, cancelled: {}); manifest not written",
                failures.len(),
                cancelled
            );
        }

        Ok(BuildReport {
            manifest,
            manifest_path,
            manifest_written,
            release_dir,
            signatures,
            bytes,
            failures,
            cancelled,
            duration: start.elapsed(),
        })
    }

    /// Copy one file into the release and describe it for the manifest
    fn stage_file(&self, file: &SourceFile, release_dir: &Path) -> Result<ManifestFileEntry> {
        self.cancel.check()?;

        let staged = file
            .relative_path
            .split('/')
            .fold(release_dir.to_path_buf(), |path, part| path.join(part));
        if let Some(parent) = staged.parent() {
            fs::create_dir_all(parent)?;
        }
        let size = fs::copy(&file.path, &staged)?;
        if size != file.size {
            return Err(PatchError::SourceTruncated {
                path: file.path.clone(),
                expected: file.size,
                actual: size,
            });
        }

        if size < self.options.small_file_threshold {
            let hash = fs_util::full_hash_file(&staged)?;
            tracing::debug!("{}: {} bytes, shipped whole", file.relative_path, size);
            return Ok(ManifestFileEntry::new(
                ManifestFileCommand::UpdateIfFullHashMismatch,
                &file.relative_path,
                size,
            )
            .with_hash(&hash));
        }

        let mut signature_path = staged.clone().into_os_string();
        signature_path.push(".");
        signature_path.push(SIGNATURE_EXTENSION);

        let summary = SignatureBuilder::new()
            .chunk_size(recommended_chunk_size(size))
            .build_file(&staged, Path::new(&signature_path))?;

        Ok(
            ManifestFileEntry::new(ManifestFileCommand::DeltaUpdate, &file.relative_path, size)
                .with_chunk_size(summary.chunk_size)
                .with_fast_hash(summary.fast_hash)
                .with_hash(&summary.full_hash),
        )
    }

    fn check_output_outside_source(&self) -> Result<()> {
        fs::create_dir_all(&self.options.output_dir)?;
        let source = self.source_root.canonicalize()?;
        let output = self.options.output_dir.canonicalize()?;

        if output.starts_with(&source) {
            return Err(PatchError::Config(format!(
                "output directory {} is inside the source tree {}",
                self.options.output_dir.display(),
                self.source_root.display()
            )));
        }
        Ok(())
    }
}

fn is_plain_name(name: &str) -> bool {
    !name.contains(|c| c == '/' || c == '\\') && name != "." && name != ".."
}
