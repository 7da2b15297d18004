use super::pool::{CancelToken, WorkerPool};
use super::FileFailure;
use crate::delta::applier::{AssemblyOutcome, PatchAssembler};
use crate::delta::checksum::FullHasher;
use crate::delta::matcher::DeltaMatcher;
use crate::delta::signature::SignatureFile;
use crate::error::{ErrorCategory, PatchError, Result};
use crate::fs_util;
use crate::manifest::policy::{decide, FileAction, FsProbe};
use crate::manifest::{ManifestFileEntry, PatchManifest};
use crate::transport::RemoteSource;
use indicatif::ProgressBar;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const DOWNLOAD_FILE_NAME: &str = "download.part";
const COPY_BUFFER_SIZE: usize = 256 * 1024;

/// A manifest entry paired with the action decided for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    pub entry: ManifestFileEntry,
    pub local_path: PathBuf,
    pub action: FileAction,
}

#[derive(Debug, Default)]
pub struct InstallPlan {
    pub files: Vec<PlannedFile>,
    pub failures: Vec<FileFailure>,
    pub cancelled: bool,
}

impl InstallPlan {
    pub fn pending(&self) -> impl Iterator<Item = &PlannedFile> {
        self.files.iter().filter(|f| !f.action.is_noop())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileOutcome {
    Unchanged,
    /// Whole file fetched; `fallback` when a delta update gave up on assembly
    Downloaded { bytes: u64, fallback: bool },
    Patched {
        local_bytes: u64,
        remote_bytes: u64,
        out_of_order: usize,
    },
    Deleted,
    /// Dry run: the action was decided but not carried out
    Planned,
}

impl FileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::Downloaded { fallback: false, .. } => "downloaded",
            Self::Downloaded { fallback: true, .. } => "downloaded_fallback",
            Self::Patched { .. } => "patched",
            Self::Deleted => "deleted",
            Self::Planned => "planned",
        }
    }

    pub fn is_change(&self) -> bool {
        matches!(
            self,
            Self::Downloaded { .. } | Self::Patched { .. } | Self::Deleted
        )
    }

    pub fn local_bytes(&self) -> u64 {
        match self {
            Self::Patched { local_bytes, .. } => *local_bytes,
            _ => 0,
        }
    }

    pub fn remote_bytes(&self) -> u64 {
        match self {
            Self::Downloaded { bytes, .. } => *bytes,
            Self::Patched { remote_bytes, .. } => *remote_bytes,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub path: String,
    pub action: FileAction,
    pub outcome: FileOutcome,
}

#[derive(Debug, Default)]
pub struct InstallReport {
    /// Completed files, in manifest order
    pub files: Vec<FileReport>,
    pub failures: Vec<FileFailure>,
    pub cancelled: bool,
    pub dry_run: bool,
    pub duration: Duration,
}

impl InstallReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    pub fn files_changed(&self) -> usize {
        self.files.iter().filter(|f| f.outcome.is_change()).count()
    }

    pub fn files_unchanged(&self) -> usize {
        self.files
            .iter()
            .filter(|f| f.outcome == FileOutcome::Unchanged)
            .count()
    }

    pub fn bytes_local(&self) -> u64 {
        self.files.iter().map(|f| f.outcome.local_bytes()).sum()
    }

    pub fn bytes_remote(&self) -> u64 {
        self.files.iter().map(|f| f.outcome.remote_bytes()).sum()
    }

    pub fn outcome(&self, path: &str) -> Option<FileOutcome> {
        self.files.iter().find(|f| f.path == path).map(|f| f.outcome)
    }

    pub fn failures_in(&self, category: ErrorCategory) -> usize {
        self.failures.iter().filter(|f| f.category == category).count()
    }
}

/// Brings an installation up to date with a manifest
///
/// Runs in three phases: decide an action per file, check that every delta
/// update has its signature in the release, then carry the actions out. The
/// first two never touch the installation, so a structural problem with the
/// release stops the run before anything changes. Failures in the last phase
/// are per file and collected in the report.
pub struct Installer<'a> {
    manifest: &'a PatchManifest,
    remote: &'a dyn RemoteSource,
    install_root: PathBuf,
    pool: &'a WorkerPool,
    cancel: &'a CancelToken,
    dry_run: bool,
    progress: Option<ProgressBar>,
}

impl<'a> Installer<'a> {
    pub fn new(
        manifest: &'a PatchManifest,
        remote: &'a dyn RemoteSource,
        install_root: impl Into<PathBuf>,
        pool: &'a WorkerPool,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            manifest,
            remote,
            install_root: install_root.into(),
            pool,
            cancel,
            dry_run: false,
            progress: None,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Advance `bar` once per executed file
    pub fn progress(mut self, bar: ProgressBar) -> Self {
        self.progress = Some(bar);
        self
    }

    /// Decide an action for every manifest entry without changing anything
    pub fn plan(&self) -> Result<InstallPlan> {
        self.manifest.validate()?;

        let root = &self.install_root;
        let results = self
            .pool
            .run(self.manifest.files.clone(), self.cancel, |entry| {
                let local_path = entry.local_path(root);
                let action = decide(&entry, &mut FsProbe::new(&local_path));
                (entry, local_path, action)
            });

        let mut plan = InstallPlan::default();
        for result in results {
            match result {
                Some((entry, local_path, Ok(action))) => {
                    tracing::debug!("{}: {}", entry.file_path, action);
                    plan.files.push(PlannedFile {
                        entry,
                        local_path,
                        action,
                    });
                }
                Some((entry, _, Err(e))) if e.category() == ErrorCategory::Format => {
                    tracing::error!("{}: {}", entry.file_path, e);
                    return Err(e);
                }
                Some((entry, _, Err(e))) => {
                    tracing::warn!("Failed to inspect {}: {}", entry.file_path, e);
                    plan.failures.push(FileFailure::new(&entry.file_path, &e));
                }
                None => plan.cancelled = true,
            }
        }

        Ok(plan)
    }

    /// Fail on the first delta update whose signature the release lacks
    pub fn validate_signatures(&self, plan: &InstallPlan) -> Result<()> {
        for planned in plan.pending() {
            if planned.action != FileAction::DeltaUpdate {
                continue;
            }

            let signature_path = planned.entry.signature_path();
            let present = self
                .remote
                .exists(&signature_path)
                .map_err(|e| transfer_error(&signature_path, e))?;

            if !present {
                return Err(PatchError::MissingSignature {
                    path: PathBuf::from(&planned.entry.file_path),
                });
            }
        }
        Ok(())
    }

    pub fn run(&self) -> Result<InstallReport> {
        let start = Instant::now();

        let plan = self.plan()?;
        let mut report = InstallReport {
            dry_run: self.dry_run,
            cancelled: plan.cancelled,
            ..InstallReport::default()
        };

        if plan.cancelled {
            tracing::warn!("Install cancelled while planning");
            report.duration = start.elapsed();
            return Ok(report);
        }

        self.validate_signatures(&plan)?;

        let pending: Vec<PlannedFile> = plan.pending().cloned().collect();
        tracing::info!(
            "{} of {} files need changes",
            pending.len(),
            plan.files.len()
        );

        let results = if self.dry_run {
            Vec::new()
        } else {
            if let Some(bar) = &self.progress {
                bar.set_length(pending.len() as u64);
            }
            self.pool.run(pending, self.cancel, |planned| {
                let result = self.execute(&planned);
                if let Some(bar) = &self.progress {
                    bar.inc(1);
                }
                result
            })
        };
        let mut results = results.into_iter();

        report.failures = plan.failures;

        for planned in plan.files {
            let path = planned.entry.file_path;

            if planned.action.is_noop() {
                report.files.push(FileReport {
                    path,
                    action: planned.action,
                    outcome: FileOutcome::Unchanged,
                });
                continue;
            }

            if self.dry_run {
                report.files.push(FileReport {
                    path,
                    action: planned.action,
                    outcome: FileOutcome::Planned,
                });
                continue;
            }

            match results.next().flatten() {
                Some(Ok(outcome)) => report.files.push(FileReport {
                    path,
                    action: planned.action,
                    outcome,
                }),
                Some(Err(e)) if e.is_cancelled() => report.cancelled = true,
                Some(Err(e)) => {
                    tracing::warn!("{} failed: {}", path, e);
                    report.failures.push(FileFailure::new(path, &e));
                }
                None => report.cancelled = true,
            }
        }

        report.duration = start.elapsed();
        tracing::info!(
            "Install finished: {} changed, {} unchanged, {} failed",
            report.files_changed(),
            report.files_unchanged(),
            report.failures.len()
        );

        Ok(report)
    }

    fn execute(&self, planned: &PlannedFile) -> Result<FileOutcome> {
        self.cancel.check()?;

        let entry = &planned.entry;
        let local = planned.local_path.as_path();

        match planned.action {
            FileAction::None => Ok(FileOutcome::Unchanged),
            FileAction::Create | FileAction::FullUpdate => {
                let bytes = self.download(entry, local)?;
                Ok(FileOutcome::Downloaded {
                    bytes,
                    fallback: false,
                })
            }
            FileAction::Delete => match fs::remove_file(local) {
                Ok(()) => Ok(FileOutcome::Deleted),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(FileOutcome::Unchanged),
                Err(e) => Err(e.into()),
            },
            FileAction::DeltaUpdate => self.delta_update(entry, local),
        }
    }

    fn delta_update(&self, entry: &ManifestFileEntry, local: &Path) -> Result<FileOutcome> {
        let Some(expected) = entry.full_hash()? else {
            let bytes = self.download(entry, local)?;
            return Ok(FileOutcome::Downloaded {
                bytes,
                fallback: true,
            });
        };

        let signature = self.fetch_signature(entry)?;

        let slices = {
            let file = File::open(local)?;
            let local_len = file.metadata()?.len();
            DeltaMatcher::new(&signature)
                .with_cancel(self.cancel)
                .compute_slices(BufReader::new(file), local_len)?
        };

        let outcome = PatchAssembler::new(
            &signature,
            entry.file_size,
            expected,
            self.remote,
            &entry.file_path,
        )
        .with_cancel(self.cancel)
        .apply(&slices, local)?;

        match outcome {
            AssemblyOutcome::Unchanged => Ok(FileOutcome::Unchanged),
            AssemblyOutcome::Patched(stats) => Ok(FileOutcome::Patched {
                local_bytes: stats.local_bytes,
                remote_bytes: stats.remote_bytes,
                out_of_order: stats.out_of_order,
            }),
            AssemblyOutcome::FullDownloadRequired(reason) => {
                tracing::debug!("{}: full download ({:?})", entry.file_path, reason);
                let bytes = self.download(entry, local)?;
                Ok(FileOutcome::Downloaded {
                    bytes,
                    fallback: true,
                })
            }
        }
    }

    fn fetch_signature(&self, entry: &ManifestFileEntry) -> Result<SignatureFile> {
        let signature_path = entry.signature_path();
        let stream = self.remote.open(&signature_path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                PatchError::MissingSignature {
                    path: PathBuf::from(&entry.file_path),
                }
            } else {
                transfer_error(&signature_path, e)
            }
        })?;

        SignatureFile::load(
            BufReader::new(stream),
            entry.file_size,
            entry.effective_chunk_size(),
        )
        .map_err(|e| PatchError::CorruptSignature {
            path: PathBuf::from(&signature_path),
            reason: e.to_string(),
        })
    }

    /// Stream the whole remote file into place, verifying size and hash
    fn download(&self, entry: &ManifestFileEntry, local: &Path) -> Result<u64> {
        let expected = entry.full_hash()?;
        let scratch = fs_util::scratch_dir_for(local)?;
        let part = scratch.path().join(DOWNLOAD_FILE_NAME);

        let mut stream = self
            .remote
            .open(&entry.file_path)
            .map_err(|e| transfer_error(&entry.file_path, e))?;
        let mut out = BufWriter::new(File::create(&part)?);
        let mut hasher = FullHasher::new();
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut total = 0u64;

        loop {
            self.cancel.check()?;
            let n = match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(transfer_error(&entry.file_path, e)),
            };
            out.write_all(&buf[..n])?;
            hasher.update(&buf[..n]);
            total += n as u64;
        }

        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        if total != entry.file_size {
            return Err(PatchError::IntegrityMismatch {
                path: PathBuf::from(&entry.file_path),
                expected: format!("{} bytes", entry.file_size),
                actual: format!("{} bytes", total),
            });
        }

        let actual = hasher.finalize();
        if let Some(expected) = expected {
            if actual != expected {
                return Err(PatchError::IntegrityMismatch {
                    path: PathBuf::from(&entry.file_path),
                    expected: expected.to_hex(),
                    actual: actual.to_hex(),
                });
            }
        }

        fs_util::replace_file(&part, local)?;
        Ok(total)
    }
}

fn transfer_error(path: &str, source: io::Error) -> PatchError {
    PatchError::Transfer {
        path: PathBuf::from(path),
        source,
    }
}
