// End-to-end delta sync correctness tests
//
// These drive the library the way the binary does: build a release from a
// source tree, then bring an installation up to date from it.

use chrono::{TimeZone, Utc};
use patchsync::delta::matcher::DeltaMatcher;
use patchsync::delta::signature::SignatureFile;
use patchsync::fs_util;
use patchsync::manifest::policy::FileAction;
use patchsync::manifest::PatchManifest;
use patchsync::sync::{
    BuildOptions, BuildPipeline, CancelToken, FileOutcome, InstallReport, Installer, WorkerPool,
};
use patchsync::transport::local::DirectorySource;
use patchsync::transport::{ByteRange, RemoteSource, RemoteStream};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Deterministic pseudo-random bytes
fn pattern(len: usize, seed: u64) -> Vec<u8> {
    (0..len as u64)
        .flat_map(|i| xxh3_64_with_seed(&i.to_le_bytes(), seed).to_le_bytes())
        .take(len)
        .collect()
}

struct Published {
    _temp: TempDir,
    source: PathBuf,
    manifest: PatchManifest,
    release: PathBuf,
}

/// Publish `files` as a release
fn publish(files: &[(&str, Vec<u8>)]) -> Published {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("source");
    let output = temp.path().join("publish");

    for (path, content) in files {
        let full = source.join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, content).unwrap();
    }

    let pool = WorkerPool::new(4).unwrap();
    let cancel = CancelToken::new();
    let options = BuildOptions::new("prod", &output)
        .date(Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap());
    let report = BuildPipeline::new(&source, options, &pool, &cancel)
        .run()
        .unwrap();
    assert!(report.is_success());

    let manifest = PatchManifest::load(&report.manifest_path).unwrap();
    Published {
        _temp: temp,
        source,
        manifest,
        release: report.release_dir,
    }
}

fn install_with(
    published: &Published,
    remote: &dyn RemoteSource,
    target: &Path,
    workers: usize,
) -> InstallReport {
    let pool = WorkerPool::new(workers).unwrap();
    let cancel = CancelToken::new();
    Installer::new(&published.manifest, remote, target, &pool, &cancel)
        .run()
        .unwrap()
}

fn install(published: &Published, target: &Path) -> InstallReport {
    let remote = DirectorySource::new(&published.release);
    install_with(published, &remote, target, 4)
}

/// Remote wrapper counting byte requests and optionally delaying them
struct InstrumentedRemote {
    inner: DirectorySource,
    delay_seed: Option<u64>,
    requests: AtomicUsize,
}

impl InstrumentedRemote {
    fn new(root: &Path) -> Self {
        Self {
            inner: DirectorySource::new(root),
            delay_seed: None,
            requests: AtomicUsize::new(0),
        }
    }

    fn with_delays(root: &Path, seed: u64) -> Self {
        Self {
            delay_seed: Some(seed),
            ..Self::new(root)
        }
    }

    fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn pause(&self, path: &str) {
        if let Some(seed) = self.delay_seed {
            let micros = xxh3_64_with_seed(path.as_bytes(), seed) % 3000;
            std::thread::sleep(Duration::from_micros(micros));
        }
    }
}

impl RemoteSource for InstrumentedRemote {
    fn exists(&self, path: &str) -> io::Result<bool> {
        self.inner.exists(path)
    }

    fn open(&self, path: &str) -> io::Result<RemoteStream> {
        self.pause(path);
        if !path.ends_with(".sig") {
            self.requests.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.open(path)
    }

    fn read_ranges(&self, path: &str, ranges: &[ByteRange]) -> io::Result<Vec<RemoteStream>> {
        self.pause(path);
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.inner.read_ranges(path, ranges)
    }
}

fn scratch_dirs(root: &Path) -> usize {
    walk(root)
        .into_iter()
        .filter(|p| fs_util::is_scratch_path(p))
        .count()
}

fn walk(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    if let Ok(entries) = fs::read_dir(root) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                found.extend(walk(&path));
            }
            found.push(path);
        }
    }
    found
}

#[test]
fn test_delta_sync_file_shrinks() {
    let target = pattern(50_000, 1);
    let published = publish(&[("test.dat", target.clone())]);

    let install_dir = TempDir::new().unwrap();
    let mut local = target.clone();
    local.extend(pattern(50_000, 2));
    fs::write(install_dir.path().join("test.dat"), &local).unwrap();

    let report = install(&published, install_dir.path());

    assert!(report.is_success());
    assert!(matches!(
        report.outcome("test.dat"),
        Some(FileOutcome::Patched { remote_bytes: 0, .. })
    ));
    assert_eq!(fs::read(install_dir.path().join("test.dat")).unwrap(), target);
}

#[test]
fn test_delta_sync_file_grows() {
    let target = pattern(80_000, 3);
    let published = publish(&[("test.dat", target.clone())]);

    let install_dir = TempDir::new().unwrap();
    fs::write(install_dir.path().join("test.dat"), &target[..60_000]).unwrap();

    let report = install(&published, install_dir.path());

    assert!(report.is_success());
    assert!(matches!(
        report.outcome("test.dat"),
        Some(FileOutcome::Patched { .. })
    ));
    assert_eq!(fs::read(install_dir.path().join("test.dat")).unwrap(), target);
    assert_eq!(scratch_dirs(install_dir.path()), 0);
}

#[test]
fn test_full_match_takes_noop_path_without_remote() {
    let target = pattern(40_000, 4);
    let published = publish(&[("same.bin", target.clone())]);
    let entry = published.manifest.entry("same.bin").unwrap();

    // Every chunk is found locally at its own offset
    let signature = SignatureFile::open(
        &published.release.join("same.bin.sig"),
        entry.file_size,
        entry.effective_chunk_size(),
    )
    .unwrap();
    let slices = DeltaMatcher::new(&signature)
        .compute_slices(io::Cursor::new(&target), target.len() as u64)
        .unwrap();
    let chunk_size = signature.chunk_size() as u64;
    assert!(slices
        .iter()
        .enumerate()
        .all(|(i, s)| s.is_existing() && s.offset == i as u64 * chunk_size));

    let install_dir = TempDir::new().unwrap();
    fs::write(install_dir.path().join("same.bin"), &target).unwrap();
    let remote = InstrumentedRemote::new(&published.release);

    let report = install_with(&published, &remote, install_dir.path(), 2);

    assert_eq!(report.outcome("same.bin"), Some(FileOutcome::Unchanged));
    assert_eq!(remote.requests(), 0);
}

#[test]
fn test_prefixed_file_matches_unaligned() {
    let target = pattern(30_000, 5);
    let published = publish(&[("shifted.bin", target.clone())]);

    let install_dir = TempDir::new().unwrap();
    let mut local = pattern(777, 6);
    local.extend_from_slice(&target);
    fs::write(install_dir.path().join("shifted.bin"), &local).unwrap();

    let remote = InstrumentedRemote::new(&published.release);
    let report = install_with(&published, &remote, install_dir.path(), 2);

    match report.outcome("shifted.bin") {
        Some(FileOutcome::Patched {
            remote_bytes,
            out_of_order,
            ..
        }) => {
            assert_eq!(remote_bytes, 0);
            assert!(out_of_order > 0);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(remote.requests(), 0);
    assert_eq!(fs::read(install_dir.path().join("shifted.bin")).unwrap(), target);
}

#[test]
fn test_unrelated_local_file_falls_back_to_full_download() {
    let target = pattern(30_000, 7);
    let published = publish(&[("other.bin", target.clone())]);

    let install_dir = TempDir::new().unwrap();
    fs::write(install_dir.path().join("other.bin"), pattern(30_000, 8)).unwrap();

    let remote = InstrumentedRemote::new(&published.release);
    let report = install_with(&published, &remote, install_dir.path(), 2);

    assert_eq!(
        report.outcome("other.bin"),
        Some(FileOutcome::Downloaded {
            bytes: 30_000,
            fallback: true
        })
    );
    // One whole-file download, no range requests
    assert_eq!(remote.requests(), 1);
    assert_eq!(fs::read(install_dir.path().join("other.bin")).unwrap(), target);
}

#[test]
fn test_second_install_is_idempotent() {
    let published = publish(&[
        ("data/world.bin", pattern(64_000, 9)),
        ("data/maps/a.map", pattern(5_000, 10)),
        ("readme.txt", b"read me".to_vec()),
    ]);

    let install_dir = TempDir::new().unwrap();
    fs::create_dir_all(install_dir.path().join("data")).unwrap();
    let mut stale = pattern(64_000, 9);
    stale[10_000] ^= 0xFF;
    fs::write(install_dir.path().join("data/world.bin"), &stale).unwrap();

    let first = install(&published, install_dir.path());
    assert!(first.is_success());
    assert_eq!(first.files_changed(), 3);

    let remote = InstrumentedRemote::new(&published.release);
    let second = install_with(&published, &remote, install_dir.path(), 4);

    assert!(second.is_success());
    assert_eq!(second.files_changed(), 0);
    assert_eq!(second.files_unchanged(), 3);
    assert!(second.files.iter().all(|f| f.action == FileAction::None));
    assert_eq!(remote.requests(), 0);

    for entry in &published.manifest.files {
        assert_eq!(
            fs::read(entry.local_path(install_dir.path())).unwrap(),
            fs::read(entry.local_path(&published.source)).unwrap(),
            "{}",
            entry.file_path
        );
    }
}

#[test]
fn test_concurrent_batch_matches_sequential() {
    let files: Vec<(String, Vec<u8>)> = (0..24)
        .map(|i| (format!("pack/file{:02}.bin", i), pattern(20_000 + i * 997, 100 + i as u64)))
        .collect();
    let borrowed: Vec<(&str, Vec<u8>)> = files
        .iter()
        .map(|(p, c)| (p.as_str(), c.clone()))
        .collect();
    let published = publish(&borrowed);

    // Same starting state in two installations
    let prepare = |root: &Path| {
        fs::create_dir_all(root.join("pack")).unwrap();
        for (i, (path, content)) in files.iter().enumerate() {
            let local = root.join(path);
            match i % 4 {
                0 => fs::write(&local, content).unwrap(),
                1 => {
                    let mut changed = content.clone();
                    changed[5_000..5_300].fill(0xAB);
                    fs::write(&local, changed).unwrap();
                }
                2 => {} // missing
                _ => fs::write(&local, pattern(content.len(), 900 + i as u64)).unwrap(),
            }
        }
    };

    let sequential_dir = TempDir::new().unwrap();
    let concurrent_dir = TempDir::new().unwrap();
    prepare(sequential_dir.path());
    prepare(concurrent_dir.path());

    let sequential_remote = DirectorySource::new(&published.release);
    let sequential = install_with(&published, &sequential_remote, sequential_dir.path(), 1);

    let concurrent_remote = InstrumentedRemote::with_delays(&published.release, 42);
    let concurrent = install_with(&published, &concurrent_remote, concurrent_dir.path(), 8);

    assert!(sequential.is_success());
    assert!(concurrent.is_success());
    assert_eq!(sequential.files, concurrent.files);

    for (path, content) in &files {
        assert_eq!(&fs::read(sequential_dir.path().join(path)).unwrap(), content);
        assert_eq!(&fs::read(concurrent_dir.path().join(path)).unwrap(), content);
    }
}
