use super::checksum::{full_hash_reader, FullHash, FullHasher};
use super::matcher::{PatchSlice, SliceLocation};
use super::signature::SignatureFile;
use crate::error::{PatchError, Result};
use crate::fs_util;
use crate::sync::pool::CancelToken;
use crate::transport::{ByteRange, RemoteSource, RemoteStream};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Name of the assembled file inside the scratch directory
const ASSEMBLY_FILE_NAME: &str = "assembly.part";

/// Most remote ranges requested, and held open, at once
const MAX_RANGES_PER_REQUEST: usize = 16;

/// Remote share above which a full download beats delta assembly
pub fn remote_threshold(file_size: u64) -> u64 {
    (file_size as f64 / 1.5) as u64
}

/// Result of the single cost-estimation pass over the slices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SliceCost {
    pub existing: usize,
    pub remote: usize,
    pub out_of_order: usize,
    pub remote_bytes: u64,
    /// Remote bytes reached the threshold; later slices were not inspected
    pub threshold_crossed: bool,
}

impl SliceCost {
    pub fn estimate(slices: &[PatchSlice], chunk_size: u32, file_size: u64) -> Self {
        let threshold = remote_threshold(file_size);
        let mut cost = Self::default();

        for (index, slice) in slices.iter().enumerate() {
            match slice.location {
                SliceLocation::Existing => {
                    cost.existing += 1;
                    if slice.offset != index as u64 * chunk_size as u64 {
                        cost.out_of_order += 1;
                    }
                }
                SliceLocation::Remote => {
                    cost.remote += 1;
                    cost.remote_bytes += chunk_size as u64;
                    if cost.remote_bytes >= threshold {
                        cost.threshold_crossed = true;
                        break;
                    }
                }
            }
        }

        cost
    }
}

/// Why delta assembly handed the file back for a full download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullDownloadReason {
    /// Too much of the file would come from the remote
    RemoteThreshold { remote_bytes: u64, threshold: u64 },
    /// Every chunk is local and aligned but the file still hashes differently
    LocalHashMismatch,
}

/// Byte accounting for one assembled file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeltaStats {
    pub local_bytes: u64,
    pub remote_bytes: u64,
    pub remainder_bytes: u64,
    pub out_of_order: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyOutcome {
    /// Local file already matches; nothing was written
    Unchanged,
    /// Local file was rebuilt and replaced
    Patched(DeltaStats),
    /// Caller should download the whole file instead
    FullDownloadRequired(FullDownloadReason),
}

/// Rebuilds one file from local and remote slices
///
/// The output is assembled in a scratch directory beside the target, checked
/// against the expected full hash, then renamed over the target. A failed or
/// cancelled assembly never touches the installed file.
pub struct PatchAssembler<'a> {
    signature: &'a SignatureFile,
    file_size: u64,
    expected: FullHash,
    remote: &'a dyn RemoteSource,
    remote_path: &'a str,
    cancel: Option<&'a CancelToken>,
}

impl<'a> PatchAssembler<'a> {
    pub fn new(
        signature: &'a SignatureFile,
        file_size: u64,
        expected: FullHash,
        remote: &'a dyn RemoteSource,
        remote_path: &'a str,
    ) -> Self {
        Self {
            signature,
            file_size,
            expected,
            remote,
            remote_path,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: &'a CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Decide, and if worthwhile perform, the delta reconstruction of `local_path`
    pub fn apply(&self, slices: &[PatchSlice], local_path: &Path) -> Result<AssemblyOutcome> {
        let chunk_size = self.signature.chunk_size();
        let cost = SliceCost::estimate(slices, chunk_size, self.file_size);

        if cost.threshold_crossed {
            let threshold = remote_threshold(self.file_size);
            tracing::debug!(
                "{}: {} remote bytes reach the {} byte threshold, preferring full download",
                self.remote_path,
                cost.remote_bytes,
                threshold
            );
            return Ok(AssemblyOutcome::FullDownloadRequired(
                FullDownloadReason::RemoteThreshold {
                    remote_bytes: cost.remote_bytes,
                    threshold,
                },
            ));
        }

        let local_len = std::fs::metadata(local_path)?.len();

        if cost.remote == 0 && cost.out_of_order == 0 && local_len == self.file_size {
            let actual = full_hash_reader(BufReader::new(File::open(local_path)?))?;
            return if actual == self.expected {
                tracing::debug!("{}: already up to date", self.remote_path);
                Ok(AssemblyOutcome::Unchanged)
            } else {
                Ok(AssemblyOutcome::FullDownloadRequired(
                    FullDownloadReason::LocalHashMismatch,
                ))
            };
        }

        let scratch = fs_util::scratch_dir_for(local_path)?;
        let assembled = scratch.path().join(ASSEMBLY_FILE_NAME);

        let (actual, stats) = self.assemble(slices, local_path, &assembled)?;

        if actual != self.expected {
            return Err(PatchError::IntegrityMismatch {
                path: PathBuf::from(self.remote_path),
                expected: self.expected.to_hex(),
                actual: actual.to_hex(),
            });
        }

        fs_util::replace_file(&assembled, local_path)?;
        drop(scratch);

        tracing::debug!(
            "{}: patched ({} local, {} remote bytes, {} out of order)",
            self.remote_path,
            stats.local_bytes,
            stats.remote_bytes,
            stats.out_of_order
        );

        Ok(AssemblyOutcome::Patched(stats))
    }

    /// Write every slice, then the remainder, into `output`; returns its full hash
    fn assemble(
        &self,
        slices: &[PatchSlice],
        local_path: &Path,
        output: &Path,
    ) -> Result<(FullHash, DeltaStats)> {
        let chunk_size = self.signature.chunk_size() as usize;
        let mut local = File::open(local_path)?;
        let mut remote = RemoteRuns::plan(self, slices);
        let mut out = BufWriter::new(File::create(output)?);
        let mut hasher = FullHasher::new();
        let mut chunk = vec![0u8; chunk_size];
        let mut stats = DeltaStats::default();

        for (index, slice) in slices.iter().enumerate() {
            if let Some(cancel) = self.cancel {
                cancel.check()?;
            }

            match slice.location {
                SliceLocation::Existing => {
                    local.seek(SeekFrom::Start(slice.offset))?;
                    local.read_exact(&mut chunk).map_err(|e| {
                        io::Error::new(
                            e.kind(),
                            format!("local chunk {} at offset {}: {}", index, slice.offset, e),
                        )
                    })?;
                    stats.local_bytes += chunk_size as u64;
                    if slice.offset != index as u64 * chunk_size as u64 {
                        stats.out_of_order += 1;
                    }
                }
                SliceLocation::Remote => {
                    remote.read_chunk(&mut chunk).map_err(|e| PatchError::Transfer {
                        path: PathBuf::from(self.remote_path),
                        source: e,
                    })?;
                    stats.remote_bytes += chunk_size as u64;
                }
            }

            out.write_all(&chunk)?;
            hasher.update(&chunk);
        }

        let remainder = self.signature.remainder();
        out.write_all(remainder)?;
        hasher.update(remainder);
        stats.remainder_bytes = remainder.len() as u64;

        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        Ok((hasher.finalize(), stats))
    }
}

/// Remote slices grouped into contiguous runs, requested in bounded batches
///
/// Each batch is asked for only when the copy loop has drained the previous
/// one, so at most `MAX_RANGES_PER_REQUEST` streams are open at a time.
struct RemoteRuns<'a> {
    remote: &'a dyn RemoteSource,
    path: &'a str,
    runs: Vec<(ByteRange, usize)>,
    next_run: usize,
    batch: std::vec::IntoIter<(RemoteStream, usize)>,
    current: Option<(RemoteStream, usize)>,
}

impl<'a> RemoteRuns<'a> {
    fn plan(assembler: &PatchAssembler<'a>, slices: &[PatchSlice]) -> Self {
        let chunk_size = assembler.signature.chunk_size() as u64;
        let mut runs: Vec<(ByteRange, usize)> = Vec::new();

        for slice in slices.iter().filter(|s| s.location == SliceLocation::Remote) {
            match runs.last_mut() {
                Some((range, count)) if range.end_inclusive + 1 == slice.offset => {
                    range.end_inclusive += chunk_size;
                    *count += 1;
                }
                _ => runs.push((ByteRange::with_len(slice.offset, chunk_size), 1)),
            }
        }

        Self {
            remote: assembler.remote,
            path: assembler.remote_path,
            runs,
            next_run: 0,
            batch: Vec::new().into_iter(),
            current: None,
        }
    }

    fn next_batch(&mut self) -> io::Result<()> {
        let end = (self.next_run + MAX_RANGES_PER_REQUEST).min(self.runs.len());
        let pending = &self.runs[self.next_run..end];
        if pending.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "remote ranges exhausted",
            ));
        }

        let ranges: Vec<ByteRange> = pending.iter().map(|(range, _)| *range).collect();
        let counts: Vec<usize> = pending.iter().map(|(_, count)| *count).collect();

        let streams = self.remote.read_ranges(self.path, &ranges)?;
        if streams.len() != ranges.len() {
            return Err(io::Error::other(format!(
                "requested {} ranges, received {} streams",
                ranges.len(),
                streams.len()
            )));
        }

        self.batch = streams.into_iter().zip(counts).collect::<Vec<_>>().into_iter();
        self.next_run = end;
        Ok(())
    }

    fn read_chunk(&mut self, chunk: &mut [u8]) -> io::Result<()> {
        if self.current.as_ref().map_or(true, |(_, left)| *left == 0) {
            self.current = None;
            if self.batch.as_slice().is_empty() {
                self.next_batch()?;
            }
            self.current = self.batch.next();
        }

        match self.current.as_mut() {
            Some((stream, left)) => {
                stream.read_exact(chunk)?;
                *left -= 1;
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "remote ranges exhausted",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::matcher::DeltaMatcher;
    use crate::transport::local::DirectorySource;
    use std::fs;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn pattern(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed.max(1);
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    fn full_hash(data: &[u8]) -> FullHash {
        full_hash_reader(Cursor::new(data)).unwrap()
    }

    /// Remote that must never be asked for bytes
    struct UntouchableRemote {
        calls: AtomicUsize,
    }

    impl RemoteSource for UntouchableRemote {
        fn exists(&self, _path: &str) -> io::Result<bool> {
            Ok(true)
        }

        fn open(&self, _path: &str) -> io::Result<RemoteStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::other("remote must not be used"))
        }

        fn read_ranges(&self, _path: &str, _ranges: &[ByteRange]) -> io::Result<Vec<RemoteStream>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::other("remote must not be used"))
        }
    }

    struct Fixture {
        _temp: TempDir,
        local: PathBuf,
        remote: DirectorySource,
    }

    fn fixture(local: &[u8], target: &[u8]) -> Fixture {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("install")).unwrap();
        fs::create_dir_all(temp.path().join("release")).unwrap();
        let local_path = temp.path().join("install/file.bin");
        fs::write(&local_path, local).unwrap();
        fs::write(temp.path().join("release/file.bin"), target).unwrap();
        let remote = DirectorySource::new(temp.path().join("release"));
        Fixture {
            _temp: temp,
            local: local_path,
            remote,
        }
    }

    fn run(fx: &Fixture, target: &[u8], chunk_size: u32) -> Result<AssemblyOutcome> {
        let sig = SignatureFile::from_bytes(target, chunk_size);
        let local = fs::read(&fx.local).unwrap();
        let slices = DeltaMatcher::new(&sig)
            .compute_slices(Cursor::new(&local), local.len() as u64)
            .unwrap();
        PatchAssembler::new(&sig, target.len() as u64, full_hash(target), &fx.remote, "file.bin")
            .apply(&slices, &fx.local)
    }

    #[test]
    fn test_threshold_value() {
        assert_eq!(remote_threshold(3000), 2000);
        assert_eq!(remote_threshold(1000), 666);
    }

    #[test]
    fn test_estimate_stops_at_threshold() {
        let slices: Vec<PatchSlice> = (0..10).map(|i| PatchSlice::remote(i * 100)).collect();
        let cost = SliceCost::estimate(&slices, 100, 1000);

        // Threshold is 666: crossed on the 7th remote slice
        assert!(cost.threshold_crossed);
        assert_eq!(cost.remote, 7);
        assert_eq!(cost.remote_bytes, 700);
    }

    #[test]
    fn test_estimate_counts_out_of_order() {
        let slices = vec![
            PatchSlice::existing(0),
            PatchSlice::existing(300),
            PatchSlice::remote(200),
            PatchSlice::existing(300),
        ];
        let cost = SliceCost::estimate(&slices, 100, 400);

        assert_eq!(cost.existing, 3);
        assert_eq!(cost.out_of_order, 1);
        assert_eq!(cost.remote, 1);
        assert!(!cost.threshold_crossed);
    }

    #[test]
    fn test_fallback_never_touches_remote() {
        let temp = TempDir::new().unwrap();
        let local_path = temp.path().join("file.bin");
        fs::write(&local_path, pattern(1000, 1)).unwrap();

        let target = pattern(1000, 2);
        let sig = SignatureFile::from_bytes(&target, 100);
        let slices: Vec<PatchSlice> = (0..10).map(|i| PatchSlice::remote(i * 100)).collect();
        let remote = UntouchableRemote {
            calls: AtomicUsize::new(0),
        };

        let outcome = PatchAssembler::new(&sig, 1000, full_hash(&target), &remote, "file.bin")
            .apply(&slices, &local_path)
            .unwrap();

        assert!(matches!(
            outcome,
            AssemblyOutcome::FullDownloadRequired(FullDownloadReason::RemoteThreshold { .. })
        ));
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fs::read(&local_path).unwrap(), pattern(1000, 1));
    }

    #[test]
    fn test_identical_file_is_noop_without_remote() {
        let target = pattern(100 * 12 + 7, 3);
        let temp = TempDir::new().unwrap();
        let local_path = temp.path().join("file.bin");
        fs::write(&local_path, &target).unwrap();

        let sig = SignatureFile::from_bytes(&target, 100);
        let slices = DeltaMatcher::new(&sig)
            .compute_slices(Cursor::new(&target), target.len() as u64)
            .unwrap();
        let remote = UntouchableRemote {
            calls: AtomicUsize::new(0),
        };

        let outcome = PatchAssembler::new(&sig, target.len() as u64, full_hash(&target), &remote, "file.bin")
            .apply(&slices, &local_path)
            .unwrap();

        assert_eq!(outcome, AssemblyOutcome::Unchanged);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_aligned_but_different_tail_requires_full_download() {
        // Same chunks, different remainder bytes
        let target = pattern(100 * 5 + 4, 4);
        let mut local = target.clone();
        let last = local.len() - 1;
        local[last] ^= 0xFF;

        let fx = fixture(&local, &target);
        let outcome = run(&fx, &target, 100).unwrap();
        assert_eq!(
            outcome,
            AssemblyOutcome::FullDownloadRequired(FullDownloadReason::LocalHashMismatch)
        );
    }

    #[test]
    fn test_patch_modified_middle() {
        let target = pattern(100 * 20 + 30, 5);
        let mut local = target.clone();
        for byte in &mut local[450..520] {
            *byte = !*byte;
        }

        let fx = fixture(&local, &target);
        let outcome = run(&fx, &target, 100).unwrap();

        match outcome {
            AssemblyOutcome::Patched(stats) => {
                assert_eq!(stats.remote_bytes, 200); // chunks 4 and 5
                assert_eq!(stats.local_bytes, 1800);
                assert_eq!(stats.remainder_bytes, 30);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(fs::read(&fx.local).unwrap(), target);
    }

    #[test]
    fn test_patch_prefixed_local_file() {
        // Local has extra bytes in front: every chunk matches unaligned
        let target = pattern(100 * 10, 6);
        let local = [pattern(100, 7), target.clone()].concat();

        let fx = fixture(&local, &target);
        let outcome = run(&fx, &target, 100).unwrap();

        match outcome {
            AssemblyOutcome::Patched(stats) => {
                assert_eq!(stats.remote_bytes, 0);
                assert_eq!(stats.out_of_order, 10);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(fs::read(&fx.local).unwrap(), target);
    }

    /// Directory remote recording request sizes and how many streams are alive
    struct TrackingRemote {
        inner: DirectorySource,
        requests: AtomicUsize,
        widest_request: AtomicUsize,
        live: Arc<AtomicUsize>,
        peak_live: Arc<AtomicUsize>,
    }

    struct TrackedStream {
        inner: RemoteStream,
        live: Arc<AtomicUsize>,
    }

    impl Read for TrackedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl Drop for TrackedStream {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl RemoteSource for TrackingRemote {
        fn exists(&self, path: &str) -> io::Result<bool> {
            self.inner.exists(path)
        }

        fn open(&self, path: &str) -> io::Result<RemoteStream> {
            self.inner.open(path)
        }

        fn read_ranges(&self, path: &str, ranges: &[ByteRange]) -> io::Result<Vec<RemoteStream>> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            self.widest_request.fetch_max(ranges.len(), Ordering::SeqCst);

            let streams = self.inner.read_ranges(path, ranges)?;
            let now = self.live.fetch_add(streams.len(), Ordering::SeqCst) + streams.len();
            self.peak_live.fetch_max(now, Ordering::SeqCst);

            Ok(streams
                .into_iter()
                .map(|inner| {
                    Box::new(TrackedStream {
                        inner,
                        live: Arc::clone(&self.live),
                    }) as RemoteStream
                })
                .collect())
        }
    }

    #[test]
    fn test_scattered_remote_slices_keep_few_streams_open() {
        // 4000 chunks, every even one changed: 2000 separate remote runs
        let chunk = 64usize;
        let target = pattern(chunk * 4000, 11);
        let mut local = target.clone();
        for i in (0..4000).step_by(2) {
            local[i * chunk] ^= 0xFF;
        }

        let fx = fixture(&local, &target);
        let remote = TrackingRemote {
            inner: fx.remote.clone(),
            requests: AtomicUsize::new(0),
            widest_request: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            peak_live: Arc::new(AtomicUsize::new(0)),
        };

        let sig = SignatureFile::from_bytes(&target, chunk as u32);
        let slices: Vec<PatchSlice> = (0..4000u64)
            .map(|i| {
                if i % 2 == 0 {
                    PatchSlice::remote(i * chunk as u64)
                } else {
                    PatchSlice::existing(i * chunk as u64)
                }
            })
            .collect();

        let outcome = PatchAssembler::new(&sig, target.len() as u64, full_hash(&target), &remote, "file.bin")
            .apply(&slices, &fx.local)
            .unwrap();

        match outcome {
            AssemblyOutcome::Patched(stats) => {
                assert_eq!(stats.remote_bytes, 2000 * chunk as u64);
                assert_eq!(stats.local_bytes, 2000 * chunk as u64);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(fs::read(&fx.local).unwrap(), target);

        assert_eq!(remote.requests.load(Ordering::SeqCst), 2000 / MAX_RANGES_PER_REQUEST);
        assert_eq!(remote.widest_request.load(Ordering::SeqCst), MAX_RANGES_PER_REQUEST);
        assert!(remote.peak_live.load(Ordering::SeqCst) <= MAX_RANGES_PER_REQUEST);
        assert_eq!(remote.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_integrity_mismatch_leaves_original() {
        let target = pattern(100 * 10, 8);
        let mut local = target.clone();
        local[10] ^= 1;

        let fx = fixture(&local, &target);
        let sig = SignatureFile::from_bytes(&target, 100);
        let slices = DeltaMatcher::new(&sig)
            .compute_slices(Cursor::new(&local), local.len() as u64)
            .unwrap();

        let wrong = full_hash(b"something else");
        let err = PatchAssembler::new(&sig, target.len() as u64, wrong, &fx.remote, "file.bin")
            .apply(&slices, &fx.local)
            .unwrap_err();

        assert!(matches!(err, PatchError::IntegrityMismatch { .. }));
        assert_eq!(fs::read(&fx.local).unwrap(), local);

        // Scratch directory is gone
        let leftovers: Vec<_> = fs::read_dir(fx.local.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| fs_util::is_scratch_path(&e.path()))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_truncated_remote_is_transfer_error() {
        let target = pattern(100 * 10, 9);
        let mut local = target.clone();
        local[950] ^= 1;

        let fx = fixture(&local, &target[..900]);
        let err = run(&fx, &target, 100).unwrap_err();

        assert!(matches!(err, PatchError::Transfer { .. }));
        assert_eq!(fs::read(&fx.local).unwrap(), local);
    }

    #[test]
    fn test_cancelled_assembly_leaves_original() {
        let target = pattern(100 * 10, 10);
        let mut local = target.clone();
        local[0] ^= 1;

        let fx = fixture(&local, &target);
        let sig = SignatureFile::from_bytes(&target, 100);
        let slices = DeltaMatcher::new(&sig)
            .compute_slices(Cursor::new(&local), local.len() as u64)
            .unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = PatchAssembler::new(&sig, target.len() as u64, full_hash(&target), &fx.remote, "file.bin")
            .with_cancel(&cancel)
            .apply(&slices, &fx.local)
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(fs::read(&fx.local).unwrap(), local);
    }
}
