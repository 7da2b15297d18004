use crate::delta::checksum::{fast_hash_reader, full_hash_reader, FullHash};
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::Path;
use tempfile::TempDir;

const SCRATCH_PREFIX: &str = ".patchsync-";

/// Create a scratch directory for assembling a replacement of `target`
///
/// The directory sits next to `target` so the final rename stays on one
/// volume. It is removed when the returned guard drops, on success and
/// failure alike.
pub fn scratch_dir_for(target: &Path) -> io::Result<TempDir> {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    tempfile::Builder::new().prefix(SCRATCH_PREFIX).tempdir_in(parent)
}

/// Whether a path is a scratch directory left behind by an interrupted run
pub fn is_scratch_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(SCRATCH_PREFIX))
        .unwrap_or(false)
}

/// Atomically replace `target` with `replacement`
pub fn replace_file(replacement: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        if parent.exists() && !same_filesystem(replacement, parent) {
            tracing::warn!(
                "Replacement for {} is on a different filesystem; rename may not be atomic",
                target.display()
            );
        }
    }

    fs::rename(replacement, target)
}

/// Fast hash of a whole file
pub fn fast_hash_file(path: &Path) -> io::Result<u64> {
    fast_hash_reader(BufReader::new(File::open(path)?))
}

/// Full hash of a whole file
pub fn full_hash_file(path: &Path) -> io::Result<FullHash> {
    full_hash_reader(BufReader::new(File::open(path)?))
}

/// Check if two paths are on the same filesystem
#[cfg(unix)]
pub fn same_filesystem(path1: &Path, path2: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    let meta1 = match fs::metadata(path1) {
        Ok(m) => m,
        Err(_) => return false,
    };
    let meta2 = match fs::metadata(path2) {
        Ok(m) => m,
        Err(_) => return false,
    };

    meta1.dev() == meta2.dev()
}

#[cfg(not(unix))]
pub fn same_filesystem(_path1: &Path, _path2: &Path) -> bool {
    // No cheap device id; scratch dirs are created beside the target anyway
    true
}
