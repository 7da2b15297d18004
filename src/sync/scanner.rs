use crate::error::{PatchError, Result};
use crate::fs_util;
use crate::manifest::{MANIFEST_FILE_NAME, SIGNATURE_EXTENSION};
use ignore::WalkBuilder;
use std::path::{Component, Path, PathBuf};

/// One payload file found in a source tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Path relative to the scan root, `/`-separated
    pub relative_path: String,
    pub size: u64,
}

pub struct Scanner {
    root: PathBuf,
}

impl Scanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Collect every regular file under the root
    ///
    /// Signatures, manifests and scratch directories from earlier runs are
    /// skipped, as is anything excluded by `.gitignore` / `.ignore` files.
    pub fn scan(&self) -> Result<Vec<SourceFile>> {
        let mut files = Vec::new();

        let walker = WalkBuilder::new(&self.root)
            .hidden(false)
            .git_ignore(true)
            .git_global(false)
            .git_exclude(true)
            .filter_entry(|entry| {
                entry.file_name() != ".git" && !fs_util::is_scratch_path(entry.path())
            })
            .build();

        for result in walker {
            let entry = result.map_err(|e| PatchError::Io(std::io::Error::other(e.to_string())))?;

            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }

            let path = entry.path().to_path_buf();
            if is_release_artifact(&path) {
                continue;
            }

            let metadata = entry
                .metadata()
                .map_err(|e| PatchError::Io(std::io::Error::other(e.to_string())))?;

            let relative_path = relative_key(&self.root, &path)?;

            files.push(SourceFile {
                path,
                relative_path,
                size: metadata.len(),
            });
        }

        tracing::debug!("Scanned {}: {} files", self.root.display(), files.len());
        Ok(files)
    }
}

fn is_release_artifact(path: &Path) -> bool {
    let is_signature = path
        .extension()
        .is_some_and(|ext| ext == SIGNATURE_EXTENSION);
    let is_manifest = path.file_name().is_some_and(|name| name == MANIFEST_FILE_NAME);
    is_signature || is_manifest
}

/// Manifest key for `path`: relative to `root`, components joined by `/`
fn relative_key(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| {
        PatchError::InvalidManifest(format!("{} is outside {}", path.display(), root.display()))
    })?;

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(part) => parts.push(part),
                None => {
                    return Err(PatchError::InvalidManifest(format!(
                        "{} is not valid UTF-8",
                        path.display()
                    )))
                }
            },
            _ => {
                return Err(PatchError::InvalidManifest(format!(
                    "unexpected path component in {}",
                    path.display()
                )))
            }
        }
    }

    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn relative_paths(files: &[SourceFile]) -> Vec<&str> {
        let mut paths: Vec<_> = files.iter().map(|f| f.relative_path.as_str()).collect();
        paths.sort();
        paths
    }

    #[test]
    fn test_scanner_basic() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();

        fs::create_dir_all(root.join("dir1/nested")).unwrap();
        fs::write(root.join("file1.txt"), "content").unwrap();
        fs::write(root.join("dir1/nested/file2.txt"), "more content").unwrap();

        let files = Scanner::new(root).scan().unwrap();

        assert_eq!(relative_paths(&files), vec!["dir1/nested/file2.txt", "file1.txt"]);
        let nested = files
            .iter()
            .find(|f| f.relative_path == "dir1/nested/file2.txt")
            .unwrap();
        assert_eq!(nested.size, 12);
    }

    #[test]
    fn test_scanner_skips_release_artifacts() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();

        fs::write(root.join("game.bin"), "payload").unwrap();
        fs::write(root.join("game.bin.sig"), "signature").unwrap();
        fs::write(root.join(MANIFEST_FILE_NAME), "{}").unwrap();
        fs::create_dir(root.join(".patchsync-abc123")).unwrap();
        fs::write(root.join(".patchsync-abc123/assembly.part"), "partial").unwrap();

        let files = Scanner::new(root).scan().unwrap();
        assert_eq!(relative_paths(&files), vec!["game.bin"]);
    }

    #[test]
    fn test_scanner_respects_ignore_file() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();

        fs::write(root.join(".ignore"), "*.log\n").unwrap();
        fs::write(root.join("debug.log"), "noise").unwrap();
        fs::write(root.join("included.txt"), "should be included").unwrap();

        let files = Scanner::new(root).scan().unwrap();
        let paths = relative_paths(&files);

        assert!(!paths.contains(&"debug.log"));
        assert!(paths.contains(&"included.txt"));
    }
}
