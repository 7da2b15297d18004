use super::{ByteRange, RemoteSource, RemoteStream};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

/// A release directory on a local or mounted filesystem acting as the remote
///
/// This is what `patchsync build` produces: payload files next to their
/// `.sig` signatures, one directory per release date.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a release-relative path, refusing anything that escapes the root
    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));

        if escapes || path.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid release path: {}", path),
            ));
        }

        Ok(self.root.join(relative))
    }
}

impl RemoteSource for DirectorySource {
    fn exists(&self, path: &str) -> io::Result<bool> {
        Ok(self.resolve(path)?.is_file())
    }

    fn open(&self, path: &str) -> io::Result<RemoteStream> {
        let file = File::open(self.resolve(path)?)?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn read_ranges(&self, path: &str, ranges: &[ByteRange]) -> io::Result<Vec<RemoteStream>> {
        let full_path = self.resolve(path)?;
        let len = std::fs::metadata(&full_path)?.len();

        ranges
            .iter()
            .map(|range| {
                if range.end_inclusive >= len {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "range {}-{} is past the end of {} ({} bytes)",
                            range.start, range.end_inclusive, path, len
                        ),
                    ));
                }

                let mut file = File::open(&full_path)?;
                file.seek(SeekFrom::Start(range.start))?;
                let stream: RemoteStream = Box::new(BufReader::new(file).take(range.len()));
                Ok(stream)
            })
            .collect()
    }
}
