pub mod local;

use std::io::{self, Read};

/// Inclusive byte range of a remote resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end_inclusive: u64,
}

impl ByteRange {
    pub fn new(start: u64, end_inclusive: u64) -> Self {
        Self {
            start,
            end_inclusive,
        }
    }

    /// Range covering `len` bytes from `start`; `len` must be non-zero
    pub fn with_len(start: u64, len: u64) -> Self {
        Self::new(start, start + len - 1)
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end_inclusive - self.start + 1
    }
}

/// Readable stream handed out by a remote source
pub type RemoteStream = Box<dyn Read + Send>;

/// Remote byte source for a published release
///
/// Paths are relative to the release root and use `/` separators. Transport
/// concerns (range negotiation, retries, pooling) belong to implementations;
/// an error returned here is terminal for the file being processed.
pub trait RemoteSource: Send + Sync {
    /// Check whether a resource exists
    fn exists(&self, path: &str) -> io::Result<bool>;

    /// Open the whole resource as a stream
    fn open(&self, path: &str) -> io::Result<RemoteStream>;

    /// Open one stream per range, in range order
    fn read_ranges(&self, path: &str, ranges: &[ByteRange]) -> io::Result<Vec<RemoteStream>>;
}
