//! Signature files: per-chunk (rolling checksum, fast hash) records.
//!
//! # Format
//! - One 12-byte record per full chunk: `u32 LE` rolling checksum, `u64 LE` fast hash
//! - Followed by the raw bytes of the trailing partial chunk, if the file size
//!   is not a multiple of the chunk size
//!
//! The format is not self-describing. Decoding needs the original file size
//! and chunk size, both of which come from the manifest.

use super::checksum::{FastHasher, FullHash, FullHasher};
use super::rolling::RollingChecksum;
use crate::error::{PatchError, Result};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Encoded size of one chunk record
pub const RECORD_SIZE: usize = 12;

/// Lower bound of the default chunk size
pub const MIN_DEFAULT_CHUNK_SIZE: u32 = 704;

/// Upper bound of the default chunk size
pub const MAX_DEFAULT_CHUNK_SIZE: u32 = 65528;

/// Round up to the next multiple of 8
pub fn round_up8(x: u64) -> u64 {
    (x + 7) & !7
}

/// Default chunk size: roundUp8(sqrt(size)) clamped to [704, 65528]
pub fn default_chunk_size(file_size: u64) -> u32 {
    let root = (file_size as f64).sqrt() as u64;
    round_up8(root).clamp(MIN_DEFAULT_CHUNK_SIZE as u64, MAX_DEFAULT_CHUNK_SIZE as u64) as u32
}

/// Chunk size actually used for a file: 0 selects the default, anything
/// else is rounded up to a multiple of 8
pub fn resolve_chunk_size(file_size: u64, requested: u32) -> u32 {
    if requested == 0 {
        default_chunk_size(file_size)
    } else {
        round_up8(requested as u64).min(u32::MAX as u64 & !7) as u32
    }
}

/// Weak and fast digests of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignatureChunk {
    pub rolling_hash: u32,
    pub content_hash: u64,
}

impl SignatureChunk {
    pub fn compute(block: &[u8]) -> Self {
        Self {
            rolling_hash: RollingChecksum::compute(block),
            content_hash: FastHasher::hash(block),
        }
    }

    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut record = [0u8; RECORD_SIZE];
        record[..4].copy_from_slice(&self.rolling_hash.to_le_bytes());
        record[4..].copy_from_slice(&self.content_hash.to_le_bytes());
        record
    }

    pub fn decode(record: &[u8; RECORD_SIZE]) -> Self {
        let mut rolling = [0u8; 4];
        let mut content = [0u8; 8];
        rolling.copy_from_slice(&record[..4]);
        content.copy_from_slice(&record[4..]);
        Self {
            rolling_hash: u32::from_le_bytes(rolling),
            content_hash: u64::from_le_bytes(content),
        }
    }
}

/// Decoded signature of one file version. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureFile {
    chunk_size: u32,
    chunks: Vec<SignatureChunk>,
    remainder: Vec<u8>,
}

impl SignatureFile {
    pub fn new(chunk_size: u32, chunks: Vec<SignatureChunk>, remainder: Vec<u8>) -> Self {
        Self {
            chunk_size,
            chunks,
            remainder,
        }
    }

    /// Compute a signature directly from in-memory content
    pub fn from_bytes(data: &[u8], chunk_size: u32) -> Self {
        let size = chunk_size.max(1) as usize;
        let full = data.len() / size * size;

        let chunks = data[..full].chunks_exact(size).map(SignatureChunk::compute).collect();

        Self {
            chunk_size: size as u32,
            chunks,
            remainder: data[full..].to_vec(),
        }
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn chunks(&self) -> &[SignatureChunk] {
        &self.chunks
    }

    pub fn remainder(&self) -> &[u8] {
        &self.remainder
    }

    /// Size of the file this signature describes
    pub fn file_size(&self) -> u64 {
        self.chunks.len() as u64 * self.chunk_size as u64 + self.remainder.len() as u64
    }

    /// Decode a signature stream
    ///
    /// Reads exactly `file_size / chunk_size` records and then
    /// `file_size % chunk_size` raw remainder bytes. Any short read, or data
    /// left over afterwards, means the signature does not belong to a file of
    /// this size.
    pub fn load<R: Read>(mut reader: R, file_size: u64, chunk_size: u32) -> io::Result<Self> {
        if chunk_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "chunk size must be non-zero"));
        }

        let chunk_count = file_size / chunk_size as u64;
        let last_chunk_size = (file_size % chunk_size as u64) as usize;

        // Cap the up-front allocation; a bogus file size should fail on read, not on alloc
        let mut chunks = Vec::with_capacity(chunk_count.min(1 << 20) as usize);
        let mut record = [0u8; RECORD_SIZE];

        for index in 0..chunk_count {
            reader.read_exact(&mut record).map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("record {} of {} is truncated", index, chunk_count),
                )
            })?;
            chunks.push(SignatureChunk::decode(&record));
        }

        let mut remainder = vec![0u8; last_chunk_size];
        reader.read_exact(&mut remainder).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("remainder of {} bytes is truncated", last_chunk_size),
            )
        })?;

        let mut probe = [0u8; 1];
        if reader.read(&mut probe)? != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "trailing data after the last record",
            ));
        }

        Ok(Self {
            chunk_size,
            chunks,
            remainder,
        })
    }

    /// Open and decode a signature file from disk
    pub fn open(path: &Path, file_size: u64, chunk_size: u32) -> Result<Self> {
        let file = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => PatchError::MissingSignature {
                path: path.with_extension(""),
            },
            _ => PatchError::Io(e),
        })?;

        Self::load(BufReader::new(file), file_size, chunk_size).map_err(|e| {
            PatchError::CorruptSignature {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })
    }

    /// Encode this signature into the on-disk format
    pub fn write_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        for chunk in &self.chunks {
            writer.write_all(&chunk.encode())?;
        }
        writer.write_all(&self.remainder)?;
        writer.flush()
    }
}

/// Result of a signature build: the whole-file digests recorded in the manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureSummary {
    pub file_size: u64,
    pub chunk_size: u32,
    pub chunk_count: u64,
    pub fast_hash: u64,
    pub full_hash: FullHash,
}

/// Streams a source file into a signature
///
/// Each full chunk is checksummed into a record; every byte also feeds the
/// whole-file fast and full hashes so one pass over the source yields
/// everything the manifest needs.
#[derive(Debug, Clone, Default)]
pub struct SignatureBuilder {
    chunk_size: u32,
    source: Option<PathBuf>,
}

impl SignatureBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requested chunk size; 0 selects the default for the file size
    pub fn chunk_size(mut self, chunk_size: u32) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Source path, used in error reports
    pub fn source(mut self, path: impl Into<PathBuf>) -> Self {
        self.source = Some(path.into());
        self
    }

    /// Build a signature for `file_size` bytes of `reader`, writing it to `writer`
    pub fn build<R: Read, W: Write>(
        &self,
        mut reader: R,
        file_size: u64,
        mut writer: W,
    ) -> Result<SignatureSummary> {
        let chunk_size = resolve_chunk_size(file_size, self.chunk_size);
        let chunk_count = file_size / chunk_size as u64;
        let last_chunk_size = (file_size % chunk_size as u64) as usize;

        let mut chunk = vec![0u8; chunk_size as usize];
        let mut file_fast = FastHasher::new();
        let mut file_full = FullHasher::new();
        let mut consumed = 0u64;

        for _ in 0..chunk_count {
            let n = read_full(&mut reader, &mut chunk)?;
            consumed += n as u64;
            if n != chunk.len() {
                return Err(self.truncated(file_size, consumed));
            }

            writer.write_all(&SignatureChunk::compute(&chunk).encode())?;
            file_fast.update(&chunk);
            file_full.update(&chunk);
        }

        if last_chunk_size > 0 {
            let tail = &mut chunk[..last_chunk_size];
            let n = read_full(&mut reader, tail)?;
            consumed += n as u64;
            if n != last_chunk_size {
                return Err(self.truncated(file_size, consumed));
            }

            writer.write_all(tail)?;
            file_fast.update(tail);
            file_full.update(tail);
        }

        writer.flush()?;

        Ok(SignatureSummary {
            file_size,
            chunk_size,
            chunk_count,
            fast_hash: file_fast.digest(),
            full_hash: file_full.finalize(),
        })
    }

    /// Build the signature of `source` into `signature_path`
    pub fn build_file(&self, source: &Path, signature_path: &Path) -> Result<SignatureSummary> {
        let file = File::open(source)?;
        let file_size = file.metadata()?.len();

        if let Some(parent) = signature_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let output = BufWriter::new(File::create(signature_path)?);

        let builder = Self {
            chunk_size: self.chunk_size,
            source: Some(source.to_path_buf()),
        };
        let summary = builder.build(BufReader::new(file), file_size, output)?;

        tracing::debug!(
            "Signature for {}: {} chunks of {} bytes",
            source.display(),
            summary.chunk_count,
            summary.chunk_size
        );

        Ok(summary)
    }

    fn truncated(&self, expected: u64, actual: u64) -> PatchError {
        PatchError::SourceTruncated {
            path: self.source.clone().unwrap_or_default(),
            expected,
            actual,
        }
    }
}

/// Read until `buf` is full or the stream ends; returns the bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
