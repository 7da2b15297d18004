//! Classify each remote chunk as present in the local file or not.
//!
//! One sequential pass over the local file keeps a `chunk_size` circular
//! window and its rolling checksum. The rolling checksum filters candidates
//! through an index built from the remote signature, and the fast hash
//! confirms them.

use super::checksum::FastHasher;
use super::rolling::RollingChecksum;
use super::signature::SignatureFile;
use crate::error::{PatchError, Result};
use crate::sync::pool::CancelToken;
use std::collections::HashMap;
use std::io::{self, Read};

/// 64 KiB staging buffer for the byte-by-byte scan
const SCAN_BUFFER_SIZE: usize = 64 * 1024;

/// Where the bytes of one chunk come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceLocation {
    /// Copy from the installed local file
    Existing,
    /// Fetch from the remote resource
    Remote,
}

/// Source of one signature chunk, with the byte offset into that source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchSlice {
    pub location: SliceLocation,
    pub offset: u64,
}

impl PatchSlice {
    pub fn existing(offset: u64) -> Self {
        Self {
            location: SliceLocation::Existing,
            offset,
        }
    }

    pub fn remote(offset: u64) -> Self {
        Self {
            location: SliceLocation::Remote,
            offset,
        }
    }

    pub fn is_existing(&self) -> bool {
        self.location == SliceLocation::Existing
    }
}

/// One distinct (rolling, fast) pair and every chunk index that carries it
#[derive(Debug)]
struct MatchTarget {
    content_hash: u64,
    chunk_indices: Vec<usize>,
}

/// Candidate lookup: rolling checksum -> dense list of targets
///
/// Targets live in one arena; buckets only hold indices into it.
#[derive(Debug, Default)]
struct ChunkIndex {
    targets: Vec<MatchTarget>,
    buckets: HashMap<u32, Vec<usize>>,
}

impl ChunkIndex {
    fn build(signature: &SignatureFile) -> Self {
        let mut index = Self::default();

        for (chunk_index, chunk) in signature.chunks().iter().enumerate() {
            let bucket = index.buckets.entry(chunk.rolling_hash).or_default();

            // Identical chunks share one target so a single hit resolves all of them
            let existing = bucket
                .iter()
                .copied()
                .find(|&t| index.targets[t].content_hash == chunk.content_hash);

            match existing {
                Some(t) => index.targets[t].chunk_indices.push(chunk_index),
                None => {
                    bucket.push(index.targets.len());
                    index.targets.push(MatchTarget {
                        content_hash: chunk.content_hash,
                        chunk_indices: vec![chunk_index],
                    });
                }
            }
        }

        index
    }

    fn candidates(&self, rolling_hash: u32) -> Option<&[usize]> {
        self.buckets.get(&rolling_hash).map(Vec::as_slice)
    }
}

/// Rolling-window matcher for one local file against one remote signature
pub struct DeltaMatcher<'a> {
    signature: &'a SignatureFile,
    cancel: Option<&'a CancelToken>,
}

impl<'a> DeltaMatcher<'a> {
    pub fn new(signature: &'a SignatureFile) -> Self {
        Self {
            signature,
            cancel: None,
        }
    }

    /// Observe a cancellation signal at every chunk boundary of the scan
    pub fn with_cancel(mut self, cancel: &'a CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Produce one slice per signature chunk
    ///
    /// `local_len` must be the exact length of `local`.
    pub fn compute_slices<R: Read>(&self, local: R, local_len: u64) -> Result<Vec<PatchSlice>> {
        let chunk_size = self.signature.chunk_size() as usize;
        let chunk_count = self.signature.chunks().len();
        let aligned = |index: usize| index as u64 * chunk_size as u64;

        if local_len < chunk_size as u64 || chunk_count == 0 {
            return Ok((0..chunk_count).map(|i| PatchSlice::remote(aligned(i))).collect());
        }

        let index = ChunkIndex::build(self.signature);
        let mut slices: Vec<Option<PatchSlice>> = vec![None; chunk_count];
        let mut scanner = WindowScanner::new(local, chunk_size)?;
        let mut hasher = FastHasher::new();
        let mut since_check = 0usize;

        loop {
            let checksum = scanner.checksum();

            if let Some(candidates) = index.candidates(checksum) {
                let (older, newer) = scanner.window();
                hasher.update(older);
                hasher.update(newer);
                let content_hash = hasher.finish_reset();

                let start = scanner.position() - chunk_size as u64;

                for &target in candidates {
                    let target = &index.targets[target];
                    if target.content_hash != content_hash {
                        continue;
                    }

                    for &chunk_index in &target.chunk_indices {
                        let slot = &mut slices[chunk_index];
                        // Aligned matches always win; otherwise first found wins
                        if slot.is_none() || start == aligned(chunk_index) {
                            *slot = Some(PatchSlice::existing(start));
                        }
                    }
                }
            }

            since_check += 1;
            if since_check >= chunk_size {
                since_check = 0;
                self.check_cancelled()?;
            }

            if !scanner.advance()? {
                break;
            }
        }

        if scanner.position() != local_len {
            return Err(PatchError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "local file length changed during scan: expected {}, read {}",
                    local_len,
                    scanner.position()
                ),
            )));
        }

        let slices: Vec<PatchSlice> = slices
            .into_iter()
            .enumerate()
            .map(|(i, slot)| slot.unwrap_or_else(|| PatchSlice::remote(aligned(i))))
            .collect();

        tracing::trace!(
            "Matched {}/{} chunks locally",
            slices.iter().filter(|s| s.is_existing()).count(),
            chunk_count
        );

        Ok(slices)
    }

    fn check_cancelled(&self) -> Result<()> {
        match self.cancel {
            Some(cancel) if cancel.is_cancelled() => Err(PatchError::Cancelled),
            _ => Ok(()),
        }
    }
}

/// Circular `window`-byte buffer over a stream with an O(1) rolling checksum
struct WindowScanner<R> {
    reader: R,
    window: Vec<u8>,
    /// Index of the oldest byte in `window`
    head: usize,
    checksum: u32,
    position: u64,
    staging: Vec<u8>,
    staged: usize,
    staged_pos: usize,
}

impl<R: Read> WindowScanner<R> {
    fn new(mut reader: R, window: usize) -> Result<Self> {
        let mut buffer = vec![0u8; window];
        reader.read_exact(&mut buffer)?;
        let checksum = RollingChecksum::compute(&buffer);

        Ok(Self {
            reader,
            window: buffer,
            head: 0,
            checksum,
            position: window as u64,
            staging: vec![0u8; SCAN_BUFFER_SIZE],
            staged: 0,
            staged_pos: 0,
        })
    }

    fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Stream offset just past the window
    fn position(&self) -> u64 {
        self.position
    }

    /// Window contents in stream order, split at the wrap point
    fn window(&self) -> (&[u8], &[u8]) {
        (&self.window[self.head..], &self.window[..self.head])
    }

    /// Slide by one byte; false at end of stream
    fn advance(&mut self) -> Result<bool> {
        let Some(added) = self.next_byte()? else {
            return Ok(false);
        };

        let removed = self.window[self.head];
        self.checksum = RollingChecksum::rotate(self.checksum, removed, added, self.window.len());
        self.window[self.head] = added;
        self.head += 1;
        if self.head == self.window.len() {
            self.head = 0;
        }
        self.position += 1;

        Ok(true)
    }

    fn next_byte(&mut self) -> Result<Option<u8>> {
        if self.staged_pos == self.staged {
            self.staged = loop {
                match self.reader.read(&mut self.staging) {
                    Ok(n) => break n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            };
            self.staged_pos = 0;
            if self.staged == 0 {
                return Ok(None);
            }
        }

        let byte = self.staging[self.staged_pos];
        self.staged_pos += 1;
        Ok(Some(byte))
    }
}
