//! Content digests: the fast xxh3 hash and the SHA-256 full hash.
//!
//! The two are never interchangeable. The fast hash confirms rolling checksum
//! candidates and fingerprints whole files; the full hash is the integrity check
//! that gates every commit of a patched file.

use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read};
use std::str::FromStr;
use xxhash_rust::xxh3::Xxh3;

/// 256 KiB read buffer for whole-file hashing
const HASH_BUFFER_SIZE: usize = 256 * 1024;

/// Streaming 64-bit fast hash (xxh3, seed 0)
pub struct FastHasher {
    inner: Xxh3,
}

impl FastHasher {
    pub fn new() -> Self {
        Self { inner: Xxh3::new() }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn digest(&self) -> u64 {
        self.inner.digest()
    }

    /// Digest and reset in one step, for per-chunk reuse of a single hasher
    pub fn finish_reset(&mut self) -> u64 {
        let hash = self.inner.digest();
        self.inner.reset();
        hash
    }

    /// One-shot hash of a block
    pub fn hash(data: &[u8]) -> u64 {
        xxhash_rust::xxh3::xxh3_64(data)
    }
}

impl Default for FastHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Manifest text form of a fast hash (decimal)
pub fn fast_hash_to_string(hash: u64) -> String {
    hash.to_string()
}

/// SHA-256 digest of a complete file
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FullHash([u8; 32]);

impl FullHash {
    /// Uppercase hex, the form stored in manifests
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// Compare against a manifest hash string (case-insensitive hex)
    pub fn matches_hex(&self, hex_str: &str) -> bool {
        hex_str.parse::<FullHash>().map(|h| h == *self).unwrap_or(false)
    }
}

impl FromStr for FullHash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for FullHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for FullHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FullHash({})", self.to_hex())
    }
}

/// Incremental SHA-256 over a file assembled block by block
pub struct FullHasher {
    inner: Sha256,
}

impl FullHasher {
    pub fn new() -> Self {
        Self { inner: Sha256::new() }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(self) -> FullHash {
        FullHash(self.inner.finalize().into())
    }
}

impl Default for FullHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Fast hash of an entire stream
pub fn fast_hash_reader<R: Read>(mut reader: R) -> io::Result<u64> {
    let mut hasher = FastHasher::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.digest())
}

/// Full hash of an entire stream
pub fn full_hash_reader<R: Read>(mut reader: R) -> io::Result<FullHash> {
    let mut hasher = FullHasher::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize())
}
