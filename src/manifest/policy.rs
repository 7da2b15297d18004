use super::{ManifestFileCommand, ManifestFileEntry};
use crate::delta::checksum::FullHash;
use crate::error::Result;
use crate::fs_util;
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::PathBuf;

/// What an install has to do for one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    None,
    /// Local file is missing; download it whole
    Create,
    FullUpdate,
    DeltaUpdate,
    Delete,
}

impl FileAction {
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Create => "create",
            Self::FullUpdate => "full_update",
            Self::DeltaUpdate => "delta_update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for FileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observations of one local file, computed only when asked for
#[allow(clippy::len_without_is_empty)]
pub trait LocalProbe {
    fn exists(&mut self) -> io::Result<bool>;
    fn len(&mut self) -> io::Result<u64>;
    fn fast_hash(&mut self) -> io::Result<u64>;
    fn full_hash(&mut self) -> io::Result<FullHash>;
}

/// Probe over a real file, caching each observation
#[derive(Debug)]
pub struct FsProbe {
    path: PathBuf,
    len: Option<Option<u64>>,
    fast: Option<u64>,
    full: Option<FullHash>,
}

impl FsProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            len: None,
            fast: None,
            full: None,
        }
    }

    fn stat(&mut self) -> io::Result<Option<u64>> {
        if let Some(len) = self.len {
            return Ok(len);
        }

        let len = match std::fs::metadata(&self.path) {
            Ok(meta) if meta.is_file() => Some(meta.len()),
            Ok(_) => None,
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };
        self.len = Some(len);
        Ok(len)
    }
}

impl LocalProbe for FsProbe {
    fn exists(&mut self) -> io::Result<bool> {
        Ok(self.stat()?.is_some())
    }

    fn len(&mut self) -> io::Result<u64> {
        self.stat()?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} does not exist", self.path.display()),
            )
        })
    }

    fn fast_hash(&mut self) -> io::Result<u64> {
        if let Some(hash) = self.fast {
            return Ok(hash);
        }
        let hash = fs_util::fast_hash_file(&self.path)?;
        self.fast = Some(hash);
        Ok(hash)
    }

    fn full_hash(&mut self) -> io::Result<FullHash> {
        if let Some(hash) = self.full {
            return Ok(hash);
        }
        let hash = fs_util::full_hash_file(&self.path)?;
        self.full = Some(hash);
        Ok(hash)
    }
}

/// Decide the action for one manifest entry against the local file
///
/// | command                  | missing | present                                   |
/// |--------------------------|---------|-------------------------------------------|
/// | AlwaysFullUpdate         | create  | full update                               |
/// | UpdateIfMissing          | create  | none                                      |
/// | NeverUpdate              | create  | none                                      |
/// | Delete                   | none    | delete                                    |
/// | DeltaUpdate              | create  | delta update unless the fast hash matches |
/// | UpdateIfFullHashMismatch | create  | full update unless size and hash match    |
///
/// A present file whose entry records no `hash` cannot be verified, so the
/// two hash-driven commands replace it outright.
pub fn decide(entry: &ManifestFileEntry, probe: &mut impl LocalProbe) -> Result<FileAction> {
    use ManifestFileCommand::*;

    if !probe.exists()? {
        return Ok(match entry.command {
            Delete => FileAction::None,
            _ => FileAction::Create,
        });
    }

    let action = match entry.command {
        UpdateIfMissing | NeverUpdate => FileAction::None,
        Delete => FileAction::Delete,
        AlwaysFullUpdate => FileAction::FullUpdate,
        DeltaUpdate | UpdateIfFullHashMismatch if entry.hash.is_none() => FileAction::FullUpdate,
        DeltaUpdate => match entry.fast_hash_value()? {
            Some(expected) if probe.len()? == entry.file_size && probe.fast_hash()? == expected => {
                FileAction::None
            }
            _ => FileAction::DeltaUpdate,
        },
        UpdateIfFullHashMismatch => {
            let expected = entry.full_hash()?;
            if probe.len()? != entry.file_size || expected != Some(probe.full_hash()?) {
                FileAction::FullUpdate
            } else {
                FileAction::None
            }
        }
    };

    Ok(action)
}
