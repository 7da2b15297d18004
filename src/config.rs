use crate::error::{PatchError, Result};
use crate::sync::build::DEFAULT_SMALL_FILE_THRESHOLD;
use crate::sync::pool::default_workers;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings read from `config.toml`; every key is optional
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Log level used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Worker pool size; 0 means one worker per CPU
    #[serde(default)]
    pub workers: usize,

    /// Channel used by `build` when none is given
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Files below this many bytes are shipped whole
    #[serde(default = "default_small_file_threshold")]
    pub small_file_threshold: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel() -> String {
    "default".to_string()
}

fn default_small_file_threshold() -> u64 {
    DEFAULT_SMALL_FILE_THRESHOLD
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            workers: 0,
            channel: default_channel(),
            small_file_threshold: default_small_file_threshold(),
        }
    }
}

impl Config {
    /// `<config dir>/patchsync/config.toml`
    pub fn config_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("patchsync").join("config.toml"))
            .ok_or_else(|| PatchError::Config("could not determine config directory".to_string()))
    }

    /// Load from `path`, or from the default location when `None`
    ///
    /// A missing file at the default location yields the defaults; an
    /// explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::config_path() {
                Ok(p) => (p, false),
                Err(_) => return Ok(Self::default()),
            },
        };

        if !explicit && !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&path).map_err(|e| {
            PatchError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&contents)
            .map_err(|e| PatchError::Config(format!("{}: {}", path.display(), e)))?;

        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Worker count to use, resolving 0 to the CPU count
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            default_workers()
        } else {
            self.workers
        }
    }
}
