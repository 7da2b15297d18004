use crate::manifest::MANIFEST_FILE_NAME;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim().to_uppercase();

    // Try to extract number and unit
    let (num_str, unit) = if let Some(pos) = s.find(|c: char| c.is_alphabetic()) {
        (&s[..pos], &s[pos..])
    } else {
        // No unit, assume bytes
        return s.parse::<u64>().map_err(|e| format!("Invalid size: {}", e));
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|e| format!("Invalid number '{}': {}", num_str, e))?;

    let multiplier: u64 = match unit.trim() {
        "B" => 1,
        "KB" | "K" => 1024,
        "MB" | "M" => 1024 * 1024,
        "GB" | "G" => 1024 * 1024 * 1024,
        _ => return Err(format!("Unknown unit '{}'. Use B, KB, MB, or GB", unit)),
    };

    Ok((num * multiplier as f64) as u64)
}

#[derive(Parser, Debug)]
#[command(name = "patchsync")]
#[command(about = "Delta patch distribution for installed file trees", long_about = None)]
#[command(version)]
#[command(after_help = "EXAMPLES:
    # Publish a build: payload, signatures and manifest under ./publish/prod
    patchsync build ./game ./publish --channel prod

    # Preview what an update would change
    patchsync plan ./publish/prod ./installed

    # Update an installation
    patchsync install ./publish/prod ./installed

    # Machine-readable output
    patchsync install ./publish/prod ./installed --json")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (only show errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output JSON (newline-delimited JSON for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Config file (default: <config dir>/patchsync/config.toml)
    #[arg(long, global = true, env = "PATCHSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of worker threads (default: one per CPU)
    #[arg(short = 'j', long, global = true)]
    pub workers: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stage a source tree as a release: payload copies, signatures and manifest
    Build {
        /// Source tree to publish
        source: PathBuf,

        /// Publish root; the release is written to <OUTPUT>/<CHANNEL>/
        output: PathBuf,

        /// Release channel (default: from config)
        #[arg(short, long)]
        channel: Option<String>,

        /// Ship files below this size whole, without a signature (e.g. "4KB")
        #[arg(long, value_parser = parse_size)]
        small_file_threshold: Option<u64>,
    },

    /// Bring an installation up to date with a published channel
    Install {
        /// Channel directory or its manifest.json
        manifest: PathBuf,

        /// Installation directory
        target: PathBuf,

        /// Decide what would change without changing anything
        #[arg(short = 'n', long)]
        dry_run: bool,
    },

    /// Show the action install would take for every file
    Plan {
        /// Channel directory or its manifest.json
        manifest: PathBuf,

        /// Installation directory
        target: PathBuf,
    },
}

impl Cli {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == Some(0) {
            anyhow::bail!("--workers must be at least 1");
        }

        match &self.command {
            Command::Build { source, .. } => {
                if !source.is_dir() {
                    anyhow::bail!("Source directory does not exist: {}", source.display());
                }
            }
            Command::Install {
                manifest, target, ..
            }
            | Command::Plan { manifest, target } => {
                let manifest = resolve_manifest_path(manifest);
                if !manifest.is_file() {
                    anyhow::bail!("Manifest not found: {}", manifest.display());
                }
                if target.exists() && !target.is_dir() {
                    anyhow::bail!("Target is not a directory: {}", target.display());
                }
            }
        }

        Ok(())
    }

    /// Effective log level; `configured` comes from the config file
    pub fn log_level(&self, configured: &str) -> String {
        if self.quiet || self.json {
            return "error".to_string();
        }

        match self.verbose {
            0 => configured.to_string(),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    }
}

/// Accept either a channel directory or the manifest file itself
pub fn resolve_manifest_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(MANIFEST_FILE_NAME)
    } else {
        path.to_path_buf()
    }
}
