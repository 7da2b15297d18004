use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use patchsync::cli::{resolve_manifest_path, Cli, Command};
use patchsync::config::Config;
use patchsync::error::format_bytes;
use patchsync::manifest::policy::FileAction;
use patchsync::manifest::PatchManifest;
use patchsync::sync::output::PatchEvent;
use patchsync::sync::{
    BuildOptions, BuildPipeline, BuildReport, CancelToken, FileFailure, InstallReport, Installer,
    WorkerPool,
};
use patchsync::transport::local::DirectorySource;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level(&config.log_level)));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    cli.validate()?;

    let cancel = CancelToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; finishing files already in progress");
            interrupt.cancel();
        }
    });

    let workers = cli.workers.unwrap_or_else(|| config.effective_workers());
    let human = !cli.quiet && !cli.json;

    let success = match &cli.command {
        Command::Build {
            source,
            output,
            channel,
            small_file_threshold,
        } => {
            let options = BuildOptions::new(
                channel.clone().unwrap_or_else(|| config.channel.clone()),
                output.clone(),
            )
            .small_file_threshold(small_file_threshold.unwrap_or(config.small_file_threshold));

            if human {
                println!("patchsync v{}", env!("CARGO_PKG_VERSION"));
                println!(
                    "Building {} → {}/{}\n",
                    source.display(),
                    output.display(),
                    options.channel
                );
            }

            let source = source.clone();
            let cancel = cancel.clone();
            let report = tokio::task::spawn_blocking(move || {
                let pool = WorkerPool::new(workers)?;
                BuildPipeline::new(&source, options, &pool, &cancel).run()
            })
            .await
            .context("build task panicked")??;

            print_build_report(&cli, &report);
            report.is_success()
        }

        Command::Install {
            manifest,
            target,
            dry_run,
        } => run_install(&cli, manifest, target, *dry_run, workers, &cancel).await?,

        Command::Plan { manifest, target } => {
            run_install(&cli, manifest, target, true, workers, &cancel).await?
        }
    };

    if !success {
        std::process::exit(1);
    }

    Ok(())
}

async fn run_install(
    cli: &Cli,
    manifest: &Path,
    target: &Path,
    dry_run: bool,
    workers: usize,
    cancel: &CancelToken,
) -> Result<bool> {
    let manifest_path = resolve_manifest_path(manifest);
    let manifest = PatchManifest::load(&manifest_path)?;
    let release_root = manifest_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(manifest.release_dir_name());

    let human = !cli.quiet && !cli.json;
    if human {
        println!("patchsync v{}", env!("CARGO_PKG_VERSION"));
        println!(
            "Updating {} to {} ({}, {})",
            target.display(),
            manifest.channel,
            manifest.version,
            manifest.release_dir_name()
        );
        if dry_run {
            println!("Mode: Dry-run (no changes will be made)");
        }
        println!();
    }
    if cli.json {
        PatchEvent::Start {
            operation: if dry_run { "plan" } else { "install" }.to_string(),
            root: target.to_path_buf(),
            channel: manifest.channel.clone(),
            total_files: manifest.files.len(),
        }
        .emit();
    }

    let progress = if human && !dry_run {
        let pb = ProgressBar::new(0);
        if let Ok(style) =
            ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    } else {
        ProgressBar::hidden()
    };

    let target = target.to_path_buf();
    let cancel = cancel.clone();
    let bar = progress.clone();
    let report = tokio::task::spawn_blocking(move || {
        let pool = WorkerPool::new(workers)?;
        let remote = DirectorySource::new(release_root);
        Installer::new(&manifest, &remote, &target, &pool, &cancel)
            .dry_run(dry_run)
            .progress(bar)
            .run()
    })
    .await
    .context("install task panicked")??;

    progress.finish_and_clear();
    print_install_report(cli, &report);

    Ok(report.is_success())
}

fn print_build_report(cli: &Cli, report: &BuildReport) {
    if cli.json {
        PatchEvent::Start {
            operation: "build".to_string(),
            root: report.release_dir.clone(),
            channel: report.manifest.channel.clone(),
            total_files: report.manifest.files.len() + report.failures.len(),
        }
        .emit();
        for entry in &report.manifest.files {
            PatchEvent::File {
                path: entry.file_path.clone(),
                action: FileAction::Create,
                outcome: entry.command.to_string(),
                local_bytes: 0,
                remote_bytes: entry.file_size,
            }
            .emit();
        }
        emit_failures(&report.failures);
        PatchEvent::Summary {
            files_total: report.manifest.files.len() + report.failures.len(),
            files_changed: report.manifest.files.len(),
            files_unchanged: 0,
            files_failed: report.failures.len(),
            bytes_local: 0,
            bytes_remote: report.bytes,
            duration_secs: report.duration.as_secs_f64(),
            cancelled: report.cancelled,
        }
        .emit();
        return;
    }

    print_failures(&report.failures);
    if cli.quiet {
        return;
    }

    if report.is_success() {
        println!("\n{}\n", "✓ Build complete".green().bold());
    } else if report.cancelled {
        println!("\n{}\n", "✗ Build cancelled (manifest not written)".yellow().bold());
    } else {
        println!("\n{}\n", "✗ Build failed (manifest not written)".red().bold());
    }

    println!("  Files:             {}", report.manifest.files.len().to_string().blue());
    println!("  Signatures:        {}", report.signatures.to_string().blue());
    println!("  Payload:           {}", format_bytes(report.bytes).cyan());
    println!("  Release:           {}", report.release_dir.display());
    if report.manifest_written {
        println!("  Manifest:          {}", report.manifest_path.display());
    }
    println!("  Duration:          {}", format_duration(report.duration).cyan());
}

fn print_install_report(cli: &Cli, report: &InstallReport) {
    if cli.json {
        for file in &report.files {
            PatchEvent::File {
                path: file.path.clone(),
                action: file.action,
                outcome: file.outcome.as_str().to_string(),
                local_bytes: file.outcome.local_bytes(),
                remote_bytes: file.outcome.remote_bytes(),
            }
            .emit();
        }
        emit_failures(&report.failures);
        PatchEvent::Summary {
            files_total: report.files.len() + report.failures.len(),
            files_changed: report.files_changed(),
            files_unchanged: report.files_unchanged(),
            files_failed: report.failures.len(),
            bytes_local: report.bytes_local(),
            bytes_remote: report.bytes_remote(),
            duration_secs: report.duration.as_secs_f64(),
            cancelled: report.cancelled,
        }
        .emit();
        return;
    }

    print_failures(&report.failures);
    if cli.quiet {
        return;
    }

    if report.dry_run {
        for file in report.files.iter().filter(|f| !f.action.is_noop()) {
            let action = format!("{:<13}", file.action.as_str());
            let action = match file.action {
                FileAction::Delete => action.red(),
                FileAction::DeltaUpdate => action.bright_magenta(),
                _ => action.yellow(),
            };
            println!("  {} {}", action, file.path);
        }
        println!("\n{}\n", "✓ Dry-run complete (no changes made)".green().bold());
        println!("  Would change:      {}", report.files.iter().filter(|f| !f.action.is_noop()).count().to_string().yellow());
        println!("  Up to date:        {}", report.files_unchanged().to_string().bright_black());
        return;
    }

    if report.is_success() {
        println!("\n{}\n", "✓ Install complete".green().bold());
    } else if report.cancelled {
        println!("\n{}\n", "✗ Install cancelled".yellow().bold());
    } else {
        println!("\n{}\n", "✗ Install finished with errors".red().bold());
    }

    let changed = report.files_changed();
    if changed > 0 {
        println!("  Files changed:     {}", changed.to_string().green());
    } else {
        println!("  Files changed:     {}", changed.to_string().bright_black());
    }
    println!("  Up to date:        {}", report.files_unchanged().to_string().bright_black());
    if !report.failures.is_empty() {
        println!("  Failed:            {}", report.failures.len().to_string().red());
    }

    println!();
    println!("  Downloaded:        {}", format_bytes(report.bytes_remote()).cyan());
    if report.bytes_local() > 0 {
        println!(
            "  {}       {} reused from local files",
            "Delta sync:".bright_magenta(),
            format_bytes(report.bytes_local()).bright_magenta()
        );
    }
    println!("  Duration:          {}", format_duration(report.duration).cyan());
}

fn emit_failures(failures: &[FileFailure]) {
    for failure in failures {
        PatchEvent::Error {
            path: failure.path.clone(),
            category: failure.category,
            error: failure.message.clone(),
        }
        .emit();
    }
}

fn print_failures(failures: &[FileFailure]) {
    for failure in failures {
        eprintln!(
            "{} {} [{}]\n  {}",
            "error:".red().bold(),
            failure.path,
            failure.category,
            failure.message.replace('\n', "\n  ")
        );
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();

    if secs >= 60 {
        let mins = secs / 60;
        let secs = secs % 60;
        if mins >= 60 {
            let hours = mins / 60;
            let mins = mins % 60;
            format!("{}h {}m {}s", hours, mins, secs)
        } else {
            format!("{}m {}s", mins, secs)
        }
    } else if secs > 0 {
        format!("{}.{:03}s", secs, millis)
    } else {
        format!("{}ms", millis)
    }
}
