//! hyperv-backup - command-line front end.
//!
//! Backs up the requested virtual machines described by a host catalog and
//! reports progress on the console. Ctrl+C cancels at the next checkpoint.

mod console;
mod logger;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use console::{format_elapsed, ConsoleObserver};
use hyperv_backup_engine::snapshot::catalog::Catalog;
use hyperv_backup_engine::{BackupManager, BackupOptions, KeyKind, OutputMode};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

const EXIT_ERROR: u8 = 2;
const EXIT_CANCELLED: u8 = 3;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Text file listing the VMs to back up, one per line
    #[arg(short, long, value_name = "FILE", conflicts_with = "list")]
    file: Option<PathBuf>,

    /// Comma separated list of VMs to back up (default: all)
    #[arg(short, long, value_delimiter = ',')]
    list: Vec<String>,

    /// VMs are given by id instead of display name
    #[arg(short, long)]
    guid: bool,

    /// Host catalog describing VMs and their volume snapshots (JSON)
    #[arg(long, value_name = "FILE")]
    catalog: PathBuf,

    /// Backup output folder (must exist)
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Protect archives with a password (AES-256; not for direct copy)
    #[arg(short, long)]
    password: Option<String>,

    /// Output name template: {name}, {id}, {timestamp[:format]}, {ext}
    #[arg(long, value_name = "TEMPLATE")]
    name_template: Option<String>,

    /// Take one snapshot set for all VMs
    #[arg(short, long)]
    single_snapshot: bool,

    /// 0 (none) to 9 (max), -1 for the format default
    #[arg(long, allow_negative_numbers = true, value_parser = clap::value_parser!(i32).range(-1..=9))]
    compression_level: Option<i32>,

    /// Comma separated file names to back up
    #[arg(long, value_delimiter = ',')]
    include: Vec<String>,

    /// Comma separated file names to skip
    #[arg(long, value_delimiter = ',')]
    ignore: Vec<String>,

    /// Comma separated VM names never to back up
    #[arg(short = 'x', long, value_delimiter = ',')]
    exclude: Vec<String>,

    /// Archive format
    #[arg(long, value_enum, conflicts_with = "direct_copy")]
    format: Option<ArchiveFormat>,

    /// Copy files into a folder instead of an archive
    #[arg(long)]
    direct_copy: bool,

    /// Multithreaded compression (tar-zstd)
    #[arg(long)]
    multithread: bool,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ArchiveFormat {
    Zip,
    TarZstd,
}

enum Status {
    Completed,
    Cancelled,
}

impl Args {
    /// Options from the config file (if any) with the command line on top.
    fn backup_options(&self) -> Result<BackupOptions> {
        let mut options = match &self.config {
            Some(path) => BackupOptions::from_file(path)?,
            None => BackupOptions::default(),
        };

        if let Some(output) = &self.output {
            options.output_dir = output.clone();
        }
        if let Some(password) = &self.password {
            options.password = Some(password.clone());
        }
        if let Some(template) = &self.name_template {
            options.name_template = template.clone();
        }
        if let Some(level) = self.compression_level {
            options.compression_level = level;
        }
        options.single_snapshot |= self.single_snapshot;
        options.multithread |= self.multithread;
        if !self.include.is_empty() {
            options.include = self.include.clone();
        }
        if !self.ignore.is_empty() {
            options.ignore = self.ignore.clone();
        }
        if !self.exclude.is_empty() {
            options.exclude = self.exclude.clone();
        }

        if self.direct_copy {
            options.output = OutputMode::DirectCopy;
        } else if let Some(format) = self.format {
            options.output = match format {
                ArchiveFormat::Zip => OutputMode::Zip,
                ArchiveFormat::TarZstd => OutputMode::TarZstd,
            };
        }

        Ok(options)
    }

    /// Requested VM keys; empty means all.
    fn vm_names(&self) -> Result<Vec<String>> {
        let names = match &self.file {
            Some(path) => read_names(path)?,
            None => self.list.clone(),
        };
        Ok(names
            .iter()
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect())
    }
}

fn read_names(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read VM list {}", path.display()))?;
    Ok(content.lines().map(str::to_string).collect())
}

#[tokio::main]
async fn main() -> ExitCode {
    let started = Instant::now();
    let args = Args::parse();

    println!("hyperv-backup {}", env!("CARGO_PKG_VERSION"));

    match run(args, started).await {
        Ok(Status::Completed) => ExitCode::SUCCESS,
        Ok(Status::Cancelled) => ExitCode::from(EXIT_CANCELLED),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(EXIT_ERROR)
        }
    }
}

async fn run(args: Args, started: Instant) -> Result<Status> {
    let options = args.backup_options()?;
    logger::init(args.log_level.as_deref().unwrap_or("warn"))?;

    let requested = args.vm_names()?;
    println!();
    if requested.is_empty() {
        println!("Backing up all VMs on this server");
    }

    if !options.output_dir.is_dir() {
        bail!("The folder \"{}\" is not valid", options.output_dir.display());
    }

    let kind = if args.guid {
        KeyKind::SystemName
    } else {
        KeyKind::ElementName
    };
    let catalog = Catalog::from_file(&args.catalog)?;

    tracing::info!(
        "Starting hyperv-backup v{} ({} VMs in catalog)",
        env!("CARGO_PKG_VERSION"),
        catalog.virtual_machines.len()
    );

    let cancel = CancellationToken::new();
    let worker_cancel = cancel.clone();
    let worker_requested = requested.clone();

    // The engine blocks; keep the runtime free for Ctrl+C.
    let mut task = tokio::task::spawn_blocking(move || {
        let manager = BackupManager::new(catalog.clone()).with_cluster(catalog.clone());
        let mut observer = ConsoleObserver::new(worker_cancel);
        manager.run_backup(&catalog, &worker_requested, kind, &options, Some(&mut observer))
    });

    let result = loop {
        tokio::select! {
            joined = &mut task => break joined.context("Backup task failed")?,
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                eprintln!();
                eprintln!("Cancelling backup...");
                cancel.cancel();
            }
        }
    };

    match result {
        Ok(outcome) => {
            for key in outcome.missing(&requested, kind) {
                println!("WARNING: \"{}\" not found", key);
            }
            println!();
            println!("Elapsed time: {}", format_elapsed(started.elapsed()));

            if cancel.is_cancelled() {
                Ok(Status::Cancelled)
            } else {
                Ok(Status::Completed)
            }
        }
        Err(e) if e.is_cancelled() => {
            eprintln!("{}", e);
            Ok(Status::Cancelled)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn parse(args: &[&str]) -> Args {
        let mut argv = vec!["hyperv-backup", "--catalog", "host.json"];
        argv.extend_from_slice(args);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_list_and_flags() {
        let args = parse(&[
            "-l",
            "web01, db01,,",
            "-o",
            "/backups",
            "--format",
            "tar-zstd",
            "--compression-level",
            "-1",
            "--multithread",
        ]);
        assert_eq!(args.vm_names().unwrap(), vec!["web01", "db01"]);

        let options = args.backup_options().unwrap();
        assert_eq!(options.output, OutputMode::TarZstd);
        assert_eq!(options.output_dir, PathBuf::from("/backups"));
        assert_eq!(options.compression_level, -1);
        assert!(options.multithread);
    }

    #[test]
    fn test_direct_copy_conflicts_with_format() {
        let argv = [
            "hyperv-backup",
            "--catalog",
            "host.json",
            "--direct-copy",
            "--format",
            "zip",
        ];
        assert!(Args::try_parse_from(argv).is_err());

        let options = parse(&["--direct-copy"]).backup_options().unwrap();
        assert_eq!(options.output, OutputMode::DirectCopy);
    }

    #[test]
    fn test_level_out_of_range_rejected() {
        let argv = ["hyperv-backup", "--catalog", "host.json", "--compression-level", "12"];
        assert!(Args::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_names_from_file() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let list = dir.path().join("vms.txt");
        fs::write(&list, "web01\n\n  db01  \n")?;

        let args = parse(&["--file", list.to_str().unwrap()]);
        assert_eq!(args.vm_names().unwrap(), vec!["web01", "db01"]);
        Ok(())
    }

    #[test]
    fn test_config_file_with_overrides() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let config = dir.path().join("backup.toml");
        fs::write(
            &config,
            "output = \"tar-zstd\"\nname_template = \"{id}{ext}\"\nexclude = [\"build\"]\n",
        )?;

        let args = parse(&["--config", config.to_str().unwrap(), "--format", "zip"]);
        let options = args.backup_options().unwrap();
        assert_eq!(options.output, OutputMode::Zip);
        assert_eq!(options.name_template, "{id}{ext}");
        assert_eq!(options.exclude, vec!["build".to_string()]);
        Ok(())
    }
}
