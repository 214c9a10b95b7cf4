//! CLI commands.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use console::style;

use crate::config::Settings;
use crate::store::{CheckpointRecord, TrackingStore};
use crate::{orchestrator, validate};

#[derive(Parser)]
#[command(name = "bookfetch")]
#[command(about = "Bulk bookout-PDF retrieval for dealer inventory sites")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Log in, export the inventory, and download pending bookout PDFs
    Run {
        /// Number of worker tabs (overrides environment)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Cap on references processed this run (0 = all)
        #[arg(short, long)]
        max_downloads: Option<usize>,
        /// Show the browser window
        #[arg(long)]
        headed: bool,
        /// Output root directory (a dated run folder is created inside)
        #[arg(long)]
        download_root: Option<PathBuf>,
    },

    /// Check every downloaded PDF against the reference embedded in it
    Validate {
        /// Run directory (e.g. downloads/10-05-2025)
        run_dir: PathBuf,
    },

    /// Show tracking and checkpoint state for a run directory
    Status {
        /// Run directory (e.g. downloads/10-05-2025)
        run_dir: PathBuf,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            workers,
            max_downloads,
            headed,
            download_root,
        } => {
            let mut settings = Settings::from_env()?;
            if let Some(workers) = workers {
                settings.worker_tabs = workers;
            }
            if let Some(max_downloads) = max_downloads {
                settings.max_downloads = max_downloads;
            }
            if headed {
                settings.headless = false;
            }
            if let Some(download_root) = download_root {
                settings.download_root = download_root;
            }
            settings.validate()?;

            let report = orchestrator::run(settings).await?;
            report.print();
            Ok(())
        }

        Commands::Validate { run_dir } => {
            let report = validate::validate_run(&run_dir)?;
            report.print();
            if !report.is_clean() {
                bail!(
                    "{} mismatched, {} missing",
                    report.mismatches(),
                    report.missing.len()
                );
            }
            Ok(())
        }

        Commands::Status { run_dir } => print_status(&run_dir),
    }
}

fn print_status(run_dir: &std::path::Path) -> Result<()> {
    let run_data = run_dir.join("run_data");

    let tracking_path = run_data.join("tracking.json");
    if tracking_path.exists() {
        let tracking = TrackingStore::read_document(&tracking_path)?;
        let downloaded = tracking
            .values()
            .filter(|s| matches!(s, Some(crate::store::ReferenceStatus::Downloaded)))
            .count();
        let failed = tracking
            .values()
            .filter(|s| matches!(s, Some(crate::store::ReferenceStatus::Failed)))
            .count();
        let pending = tracking.len() - downloaded - failed;
        println!("{}", style("Tracking").bold());
        println!("  Total      : {}", tracking.len());
        println!("  Downloaded : {}", style(downloaded).green());
        println!("  Failed     : {failed}");
        println!("  Pending    : {pending}");
    } else {
        println!("No tracking document in {}", run_dir.display());
    }

    let checkpoint_path = run_data.join("checkpoint.json");
    if checkpoint_path.exists() {
        let raw = std::fs::read_to_string(&checkpoint_path)?;
        let checkpoint: CheckpointRecord = serde_json::from_str(&raw)?;
        println!("{}", style("Checkpoint").bold());
        println!("  Attempted  : {}", checkpoint.attempted);
        println!("  Succeeded  : {}", checkpoint.succeeded);
        println!("  Failed     : {}", checkpoint.failed);
        println!("  Streak     : {} consecutive failures", checkpoint.consecutive_failures);
        if let Some(reference) = &checkpoint.last_reference {
            println!("  Last ref   : {reference}");
        }
    }

    Ok(())
}
