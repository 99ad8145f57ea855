use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

/// Top-level CLI entry point.
#[derive(Debug, Parser)]
#[command(
    name = "scanflow",
    version,
    about = "Batch orchestration and metadata reconciliation for neuroimaging QC"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

/// Supported subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Discover intake batches and dispatch one QC job per acquisition unit.
    Run(RunArgs),
    /// Execute the QC pipeline for a single unit (what a scheduled job runs).
    Job(JobArgs),
    /// Back-fill group reports with subject and scan metadata.
    Meta(MetaArgs),
    /// Delete image payloads for sessions whose QC reports already exist.
    Cleanup(CleanupArgs),
}

/// Orchestrate discovery and dispatch for one or more batches.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Batch selector: a date (`20230101`, `2023-01-01`), a relaxed
    /// expression (`yesterday`, `3 days ago`), `all`, or a glob.
    #[arg(short = 'd', long, default_value = "yesterday")]
    pub date: String,
    /// Root of the dated intake folders (`<root>/<year>/<yyyymmdd>/`).
    #[arg(short = 'r', long)]
    pub raw_root: Option<PathBuf>,
    /// The QC output folder.
    #[arg(short = 'o', long)]
    pub outfolder: Option<PathBuf>,
    /// Reprocess batches even when their completion marker exists.
    #[arg(short = 'f', long)]
    pub force: bool,
    /// Print what would be dispatched without submitting or writing anything.
    #[arg(long)]
    pub dry_run: bool,
    /// Execute jobs synchronously in-process instead of submitting them.
    #[arg(long)]
    pub inline: bool,
}

/// Process one acquisition unit end to end.
#[derive(Debug, Args)]
pub struct JobArgs {
    /// Batch identifier the unit belongs to.
    #[arg(long)]
    pub batch: String,
    /// Path to the unit's raw data (directory or packed archive).
    #[arg(long)]
    pub unit: PathBuf,
    /// The QC output folder.
    #[arg(short = 'o', long)]
    pub outfolder: Option<PathBuf>,
}

/// Reconcile metadata into the group-level QC reports.
#[derive(Debug, Args)]
pub struct MetaArgs {
    /// Project to reconcile (default: every project with a pending marker).
    #[arg(short = 'p', long)]
    pub project: Option<String>,
    /// Reconcile every project directory, pending marker or not.
    #[arg(long, conflicts_with = "project")]
    pub all: bool,
    /// Sidecar attribute names copied into `meta.<attribute>` columns.
    #[arg(
        short = 'm',
        long = "meta",
        num_args = 1..,
        default_values = [
            "MagneticFieldStrength",
            "ManufacturersModelName",
            "StationName",
            "SoftwareVersions",
        ]
    )]
    pub attributes: Vec<String>,
    /// Minutes to keep retrying a scans table that has not landed yet.
    #[arg(short = 'w', long, default_value_t = 0)]
    pub wait_minutes: u32,
    /// The QC output folder.
    #[arg(short = 'o', long)]
    pub outfolder: Option<PathBuf>,
    /// Print the metadata decisions without saving anything.
    #[arg(long)]
    pub dry_run: bool,
}

/// Clean up processed sessions in the BIDS tree.
#[derive(Debug, Args)]
pub struct CleanupArgs {
    /// The QC output folder.
    #[arg(short = 'o', long)]
    pub outfolder: Option<PathBuf>,
    /// List what would be deleted without removing anything.
    #[arg(long)]
    pub dry_run: bool,
}
