//! Configuration loading (file + environment) for the orchestrator.

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;

const CONFIG_FILE: &str = "config/scanflow";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error(transparent)]
    Build(#[from] config::ConfigError),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub raw_root: PathBuf,
    pub output_root: PathBuf,
    pub throttle: ThrottleConfig,
    pub scheduler: SchedulerConfig,
    pub tools: ToolsConfig,
}

/// Submission throttling knobs. These changed repeatedly in deployment, so
/// they are configuration, never call-site constants.
#[derive(Debug, Deserialize, Clone)]
pub struct ThrottleConfig {
    /// Cluster-wide ceiling on concurrently queued/running scanflow jobs.
    pub max_jobs: usize,
    /// Seconds between queue-depth polls while parked.
    pub poll_secs: u64,
}

impl ThrottleConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_secs)
    }
}

/// Batch scheduler commands and per-job resource requests.
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    pub qsub: String,
    pub qstat: String,
    pub walltime: String,
    pub mem_gb: u32,
    pub scratch_gb: u32,
}

/// Command templates for the external conversion and QC tools. Placeholders
/// `{raw}`, `{bids}` and `{out}` are substituted when the invocation is
/// built; the templates themselves (container paths, versions) are opaque to
/// the orchestrator and typically come from the environment.
#[derive(Debug, Deserialize, Clone)]
pub struct ToolsConfig {
    pub convert: String,
    pub qc_participant: String,
    pub qc_group: String,
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    let builder = Config::builder()
        .set_default("raw_root", "/project/raw")?
        .set_default("output_root", "/project/qc_data")?
        .set_default("throttle.max_jobs", 250)?
        .set_default("throttle.poll_secs", 120)?
        .set_default("scheduler.qsub", "qsub")?
        .set_default("scheduler.qstat", "qstat")?
        .set_default("scheduler.walltime", "24:00:00")?
        .set_default("scheduler.mem_gb", 32)?
        .set_default("scheduler.scratch_gb", 50)?
        .set_default("tools.convert", "bidscoiner {raw} {bids}")?
        .set_default(
            "tools.qc_participant",
            "mriqc {bids} {out} participant --nprocs 1",
        )?
        .set_default("tools.qc_group", "mriqc {bids} {out} group --nprocs 1")?
        .add_source(File::with_name(CONFIG_FILE).required(false))
        .add_source(Environment::with_prefix("SCANFLOW").separator("__"));

    let cfg = builder.build()?.try_deserialize()?;
    Ok(cfg)
}
