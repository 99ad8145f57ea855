//! Job dispatch: turning one acquisition unit into one external invocation,
//! either submitted to the batch scheduler or executed inline. Both paths sit
//! behind the [`JobExecutor`] seam so the orchestration loop is agnostic to
//! execution mode.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use thiserror::Error;

use crate::config::SchedulerConfig;
use crate::discovery::Unit;
use crate::job::{self, JobContext};
use crate::state::{MarkerError, UnitState};

/// Prefix of every scheduler job name this system submits; the throttler
/// counts queue entries by it.
pub const JOB_NAME_PREFIX: &str = "scanflow_";

/// Scheduler job name for one unit, `scanflow_<batch>_<unit>`.
pub fn job_name(batch: &str, unit: &str) -> String {
    format!("{JOB_NAME_PREFIX}{batch}_{unit}")
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("scheduler rejected job {job}: {detail}")]
    Submission { job: String, detail: String },

    #[error(transparent)]
    Marker(#[from] MarkerError),
}

/// Observable result of one dispatch. A scheduled submission only reports
/// `Submitted`; the remote execution outcome lands in the unit markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Submitted,
    Completed,
    Empty,
    Failed,
}

pub trait JobExecutor {
    fn dispatch(&self, batch: &str, unit: &Unit) -> Result<DispatchOutcome, DispatchError>;
}

/// Hands the unit to the ambient batch scheduler as one `qsub` request with
/// declared resource limits. The submitted script re-enters this binary via
/// `scanflow job`, which runs the inline pipeline on the compute node.
pub struct SchedulerExecutor<'a> {
    scheduler: &'a SchedulerConfig,
    outfolder: &'a Path,
}

impl<'a> SchedulerExecutor<'a> {
    pub fn new(scheduler: &'a SchedulerConfig, outfolder: &'a Path) -> Self {
        Self {
            scheduler,
            outfolder,
        }
    }

    fn job_script(&self, batch: &str, unit: &Unit) -> String {
        let exe = std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "scanflow".to_string());
        format!(
            "{exe} job --batch {batch} --unit {} --outfolder {}\n",
            unit.source_path().display(),
            self.outfolder.display(),
        )
    }
}

impl JobExecutor for SchedulerExecutor<'_> {
    fn dispatch(&self, batch: &str, unit: &Unit) -> Result<DispatchOutcome, DispatchError> {
        let name = job_name(batch, &unit.name);
        let resources = format!(
            "walltime={},mem={}gb,file={}gb",
            self.scheduler.walltime, self.scheduler.mem_gb, self.scheduler.scratch_gb
        );
        let submission = || -> Result<(String, String, bool), String> {
            let mut child = Command::new(&self.scheduler.qsub)
                .args(["-N", &name, "-l", &resources])
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| e.to_string())?;
            if let Some(stdin) = child.stdin.as_mut() {
                stdin
                    .write_all(self.job_script(batch, unit).as_bytes())
                    .map_err(|e| e.to_string())?;
            }
            let output = child.wait_with_output().map_err(|e| e.to_string())?;
            Ok((
                String::from_utf8_lossy(&output.stdout).trim().to_string(),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
                output.status.success(),
            ))
        };

        match submission() {
            Ok((job_id, stderr, true)) if stderr.is_empty() => {
                tracing::info!(job = %name, id = %job_id, "submitted");
                Ok(DispatchOutcome::Submitted)
            }
            Ok((_, stderr, _)) => Err(DispatchError::Submission {
                job: name,
                detail: stderr,
            }),
            Err(detail) => Err(DispatchError::Submission { job: name, detail }),
        }
    }
}

/// Executes the unit pipeline synchronously in-process. Pipeline failures
/// resolve to a `failed` marker rather than erroring the dispatch.
pub struct InlineExecutor<'a> {
    ctx: JobContext<'a>,
}

impl<'a> InlineExecutor<'a> {
    pub fn new(ctx: JobContext<'a>) -> Self {
        Self { ctx }
    }
}

impl JobExecutor for InlineExecutor<'_> {
    fn dispatch(&self, batch: &str, unit: &Unit) -> Result<DispatchOutcome, DispatchError> {
        let ctx = JobContext {
            batch,
            tree: self.ctx.tree,
            tracker: self.ctx.tracker,
            markers: self.ctx.markers,
            tools: self.ctx.tools,
            unpacker: self.ctx.unpacker,
        };
        let outcome = match job::run_unit(&ctx, unit)? {
            UnitState::Completed => DispatchOutcome::Completed,
            UnitState::Empty => DispatchOutcome::Empty,
            UnitState::Failed => DispatchOutcome::Failed,
            UnitState::Running => DispatchOutcome::Submitted,
        };
        Ok(outcome)
    }
}
