//! The sequential orchestration loop: discovery, completion-log filtering,
//! throttled dispatch, and batch bookkeeping. Unit failures never abort a
//! batch; only selector resolution and completion-log I/O are run-fatal.

use std::path::Path;

use chrono::NaiveDate;

use crate::dispatch::{DispatchError, DispatchOutcome, JobExecutor, JOB_NAME_PREFIX};
use crate::discovery::{self, Selector};
use crate::error::AppError;
use crate::state::{BatchLog, UnitTracker};
use crate::throttle::{self, Clock, QueueDepth, WaitPolicy};

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Reprocess batches even when their completion marker exists.
    pub force: bool,
    /// Log decisions without querying, submitting or writing anything.
    pub dry_run: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RunSummary {
    pub batches: usize,
    pub batches_skipped: usize,
    pub submitted: usize,
    pub completed: usize,
    pub empty: usize,
    pub failed: usize,
    pub rejected: usize,
    pub units_skipped: usize,
}

/// Process every batch the selector resolves to, newest first.
#[allow(clippy::too_many_arguments)]
pub fn run_batches(
    raw_root: &Path,
    selector: &Selector,
    today: NaiveDate,
    batch_log: &BatchLog,
    tracker: &UnitTracker,
    executor: &dyn JobExecutor,
    queue: &dyn QueueDepth,
    clock: &dyn Clock,
    policy: &WaitPolicy,
    opts: RunOptions,
) -> Result<RunSummary, AppError> {
    let batches = discovery::resolve_batches(raw_root, selector, today)?;
    let mut summary = RunSummary::default();

    for batch in batches {
        if !opts.force && batch_log.is_done(&batch.id) {
            tracing::info!(batch = %batch.id, "already processed, skipping");
            summary.batches_skipped += 1;
            continue;
        }

        tracing::info!(batch = %batch.id, dir = %batch.dir.display(), "processing batch");
        for unit in discovery::discover_units(&batch)? {
            // Terminal units are not candidates again unless the caller
            // forces reprocessing.
            let terminal = tracker
                .current(&batch.id, &unit.name)
                .filter(|state| state.is_terminal());
            if let Some(state) = terminal {
                if !opts.force {
                    tracing::info!(batch = %batch.id, unit = %unit.name, state = ?state, "terminal marker present, skipping unit");
                    summary.units_skipped += 1;
                    continue;
                }
            }

            if opts.dry_run {
                tracing::info!(batch = %batch.id, unit = %unit.name, "dry run, would dispatch");
                continue;
            }

            // A forced rerun resets the old marker before dispatch so a
            // remote job starts clean.
            if terminal.is_some() {
                tracker.reset(&batch.id, &unit.name)?;
            }

            throttle::wait_for_capacity(queue, clock, policy, JOB_NAME_PREFIX);
            match executor.dispatch(&batch.id, &unit) {
                Ok(DispatchOutcome::Submitted) => summary.submitted += 1,
                Ok(DispatchOutcome::Completed) => summary.completed += 1,
                Ok(DispatchOutcome::Empty) => summary.empty += 1,
                Ok(DispatchOutcome::Failed) => summary.failed += 1,
                Err(DispatchError::Submission { job, detail }) => {
                    tracing::error!(job = %job, detail = %detail, "submission rejected, continuing with next unit");
                    summary.rejected += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }

        if !opts.dry_run {
            batch_log.mark_done(&batch.id)?;
        }
        summary.batches += 1;
    }

    tracing::info!(
        batches = summary.batches,
        skipped = summary.batches_skipped,
        submitted = summary.submitted,
        completed = summary.completed,
        empty = summary.empty,
        failed = summary.failed,
        rejected = summary.rejected,
        "run finished"
    );
    Ok(summary)
}
