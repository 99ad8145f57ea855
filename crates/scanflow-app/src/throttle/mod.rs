//! Submission throttling: bounded polling against the ambient batch queue.
//!
//! The queue-depth source and the clock are injected so the polling loop is
//! deterministic under test. The production source fails open: a broken or
//! empty scheduler query counts as zero jobs, never blocking forever.

use std::process::Command;
use std::time::Duration;

use crate::config::SchedulerConfig;

/// Source of the ambient queue depth for jobs matching a name prefix.
pub trait QueueDepth {
    fn depth(&self, name_prefix: &str) -> usize;
}

/// Sleep seam; swapped for a fake in tests so no real timers fire.
pub trait Clock {
    fn sleep(&self, duration: Duration);
}

/// Real wall-clock sleeping.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Throttling policy: park while `ceiling` or more scanflow jobs are queued
/// or running, re-polling every `poll_interval`.
#[derive(Debug, Clone)]
pub struct WaitPolicy {
    pub ceiling: usize,
    pub poll_interval: Duration,
}

/// Block until the ambient queue depth drops below the ceiling. The count is
/// re-evaluated after every wake; a stale pre-sleep count is never trusted.
pub fn wait_for_capacity(
    queue: &dyn QueueDepth,
    clock: &dyn Clock,
    policy: &WaitPolicy,
    name_prefix: &str,
) {
    loop {
        let depth = queue.depth(name_prefix);
        if depth < policy.ceiling {
            return;
        }
        tracing::info!(
            depth,
            ceiling = policy.ceiling,
            wait_secs = policy.poll_interval.as_secs(),
            "job ceiling reached, parking before next submission"
        );
        clock.sleep(policy.poll_interval);
    }
}

/// Queue depth from a PBS/Torque `qstat` listing: one line per job, with the
/// job name in the second column.
#[derive(Debug, Clone)]
pub struct PbsQueue {
    qstat: String,
}

impl PbsQueue {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            qstat: config.qstat.clone(),
        }
    }
}

impl QueueDepth for PbsQueue {
    fn depth(&self, name_prefix: &str) -> usize {
        let output = match Command::new(&self.qstat).output() {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!(command = %self.qstat, error = %err, "queue query failed, assuming empty queue");
                return 0;
            }
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        count_matching_jobs(&stdout, name_prefix)
    }
}

fn count_matching_jobs(listing: &str, name_prefix: &str) -> usize {
    listing
        .lines()
        .filter(|line| {
            line.split_whitespace()
                .nth(1)
                .is_some_and(|name| name.starts_with(name_prefix))
        })
        .count()
}
