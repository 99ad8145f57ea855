//! Durable per-batch and per-unit state, persisted as marker files under the
//! logs directory. Markers double as an operator dashboard: listing the logs
//! directory shows in-flight, empty and failed units at a glance, and `.meta`
//! markers queue projects for metadata reconciliation.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use thiserror::Error;

use crate::paths::OutputTree;

#[derive(Debug, Error)]
pub enum MarkerError {
    #[error("invalid transition for unit {batch}_{unit}: {detail}")]
    InvalidTransition {
        batch: String,
        unit: String,
        detail: String,
    },

    #[error("marker io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Lifecycle state of one acquisition unit.
///
/// `Running` is the only non-terminal state; terminal states are final and
/// mutually exclusive. `Completed` is recorded by *absence*: the running
/// marker is removed and the QC output tree is the evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Running,
    Empty,
    Failed,
    Completed,
}

impl UnitState {
    /// Marker file suffix for states that keep a marker on disk.
    fn suffix(self) -> Option<&'static str> {
        match self {
            UnitState::Running => Some("running"),
            UnitState::Empty => Some("empty"),
            UnitState::Failed => Some("failed"),
            UnitState::Completed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, UnitState::Running)
    }
}

/// Per-unit state store backed by marker files.
#[derive(Debug, Clone)]
pub struct UnitTracker {
    tree: OutputTree,
}

impl UnitTracker {
    pub fn new(tree: OutputTree) -> Self {
        Self { tree }
    }

    /// Current state of a unit, if any marker exists for it.
    pub fn current(&self, batch: &str, unit: &str) -> Option<UnitState> {
        for state in [UnitState::Running, UnitState::Empty, UnitState::Failed] {
            let suffix = state.suffix().unwrap_or_default();
            if self.tree.unit_marker(batch, unit, suffix).is_file() {
                return Some(state);
            }
        }
        None
    }

    /// Enter `Running`: write the in-flight marker holding the unit's
    /// intended output path, the durable record used to audit stuck jobs.
    pub fn start(&self, batch: &str, unit: &str, output: &Path) -> Result<(), MarkerError> {
        if let Some(state) = self.current(batch, unit) {
            if state.is_terminal() {
                return Err(self.invalid(batch, unit, format!("already terminal: {state:?}")));
            }
        }
        let marker = self.tree.unit_marker(batch, unit, "running");
        write_file(&marker, &output.display().to_string())
    }

    /// `Running -> Empty`: rename the marker, preserving its content.
    pub fn mark_empty(&self, batch: &str, unit: &str) -> Result<(), MarkerError> {
        let to = self.rename_running(batch, unit, "empty")?;
        tracing::warn!(batch = %batch, unit = %unit, marker = %to.display(), "no usable data produced");
        Ok(())
    }

    /// `Running -> Failed`: rename the marker and replace its content with
    /// the error text.
    pub fn mark_failed(&self, batch: &str, unit: &str, error: &str) -> Result<(), MarkerError> {
        let to = self.rename_running(batch, unit, "failed")?;
        write_file(&to, error)?;
        tracing::error!(batch = %batch, unit = %unit, error = %error, "unit processing failed");
        Ok(())
    }

    /// `Running -> Completed`: delete the running marker; the QC output plus
    /// marker absence is how success reads.
    pub fn mark_completed(&self, batch: &str, unit: &str) -> Result<(), MarkerError> {
        let running = self.tree.unit_marker(batch, unit, "running");
        if !running.is_file() {
            return Err(self.invalid(batch, unit, "no running marker to complete".into()));
        }
        fs::remove_file(&running).map_err(|source| MarkerError::Io {
            path: running,
            source,
        })
    }

    /// Remove any marker for the unit, making it a candidate for `Running`
    /// again. A force-reprocess decision belongs to the caller, never to the
    /// tracker itself.
    pub fn reset(&self, batch: &str, unit: &str) -> Result<(), MarkerError> {
        for suffix in ["running", "empty", "failed"] {
            let marker = self.tree.unit_marker(batch, unit, suffix);
            if marker.is_file() {
                fs::remove_file(&marker).map_err(|source| MarkerError::Io {
                    path: marker,
                    source,
                })?;
            }
        }
        Ok(())
    }

    fn rename_running(&self, batch: &str, unit: &str, suffix: &str) -> Result<PathBuf, MarkerError> {
        if let Some(state) = self.current(batch, unit) {
            if state.is_terminal() {
                return Err(self.invalid(batch, unit, format!("already terminal: {state:?}")));
            }
        }
        let from = self.tree.unit_marker(batch, unit, "running");
        let to = self.tree.unit_marker(batch, unit, suffix);
        if !from.is_file() {
            return Err(self.invalid(batch, unit, format!("no running marker to turn .{suffix}")));
        }
        fs::rename(&from, &to).map_err(|source| MarkerError::Io { path: from, source })?;
        Ok(to)
    }

    fn invalid(&self, batch: &str, unit: &str, detail: String) -> MarkerError {
        MarkerError::InvalidTransition {
            batch: batch.to_string(),
            unit: unit.to_string(),
            detail,
        }
    }
}

/// Durable per-batch completion log.
#[derive(Debug, Clone)]
pub struct BatchLog {
    tree: OutputTree,
}

impl BatchLog {
    pub fn new(tree: OutputTree) -> Self {
        Self { tree }
    }

    pub fn is_done(&self, batch: &str) -> bool {
        self.tree.batch_marker(batch).is_file()
    }

    /// Record the batch as processed, stamping the current time. Called only
    /// after every unit was dispatched or intentionally skipped.
    pub fn mark_done(&self, batch: &str) -> Result<(), MarkerError> {
        let marker = self.tree.batch_marker(batch);
        write_file(&marker, &Local::now().to_rfc3339())
    }
}

/// The `.meta` markers queueing projects for metadata reconciliation.
#[derive(Debug, Clone)]
pub struct MetaMarkers {
    tree: OutputTree,
}

impl MetaMarkers {
    pub fn new(tree: OutputTree) -> Self {
        Self { tree }
    }

    pub fn set(&self, project: &str) -> Result<(), MarkerError> {
        write_file(&self.tree.meta_marker(project), "")
    }

    pub fn clear(&self, project: &str) -> Result<(), MarkerError> {
        let marker = self.tree.meta_marker(project);
        if marker.is_file() {
            fs::remove_file(&marker).map_err(|source| MarkerError::Io {
                path: marker,
                source,
            })?;
        }
        Ok(())
    }

    /// Projects with an outstanding needs-metadata marker.
    pub fn pending(&self) -> Result<Vec<String>, MarkerError> {
        let logs = self.tree.logs_dir();
        let entries = fs::read_dir(&logs).map_err(|source| MarkerError::Io {
            path: logs,
            source,
        })?;
        let mut projects: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                e.file_name()
                    .to_string_lossy()
                    .strip_suffix(".meta")
                    .map(str::to_string)
            })
            .collect();
        projects.sort();
        Ok(projects)
    }
}

fn write_file(path: &Path, content: &str) -> Result<(), MarkerError> {
    fs::write(path, content).map_err(|source| MarkerError::Io {
        path: path.to_path_buf(),
        source,
    })
}
