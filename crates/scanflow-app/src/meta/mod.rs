//! Metadata reconciliation: back-filling `meta.*` columns in the group-level
//! QC reports from the participants table, the per-session scans tables and
//! the per-scan JSON sidecars. Failures are row-scoped; a modality fails
//! outward only when zero of its rows could be reconciled.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::job::ToolRunner;
use crate::paths::OutputTree;
use crate::state::{MarkerError, MetaMarkers};
use crate::tables::{TableError, TsvTable};
use crate::throttle::Clock;

/// Group report tables and the modality folder their scans live in.
const MODALITY_REPORTS: [(&str, &str); 2] = [("group_T1w.tsv", "anat"), ("group_bold.tsv", "func")];

/// The report column every scan identifier is unique under.
const REPORT_KEY: &str = "bids_name";

#[derive(Debug, Error)]
pub enum MetaError {
    #[error(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    Marker(#[from] MarkerError),

    #[error("failed to list projects under {path}: {source}")]
    List {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Which projects to reconcile.
#[derive(Debug, Clone)]
pub enum ProjectSelection {
    /// One explicitly named project.
    Explicit(String),
    /// Every project directory under the output root.
    All,
    /// Projects with an outstanding `.meta` marker (the default).
    Pending,
}

#[derive(Debug, Clone)]
pub struct MetaOptions {
    /// Sidecar attribute names copied into `meta.<attribute>` columns.
    pub attributes: Vec<String>,
    /// Minutes to keep retrying a missing scans table before skipping the
    /// row. Bridges the lag between a compute job landing its files and this
    /// pass reading them.
    pub wait_minutes: u32,
    pub dry_run: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MetaSummary {
    pub projects: usize,
    pub rows: usize,
}

/// Reconcile the selected projects, clearing each project's `.meta` marker
/// only when at least one of its modalities succeeded.
pub fn reconcile(
    tree: &OutputTree,
    markers: &MetaMarkers,
    selection: &ProjectSelection,
    opts: &MetaOptions,
    tools: &dyn ToolRunner,
    clock: &dyn Clock,
) -> Result<MetaSummary, MetaError> {
    let projects = select_projects(tree, markers, selection)?;
    let mut summary = MetaSummary::default();

    for project in projects {
        let project_dir = tree.project_dir(&project);
        if !project_dir.is_dir() {
            tracing::warn!(project = %project, path = %project_dir.display(), "not an existing project directory");
            continue;
        }

        let mut project_rows = 0;
        for (report_name, modality) in MODALITY_REPORTS {
            match reconcile_report(tree, &project, report_name, modality, opts, tools, clock) {
                Ok(Some(rows)) => project_rows += rows,
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(project = %project, report = %report_name, error = %err, "modality reconciliation failed");
                }
            }
        }

        if project_rows > 0 {
            summary.projects += 1;
            summary.rows += project_rows;
            if !opts.dry_run {
                markers.clear(&project)?;
            }
        } else {
            tracing::warn!(project = %project, "no rows reconciled, leaving needs-metadata marker for a future retry");
        }
    }
    Ok(summary)
}

fn select_projects(
    tree: &OutputTree,
    markers: &MetaMarkers,
    selection: &ProjectSelection,
) -> Result<Vec<String>, MetaError> {
    match selection {
        ProjectSelection::Explicit(name) => Ok(vec![name.clone()]),
        ProjectSelection::Pending => Ok(markers.pending()?),
        ProjectSelection::All => {
            let root = tree.root().to_path_buf();
            let entries = fs::read_dir(&root).map_err(|source| MetaError::List {
                path: root,
                source,
            })?;
            let mut projects: Vec<String> = entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| name != "logs" && name != "bids")
                .collect();
            projects.sort();
            Ok(projects)
        }
    }
}

/// Reconcile one modality report. `Ok(None)` means there is no report to
/// process; `Ok(Some(n))` is the number of rows reconciled.
#[allow(clippy::too_many_arguments)]
fn reconcile_report(
    tree: &OutputTree,
    project: &str,
    report_name: &str,
    modality: &str,
    opts: &MetaOptions,
    tools: &dyn ToolRunner,
    clock: &dyn Clock,
) -> Result<Option<usize>, MetaError> {
    let project_dir = tree.project_dir(project);
    let bids_project = tree.bids_project_dir(project);
    let report_path = project_dir.join(report_name);

    // A missing report with raw subject data present means the group step
    // never ran; synthesize it, tolerating a failing generator.
    if !report_path.is_file() && has_subject_data(&bids_project) {
        if let Err(err) = tools.qc_group(&bids_project, &project_dir) {
            tracing::warn!(project = %project, error = %err, "group report generator failed");
        }
    }
    if !report_path.is_file() {
        return Ok(None);
    }

    tracing::info!(report = %report_path.display(), "reading group report");
    let mut report = TsvTable::load(&report_path, REPORT_KEY)?;
    let participants = TsvTable::load(&bids_project.join("participants.tsv"), "participant_id")?;

    let keys: Vec<String> = report.keys().map(str::to_string).collect();
    let mut reconciled = 0;
    for key in keys {
        if reconcile_row(
            &mut report,
            &key,
            &participants,
            &bids_project,
            modality,
            opts,
            clock,
        )? {
            reconciled += 1;
        }
    }

    if reconciled > 0 && !opts.dry_run {
        tracing::info!(report = %report_path.display(), rows = reconciled, "saving metadata to group report");
        report.save(&report_path)?;
    }
    Ok(Some(reconciled))
}

fn reconcile_row(
    report: &mut TsvTable,
    key: &str,
    participants: &TsvTable,
    bids_project: &Path,
    modality: &str,
    opts: &MetaOptions,
    clock: &dyn Clock,
) -> Result<bool, MetaError> {
    // `sub-<label>[_ses-<label>]_...` composite scan identifier.
    let mut fields = key.split('_');
    let sub = fields.next().unwrap_or_default();
    let ses = fields.next().filter(|f| f.starts_with("ses-")).unwrap_or("");

    // Never fabricate demographics for unknown subjects.
    if !participants.contains_key(sub) {
        tracing::warn!(scan = %key, subject = %sub, "subject missing from participants table, skipping row");
        return Ok(false);
    }
    let sex = participants.get(sub, "sex").unwrap_or("").to_string();
    let age = participants.get(sub, "age").unwrap_or("").to_string();
    report.set(key, "meta.Sex", &sex)?;
    report.set(key, "meta.Age", &age)?;

    let session_dir = if ses.is_empty() {
        bids_project.join(sub)
    } else {
        bids_project.join(sub).join(ses)
    };
    let scans_file = if ses.is_empty() {
        format!("{sub}_scans.tsv")
    } else {
        format!("{sub}_{ses}_scans.tsv")
    };
    let scans_path = session_dir.join(scans_file);
    if !wait_for_file(&scans_path, opts.wait_minutes, clock) {
        tracing::warn!(scan = %key, path = %scans_path.display(), "scans table still missing, skipping row");
        return Ok(false);
    }
    let scans = match TsvTable::load(&scans_path, "filename") {
        Ok(table) => table,
        Err(err) => {
            tracing::warn!(scan = %key, error = %err, "unreadable scans table, skipping row");
            return Ok(false);
        }
    };
    let scan_path = format!("{modality}/{key}.nii");
    let Some(acq_time) = scans.get(&scan_path, "acq_time").map(str::to_string) else {
        tracing::warn!(scan = %key, file = %scan_path, "no acquisition time recorded, skipping row");
        return Ok(false);
    };
    report.set(key, "meta.AcquisitionTime", &acq_time)?;

    let sidecar = session_dir.join(modality).join(format!("{key}.json"));
    let metadata: serde_json::Value = match fs::read_to_string(&sidecar)
        .map_err(|e| e.to_string())
        .and_then(|text| serde_json::from_str(&text).map_err(|e| e.to_string()))
    {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(scan = %key, path = %sidecar.display(), error = %err, "unreadable sidecar, skipping row");
            return Ok(false);
        }
    };
    for attribute in &opts.attributes {
        let cell = metadata.get(attribute).map(json_cell).unwrap_or_default();
        report.set(key, &format!("meta.{attribute}"), &cell)?;
    }
    Ok(true)
}

/// Poll for a file that a compute job may not have landed yet, retrying once
/// per minute up to the configured budget.
fn wait_for_file(path: &Path, wait_minutes: u32, clock: &dyn Clock) -> bool {
    if path.is_file() {
        return true;
    }
    for attempt in 1..=wait_minutes {
        tracing::info!(path = %path.display(), attempt, budget = wait_minutes, "waiting for file to land");
        clock.sleep(Duration::from_secs(60));
        if path.is_file() {
            return true;
        }
    }
    false
}

fn has_subject_data(bids_project: &Path) -> bool {
    fs::read_dir(bids_project)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .any(|e| e.path().is_dir() && e.file_name().to_string_lossy().starts_with("sub-"))
        })
        .unwrap_or(false)
}

fn json_cell(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
