//! Deletion of bulky image payloads for sessions whose QC reports already
//! exist in the project output folder.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::paths::OutputTree;

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CleanupSummary {
    pub sessions: usize,
    pub files: usize,
}

/// Walk `bids/<project>/sub-*/ses-*` and delete the `.nii` payloads of every
/// session that already has at least one matching QC report.
pub fn cleanup_reported_sessions(
    tree: &OutputTree,
    dry_run: bool,
) -> Result<CleanupSummary, CleanupError> {
    let mut summary = CleanupSummary::default();
    let bids_root = tree.bids_dir();
    if !bids_root.is_dir() {
        return Ok(summary);
    }

    for project_dir in dirs_in(&bids_root)? {
        let project = file_name(&project_dir);
        let report_dir = tree.project_dir(&project);
        for sub_dir in dirs_with_prefix(&project_dir, "sub-")? {
            let sub = file_name(&sub_dir);
            for ses_dir in dirs_with_prefix(&sub_dir, "ses-")? {
                let ses = file_name(&ses_dir);
                if !has_report(&report_dir, &sub, &ses)? {
                    continue;
                }
                let deleted = delete_images(&ses_dir, dry_run)?;
                if deleted > 0 {
                    tracing::info!(project = %project, subject = %sub, session = %ses, files = deleted, dry_run, "cleaned reported session");
                    summary.sessions += 1;
                    summary.files += deleted;
                }
            }
        }
    }
    Ok(summary)
}

fn has_report(report_dir: &Path, sub: &str, ses: &str) -> Result<bool, CleanupError> {
    if !report_dir.is_dir() {
        return Ok(false);
    }
    let prefix = format!("{sub}_{ses}_");
    for entry in entries_in(report_dir)? {
        let name = file_name(&entry);
        if name.starts_with(&prefix) && name.ends_with(".html") {
            return Ok(true);
        }
    }
    Ok(false)
}

fn delete_images(dir: &Path, dry_run: bool) -> Result<usize, CleanupError> {
    let mut deleted = 0;
    for entry in entries_in(dir)? {
        if entry.is_dir() {
            deleted += delete_images(&entry, dry_run)?;
        } else {
            let name = file_name(&entry);
            if name.starts_with("sub-") && name.contains(".nii") {
                if !dry_run {
                    fs::remove_file(&entry).map_err(|source| CleanupError::Io {
                        path: entry.clone(),
                        source,
                    })?;
                }
                deleted += 1;
            }
        }
    }
    Ok(deleted)
}

fn dirs_in(dir: &Path) -> Result<Vec<PathBuf>, CleanupError> {
    Ok(entries_in(dir)?.into_iter().filter(|p| p.is_dir()).collect())
}

fn dirs_with_prefix(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>, CleanupError> {
    Ok(dirs_in(dir)?
        .into_iter()
        .filter(|p| file_name(p).starts_with(prefix))
        .collect())
}

fn entries_in(dir: &Path) -> Result<Vec<PathBuf>, CleanupError> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|source| CleanupError::Io {
            path: dir.to_path_buf(),
            source,
        })?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    entries.sort();
    Ok(entries)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
