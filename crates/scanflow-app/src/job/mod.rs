//! In-process execution of one acquisition unit: conversion, QC, and the
//! bookkeeping around it. The conversion and QC tools themselves are opaque
//! collaborators behind the [`ToolRunner`] seam; this module owns the unit
//! state transitions, the shadow layout for unstructured acquisitions, and
//! the monotone participants merge.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

use crate::discovery::{ArchiveKind, Unit, UnitSource};
use crate::paths::OutputTree;
use crate::state::{MarkerError, MetaMarkers, UnitState, UnitTracker};
use crate::tables::{TableError, TsvTable};

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` exited with {status}")]
    Status { command: String, status: String },
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Table(#[from] TableError),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to unpack {path}: {detail}")]
    Unpack { path: PathBuf, detail: String },

    #[error("cannot derive a session token from unit name `{name}`")]
    ShadowLayout { name: String },
}

/// External conversion and QC tools, invoked as black boxes.
pub trait ToolRunner {
    /// Convert a raw acquisition folder into a BIDS work folder.
    fn convert(&self, raw: &Path, bids_work: &Path) -> Result<(), ToolError>;
    /// Run the participant-level QC computation.
    fn qc_participant(&self, bids_work: &Path, out: &Path) -> Result<(), ToolError>;
    /// (Re)generate the group-level QC report tables.
    fn qc_group(&self, bids: &Path, out: &Path) -> Result<(), ToolError>;
}

/// Archive extraction seam; the formats themselves are not this system's
/// concern.
pub trait ArchiveUnpacker {
    fn unpack(&self, kind: ArchiveKind, archive: &Path, dest: &Path) -> Result<(), JobError>;
}

/// Everything a unit job needs, bundled for the inline executor and the
/// `scanflow job` subcommand.
#[derive(Clone, Copy)]
pub struct JobContext<'a> {
    pub batch: &'a str,
    pub tree: &'a OutputTree,
    pub tracker: &'a UnitTracker,
    pub markers: &'a MetaMarkers,
    pub tools: &'a dyn ToolRunner,
    pub unpacker: &'a dyn ArchiveUnpacker,
}

enum PipelineEnd {
    /// Conversion produced no subject folders.
    NoSubjects,
    /// QC ran but emitted no per-subject report.
    NoReports,
    /// At least one subject report exists.
    Reported,
}

/// Run one unit end to end, resolving its state marker. Pipeline errors are
/// absorbed into a `Failed` marker; only marker I/O failures propagate.
pub fn run_unit(ctx: &JobContext, unit: &Unit) -> Result<UnitState, MarkerError> {
    let bids = ctx.tree.bids_project_dir(&unit.name);
    let out = ctx.tree.project_dir(&unit.name);
    ctx.tracker.start(ctx.batch, &unit.name, &bids)?;
    tracing::info!(batch = %ctx.batch, unit = %unit.name, raw = %unit.source_path().display(), "processing unit");

    match process(ctx, unit, &bids, &out) {
        Ok(PipelineEnd::Reported) => {
            ctx.markers.set(&unit.name)?;
            ctx.tracker.mark_completed(ctx.batch, &unit.name)?;
            Ok(UnitState::Completed)
        }
        Ok(PipelineEnd::NoSubjects) | Ok(PipelineEnd::NoReports) => {
            ctx.tracker.mark_empty(ctx.batch, &unit.name)?;
            Ok(UnitState::Empty)
        }
        Err(err) => {
            ctx.tracker
                .mark_failed(ctx.batch, &unit.name, &err.to_string())?;
            Ok(UnitState::Failed)
        }
    }
}

fn process(
    ctx: &JobContext,
    unit: &Unit,
    bids: &Path,
    out: &Path,
) -> Result<PipelineEnd, JobError> {
    let scratch = tempfile::tempdir().map_err(|source| JobError::Io {
        path: PathBuf::from("scratch"),
        source,
    })?;

    // Unpack legacy packed sessions into scratch before anything else.
    let mut raw_dir = match &unit.source {
        UnitSource::Directory(path) => path.clone(),
        UnitSource::Archive { path, kind } => {
            let dest = scratch.path().join(&unit.name);
            tracing::info!(archive = %path.display(), dest = %dest.display(), "extracting packed session");
            ctx.unpacker.unpack(*kind, path, &dest)?;
            dest
        }
    };

    // Acquisitions without a sub-/ses- hierarchy get a synthesized shadow
    // layout so the converter sees the structure it expects.
    if unit.name.contains('^') {
        raw_dir = synthesize_shadow(&unit.name, &raw_dir, scratch.path())?;
    }

    let bids_work = scratch.path().join("bids");
    ctx.tools.convert(&raw_dir, &bids_work)?;
    if subject_dirs(&bids_work)?.is_empty() {
        return Ok(PipelineEnd::NoSubjects);
    }

    ensure_dir(out)?;
    ctx.tools.qc_participant(&bids_work, out)?;

    // The heavy image payloads never leave scratch; only their names do.
    blank_image_files(&bids_work)?;

    ensure_dir(bids)?;
    merge_participants(&bids_work.join("participants.tsv"), &bids.join("participants.tsv"))?;
    for root_file in ["README", "dataset_description.json", "participants.tsv"] {
        let dest = bids.join(root_file);
        let src = bids_work.join(root_file);
        if !dest.is_file() && src.is_file() {
            fs::copy(&src, &dest).map_err(|source| JobError::Io { path: dest, source })?;
        }
    }

    // Keep the per-session metadata next to any sessions from earlier runs.
    for subject in subject_dirs(&bids_work)? {
        let sub_dest = bids.join(file_name(&subject));
        ensure_dir(&sub_dest)?;
        for session in session_dirs(&subject)? {
            copy_tree(&session, &sub_dest.join(file_name(&session)))?;
        }
    }

    if has_subject_reports(out, &unit.name)? {
        Ok(PipelineEnd::Reported)
    } else {
        Ok(PipelineEnd::NoReports)
    }
}

/// Split an unstructured acquisition name into subject and session tokens.
/// The upstream producer names these folders `<patient>^<scanner>_<ses>...`,
/// so the subject token is the whole name and the session token is the
/// second `_`-separated field. Nothing beyond that two-token split is
/// assumed.
pub fn shadow_tokens(name: &str) -> Option<(&str, &str)> {
    let ses = name.splitn(3, '_').nth(1)?;
    Some((name, ses))
}

fn synthesize_shadow(name: &str, raw_dir: &Path, scratch: &Path) -> Result<PathBuf, JobError> {
    let (sub, ses) = shadow_tokens(name).ok_or_else(|| JobError::ShadowLayout {
        name: name.to_string(),
    })?;
    let shadow = scratch.join("sourcedata").join(name);
    let sub_dir = shadow.join(format!("sub-{sub}"));
    ensure_dir(&sub_dir)?;
    let ses_link = sub_dir.join(format!("ses-{ses}"));
    link_or_copy(raw_dir, &ses_link)?;
    Ok(shadow)
}

#[cfg(unix)]
fn link_or_copy(target: &Path, link: &Path) -> Result<(), JobError> {
    std::os::unix::fs::symlink(target, link).map_err(|source| JobError::Io {
        path: link.to_path_buf(),
        source,
    })
}

#[cfg(not(unix))]
fn link_or_copy(target: &Path, link: &Path) -> Result<(), JobError> {
    copy_tree(target, link)
}

/// Merge newly converted subjects into an existing participants table.
/// Existing rows always win; the destination key set only grows.
fn merge_participants(work: &Path, dest: &Path) -> Result<(), JobError> {
    if !work.is_file() || !dest.is_file() {
        return Ok(());
    }
    let mut existing = TsvTable::load(dest, "participant_id")?;
    let incoming = TsvTable::load(work, "participant_id")?;
    let added = existing.merge_new_rows(&incoming);
    if added > 0 {
        tracing::debug!(table = %dest.display(), added, "merged new participants");
        existing.save(dest)?;
    }
    Ok(())
}

fn has_subject_reports(out: &Path, unit: &str) -> Result<bool, JobError> {
    if !out.is_dir() {
        return Ok(false);
    }
    for entry in read_dir(out)? {
        let name = file_name(&entry);
        if name.starts_with("sub-") && name.ends_with(".html") {
            return Ok(true);
        }
    }
    tracing::warn!(unit = %unit, out = %out.display(), "no subject reports produced");
    Ok(false)
}

fn subject_dirs(dir: &Path) -> Result<Vec<PathBuf>, JobError> {
    prefixed_dirs(dir, "sub-")
}

fn session_dirs(dir: &Path) -> Result<Vec<PathBuf>, JobError> {
    prefixed_dirs(dir, "ses-")
}

fn prefixed_dirs(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>, JobError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut dirs: Vec<PathBuf> = read_dir(dir)?
        .into_iter()
        .filter(|p| p.is_dir() && file_name(p).starts_with(prefix))
        .collect();
    dirs.sort();
    Ok(dirs)
}

/// Replace every `sub-*.nii*` payload under `dir` with an empty file.
fn blank_image_files(dir: &Path) -> Result<(), JobError> {
    for entry in read_dir(dir)? {
        if entry.is_dir() {
            blank_image_files(&entry)?;
        } else {
            let name = file_name(&entry);
            if name.starts_with("sub-") && name.contains(".nii") {
                fs::write(&entry, "").map_err(|source| JobError::Io {
                    path: entry.clone(),
                    source,
                })?;
            }
        }
    }
    Ok(())
}

fn copy_tree(src: &Path, dest: &Path) -> Result<(), JobError> {
    ensure_dir(dest)?;
    for entry in read_dir(src)? {
        let target = dest.join(file_name(&entry));
        if entry.is_dir() {
            copy_tree(&entry, &target)?;
        } else {
            fs::copy(&entry, &target).map_err(|source| JobError::Io {
                path: target,
                source,
            })?;
        }
    }
    Ok(())
}

fn read_dir(dir: &Path) -> Result<Vec<PathBuf>, JobError> {
    let entries = fs::read_dir(dir).map_err(|source| JobError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    Ok(entries.filter_map(|e| e.ok().map(|e| e.path())).collect())
}

fn ensure_dir(dir: &Path) -> Result<(), JobError> {
    fs::create_dir_all(dir).map_err(|source| JobError::Io {
        path: dir.to_path_buf(),
        source,
    })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Tool runner that shells out using the configured command templates.
/// Templates carry `{raw}`, `{bids}` and `{out}` placeholders.
pub struct ShellTools {
    convert: String,
    qc_participant: String,
    qc_group: String,
}

impl ShellTools {
    pub fn new(tools: &crate::config::ToolsConfig) -> Self {
        Self {
            convert: tools.convert.clone(),
            qc_participant: tools.qc_participant.clone(),
            qc_group: tools.qc_group.clone(),
        }
    }

    fn run(template: &str, substitutions: &[(&str, &Path)]) -> Result<(), ToolError> {
        let argv: Vec<String> = template
            .split_whitespace()
            .map(|token| {
                let mut token = token.to_string();
                for (placeholder, path) in substitutions {
                    token = token.replace(placeholder, &path.display().to_string());
                }
                token
            })
            .collect();
        let (program, args) = argv.split_first().ok_or_else(|| ToolError::Launch {
            command: template.to_string(),
            source: io::Error::other("empty command template"),
        })?;
        let status = Command::new(program)
            .args(args)
            .status()
            .map_err(|source| ToolError::Launch {
                command: program.clone(),
                source,
            })?;
        if !status.success() {
            return Err(ToolError::Status {
                command: program.clone(),
                status: status.to_string(),
            });
        }
        Ok(())
    }
}

impl ToolRunner for ShellTools {
    fn convert(&self, raw: &Path, bids_work: &Path) -> Result<(), ToolError> {
        Self::run(&self.convert, &[("{raw}", raw), ("{bids}", bids_work)])
    }

    fn qc_participant(&self, bids_work: &Path, out: &Path) -> Result<(), ToolError> {
        Self::run(&self.qc_participant, &[("{bids}", bids_work), ("{out}", out)])
    }

    fn qc_group(&self, bids: &Path, out: &Path) -> Result<(), ToolError> {
        Self::run(&self.qc_group, &[("{bids}", bids), ("{out}", out)])
    }
}

/// Unpacker for the recognized legacy archive formats.
#[derive(Debug, Default, Clone, Copy)]
pub struct FormatUnpacker;

impl ArchiveUnpacker for FormatUnpacker {
    fn unpack(&self, kind: ArchiveKind, archive: &Path, dest: &Path) -> Result<(), JobError> {
        let unpack_err = |detail: String| JobError::Unpack {
            path: archive.to_path_buf(),
            detail,
        };
        let file = fs::File::open(archive).map_err(|source| JobError::Io {
            path: archive.to_path_buf(),
            source,
        })?;
        ensure_dir(dest)?;
        match kind {
            ArchiveKind::Zip => {
                let mut zip = zip::ZipArchive::new(file).map_err(|e| unpack_err(e.to_string()))?;
                zip.extract(dest).map_err(|e| unpack_err(e.to_string()))
            }
            ArchiveKind::Tar => tar::Archive::new(file)
                .unpack(dest)
                .map_err(|e| unpack_err(e.to_string())),
            ArchiveKind::TarGz => tar::Archive::new(flate2::read::GzDecoder::new(file))
                .unpack(dest)
                .map_err(|e| unpack_err(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_tokens_follow_the_two_token_contract() {
        let (sub, ses) = shadow_tokens("JurCla^Prisma_090135.023000").unwrap();
        assert_eq!(sub, "JurCla^Prisma_090135.023000");
        assert_eq!(ses, "090135.023000");

        // maxsplit semantics: only the second field is the session token.
        let (_, ses) = shadow_tokens("A^B_ses_extra_bits").unwrap();
        assert_eq!(ses, "ses");

        assert!(shadow_tokens("NoDelimiterHere").is_none());
    }
}
