//! Work discovery: resolving batch selectors to dated intake folders and
//! enumerating the acquisition units inside each batch.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{Datelike, Days, NaiveDate, Weekday};
use glob::Pattern;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("could not resolve batch selector `{expr}` to a date")]
    DateResolution { expr: String },

    #[error("invalid glob pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("batch directory not found: {path}")]
    BatchNotFound { path: PathBuf },

    #[error("failed to list {path}: {source}")]
    List {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A parsed batch selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Every batch under the intake root.
    All,
    /// Batches whose name matches a glob pattern.
    Glob(String),
    /// The batch for one calendar date.
    Date(NaiveDate),
}

impl Selector {
    /// Parse a selector expression: the literal `all`, a glob, a structured
    /// date, or a permissive natural-language date. Anything else is a hard
    /// `DateResolution` failure.
    pub fn parse(expr: &str, today: NaiveDate) -> Result<Self, DiscoveryError> {
        let trimmed = expr.trim();
        if trimmed.eq_ignore_ascii_case("all") {
            return Ok(Selector::All);
        }
        if trimmed.contains(['*', '?', '[']) {
            return Ok(Selector::Glob(trimmed.to_string()));
        }
        if let Some(date) = parse_structured_date(trimmed) {
            return Ok(Selector::Date(date));
        }
        if let Some(date) = parse_relaxed_date(trimmed, today) {
            return Ok(Selector::Date(date));
        }
        Err(DiscoveryError::DateResolution {
            expr: trimmed.to_string(),
        })
    }
}

/// One dated intake folder.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: String,
    pub dir: PathBuf,
}

/// Recognized legacy archive formats for packed session data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
}

/// Where a unit's raw data lives.
#[derive(Debug, Clone)]
pub enum UnitSource {
    Directory(PathBuf),
    Archive { path: PathBuf, kind: ArchiveKind },
}

/// One acquisition unit, processed by exactly one external job.
#[derive(Debug, Clone)]
pub struct Unit {
    pub name: String,
    pub source: UnitSource,
}

impl Unit {
    pub fn source_path(&self) -> &Path {
        match &self.source {
            UnitSource::Directory(p) => p,
            UnitSource::Archive { path, .. } => path,
        }
    }
}

/// Resolve a selector to an ordered batch list, newest first. A batch whose
/// identifier matches today's date is always excluded: a same-day intake
/// folder may still be filling.
pub fn resolve_batches(
    raw_root: &Path,
    selector: &Selector,
    today: NaiveDate,
) -> Result<Vec<Batch>, DiscoveryError> {
    let today_id = batch_id_for(today);
    let mut batches = match selector {
        Selector::All => walk_batches(raw_root, |_| true)?,
        Selector::Glob(p) => {
            let pattern = Pattern::new(p).map_err(|source| DiscoveryError::InvalidPattern {
                pattern: p.clone(),
                source,
            })?;
            walk_batches(raw_root, |name| pattern.matches(name))?
        }
        Selector::Date(date) => {
            let id = batch_id_for(*date);
            let dir = raw_root.join(date.year().to_string()).join(&id);
            if !dir.is_dir() {
                return Err(DiscoveryError::BatchNotFound { path: dir });
            }
            vec![Batch { id, dir }]
        }
    };

    let before = batches.len();
    batches.retain(|b| b.id != today_id);
    if batches.len() < before {
        tracing::info!(batch = %today_id, "excluding today's still-filling batch");
    }
    batches.sort_by(|a, b| b.id.cmp(&a.id));
    Ok(batches)
}

/// List the acquisition units inside one batch, in directory-listing order.
/// Plain files are classified as legacy archives when the extension is
/// recognized, otherwise skipped with a diagnostic.
pub fn discover_units(batch: &Batch) -> Result<Vec<Unit>, DiscoveryError> {
    let mut entries: Vec<PathBuf> = fs::read_dir(&batch.dir)
        .map_err(|source| DiscoveryError::List {
            path: batch.dir.clone(),
            source,
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    entries.sort();

    let mut units = Vec::new();
    for path in entries {
        if path.is_dir() {
            let name = file_name(&path);
            units.push(Unit {
                name,
                source: UnitSource::Directory(path),
            });
        } else if let Some(kind) = classify_archive(&path) {
            units.push(Unit {
                name: archive_unit_name(&path),
                source: UnitSource::Archive { path, kind },
            });
        } else {
            tracing::warn!(batch = %batch.id, file = %path.display(), "skipping unexpected file");
        }
    }
    Ok(units)
}

/// Batch identifier for a calendar date (`YYYYMMDD`).
pub fn batch_id_for(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// Reconstitute a unit from a bare path, as handed to a scheduled job.
/// Returns `None` for a plain file that is not a recognized archive.
pub fn unit_from_path(path: &Path) -> Option<Unit> {
    if path.is_dir() {
        Some(Unit {
            name: file_name(path),
            source: UnitSource::Directory(path.to_path_buf()),
        })
    } else {
        classify_archive(path).map(|kind| Unit {
            name: archive_unit_name(path),
            source: UnitSource::Archive {
                path: path.to_path_buf(),
                kind,
            },
        })
    }
}

fn walk_batches<F: Fn(&str) -> bool>(
    raw_root: &Path,
    keep: F,
) -> Result<Vec<Batch>, DiscoveryError> {
    let mut batches = Vec::new();
    let years = fs::read_dir(raw_root).map_err(|source| DiscoveryError::List {
        path: raw_root.to_path_buf(),
        source,
    })?;
    for year in years.filter_map(|e| e.ok().map(|e| e.path())) {
        if !year.is_dir() || !file_name(&year).starts_with("20") {
            continue;
        }
        let children = fs::read_dir(&year).map_err(|source| DiscoveryError::List {
            path: year.clone(),
            source,
        })?;
        for dir in children.filter_map(|e| e.ok().map(|e| e.path())) {
            let name = file_name(&dir);
            if dir.is_dir() && keep(&name) {
                batches.push(Batch { id: name, dir });
            }
        }
    }
    Ok(batches)
}

fn parse_structured_date(expr: &str) -> Option<NaiveDate> {
    for fmt in ["%Y%m%d", "%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(expr, fmt) {
            return Some(date);
        }
    }
    None
}

/// Permissive fallback for expressions the structured parser rejects:
/// `today`, `yesterday`, `tomorrow`, `N day(s) ago`, and weekday names
/// (resolving to the most recent past occurrence).
fn parse_relaxed_date(expr: &str, today: NaiveDate) -> Option<NaiveDate> {
    let lower = expr.to_ascii_lowercase();
    match lower.as_str() {
        "today" => return Some(today),
        "yesterday" => return today.checked_sub_days(Days::new(1)),
        "tomorrow" => return today.checked_add_days(Days::new(1)),
        _ => {}
    }

    let words: Vec<&str> = lower.split_whitespace().collect();
    if let [n, unit, "ago"] = words.as_slice() {
        if matches!(*unit, "day" | "days") {
            if let Ok(n) = n.parse::<u64>() {
                return today.checked_sub_days(Days::new(n));
            }
        }
    }

    if let Ok(weekday) = lower.parse::<Weekday>() {
        let back = (today.weekday().num_days_from_monday() + 7
            - weekday.num_days_from_monday())
            % 7;
        let back = if back == 0 { 7 } else { back };
        return today.checked_sub_days(Days::new(back as u64));
    }

    None
}

fn classify_archive(path: &Path) -> Option<ArchiveKind> {
    let name = file_name(path).to_ascii_lowercase();
    if name.ends_with(".zip") {
        Some(ArchiveKind::Zip)
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Some(ArchiveKind::TarGz)
    } else if name.ends_with(".tar") {
        Some(ArchiveKind::Tar)
    } else {
        None
    }
}

/// Unit name for an archive file: the file name with all archive suffixes
/// stripped (`sess.tar.gz` -> `sess`).
fn archive_unit_name(path: &Path) -> String {
    let mut name = file_name(path);
    for suffix in [".tar.gz", ".tgz", ".tar", ".zip", ".gz"] {
        if let Some(stripped) = name.strip_suffix(suffix) {
            name = stripped.to_string();
            break;
        }
    }
    name
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn structured_dates_win_over_relaxed_parsing() {
        let today = day(2023, 6, 15);
        assert_eq!(
            Selector::parse("20230101", today).unwrap(),
            Selector::Date(day(2023, 1, 1))
        );
        assert_eq!(
            Selector::parse("2023-01-01", today).unwrap(),
            Selector::Date(day(2023, 1, 1))
        );
    }

    #[test]
    fn relaxed_expressions_resolve_relative_to_today() {
        let today = day(2023, 6, 15); // a Thursday
        assert_eq!(
            Selector::parse("yesterday", today).unwrap(),
            Selector::Date(day(2023, 6, 14))
        );
        assert_eq!(
            Selector::parse("3 days ago", today).unwrap(),
            Selector::Date(day(2023, 6, 12))
        );
        // Most recent past Thursday is a week back, never today.
        assert_eq!(
            Selector::parse("thursday", today).unwrap(),
            Selector::Date(day(2023, 6, 8))
        );
        assert_eq!(
            Selector::parse("monday", today).unwrap(),
            Selector::Date(day(2023, 6, 12))
        );
    }

    #[test]
    fn unresolvable_selector_is_a_hard_stop() {
        let err = Selector::parse("not a date", day(2023, 6, 15)).unwrap_err();
        assert!(matches!(err, DiscoveryError::DateResolution { .. }));
    }

    #[test]
    fn archive_classification_and_naming() {
        assert_eq!(
            classify_archive(Path::new("/raw/sess.tar.gz")),
            Some(ArchiveKind::TarGz)
        );
        assert_eq!(
            classify_archive(Path::new("/raw/sess.zip")),
            Some(ArchiveKind::Zip)
        );
        assert_eq!(classify_archive(Path::new("/raw/notes.txt")), None);
        assert_eq!(archive_unit_name(Path::new("/raw/sess.tar.gz")), "sess");
        assert_eq!(archive_unit_name(Path::new("/raw/sess.zip")), "sess");
    }
}
