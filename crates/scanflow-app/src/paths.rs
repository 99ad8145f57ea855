//! Filesystem layout of the QC output tree (logs, BIDS folders, markers).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Container providing filesystem paths under one QC output root. In
/// production this is the `--outfolder` directory; tests construct instances
/// over a temporary directory.
#[derive(Debug, Clone)]
pub struct OutputTree {
    root: PathBuf,
}

impl OutputTree {
    /// Construct the tree rooted under the provided directory, ensuring the
    /// root and the logs directory exist.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, PathError> {
        let root = root.as_ref().to_path_buf();
        ensure_dir(&root)?;
        let tree = Self { root };
        ensure_dir(&tree.logs_dir())?;
        Ok(tree)
    }

    /// QC output root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding all durable markers (`.../logs`).
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Root of the accumulated BIDS source folders (`.../bids`).
    pub fn bids_dir(&self) -> PathBuf {
        self.root.join("bids")
    }

    /// QC output folder for one project (`.../{project}`).
    pub fn project_dir<S: AsRef<str>>(&self, project: S) -> PathBuf {
        self.root.join(project.as_ref())
    }

    /// BIDS source folder for one project (`.../bids/{project}`).
    pub fn bids_project_dir<S: AsRef<str>>(&self, project: S) -> PathBuf {
        self.bids_dir().join(project.as_ref())
    }

    /// Batch completion marker (`.../logs/{batch}`).
    pub fn batch_marker<S: AsRef<str>>(&self, batch: S) -> PathBuf {
        self.logs_dir().join(batch.as_ref())
    }

    /// Unit state marker (`.../logs/{batch}_{unit}.{suffix}`).
    pub fn unit_marker(&self, batch: &str, unit: &str, suffix: &str) -> PathBuf {
        self.logs_dir().join(format!("{batch}_{unit}.{suffix}"))
    }

    /// Needs-reconciliation marker for a project (`.../logs/{project}.meta`).
    pub fn meta_marker<S: AsRef<str>>(&self, project: S) -> PathBuf {
        self.logs_dir().join(format!("{}.meta", project.as_ref()))
    }
}

fn ensure_dir(path: &Path) -> Result<(), PathError> {
    fs::create_dir_all(path).map_err(|source| PathError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}
