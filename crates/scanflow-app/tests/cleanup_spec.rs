use std::fs;
use std::path::PathBuf;

use tempfile::TempDir;

use scanflow_app::cleanup::cleanup_reported_sessions;
use scanflow_app::paths::OutputTree;

fn session_with_payload(tree: &OutputTree, ses: &str) -> PathBuf {
    let anat = tree
        .bids_project_dir("P1")
        .join("sub-001")
        .join(ses)
        .join("anat");
    fs::create_dir_all(&anat).expect("session dir");
    let nii = anat.join(format!("sub-001_{ses}_T1w.nii"));
    fs::write(&nii, "payload").expect("payload");
    nii
}

#[test]
fn only_sessions_with_reports_lose_their_payloads() {
    let temp = TempDir::new().expect("temp dir");
    let tree = OutputTree::new(temp.path()).expect("tree");
    let reported = session_with_payload(&tree, "ses-01");
    let unreported = session_with_payload(&tree, "ses-02");

    let project_dir = tree.project_dir("P1");
    fs::create_dir_all(&project_dir).expect("project dir");
    fs::write(project_dir.join("sub-001_ses-01_T1w.html"), "<html/>").expect("report");

    let summary = cleanup_reported_sessions(&tree, false).expect("cleanup");
    assert_eq!(summary.sessions, 1);
    assert_eq!(summary.files, 1);
    assert!(!reported.exists());
    assert!(unreported.exists());
}

#[test]
fn dry_run_counts_without_deleting() {
    let temp = TempDir::new().expect("temp dir");
    let tree = OutputTree::new(temp.path()).expect("tree");
    let nii = session_with_payload(&tree, "ses-01");
    let project_dir = tree.project_dir("P1");
    fs::create_dir_all(&project_dir).expect("project dir");
    fs::write(project_dir.join("sub-001_ses-01_T1w.html"), "<html/>").expect("report");

    let summary = cleanup_reported_sessions(&tree, true).expect("cleanup");
    assert_eq!(summary.files, 1);
    assert!(nii.exists());
}
