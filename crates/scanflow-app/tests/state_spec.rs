use std::fs;
use std::path::Path;

use tempfile::TempDir;

use scanflow_app::paths::OutputTree;
use scanflow_app::state::{BatchLog, MarkerError, MetaMarkers, UnitState, UnitTracker};

fn tracker() -> (TempDir, OutputTree, UnitTracker) {
    let temp = TempDir::new().expect("temp dir");
    let tree = OutputTree::new(temp.path()).expect("tree");
    let tracker = UnitTracker::new(tree.clone());
    (temp, tree, tracker)
}

#[test]
fn running_marker_records_the_intended_output_path() {
    let (_temp, tree, tracker) = tracker();
    tracker
        .start("20230101", "A", Path::new("/out/bids/A"))
        .expect("start");

    assert_eq!(tracker.current("20230101", "A"), Some(UnitState::Running));
    let marker = tree.unit_marker("20230101", "A", "running");
    assert_eq!(fs::read_to_string(marker).expect("read"), "/out/bids/A");
}

#[test]
fn empty_transition_renames_and_preserves_content() {
    let (_temp, tree, tracker) = tracker();
    tracker
        .start("20230101", "A", Path::new("/out/bids/A"))
        .expect("start");
    tracker.mark_empty("20230101", "A").expect("empty");

    assert_eq!(tracker.current("20230101", "A"), Some(UnitState::Empty));
    assert!(!tree.unit_marker("20230101", "A", "running").exists());
    let marker = tree.unit_marker("20230101", "A", "empty");
    assert_eq!(fs::read_to_string(marker).expect("read"), "/out/bids/A");
}

#[test]
fn failed_transition_replaces_content_with_the_error() {
    let (_temp, tree, tracker) = tracker();
    tracker
        .start("20230101", "A", Path::new("/out/bids/A"))
        .expect("start");
    tracker
        .mark_failed("20230101", "A", "converter blew up")
        .expect("failed");

    let marker = tree.unit_marker("20230101", "A", "failed");
    assert_eq!(
        fs::read_to_string(marker).expect("read"),
        "converter blew up"
    );
}

#[test]
fn completed_leaves_no_marker_behind() {
    let (_temp, tree, tracker) = tracker();
    tracker
        .start("20230101", "A", Path::new("/out/bids/A"))
        .expect("start");
    tracker.mark_completed("20230101", "A").expect("completed");

    assert_eq!(tracker.current("20230101", "A"), None);
    for suffix in ["running", "empty", "failed"] {
        assert!(!tree.unit_marker("20230101", "A", suffix).exists());
    }
}

#[test]
fn a_unit_never_holds_two_terminal_markers() {
    let (_temp, tree, tracker) = tracker();
    tracker
        .start("20230101", "A", Path::new("/out/bids/A"))
        .expect("start");
    tracker.mark_empty("20230101", "A").expect("empty");

    let err = tracker.mark_failed("20230101", "A", "late error").unwrap_err();
    assert!(matches!(err, MarkerError::InvalidTransition { .. }));
    assert!(tree.unit_marker("20230101", "A", "empty").exists());
    assert!(!tree.unit_marker("20230101", "A", "failed").exists());
}

#[test]
fn terminal_units_cannot_reenter_running_without_a_reset() {
    let (_temp, _tree, tracker) = tracker();
    tracker
        .start("20230101", "A", Path::new("/out/bids/A"))
        .expect("start");
    tracker.mark_failed("20230101", "A", "boom").expect("failed");

    let err = tracker
        .start("20230101", "A", Path::new("/out/bids/A"))
        .unwrap_err();
    assert!(matches!(err, MarkerError::InvalidTransition { .. }));

    tracker.reset("20230101", "A").expect("reset");
    assert_eq!(tracker.current("20230101", "A"), None);
    tracker
        .start("20230101", "A", Path::new("/out/bids/A"))
        .expect("start after reset");
}

#[test]
fn batch_log_round_trips_with_a_parseable_timestamp() {
    let temp = TempDir::new().expect("temp dir");
    let tree = OutputTree::new(temp.path()).expect("tree");
    let log = BatchLog::new(tree.clone());

    assert!(!log.is_done("20230101"));
    log.mark_done("20230101").expect("mark done");
    assert!(log.is_done("20230101"));

    let stamp = fs::read_to_string(tree.batch_marker("20230101")).expect("read");
    chrono::DateTime::parse_from_rfc3339(&stamp).expect("timestamp parses");
}

#[test]
fn meta_markers_queue_and_clear_projects() {
    let temp = TempDir::new().expect("temp dir");
    let tree = OutputTree::new(temp.path()).expect("tree");
    let markers = MetaMarkers::new(tree);

    markers.set("3015999.02").expect("set");
    markers.set("3013091.02").expect("set");
    assert_eq!(
        markers.pending().expect("pending"),
        vec!["3013091.02".to_string(), "3015999.02".to_string()]
    );

    markers.clear("3013091.02").expect("clear");
    markers.clear("3013091.02").expect("clear is idempotent");
    assert_eq!(
        markers.pending().expect("pending"),
        vec!["3015999.02".to_string()]
    );
}
