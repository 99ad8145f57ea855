use std::cell::{Cell, RefCell};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use tempfile::TempDir;

use scanflow_app::discovery::{Selector, Unit};
use scanflow_app::dispatch::{DispatchError, DispatchOutcome, InlineExecutor, JobExecutor};
use scanflow_app::job::{FormatUnpacker, JobContext, ToolError, ToolRunner};
use scanflow_app::orchestrate::{run_batches, RunOptions};
use scanflow_app::paths::OutputTree;
use scanflow_app::state::{BatchLog, UnitState, UnitTracker, MetaMarkers};
use scanflow_app::throttle::{Clock, QueueDepth, WaitPolicy};

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Conversion/QC stand-in: unit `A` produces one subject, everything else
/// produces nothing.
#[derive(Default)]
struct FakeTools {
    converts: Cell<usize>,
}

impl ToolRunner for FakeTools {
    fn convert(&self, raw: &Path, bids_work: &Path) -> Result<(), ToolError> {
        self.converts.set(self.converts.get() + 1);
        let unit = raw.file_name().unwrap().to_string_lossy().into_owned();
        if unit != "A" {
            return Ok(());
        }
        let anat = bids_work.join("sub-001").join("ses-01").join("anat");
        fs::create_dir_all(&anat).expect("work tree");
        fs::write(anat.join("sub-001_ses-01_T1w.nii"), "payload").expect("nii");
        fs::write(
            bids_work.join("participants.tsv"),
            "participant_id\tsex\tage\nsub-001\tF\t31\n",
        )
        .expect("participants");
        fs::write(bids_work.join("README"), "converted dataset").expect("readme");
        fs::write(bids_work.join("dataset_description.json"), "{}").expect("description");
        Ok(())
    }

    fn qc_participant(&self, _bids_work: &Path, out: &Path) -> Result<(), ToolError> {
        fs::create_dir_all(out).expect("out dir");
        fs::write(out.join("sub-001_ses-01_T1w.html"), "<html/>").expect("report");
        Ok(())
    }

    fn qc_group(&self, _bids: &Path, _out: &Path) -> Result<(), ToolError> {
        Ok(())
    }
}

struct FakeQueue {
    depths: RefCell<Vec<usize>>,
    queries: Cell<usize>,
}

impl FakeQueue {
    fn idle() -> Self {
        Self {
            depths: RefCell::new(Vec::new()),
            queries: Cell::new(0),
        }
    }

    fn with_sequence(depths: &[usize]) -> Self {
        let mut depths: Vec<usize> = depths.to_vec();
        depths.reverse();
        Self {
            depths: RefCell::new(depths),
            queries: Cell::new(0),
        }
    }
}

impl QueueDepth for FakeQueue {
    fn depth(&self, _name_prefix: &str) -> usize {
        self.queries.set(self.queries.get() + 1);
        self.depths.borrow_mut().pop().unwrap_or(0)
    }
}

#[derive(Default)]
struct FakeClock {
    slept: RefCell<Vec<Duration>>,
}

impl Clock for FakeClock {
    fn sleep(&self, duration: Duration) {
        self.slept.borrow_mut().push(duration);
    }
}

struct Fixture {
    _raw: TempDir,
    _out: TempDir,
    raw_root: PathBuf,
    tree: OutputTree,
    batch_log: BatchLog,
    tracker: UnitTracker,
    markers: MetaMarkers,
}

/// Intake tree with batch `20230101` holding units `A` and `B`.
fn fixture() -> Fixture {
    let raw = TempDir::new().expect("raw temp");
    let out = TempDir::new().expect("out temp");
    let batch_dir = raw.path().join("2023").join("20230101");
    fs::create_dir_all(batch_dir.join("A")).expect("unit A");
    fs::create_dir_all(batch_dir.join("B")).expect("unit B");

    let tree = OutputTree::new(out.path()).expect("tree");
    Fixture {
        raw_root: raw.path().to_path_buf(),
        tree: tree.clone(),
        batch_log: BatchLog::new(tree.clone()),
        tracker: UnitTracker::new(tree.clone()),
        markers: MetaMarkers::new(tree),
        _raw: raw,
        _out: out,
    }
}

fn dispatch_inline(
    fx: &Fixture,
    tools: &FakeTools,
    queue: &FakeQueue,
    opts: RunOptions,
) -> scanflow_app::orchestrate::RunSummary {
    let unpacker = FormatUnpacker;
    let executor = InlineExecutor::new(JobContext {
        batch: "",
        tree: &fx.tree,
        tracker: &fx.tracker,
        markers: &fx.markers,
        tools,
        unpacker: &unpacker,
    });
    let clock = FakeClock::default();
    let policy = WaitPolicy {
        ceiling: 250,
        poll_interval: Duration::from_secs(120),
    };
    run_batches(
        &fx.raw_root,
        &Selector::parse("20230101", day(2023, 6, 15)).expect("selector"),
        day(2023, 6, 15),
        &fx.batch_log,
        &fx.tracker,
        &executor,
        queue,
        &clock,
        &policy,
        opts,
    )
    .expect("run")
}

#[test]
fn one_reporting_and_one_empty_unit_resolve_to_distinct_outcomes() {
    let fx = fixture();
    let tools = FakeTools::default();
    let summary = dispatch_inline(
        &fx,
        &tools,
        &FakeQueue::idle(),
        RunOptions {
            force: false,
            dry_run: false,
        },
    );

    assert_eq!(summary.completed, 1);
    assert_eq!(summary.empty, 1);

    // A: completed means no marker at all plus QC output on disk.
    assert_eq!(fx.tracker.current("20230101", "A"), None);
    assert!(fx.tree.project_dir("A").join("sub-001_ses-01_T1w.html").is_file());
    assert!(fx.tree.meta_marker("A").is_file());
    assert!(fx.tree.bids_project_dir("A").join("participants.tsv").is_file());

    // B: empty marker, nothing else.
    assert_eq!(fx.tracker.current("20230101", "B"), Some(UnitState::Empty));

    // Batch marker written after both, with a parseable timestamp.
    let stamp = fs::read_to_string(fx.tree.batch_marker("20230101")).expect("stamp");
    chrono::DateTime::parse_from_rfc3339(&stamp).expect("timestamp");
}

#[test]
fn a_done_batch_yields_zero_dispatches_until_forced() {
    let fx = fixture();
    let tools = FakeTools::default();
    dispatch_inline(
        &fx,
        &tools,
        &FakeQueue::idle(),
        RunOptions {
            force: false,
            dry_run: false,
        },
    );
    let converts_after_first = tools.converts.get();
    assert_eq!(converts_after_first, 2);

    let rerun = dispatch_inline(
        &fx,
        &tools,
        &FakeQueue::idle(),
        RunOptions {
            force: false,
            dry_run: false,
        },
    );
    assert_eq!(rerun.batches_skipped, 1);
    assert_eq!(tools.converts.get(), converts_after_first);

    let forced = dispatch_inline(
        &fx,
        &tools,
        &FakeQueue::idle(),
        RunOptions {
            force: true,
            dry_run: false,
        },
    );
    assert_eq!(forced.batches, 1);
    assert_eq!(tools.converts.get(), converts_after_first + 2);
    // B's stale empty marker was reset, then written again by the rerun.
    assert_eq!(fx.tracker.current("20230101", "B"), Some(UnitState::Empty));
}

#[test]
fn dry_run_never_queries_the_queue_or_writes_markers() {
    let fx = fixture();
    let tools = FakeTools::default();
    let queue = FakeQueue::idle();
    dispatch_inline(
        &fx,
        &tools,
        &queue,
        RunOptions {
            force: false,
            dry_run: true,
        },
    );

    assert_eq!(queue.queries.get(), 0);
    assert_eq!(tools.converts.get(), 0);
    assert!(!fx.batch_log.is_done("20230101"));
    assert_eq!(fx.tracker.current("20230101", "A"), None);
}

#[test]
fn selectors_resolving_to_today_produce_no_batches() {
    let fx = fixture();
    let today = day(2023, 1, 1); // same day the batch was collected
    let tools = FakeTools::default();

    let unpacker = FormatUnpacker;
    let executor = InlineExecutor::new(JobContext {
        batch: "",
        tree: &fx.tree,
        tracker: &fx.tracker,
        markers: &fx.markers,
        tools: &tools,
        unpacker: &unpacker,
    });
    let clock = FakeClock::default();
    let policy = WaitPolicy {
        ceiling: 250,
        poll_interval: Duration::from_secs(120),
    };

    for expr in ["all", "2023*", "today"] {
        let summary = run_batches(
            &fx.raw_root,
            &Selector::parse(expr, today).expect("selector"),
            today,
            &fx.batch_log,
            &fx.tracker,
            &executor,
            &FakeQueue::idle(),
            &clock,
            &policy,
            RunOptions {
                force: false,
                dry_run: false,
            },
        )
        .expect("run");
        assert_eq!(summary.batches, 0, "selector `{expr}` must exclude today");
    }
    assert_eq!(tools.converts.get(), 0);
}

#[test]
fn throttler_parks_between_dispatches_and_requeries_after_waking() {
    let fx = fixture();
    let tools = FakeTools::default();
    // First unit sees the queue over the ceiling once, then capacity.
    let queue = FakeQueue::with_sequence(&[251, 249, 0]);
    let summary = dispatch_inline(
        &fx,
        &tools,
        &queue,
        RunOptions {
            force: false,
            dry_run: false,
        },
    );

    assert_eq!(summary.completed + summary.empty, 2);
    assert_eq!(queue.queries.get(), 3);
}

/// Executor standing in for a scheduler that rejects the first submission.
struct RejectingExecutor {
    dispatched: Cell<usize>,
}

impl JobExecutor for RejectingExecutor {
    fn dispatch(&self, batch: &str, unit: &Unit) -> Result<DispatchOutcome, DispatchError> {
        self.dispatched.set(self.dispatched.get() + 1);
        if unit.name == "A" {
            Err(DispatchError::Submission {
                job: format!("scanflow_{batch}_{}", unit.name),
                detail: "qsub: would exceed queue limits".into(),
            })
        } else {
            Ok(DispatchOutcome::Submitted)
        }
    }
}

#[test]
fn a_rejected_submission_does_not_abort_the_batch() {
    let fx = fixture();
    let executor = RejectingExecutor {
        dispatched: Cell::new(0),
    };
    let clock = FakeClock::default();
    let policy = WaitPolicy {
        ceiling: 250,
        poll_interval: Duration::from_secs(120),
    };
    let summary = run_batches(
        &fx.raw_root,
        &Selector::parse("20230101", day(2023, 6, 15)).expect("selector"),
        day(2023, 6, 15),
        &fx.batch_log,
        &fx.tracker,
        &executor,
        &FakeQueue::idle(),
        &clock,
        &policy,
        RunOptions {
            force: false,
            dry_run: false,
        },
    )
    .expect("run");

    assert_eq!(executor.dispatched.get(), 2);
    assert_eq!(summary.rejected, 1);
    assert_eq!(summary.submitted, 1);
    assert!(fx.batch_log.is_done("20230101"));
}
