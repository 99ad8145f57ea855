use std::path::PathBuf;
use std::process;

use chrono::Local;
use tracing_subscriber::{filter::LevelFilter, fmt};

use scanflow_app::cleanup;
use scanflow_app::cli::{Cli, CleanupArgs, Commands, JobArgs, MetaArgs, RunArgs};
use scanflow_app::config::{self, AppConfig};
use scanflow_app::discovery::{self, Selector};
use scanflow_app::dispatch::{InlineExecutor, SchedulerExecutor};
use scanflow_app::error::AppError;
use scanflow_app::job::{FormatUnpacker, JobContext, ShellTools};
use scanflow_app::meta::{self, MetaOptions, ProjectSelection};
use scanflow_app::orchestrate::{self, RunOptions};
use scanflow_app::paths::OutputTree;
use scanflow_app::state::{BatchLog, MetaMarkers, UnitTracker};
use scanflow_app::throttle::{PbsQueue, SystemClock, WaitPolicy};

fn main() {
    let cli = Cli::parse();
    init_tracing(determine_log_level(cli.verbose));

    if let Err(err) = run(cli) {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn determine_log_level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("tracing subscriber already set; skipping re-initialization");
    }
}

fn run(cli: Cli) -> Result<(), AppError> {
    let cfg = config::load()?;
    match cli.command {
        Commands::Run(args) => run_batches(args, &cfg),
        Commands::Job(args) => run_single_unit(args, &cfg),
        Commands::Meta(args) => run_meta(args, &cfg),
        Commands::Cleanup(args) => run_cleanup(args, &cfg),
    }
}

fn output_tree(outfolder: Option<PathBuf>, cfg: &AppConfig) -> Result<OutputTree, AppError> {
    let root = outfolder.unwrap_or_else(|| cfg.output_root.clone());
    Ok(OutputTree::new(root)?)
}

fn run_batches(args: RunArgs, cfg: &AppConfig) -> Result<(), AppError> {
    let raw_root = args.raw_root.unwrap_or_else(|| cfg.raw_root.clone());
    let tree = output_tree(args.outfolder, cfg)?;
    let today = Local::now().date_naive();
    let selector = Selector::parse(&args.date, today)?;

    let batch_log = BatchLog::new(tree.clone());
    let tracker = UnitTracker::new(tree.clone());
    let policy = WaitPolicy {
        ceiling: cfg.throttle.max_jobs,
        poll_interval: cfg.throttle.poll_interval(),
    };
    let queue = PbsQueue::new(&cfg.scheduler);
    let clock = SystemClock;
    let opts = RunOptions {
        force: args.force,
        dry_run: args.dry_run,
    };

    if args.inline {
        let markers = MetaMarkers::new(tree.clone());
        let tools = ShellTools::new(&cfg.tools);
        let unpacker = FormatUnpacker;
        let executor = InlineExecutor::new(JobContext {
            batch: "",
            tree: &tree,
            tracker: &tracker,
            markers: &markers,
            tools: &tools,
            unpacker: &unpacker,
        });
        orchestrate::run_batches(
            &raw_root, &selector, today, &batch_log, &tracker, &executor, &queue, &clock, &policy,
            opts,
        )?;
    } else {
        let executor = SchedulerExecutor::new(&cfg.scheduler, tree.root());
        orchestrate::run_batches(
            &raw_root, &selector, today, &batch_log, &tracker, &executor, &queue, &clock, &policy,
            opts,
        )?;
    }
    Ok(())
}

fn run_single_unit(args: JobArgs, cfg: &AppConfig) -> Result<(), AppError> {
    let tree = output_tree(args.outfolder, cfg)?;
    let Some(unit) = discovery::unit_from_path(&args.unit) else {
        tracing::warn!(path = %args.unit.display(), "not a directory or recognized archive, nothing to do");
        return Ok(());
    };
    let tracker = UnitTracker::new(tree.clone());
    let markers = MetaMarkers::new(tree.clone());
    let tools = ShellTools::new(&cfg.tools);
    let unpacker = FormatUnpacker;
    let ctx = JobContext {
        batch: &args.batch,
        tree: &tree,
        tracker: &tracker,
        markers: &markers,
        tools: &tools,
        unpacker: &unpacker,
    };
    let state = scanflow_app::job::run_unit(&ctx, &unit)?;
    tracing::info!(unit = %unit.name, state = ?state, "unit finished");
    Ok(())
}

fn run_meta(args: MetaArgs, cfg: &AppConfig) -> Result<(), AppError> {
    let tree = output_tree(args.outfolder, cfg)?;
    let markers = MetaMarkers::new(tree.clone());
    let selection = match (args.project, args.all) {
        (Some(project), _) => ProjectSelection::Explicit(project),
        (None, true) => ProjectSelection::All,
        (None, false) => ProjectSelection::Pending,
    };
    let opts = MetaOptions {
        attributes: args.attributes,
        wait_minutes: args.wait_minutes,
        dry_run: args.dry_run,
    };
    let tools = ShellTools::new(&cfg.tools);
    let summary = meta::reconcile(&tree, &markers, &selection, &opts, &tools, &SystemClock)?;
    tracing::info!(
        projects = summary.projects,
        rows = summary.rows,
        "metadata reconciliation finished"
    );
    Ok(())
}

fn run_cleanup(args: CleanupArgs, cfg: &AppConfig) -> Result<(), AppError> {
    let tree = output_tree(args.outfolder, cfg)?;
    let summary = cleanup::cleanup_reported_sessions(&tree, args.dry_run)?;
    tracing::info!(
        sessions = summary.sessions,
        files = summary.files,
        "cleanup finished"
    );
    Ok(())
}
