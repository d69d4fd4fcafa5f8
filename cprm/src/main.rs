use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use common::overwrite::{Negotiator, TerminalPrompt};
use common::walk::{Mode, WalkSettings};
use common::{Operation, Report};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "cprm",
    version,
    about = "Copy and remove files with a unified progress bar - cp/rm with progress",
    long_about = "`cprm` copies and removes files like `cp` and `rm` while showing one progress bar for \
the whole operation: percent, bytes, item counts, speed and the current file.

EXAMPLES:
    # Copy a directory tree
    cprm cp -r photos/ /backup/

    # Preview a copy without touching anything
    cprm cp -r -n project/ /tmp/

    # Copy a large file with chunked parallel transfer, using the tuned worker count
    cprm cp --parallel large.iso /backup/

    # Find the best worker count for this machine
    cprm benchmark

    # Remove a directory without the confirmation countdown
    cprm rm -rf build/"
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    // Progress & output
    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, don't report errors and keep output minimal
    #[arg(short = 'q', long = "quiet", global = true, help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Path of the tuning record written by `benchmark` [default: ~/.config/cprm/config.json]
    #[arg(long, value_name = "PATH", global = true, help_heading = "Advanced settings")]
    config: Option<PathBuf>,

    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        global = true,
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        global = true,
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Copy files and directories
    Cp(CpArgs),
    /// Remove files and directories
    Rm(RmArgs),
    /// Measure chunked copy speed per worker count and record the fastest
    Benchmark,
}

#[derive(clap::Args, Debug, Clone)]
struct ProgressArgs {
    /// Toggles the type of progress to show
    ///
    /// Options are: `ProgressBar` (animated progress bar), `TextUpdates` (appropriate for logging), Auto (default, will
    /// choose between `ProgressBar` or `TextUpdates` depending on the type of terminal attached to stderr)
    #[arg(long, value_name = "TYPE", ignore_case = true, help_heading = "Progress & output")]
    progress_type: Option<common::ProgressType>,

    /// Sets the delay between progress updates
    ///
    /// - For the interactive (--progress-type=ProgressBar), the default is 200ms.
    /// - For the non-interactive (--progress-type=TextUpdates), the default is 10s.
    ///
    /// This option accepts a human readable duration, e.g. "200ms", "10s", "5min" etc.
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,
}

impl ProgressArgs {
    fn settings(&self) -> Result<common::ProgressSettings> {
        let progress_delay = match &self.progress_delay {
            Some(delay) => Some(
                humantime::parse_duration(delay)
                    .with_context(|| format!("invalid --progress-delay {delay:?}"))?,
            ),
            None => None,
        };
        Ok(common::ProgressSettings {
            progress_type: self.progress_type.unwrap_or_default(),
            progress_delay,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ParallelRequest {
    Auto,
    Workers(usize),
}

impl std::str::FromStr for ParallelRequest {
    type Err = String;
    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        if value.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        match value.parse::<usize>() {
            Ok(workers) if workers >= 1 => Ok(Self::Workers(workers)),
            _ => Err(format!(
                "expected a worker count of at least 1 or \"auto\", got {value:?}"
            )),
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
struct CpArgs {
    // Copy options
    /// Copy directories recursively
    #[arg(short = 'r', short_alias = 'R', long, help_heading = "Copy options")]
    recursive: bool,

    /// Overwrite existing files without asking
    #[arg(short = 'f', long, help_heading = "Copy options")]
    force: bool,

    /// Follow symlinks in the sources instead of copying them as links
    #[arg(short = 'L', long, help_heading = "Copy options")]
    dereference: bool,

    /// Split large files into chunks copied by a worker pool
    ///
    /// Takes a worker count or "auto" (the default) for the count recorded by `cprm benchmark`,
    /// falling back to 4. Files of 64 MiB and more are split into 32 MiB chunks.
    #[arg(
        short = 'P',
        long,
        value_name = "N|auto",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "auto",
        help_heading = "Copy options"
    )]
    parallel: Option<ParallelRequest>,

    /// Show what would be copied without copying
    #[arg(short = 'n', long, help_heading = "Copy options")]
    dry_run: bool,

    #[command(flatten)]
    progress: ProgressArgs,

    // ARGUMENTS
    /// Source path(s) followed by the destination
    #[arg(required = true, num_args = 2.., value_name = "SOURCE... DEST")]
    paths: Vec<PathBuf>,
}

#[derive(clap::Args, Debug, Clone)]
struct RmArgs {
    // Removal options
    /// Remove directories and their contents recursively
    #[arg(short = 'r', short_alias = 'R', long, help_heading = "Removal options")]
    recursive: bool,

    /// Skip the countdown and confirmation question
    #[arg(short = 'f', long, help_heading = "Removal options")]
    force: bool,

    /// Show what would be removed without removing
    #[arg(short = 'n', long, help_heading = "Removal options")]
    dry_run: bool,

    /// Seconds to wait before asking for confirmation
    #[arg(long, default_value = "3", value_name = "SECS", hide = true)]
    countdown: u64,

    #[command(flatten)]
    progress: ProgressArgs,

    // ARGUMENTS
    /// Path(s) to remove
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

/// How an operation that ran to its end should exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Success,
    Failed,
    Interrupted,
}

impl Status {
    fn exit_code(self) -> i32 {
        match self {
            Status::Success => 0,
            Status::Failed => 1,
            Status::Interrupted => common::INTERRUPTED_EXIT_CODE,
        }
    }

    fn of(report: &Report) -> Self {
        match &report.aborted {
            Some(common::Abort::Interrupted) => Status::Interrupted,
            Some(common::Abort::Fatal(_)) => Status::Failed,
            // quitting at a question keeps what was done and is not a failure
            Some(common::Abort::Quit) | None if report.failures.is_empty() => Status::Success,
            Some(common::Abort::Quit) | None => Status::Failed,
        }
    }
}

fn tuning_store(args: &Args) -> Result<common::tuning::TuningStore> {
    match &args.config {
        Some(path) => Ok(common::tuning::TuningStore::at(path)),
        None => common::tuning::TuningStore::default_location(),
    }
}

async fn walk(sources: Vec<PathBuf>, mode: Mode, settings: WalkSettings) -> Result<common::walk::TransferPlan> {
    let plan = tokio::task::spawn_blocking(move || common::walk::walk(&sources, &mode, &settings))
        .await
        .context("walk task failed")??;
    for warning in &plan.warnings {
        eprintln!("Warning: {warning}");
    }
    Ok(plan)
}

fn finish(operation: Operation, mut report: Report, warnings: Vec<common::Failure>) -> Status {
    report.extend_warnings(warnings);
    println!("{}", report.render(operation));
    Status::of(&report)
}

#[instrument(skip(args, cancel))]
async fn copy_main(args: &Args, cp: &CpArgs, cancel: CancellationToken) -> Result<Status> {
    let (destination, sources) = cp
        .paths
        .split_last()
        .ok_or_else(|| anyhow!("missing destination"))?;
    let mut plan = walk(
        sources.to_vec(),
        Mode::Copy {
            destination: destination.clone(),
        },
        WalkSettings {
            recursive: cp.recursive,
            follow_symlinks: cp.dereference,
        },
    )
    .await?;
    if plan.is_empty() {
        return Err(anyhow!("no files to copy"));
    }
    if cp.dry_run {
        print!(
            "{}",
            common::dry_run::report(&plan, Operation::Copy, Some(destination))
        );
        return Ok(Status::Success);
    }
    if sources.len() > 1 {
        tokio::fs::create_dir_all(destination)
            .await
            .with_context(|| format!("cannot create destination directory {destination:?}"))?;
    }
    let workers = match cp.parallel {
        None => None,
        Some(ParallelRequest::Workers(workers)) => Some(workers),
        Some(ParallelRequest::Auto) => Some(tuning_store(args)?.optimal_workers()),
    };
    let settings = common::copy::Settings {
        workers,
        ..Default::default()
    };
    if !args.quiet {
        if let Some(workers) = workers {
            println!("🚀 Parallel copy with {workers} workers");
        }
        println!(
            "{} {} files ({})...",
            Operation::Copy.progressive(),
            plan.entries().count(),
            bytesize::ByteSize(plan.total_bytes)
        );
    }
    let progress = Arc::new(common::progress::Progress::new(
        plan.total_items() as u64,
        plan.total_bytes,
    ));
    let renderer = common::render::Renderer::start(
        Operation::Copy,
        progress.clone(),
        &cp.progress.settings()?,
    )?;
    let mut negotiator = if cp.force {
        Negotiator::forced()
    } else {
        Negotiator::new(Arc::new(TerminalPrompt))
    };
    let report = common::copy::copy(
        &plan,
        &settings,
        &progress,
        &mut negotiator,
        renderer.gate(),
        &cancel,
    )
    .await;
    renderer.finish();
    Ok(finish(
        Operation::Copy,
        report,
        std::mem::take(&mut plan.warnings),
    ))
}

#[instrument(skip(rm, cancel))]
async fn rm_main(rm: &RmArgs, cancel: CancellationToken) -> Result<Status> {
    let mut plan = walk(
        rm.paths.clone(),
        Mode::Delete,
        WalkSettings {
            recursive: rm.recursive,
            follow_symlinks: false,
        },
    )
    .await?;
    if plan.is_empty() {
        return Err(anyhow!("no files to delete"));
    }
    if rm.dry_run {
        print!("{}", common::dry_run::report(&plan, Operation::Delete, None));
        return Ok(Status::Success);
    }
    if !rm.force {
        let confirmed = common::rm::confirm(
            &plan,
            Arc::new(TerminalPrompt),
            std::time::Duration::from_secs(rm.countdown),
            &cancel,
        )
        .await;
        match confirmed {
            Ok(true) => {}
            Ok(false) => {
                println!("Operation cancelled");
                return Ok(Status::Success);
            }
            Err(common::Error::UserAborted) => {
                println!("Operation cancelled");
                return Ok(Status::Interrupted);
            }
            Err(err) => return Err(err.into()),
        }
    }
    let progress = Arc::new(common::progress::Progress::new(
        plan.total_items() as u64,
        plan.total_bytes,
    ));
    let renderer = common::render::Renderer::start(
        Operation::Delete,
        progress.clone(),
        &rm.progress.settings()?,
    )?;
    let report = common::rm::rm(&plan, &common::rm::Settings::default(), &progress, &cancel).await;
    renderer.finish();
    Ok(finish(
        Operation::Delete,
        report,
        std::mem::take(&mut plan.warnings),
    ))
}

#[instrument(skip(args, cancel))]
async fn benchmark_main(args: &Args, cancel: CancellationToken) -> Result<Status> {
    let store = tuning_store(args)?;
    let settings = common::benchmark::Settings::default();
    if !args.quiet {
        println!("🔬 Benchmarking parallel copy performance...");
        println!(
            "Test file size: {}, {} trials per worker count",
            bytesize::ByteSize(settings.payload_size),
            settings.trials
        );
    }
    let outcome = match common::benchmark::run(&settings, &store, &cancel).await {
        Ok(outcome) => outcome,
        Err(common::Error::UserAborted) => return Ok(Status::Interrupted),
        Err(err) => return Err(err.into()),
    };
    if !args.quiet {
        println!();
        println!("{:>8} {:>10} {:>14}", "Workers", "Time", "Throughput");
        for result in &outcome.results {
            println!(
                "{:>8} {:>9.2}s {:>12}/s",
                result.workers,
                result.elapsed.as_secs_f64(),
                bytesize::ByteSize(result.throughput(outcome.payload_size) as u64),
            );
        }
        println!();
    }
    println!("✅ Optimal configuration: {} workers", outcome.optimal_workers);
    if !args.quiet {
        println!("Configuration saved to: {}", store.path().display());
    }
    Ok(Status::Success)
}

#[instrument(skip(cancel))]
async fn async_main(args: Args, cancel: CancellationToken) -> Result<Status> {
    match &args.command {
        Command::Cp(cp) => copy_main(&args, cp, cancel).await,
        Command::Rm(rm) => rm_main(rm, cancel).await,
        Command::Benchmark => benchmark_main(&args, cancel).await,
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
    };
    if let Err(err) = output.validate() {
        eprintln!("Configuration error: {err}");
        std::process::exit(1);
    }
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let func = |cancel| async_main(args, cancel);
    let res = common::run(output, runtime, func);
    match res {
        Some(Status::Success) => Ok(()),
        Some(status) => std::process::exit(status.exit_code()),
        None => std::process::exit(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallel_request_parses_counts_and_auto() {
        assert_eq!("auto".parse(), Ok(ParallelRequest::Auto));
        assert_eq!("AUTO".parse(), Ok(ParallelRequest::Auto));
        assert_eq!("6".parse(), Ok(ParallelRequest::Workers(6)));
        assert!("0".parse::<ParallelRequest>().is_err());
        assert!("many".parse::<ParallelRequest>().is_err());
    }

    #[test]
    fn parallel_flag_defaults_to_auto() {
        let args = Args::try_parse_from(["cprm", "cp", "--parallel", "a", "b"]).unwrap();
        let Command::Cp(cp) = args.command else {
            panic!("expected cp");
        };
        assert_eq!(cp.parallel, Some(ParallelRequest::Auto));
        assert_eq!(cp.paths, vec![PathBuf::from("a"), PathBuf::from("b")]);

        let args = Args::try_parse_from(["cprm", "cp", "--parallel=8", "a", "b"]).unwrap();
        let Command::Cp(cp) = args.command else {
            panic!("expected cp");
        };
        assert_eq!(cp.parallel, Some(ParallelRequest::Workers(8)));
    }

    #[test]
    fn cp_needs_source_and_destination() {
        assert!(Args::try_parse_from(["cprm", "cp", "only-one"]).is_err());
        assert!(Args::try_parse_from(["cprm", "rm"]).is_err());
    }

    #[test]
    fn report_status_maps_to_exit_codes() {
        let mut report = Report::default();
        assert_eq!(Status::of(&report).exit_code(), 0);
        report.aborted = Some(common::Abort::Interrupted);
        assert_eq!(Status::of(&report).exit_code(), 130);
        report.aborted = Some(common::Abort::Quit);
        assert_eq!(Status::of(&report).exit_code(), 0);
        report.aborted = Some(common::Abort::Fatal("/x".into()));
        assert_eq!(Status::of(&report).exit_code(), 1);
    }
}
