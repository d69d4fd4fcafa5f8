//! Core of the `cprm` tool: progress-aware copy and delete.
//!
//! An operation first walks its sources into a [`walk::TransferPlan`] with fixed
//! totals. The plan is then either described ([`dry_run`]) or executed by the
//! copy engine ([`copy`]) or the delete engine ([`rm`]), all of which feed one
//! shared [`progress::Progress`] that a [`render::Renderer`] redraws. Parallel
//! copy splits large files into chunks spread over a worker pool whose size can
//! be autotuned by [`benchmark`] and persisted through [`tuning`].

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

pub mod benchmark;
pub mod config;
pub mod copy;
pub mod dry_run;
pub mod error;
pub mod filegen;
pub mod overwrite;
pub mod preserve;
pub mod progress;
pub mod render;
pub mod rm;
pub mod summary;
pub mod tuning;
pub mod walk;

#[cfg(test)]
mod testutils;

pub use config::{OutputConfig, RuntimeConfig};
pub use error::Error;
pub use render::{ProgressSettings, ProgressType};
pub use summary::{Abort, Failure, Operation, Report, Summary};

/// Exit status after an interrupt, as shells report SIGINT.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

fn init_tracing(output: &OutputConfig) {
    let filter = EnvFilter::builder()
        .with_default_directive(output.level_filter().into())
        .from_env_lossy();
    // a subscriber set earlier (tests, embedding) wins
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn build_runtime(runtime: &RuntimeConfig) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    builder.build().context("failed to create tokio runtime")
}

/// Runs `func` on a fresh runtime with logging set up and Ctrl-C wired to the
/// cancellation token it receives. A second Ctrl-C exits immediately.
///
/// Errors are printed unless quiet; `None` means the operation failed.
pub fn run<Fut, T>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce(CancellationToken) -> Fut,
) -> Option<T>
where
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    init_tracing(&output);
    let result = build_runtime(&runtime).and_then(|runtime| {
        let result = runtime.block_on(async {
            let cancel = CancellationToken::new();
            let signal_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                tracing::info!("interrupted, finishing in-flight work");
                signal_cancel.cancel();
                if tokio::signal::ctrl_c().await.is_ok() {
                    std::process::exit(INTERRUPTED_EXIT_CODE);
                }
            });
            func(cancel).await
        });
        // blocking readers (a pending prompt) must not hold up exit
        runtime.shutdown_background();
        result
    });
    match result {
        Ok(summary) => Some(summary),
        Err(err) => {
            if !output.quiet {
                eprintln!("{err:#}");
            }
            None
        }
    }
}
