use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::Error;
use crate::overwrite::Prompt;
use crate::progress::Progress;
use crate::summary::{Abort, Failure, Report};
use crate::walk::{ItemKind, TransferPlan, WorkItem};

pub const DEFAULT_COUNTDOWN: Duration = Duration::from_secs(3);

#[derive(Copy, Clone, Debug)]
pub struct Settings {
    /// Files and symlinks removed concurrently.
    pub max_width: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self { max_width: 16 }
    }
}

async fn remove_entry(item: WorkItem, progress: Arc<Progress>) -> (WorkItem, Result<(), Error>) {
    tracing::debug!("remove: {:?}", &item.source);
    let result = tokio::fs::remove_file(&item.source)
        .await
        .map_err(|err| Error::from_io(&item.source, err));
    progress.advance(item.size, true, &item.display_name());
    (item, result)
}

fn record(report: &mut Report, item: &WorkItem, result: Result<(), Error>) {
    match result {
        Ok(()) => match item.kind {
            ItemKind::File => {
                report.summary.files += 1;
                report.summary.bytes += item.size;
            }
            ItemKind::Symlink => report.summary.symlinks += 1,
            ItemKind::Directory => report.summary.directories += 1,
        },
        Err(error) => {
            tracing::error!("{:?}: {}", &item.source, &error);
            report.record_failure(Failure::new(item.source.clone(), error));
        }
    }
}

/// Removes everything in `plan`.
///
/// Files and symlinks go first, concurrently. Directories follow in reverse
/// enumeration order so each one is empty by the time it is removed; one whose
/// contents could not all be removed fails on its own.
#[instrument(skip(plan, progress, cancel))]
pub async fn rm(
    plan: &TransferPlan,
    settings: &Settings,
    progress: &Arc<Progress>,
    cancel: &CancellationToken,
) -> Report {
    let mut report = Report::default();
    let mut join_set = tokio::task::JoinSet::new();
    for item in plan.entries() {
        if cancel.is_cancelled() || report.aborted.is_some() {
            break;
        }
        if join_set.len() >= settings.max_width.max(1) {
            if let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((done, result)) => record(&mut report, &done, result),
                    Err(error) => tracing::error!("remove task failed: {}", error),
                }
            }
        }
        join_set.spawn(remove_entry(item.clone(), progress.clone()));
    }
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((done, result)) => record(&mut report, &done, result),
            Err(error) => tracing::error!("remove task failed: {}", error),
        }
    }
    for item in plan.directories().collect::<Vec<_>>().into_iter().rev() {
        if cancel.is_cancelled() || report.aborted.is_some() {
            break;
        }
        tracing::debug!("remove directory: {:?}", &item.source);
        let result = tokio::fs::remove_dir(&item.source)
            .await
            .map_err(|err| Error::from_io(&item.source, err));
        progress.advance(0, true, &item.display_name());
        record(&mut report, item, result);
    }
    if report.aborted.is_none() && cancel.is_cancelled() {
        report.aborted = Some(Abort::Interrupted);
    }
    report
}

pub const CONFIRM_QUESTION: &str = "Continue? [y/N]: ";

/// Yes and no, with an empty answer meaning no.
pub fn parse_confirmation(input: &str) -> Option<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" | "" => Some(false),
        _ => None,
    }
}

/// Shows what is about to go, waits out `countdown`, then asks once for consent.
///
/// End of input declines. An interrupt during the wait or the question is
/// reported as [`Error::UserAborted`].
pub async fn confirm(
    plan: &TransferPlan,
    prompt: Arc<dyn Prompt>,
    countdown: Duration,
    cancel: &CancellationToken,
) -> Result<bool, Error> {
    eprintln!(
        "⚠️  Will delete {} files ({})",
        plan.entries().count(),
        bytesize::ByteSize(plan.total_bytes)
    );
    for remaining in (1..=countdown.as_secs()).rev() {
        eprint!("\rWait {remaining}s before confirming...  ");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            _ = cancel.cancelled() => {
                eprintln!();
                return Err(Error::UserAborted);
            }
        }
    }
    if countdown.as_secs() > 0 {
        eprint!("\r{:40}\r", "");
    }
    loop {
        let ask = {
            let prompt = prompt.clone();
            tokio::task::spawn_blocking(move || prompt.ask(CONFIRM_QUESTION))
        };
        let answer = tokio::select! {
            answer = ask => answer
                .map_err(|err| Error::InvalidArgument(format!("confirmation failed: {err}")))?
                .map_err(|err| Error::Io { path: "<stdin>".into(), source: err })?,
            _ = cancel.cancelled() => return Err(Error::UserAborted),
        };
        let Some(line) = answer else {
            return Ok(false);
        };
        match parse_confirmation(&line) {
            Some(decision) => return Ok(decision),
            None => prompt.notify("Invalid option. Use: y (yes) or n (no)"),
        }
    }
}
