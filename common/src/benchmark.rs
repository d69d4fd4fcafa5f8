use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::copy;
use crate::error::Error;
use crate::filegen;
use crate::overwrite::Negotiator;
use crate::progress::Progress;
use crate::render::RenderGate;
use crate::tuning::{TuningRecord, TuningStore};
use crate::walk::{ItemKind, TransferPlan, WorkItem};

const MIB: u64 = 1024 * 1024;

pub const PAYLOAD_SIZE: u64 = 100 * MIB;
pub const CANDIDATES: [usize; 5] = [1, 2, 4, 6, 8];
pub const TRIALS: usize = 3;

#[derive(Clone, Debug)]
pub struct Settings {
    pub payload_size: u64,
    pub candidates: Vec<usize>,
    pub trials: usize,
    pub chunk_size: u64,
    pub buffer_size: usize,
    /// Where the scratch directory goes, the system temp dir when unset.
    pub scratch_parent: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            payload_size: PAYLOAD_SIZE,
            candidates: CANDIDATES.to_vec(),
            trials: TRIALS,
            chunk_size: copy::DEFAULT_CHUNK_SIZE,
            buffer_size: copy::DEFAULT_BUFFER_SIZE,
            scratch_parent: None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BenchmarkResult {
    pub workers: usize,
    /// Best of all trials.
    pub elapsed: Duration,
}

impl BenchmarkResult {
    pub fn throughput(&self, payload_size: u64) -> f64 {
        payload_size as f64 / self.elapsed.as_secs_f64().max(f64::EPSILON)
    }
}

#[derive(Clone, Debug)]
pub struct Outcome {
    pub results: Vec<BenchmarkResult>,
    pub optimal_workers: usize,
    pub payload_size: u64,
}

/// Fastest candidate, the lower worker count on a tie.
pub fn select_optimal(results: &[BenchmarkResult]) -> Option<usize> {
    results
        .iter()
        .min_by(|a, b| a.elapsed.cmp(&b.elapsed).then(a.workers.cmp(&b.workers)))
        .map(|result| result.workers)
}

async fn time_copy(
    plan: &TransferPlan,
    settings: &copy::Settings,
    cancel: &CancellationToken,
) -> Result<Duration, Error> {
    let progress = Arc::new(Progress::new(1, plan.total_bytes));
    let start = Instant::now();
    let report = copy::copy(
        plan,
        settings,
        &progress,
        &mut Negotiator::forced(),
        &RenderGate::default(),
        cancel,
    )
    .await;
    let elapsed = start.elapsed();
    if let Some(failure) = report.failures.into_iter().next() {
        return Err(Error::benchmark(failure.error));
    }
    if report.aborted.is_some() || cancel.is_cancelled() {
        return Err(Error::UserAborted);
    }
    Ok(elapsed)
}

/// Times the chunked copy of a synthetic payload for every candidate worker count
/// and records the fastest in `store`. The payload and its copies live in a
/// scratch directory that is gone when this returns; on any failure nothing is
/// written to `store`.
#[instrument(skip(store, cancel))]
pub async fn run(
    settings: &Settings,
    store: &TuningStore,
    cancel: &CancellationToken,
) -> Result<Outcome, Error> {
    if settings.candidates.is_empty() || settings.trials == 0 {
        return Err(Error::InvalidArgument(
            "benchmark needs at least one candidate and one trial".to_string(),
        ));
    }
    let parent = settings
        .scratch_parent
        .clone()
        .unwrap_or_else(std::env::temp_dir);
    let scratch = tempfile::Builder::new()
        .prefix("cprm-benchmark")
        .tempdir_in(&parent)
        .with_context(|| format!("failed creating scratch directory in {:?}", &parent))
        .map_err(Error::benchmark)?;
    let payload = scratch.path().join("payload.bin");
    let destination = scratch.path().join("copy.bin");
    filegen::write_random_file(&payload, settings.payload_size, settings.buffer_size)
        .await
        .map_err(Error::benchmark)?;
    let plan = TransferPlan {
        items: vec![WorkItem {
            source: payload.clone(),
            destination: Some(destination.clone()),
            kind: ItemKind::File,
            size: settings.payload_size,
        }],
        total_bytes: settings.payload_size,
        warnings: Vec::new(),
    };
    let mut results = Vec::with_capacity(settings.candidates.len());
    for &workers in &settings.candidates {
        let copy_settings = copy::Settings {
            workers: Some(workers.max(1)),
            chunk_threshold: 0,
            chunk_size: settings.chunk_size,
            buffer_size: settings.buffer_size,
            preserve: crate::preserve::Settings::none(),
        };
        let mut best: Option<Duration> = None;
        for trial in 0..settings.trials {
            let elapsed = time_copy(&plan, &copy_settings, cancel).await?;
            tracing::info!("{} workers, trial {}: {:?}", workers, trial + 1, elapsed);
            best = Some(best.map_or(elapsed, |best| best.min(elapsed)));
            tokio::fs::remove_file(&destination)
                .await
                .with_context(|| format!("failed removing {:?}", &destination))
                .map_err(Error::benchmark)?;
        }
        if let Some(elapsed) = best {
            results.push(BenchmarkResult { workers, elapsed });
        }
    }
    scratch
        .close()
        .context("failed removing benchmark scratch directory")
        .map_err(Error::benchmark)?;
    let optimal_workers = select_optimal(&results)
        .ok_or_else(|| Error::benchmark(anyhow::anyhow!("no benchmark results")))?;
    let mut record = match store.load() {
        Ok(record) => record.unwrap_or_default(),
        Err(err) => {
            tracing::warn!("{:#}, replacing it", err);
            TuningRecord::default()
        }
    };
    record.optimal_worker_count = Some(optimal_workers);
    record.benchmark_date = Some(chrono::Utc::now().to_rfc3339());
    record.benchmark_results = results
        .iter()
        .map(|result| (result.workers.to_string(), result.elapsed.as_secs_f64()))
        .collect();
    store.save(&record).map_err(Error::benchmark)?;
    Ok(Outcome {
        results,
        optimal_workers,
        payload_size: settings.payload_size,
    })
}
