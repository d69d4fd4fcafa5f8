use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::Error;
use crate::overwrite::{Negotiator, Resolution};
use crate::preserve;
use crate::progress::Progress;
use crate::render::RenderGate;
use crate::summary::{Abort, Failure, Report};
use crate::walk::{ItemKind, TransferPlan, WorkItem};

const MIB: u64 = 1024 * 1024;

/// Files at least this large are split when parallel copy is on.
pub const DEFAULT_CHUNK_THRESHOLD: u64 = 64 * MIB;
pub const DEFAULT_CHUNK_SIZE: u64 = 32 * MIB;
pub const DEFAULT_BUFFER_SIZE: usize = 16 * MIB as usize;

#[derive(Copy, Clone, Debug)]
pub struct Settings {
    /// Worker pool size for parallel copy, `None` copies one item at a time.
    pub workers: Option<usize>,
    pub chunk_threshold: u64,
    pub chunk_size: u64,
    pub buffer_size: usize,
    pub preserve: preserve::Settings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: None,
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            preserve: preserve::Settings::default(),
        }
    }
}

impl Settings {
    pub fn should_chunk(&self, size: u64) -> bool {
        self.workers.is_some() && size > 0 && size >= self.chunk_threshold
    }

    fn pool_size(&self) -> usize {
        self.workers.unwrap_or(1).max(1)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChunkRange {
    pub offset: u64,
    pub length: u64,
}

/// Splits `[0, file_size)` into consecutive ranges of `chunk_size`, the last one possibly shorter.
pub fn plan_chunks(file_size: u64, chunk_size: u64) -> Vec<ChunkRange> {
    let chunk_size = chunk_size.max(1);
    let mut ranges = Vec::with_capacity(file_size.div_ceil(chunk_size) as usize);
    let mut offset = 0;
    while offset < file_size {
        let length = chunk_size.min(file_size - offset);
        ranges.push(ChunkRange { offset, length });
        offset += length;
    }
    ranges
}

/// State shared by every chunk of one file; the last chunk to finish settles the file.
#[derive(Debug)]
struct ChunkedFile {
    index: usize,
    item: WorkItem,
    destination: PathBuf,
    metadata: std::fs::Metadata,
    source: std::fs::File,
    target: std::fs::File,
    remaining: AtomicUsize,
    abandoned: AtomicBool,
    failure: parking_lot::Mutex<Option<Error>>,
    name: String,
}

impl ChunkedFile {
    fn fail(&self, error: Error) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(error);
        }
    }

    fn has_failed(&self) -> bool {
        self.failure.lock().is_some()
    }

    /// Returns the outcome once every chunk is accounted for.
    fn complete_chunk(&self, settings: &Settings, progress: &Progress) -> Option<Outcome> {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return None;
        }
        progress.advance(0, true, &self.name);
        let failure = self.failure.lock().take();
        let result = match failure {
            Some(error) => Err(error),
            None if self.abandoned.load(Ordering::Acquire) => Ok(Done::Abandoned),
            None => {
                if let Err(error) = self.target.sync_data() {
                    Err(Error::from_io(&self.destination, error))
                } else {
                    preserve::apply_or_warn(&settings.preserve, &self.metadata, &self.destination);
                    Ok(Done::Copied {
                        kind: ItemKind::File,
                        bytes: self.item.size,
                    })
                }
            }
        };
        if !matches!(result, Ok(Done::Copied { .. })) {
            tracing::debug!("removing partial destination {:?}", &self.destination);
            if let Err(error) = std::fs::remove_file(&self.destination) {
                tracing::warn!(
                    "failed removing partial file {:?}: {}",
                    &self.destination,
                    error
                );
            }
        }
        Some(Outcome {
            index: self.index,
            result,
        })
    }
}

#[derive(Debug)]
enum Job {
    Whole { index: usize, item: WorkItem },
    Chunk { file: Arc<ChunkedFile>, range: ChunkRange },
}

#[derive(Debug)]
enum Done {
    Copied { kind: ItemKind, bytes: u64 },
    Abandoned,
}

#[derive(Debug)]
struct Outcome {
    index: usize,
    result: Result<Done, Error>,
}

fn create_parent(destination: &Path) -> Result<(), Error> {
    if let Some(parent) = destination.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|err| Error::from_io(parent, err))?;
        }
    }
    Ok(())
}

fn copy_symlink(item: &WorkItem, destination: &Path, settings: &Settings) -> Result<Done, Error> {
    let target =
        std::fs::read_link(&item.source).map_err(|err| Error::from_io(&item.source, err))?;
    create_parent(destination)?;
    if let Ok(existing) = std::fs::symlink_metadata(destination) {
        if existing.is_dir() {
            return Err(Error::IsDirectory {
                path: destination.to_owned(),
            });
        }
        std::fs::remove_file(destination).map_err(|err| Error::from_io(destination, err))?;
    }
    std::os::unix::fs::symlink(&target, destination)
        .map_err(|err| Error::from_io(destination, err))?;
    if let Ok(metadata) = std::fs::symlink_metadata(&item.source) {
        preserve::apply_or_warn(&settings.preserve, &metadata, destination);
    }
    Ok(Done::Copied {
        kind: ItemKind::Symlink,
        bytes: 0,
    })
}

/// Sequential copy through one reusable buffer; progress moves once per buffer.
fn copy_whole(
    item: &WorkItem,
    destination: &Path,
    settings: &Settings,
    progress: &Progress,
    cancel: &CancellationToken,
) -> Result<Done, Error> {
    use std::io::{Read, Write};
    let name = item.display_name();
    let mut counted = 0u64;
    let result = (|| -> Result<Done, Error> {
        let metadata =
            std::fs::metadata(&item.source).map_err(|err| Error::from_io(&item.source, err))?;
        let mut reader =
            std::fs::File::open(&item.source).map_err(|err| Error::from_io(&item.source, err))?;
        create_parent(destination)?;
        let mut writer =
            std::fs::File::create(destination).map_err(|err| Error::from_io(destination, err))?;
        let capacity = settings.buffer_size.min(item.size.max(1) as usize).max(1);
        let mut buffer = vec![0u8; capacity];
        let mut copied = 0u64;
        loop {
            if cancel.is_cancelled() {
                drop(writer);
                if let Err(error) = std::fs::remove_file(destination) {
                    tracing::warn!("failed removing partial file {:?}: {}", destination, error);
                }
                return Ok(Done::Abandoned);
            }
            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::from_io(&item.source, err)),
            };
            writer
                .write_all(&buffer[..n])
                .map_err(|err| Error::from_io(destination, err))?;
            copied += n as u64;
            counted += n as u64;
            progress.advance(n as u64, false, &name);
        }
        drop(writer);
        preserve::apply_or_warn(&settings.preserve, &metadata, destination);
        Ok(Done::Copied {
            kind: ItemKind::File,
            bytes: copied,
        })
    })();
    progress.advance(item.size.saturating_sub(counted), true, &name);
    result
}

fn copy_range(file: &ChunkedFile, range: ChunkRange, buffer_size: usize) -> Result<(), Error> {
    let capacity = buffer_size.min(range.length as usize).max(1);
    let mut buffer = vec![0u8; capacity];
    let end = range.offset + range.length;
    let mut offset = range.offset;
    while offset < end {
        let n = capacity.min((end - offset) as usize);
        file.source
            .read_exact_at(&mut buffer[..n], offset)
            .map_err(|err| Error::from_io(&file.item.source, err))?;
        file.target
            .write_all_at(&buffer[..n], offset)
            .map_err(|err| Error::from_io(&file.destination, err))?;
        offset += n as u64;
    }
    Ok(())
}

/// `stop` ends work between jobs and chunks, `cancel` also interrupts a file mid-copy.
fn run_job(
    job: Job,
    settings: &Settings,
    progress: &Progress,
    stop: &CancellationToken,
    cancel: &CancellationToken,
) -> Option<Outcome> {
    match job {
        Job::Whole { index, item } => {
            let Some(destination) = item.destination.clone() else {
                return Some(Outcome {
                    index,
                    result: Err(Error::InvalidArgument(format!(
                        "no destination for {:?}",
                        &item.source
                    ))),
                });
            };
            let result = if stop.is_cancelled() {
                progress.advance(item.size, true, &item.display_name());
                Ok(Done::Abandoned)
            } else if item.kind == ItemKind::Symlink {
                let result = copy_symlink(&item, &destination, settings);
                progress.advance(0, true, &item.display_name());
                result
            } else {
                copy_whole(&item, &destination, settings, progress, cancel)
            };
            Some(Outcome { index, result })
        }
        Job::Chunk { file, range } => {
            if stop.is_cancelled() {
                file.abandoned.store(true, Ordering::Release);
            } else if !file.has_failed() {
                if let Err(error) = copy_range(&file, range, settings.buffer_size) {
                    tracing::debug!("chunk at offset {} failed: {}", range.offset, &error);
                    file.fail(error);
                }
            }
            progress.advance(range.length, false, &file.name);
            file.complete_chunk(settings, progress)
        }
    }
}

/// What is left to account for when the task running a job dies.
#[derive(Debug)]
enum LostJob {
    Whole { index: usize, source: PathBuf },
    Chunk { file: Arc<ChunkedFile>, range: ChunkRange },
}

impl LostJob {
    fn of(job: &Job) -> Self {
        match job {
            Job::Whole { index, item } => LostJob::Whole {
                index: *index,
                source: item.source.clone(),
            },
            Job::Chunk { file, range } => LostJob::Chunk {
                file: file.clone(),
                range: *range,
            },
        }
    }

    fn path(&self) -> &Path {
        match self {
            LostJob::Whole { source, .. } => source,
            LostJob::Chunk { file, .. } => &file.destination,
        }
    }

    /// A lost chunk fails its file and still counts down, so the file reports once.
    fn settle(self, error: Error, settings: &Settings, progress: &Progress) -> Option<Outcome> {
        match self {
            LostJob::Whole { index, .. } => Some(Outcome {
                index,
                result: Err(error),
            }),
            LostJob::Chunk { file, range } => {
                file.fail(error);
                progress.advance(range.length, false, &file.name);
                file.complete_chunk(settings, progress)
            }
        }
    }
}

async fn worker(
    jobs: async_channel::Receiver<Job>,
    outcomes: tokio::sync::mpsc::UnboundedSender<Outcome>,
    settings: Settings,
    progress: Arc<Progress>,
    stop: CancellationToken,
    cancel: CancellationToken,
) {
    while let Ok(job) = jobs.recv().await {
        let job_progress = progress.clone();
        let job_stop = stop.clone();
        let job_cancel = cancel.clone();
        let lost = LostJob::of(&job);
        let outcome = match tokio::task::spawn_blocking(move || {
            run_job(job, &settings, &job_progress, &job_stop, &job_cancel)
        })
        .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!("copy task failed: {}", err);
                let error = Error::Io {
                    path: lost.path().to_owned(),
                    source: std::io::Error::other(err.to_string()),
                };
                lost.settle(error, &settings, &progress)
            }
        };
        if let Some(outcome) = outcome {
            if outcome.result.as_ref().is_err_and(|err| err.is_fatal()) {
                cancel.cancel();
            }
            // coordinator gone means the operation is over
            let _ = outcomes.send(outcome);
        }
    }
}

/// True when writing `destination` would write over the source of `item`.
async fn writes_onto_source(item: &WorkItem, destination: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    let (source, target) = if item.kind == ItemKind::Symlink {
        (
            tokio::fs::symlink_metadata(&item.source).await,
            tokio::fs::symlink_metadata(destination).await,
        )
    } else {
        (
            tokio::fs::metadata(&item.source).await,
            tokio::fs::metadata(destination).await,
        )
    };
    match (source, target) {
        (Ok(source), Ok(target)) => source.dev() == target.dev() && source.ino() == target.ino(),
        _ => false,
    }
}

/// Opens both ends and pre-sizes the destination so chunks can land at any offset.
fn prepare_chunked(
    index: usize,
    item: &WorkItem,
    destination: &Path,
    ranges: usize,
) -> Result<ChunkedFile, Error> {
    let metadata =
        std::fs::metadata(&item.source).map_err(|err| Error::from_io(&item.source, err))?;
    let source =
        std::fs::File::open(&item.source).map_err(|err| Error::from_io(&item.source, err))?;
    create_parent(destination)?;
    let target = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(destination)
        .map_err(|err| Error::from_io(destination, err))?;
    if let Err(err) = target.set_len(item.size) {
        drop(target);
        let _ = std::fs::remove_file(destination);
        return Err(Error::from_io(destination, err));
    }
    Ok(ChunkedFile {
        index,
        item: item.clone(),
        destination: destination.to_owned(),
        metadata,
        source,
        target,
        remaining: AtomicUsize::new(ranges),
        abandoned: AtomicBool::new(false),
        failure: parking_lot::Mutex::new(None),
        name: item.display_name(),
    })
}

struct Tally<'a> {
    plan: &'a TransferPlan,
    report: Report,
}

impl Tally<'_> {
    fn record(&mut self, outcome: Outcome) {
        let Some(item) = self.plan.items.get(outcome.index) else {
            return;
        };
        match outcome.result {
            Ok(Done::Copied { kind, bytes }) => {
                self.report.summary.bytes += bytes;
                match kind {
                    ItemKind::File => self.report.summary.files += 1,
                    ItemKind::Symlink => self.report.summary.symlinks += 1,
                    ItemKind::Directory => self.report.summary.directories += 1,
                }
            }
            Ok(Done::Abandoned) => self.report.summary.skipped += 1,
            Err(error) => {
                tracing::error!("{:?}: {}", &item.source, &error);
                self.report
                    .record_failure(Failure::new(item.source.clone(), error));
            }
        }
    }
}

/// Copies every item of `plan` to its destination.
///
/// Collisions are settled by `negotiator` before an item is dispatched, and an
/// item whose destination is its own source fails without being touched. Files
/// at or above the chunk threshold are split across the worker pool when
/// parallel copy is enabled; a file with any failed or abandoned chunk is
/// removed rather than left partial. A "quit" answer lets running jobs and
/// chunks finish and abandons the rest. A fatal failure or cancellation also
/// interrupts sequential copies mid-file.
#[instrument(skip(plan, progress, negotiator, gate, cancel))]
pub async fn copy(
    plan: &TransferPlan,
    settings: &Settings,
    progress: &Arc<Progress>,
    negotiator: &mut Negotiator,
    gate: &RenderGate,
    cancel: &CancellationToken,
) -> Report {
    let run_cancel = cancel.child_token();
    let stop = run_cancel.child_token();
    let pool_size = settings.pool_size();
    let (job_tx, job_rx) = async_channel::bounded::<Job>(pool_size * 2);
    let (outcome_tx, mut outcome_rx) = tokio::sync::mpsc::unbounded_channel::<Outcome>();
    let mut workers = tokio::task::JoinSet::new();
    for _ in 0..pool_size {
        workers.spawn(worker(
            job_rx.clone(),
            outcome_tx.clone(),
            *settings,
            progress.clone(),
            stop.clone(),
            run_cancel.clone(),
        ));
    }
    drop(job_rx);
    drop(outcome_tx);
    let mut tally = Tally {
        plan,
        report: Report::default(),
    };
    let mut directories = Vec::new();
    for (index, item) in plan.items.iter().enumerate() {
        while let Ok(outcome) = outcome_rx.try_recv() {
            tally.record(outcome);
        }
        if tally.report.aborted.is_some() {
            run_cancel.cancel();
        }
        if run_cancel.is_cancelled() {
            break;
        }
        let Some(destination) = item.destination.clone() else {
            tally.record(Outcome {
                index,
                result: Err(Error::InvalidArgument(format!(
                    "no destination for {:?}",
                    &item.source
                ))),
            });
            continue;
        };
        let name = item.display_name();
        if item.kind == ItemKind::Directory {
            // workers may still be filling earlier directories, creation order is what matters
            let result = tokio::fs::create_dir_all(&destination)
                .await
                .map_err(|err| Error::from_io(&destination, err));
            progress.advance(0, true, &name);
            match result {
                Ok(()) => {
                    tally.report.summary.directories += 1;
                    directories.push((item.source.clone(), destination));
                }
                Err(error) => tally.record(Outcome {
                    index,
                    result: Err(error),
                }),
            }
            continue;
        }
        if writes_onto_source(item, &destination).await {
            progress.advance(item.size, true, &name);
            tally.record(Outcome {
                index,
                result: Err(Error::InvalidArgument(format!(
                    "{:?} and {:?} are the same file",
                    &item.source, &destination
                ))),
            });
            continue;
        }
        let resolution = match negotiator.resolve(&destination, gate, &run_cancel).await {
            Ok(resolution) => resolution,
            Err(error) => {
                progress.advance(item.size, true, &name);
                tally.record(Outcome {
                    index,
                    result: Err(error),
                });
                continue;
            }
        };
        match resolution {
            Resolution::Write => {}
            Resolution::Skip => {
                tracing::info!("skipping {:?}, destination exists", &destination);
                progress.advance(item.size, true, &name);
                tally.report.summary.skipped += 1;
                continue;
            }
            Resolution::Abort => {
                if !run_cancel.is_cancelled() {
                    tracing::info!("user quit at {:?}", &destination);
                    // files already being written finish, nothing new starts
                    tally.report.aborted.get_or_insert(Abort::Quit);
                    stop.cancel();
                }
                break;
            }
        }
        if item.kind == ItemKind::File && settings.should_chunk(item.size) {
            let ranges = plan_chunks(item.size, settings.chunk_size);
            let prepared = {
                let item = item.clone();
                let destination = destination.clone();
                let count = ranges.len();
                tokio::task::spawn_blocking(move || {
                    prepare_chunked(index, &item, &destination, count)
                })
                .await
                .unwrap_or_else(|err| {
                    Err(Error::InvalidArgument(format!("copy task failed: {err}")))
                })
            };
            let file = match prepared {
                Ok(file) => Arc::new(file),
                Err(error) => {
                    progress.advance(item.size, true, &name);
                    tally.record(Outcome {
                        index,
                        result: Err(error),
                    });
                    continue;
                }
            };
            tracing::info!(
                "{:?}: parallel mode: {} workers, {} chunks of {}",
                &item.source,
                pool_size,
                ranges.len(),
                bytesize::ByteSize(settings.chunk_size)
            );
            // every range is sent so the shared counter always reaches zero
            for range in ranges {
                if job_tx
                    .send(Job::Chunk {
                        file: file.clone(),
                        range,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        } else if job_tx
            .send(Job::Whole {
                index,
                item: item.clone(),
            })
            .await
            .is_err()
        {
            break;
        }
    }
    job_tx.close();
    while let Some(result) = workers.join_next().await {
        if let Err(error) = result {
            tracing::error!("copy worker failed: {}", error);
        }
    }
    while let Some(outcome) = outcome_rx.recv().await {
        tally.record(outcome);
    }
    let mut report = tally.report;
    if report.aborted.is_none() && run_cancel.is_cancelled() {
        report.aborted = Some(Abort::Interrupted);
    }
    // directory times last, after their contents stopped changing
    for (source, destination) in directories.iter().rev() {
        if let Ok(metadata) = tokio::fs::metadata(source).await {
            preserve::apply_or_warn(&settings.preserve, &metadata, destination);
        }
    }
    report
}
