use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::progress::{Progress, Snapshot};
use crate::summary::Operation;

/// Width given to the current item name when the terminal size is unknown.
pub const NAME_WIDTH: usize = 32;
pub const MIN_NAME_WIDTH: usize = 12;
/// Columns taken by the bar template around the message.
const BAR_OVERHEAD: usize = 41;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProgressType {
    /// Progress bar on a terminal, periodic text lines otherwise
    #[default]
    Auto,
    #[value(alias = "ProgressBar")]
    ProgressBar,
    #[value(alias = "TextUpdates")]
    TextUpdates,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct ProgressSettings {
    pub progress_type: ProgressType,
    /// Refresh interval, 200ms for the bar and 10s for text updates when unset.
    pub progress_delay: Option<Duration>,
}

fn human_rate(rate: f64) -> String {
    format!("{}/s", bytesize::ByteSize(rate.max(0.0) as u64))
}

fn human_elapsed(elapsed: Duration) -> String {
    humantime::format_duration(Duration::from_secs(elapsed.as_secs())).to_string()
}

/// Keeps the tail of `name`, the part that tells files apart.
pub fn truncate_name(name: &str, width: usize) -> String {
    let count = name.chars().count();
    if count <= width {
        return name.to_owned();
    }
    let keep = width.saturating_sub(3);
    let tail: String = name.chars().skip(count - keep).collect();
    format!("...{tail}")
}

/// Counts, sizes and speed, e.g. `3/10 | 1.0 MiB/5.0 MiB | 2s @ 512.0 KiB/s`.
pub fn format_status(snapshot: &Snapshot) -> String {
    format!(
        "{}/{} | {}/{} | {} @ {}",
        snapshot.items_done,
        snapshot.total_items,
        bytesize::ByteSize(snapshot.bytes_done),
        bytesize::ByteSize(snapshot.total_bytes),
        human_elapsed(snapshot.elapsed),
        human_rate(snapshot.rate)
    )
}

/// Room left for the current name on a line `columns` wide.
pub fn name_width(columns: Option<usize>, used: usize) -> usize {
    match columns {
        Some(columns) => columns.saturating_sub(used).max(MIN_NAME_WIDTH),
        None => NAME_WIDTH,
    }
}

fn terminal_columns() -> Option<usize> {
    console::Term::stderr()
        .size_checked()
        .map(|(_rows, columns)| columns as usize)
}

fn format_message(snapshot: &Snapshot, columns: Option<usize>, overhead: usize) -> String {
    let status = format_status(snapshot);
    if snapshot.current.is_empty() {
        return status;
    }
    let width = name_width(columns, overhead + status.chars().count() + 3);
    format!("{status} | {}", truncate_name(&snapshot.current, width))
}

/// One self-contained progress line for non-terminal output.
pub fn format_line(operation: Operation, snapshot: &Snapshot, columns: Option<usize>) -> String {
    format!(
        "{} {:>3.0}% {}",
        operation.glyph(),
        snapshot.percent(),
        format_message(snapshot, columns, 8)
    )
}

/// Lets the coordinator hide progress output while it talks to the user.
///
/// The renderer draws only while holding `output` and seeing `paused` clear, so
/// nothing is drawn between a pause and the question that follows it.
#[derive(Clone, Default)]
pub struct RenderGate {
    paused: Arc<AtomicBool>,
    output: Arc<parking_lot::Mutex<()>>,
    bar: Option<indicatif::ProgressBar>,
}

impl std::fmt::Debug for RenderGate {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RenderGate")
            .field("paused", &self.is_paused())
            .field("bar", &self.bar.is_some())
            .finish()
    }
}

impl RenderGate {
    /// Runs `f` with the bar cleared and redraws paused.
    ///
    /// While `f` runs the renderer stays clear of the bar, so a renderer
    /// finishing meanwhile never waits on `f`.
    pub fn suspend<R>(&self, f: impl FnOnce() -> R) -> R {
        {
            let _output = self.output.lock();
            self.paused.store(true, Ordering::SeqCst);
        }
        let result = match &self.bar {
            Some(bar) => bar.suspend(f),
            None => f(),
        };
        let _output = self.output.lock();
        self.paused.store(false, Ordering::SeqCst);
        result
    }

    /// Runs `draw` unless paused, excluding [`RenderGate::suspend`] meanwhile.
    fn draw_unpaused(&self, draw: impl FnOnce()) -> bool {
        let _output = self.output.lock();
        if self.is_paused() {
            return false;
        }
        draw();
        true
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

type StopSignal = Arc<(parking_lot::Mutex<bool>, parking_lot::Condvar)>;

/// Redraws progress from a dedicated thread so workers never wait on the terminal.
pub struct Renderer {
    gate: RenderGate,
    stop: StopSignal,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Renderer {
    pub fn start(
        operation: Operation,
        progress: Arc<Progress>,
        settings: &ProgressSettings,
    ) -> anyhow::Result<Self> {
        let use_bar = match settings.progress_type {
            ProgressType::Auto => std::io::stderr().is_terminal(),
            ProgressType::ProgressBar => true,
            ProgressType::TextUpdates => false,
        };
        let delay = settings.progress_delay.unwrap_or(if use_bar {
            Duration::from_millis(200)
        } else {
            Duration::from_secs(10)
        });
        let bar = if use_bar {
            let bar = indicatif::ProgressBar::with_draw_target(
                None,
                indicatif::ProgressDrawTarget::stderr(),
            );
            bar.set_style(
                indicatif::ProgressStyle::with_template(
                    "{prefix} {percent:>3}% [{bar:30.green/white}] {wide_msg}",
                )?
                .progress_chars("█▉▊▋▌▍▎▏ "),
            );
            bar.set_prefix(operation.glyph());
            Some(bar)
        } else {
            None
        };
        let gate = RenderGate {
            bar,
            ..Default::default()
        };
        let stop: StopSignal = Arc::new((parking_lot::Mutex::new(false), parking_lot::Condvar::new()));
        let thread = {
            let gate = gate.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("progress".to_string())
                .spawn(move || render_loop(operation, &progress, &gate, &stop, delay))?
        };
        Ok(Self {
            gate,
            stop,
            thread: Some(thread),
        })
    }

    pub fn gate(&self) -> &RenderGate {
        &self.gate
    }

    /// Draws a last frame and removes the bar.
    pub fn finish(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        {
            let (lock, cvar) = &*self.stop;
            *lock.lock() = true;
            cvar.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("progress thread panicked");
            }
        }
        if let Some(bar) = &self.gate.bar {
            // a question still waiting for an answer owns the bar, it was cleared for it
            if !self.gate.draw_unpaused(|| bar.finish_and_clear()) {
                eprintln!();
            }
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown();
        }
    }
}

fn draw(operation: Operation, snapshot: &Snapshot, gate: &RenderGate) {
    let columns = terminal_columns();
    match &gate.bar {
        Some(bar) => {
            if snapshot.total_bytes > 0 {
                bar.set_length(snapshot.total_bytes);
                bar.set_position(snapshot.bytes_done.min(snapshot.total_bytes));
            } else {
                bar.set_length(snapshot.total_items.max(1));
                bar.set_position(snapshot.items_done.min(snapshot.total_items));
            }
            bar.set_message(format_message(snapshot, columns, BAR_OVERHEAD));
        }
        None => eprintln!("{}", format_line(operation, snapshot, columns)),
    }
}

fn render_loop(
    operation: Operation,
    progress: &Progress,
    gate: &RenderGate,
    stop: &StopSignal,
    delay: Duration,
) {
    let (lock, cvar) = &**stop;
    let mut stopped = lock.lock();
    loop {
        if *stopped {
            break;
        }
        cvar.wait_for(&mut stopped, delay);
        if *stopped {
            break;
        }
        let snapshot = progress.sample();
        gate.draw_unpaused(|| draw(operation, &snapshot, gate));
    }
    if gate.bar.is_some() {
        let snapshot = progress.sample();
        gate.draw_unpaused(|| draw(operation, &snapshot, gate));
    }
}
