use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Weight of the newest sample in the smoothed rate.
pub const SMOOTHING_FACTOR: f64 = 0.5;

/// Samples closer together than this reuse the previous rate.
pub const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct TlsCounter {
    // each thread bumps its own slot, readers sum all of them
    count: thread_local::ThreadLocal<AtomicU64>,
}

impl TlsCounter {
    pub fn new() -> Self {
        Self {
            count: thread_local::ThreadLocal::new(),
        }
    }

    pub fn add(&self, value: u64) {
        self.count
            .get_or(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.count
            .iter()
            .fold(0, |x, y| x + y.load(Ordering::Relaxed))
    }
}

impl Default for TlsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponentially smoothed throughput over a monotonically growing byte count.
#[derive(Debug)]
pub struct RateEstimator {
    last: Option<(Instant, u64)>,
    rate: f64,
}

impl RateEstimator {
    pub fn new() -> Self {
        Self {
            last: None,
            rate: 0.0,
        }
    }

    /// Folds in the byte count observed at `now` and returns the smoothed rate in bytes/s.
    pub fn sample(&mut self, bytes_done: u64, now: Instant) -> f64 {
        let Some((prev_time, prev_bytes)) = self.last else {
            self.last = Some((now, bytes_done));
            return self.rate;
        };
        let elapsed = now.saturating_duration_since(prev_time);
        if elapsed < MIN_SAMPLE_INTERVAL {
            return self.rate;
        }
        let instant = bytes_done.saturating_sub(prev_bytes) as f64 / elapsed.as_secs_f64();
        self.rate = if self.rate == 0.0 {
            instant
        } else {
            SMOOTHING_FACTOR * instant + (1.0 - SMOOTHING_FACTOR) * self.rate
        };
        self.last = Some((now, bytes_done));
        self.rate
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub bytes_done: u64,
    pub items_done: u64,
    pub total_bytes: u64,
    pub total_items: u64,
    pub current: String,
    pub elapsed: Duration,
    /// Smoothed bytes per second.
    pub rate: f64,
}

impl Snapshot {
    /// Percent complete by bytes, or by items when there are no bytes to move.
    pub fn percent(&self) -> f64 {
        if self.total_bytes > 0 {
            (100.0 * self.bytes_done as f64 / self.total_bytes as f64).min(100.0)
        } else if self.total_items > 0 {
            (100.0 * self.items_done as f64 / self.total_items as f64).min(100.0)
        } else {
            100.0
        }
    }
}

/// Shared progress state, updated concurrently by every worker.
#[derive(Debug)]
pub struct Progress {
    bytes_done: TlsCounter,
    items_done: TlsCounter,
    total_bytes: u64,
    total_items: u64,
    current: parking_lot::Mutex<String>,
    estimator: parking_lot::Mutex<RateEstimator>,
    start_time: Instant,
}

impl Progress {
    pub fn new(total_items: u64, total_bytes: u64) -> Self {
        Self {
            bytes_done: TlsCounter::new(),
            items_done: TlsCounter::new(),
            total_bytes,
            total_items,
            current: parking_lot::Mutex::new(String::new()),
            estimator: parking_lot::Mutex::new(RateEstimator::new()),
            start_time: Instant::now(),
        }
    }

    pub fn advance(&self, bytes: u64, item_completed: bool, current_name: &str) {
        if bytes > 0 {
            self.bytes_done.add(bytes);
        }
        if item_completed {
            self.items_done.inc();
        }
        let mut current = self.current.lock();
        if *current != current_name {
            current.clear();
            current.push_str(current_name);
        }
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done.get()
    }

    pub fn items_done(&self) -> u64 {
        self.items_done.get()
    }

    /// Reads the counters and advances the rate estimate; meant for the single renderer.
    pub fn sample(&self) -> Snapshot {
        self.sample_at(Instant::now())
    }

    pub fn sample_at(&self, now: Instant) -> Snapshot {
        let bytes_done = self.bytes_done.get();
        let rate = self.estimator.lock().sample(bytes_done, now);
        Snapshot {
            bytes_done,
            items_done: self.items_done.get(),
            total_bytes: self.total_bytes,
            total_items: self.total_items,
            current: self.current.lock().clone(),
            elapsed: now.saturating_duration_since(self.start_time),
            rate,
        }
    }
}
