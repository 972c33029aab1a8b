//! Rolling throughput and latency statistics.
//!
//! Three sample windows are kept: the last 60 and 300 samples (the "1 minute"
//! and "5 minute" averages) and the last 1000 samples for percentiles. The two
//! averaging windows also drop samples older than 60 s / 300 s, so a quiet
//! proxy does not keep reporting latencies from long ago.

use crate::model::StatsSnapshot;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const ONE_MINUTE_SAMPLES: usize = 60;
pub const FIVE_MINUTE_SAMPLES: usize = 300;
pub const OVERALL_SAMPLES: usize = 1000;

/// FIFO window capped by sample count and, optionally, by sample age.
#[derive(Debug)]
struct RollingWindow {
    cap: usize,
    max_age: Option<Duration>,
    samples: VecDeque<(Instant, Duration)>,
}

impl RollingWindow {
    fn new(cap: usize, max_age: Option<Duration>) -> Self {
        Self {
            cap,
            max_age,
            samples: VecDeque::with_capacity(cap),
        }
    }

    fn push(&mut self, at: Instant, duration: Duration) {
        if self.samples.len() >= self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back((at, duration));
        self.expire(at);
    }

    fn expire(&mut self, now: Instant) {
        let Some(max_age) = self.max_age else {
            return;
        };
        while let Some((at, _)) = self.samples.front() {
            if now.saturating_duration_since(*at) > max_age {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn mean_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let total: Duration = self.samples.iter().map(|(_, d)| *d).sum();
        as_ms(total) / self.samples.len() as f64
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    fn clear(&mut self) {
        self.samples.clear();
    }
}

#[derive(Debug)]
struct Inner {
    total: u64,
    open: u64,
    one_minute: RollingWindow,
    five_minutes: RollingWindow,
    overall: RollingWindow,
}

/// Shared statistics aggregate. Every mutation and read takes the same lock.
#[derive(Debug)]
pub struct StatsTracker {
    inner: Mutex<Inner>,
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                total: 0,
                open: 0,
                one_minute: RollingWindow::new(ONE_MINUTE_SAMPLES, Some(Duration::from_secs(60))),
                five_minutes: RollingWindow::new(
                    FIVE_MINUTE_SAMPLES,
                    Some(Duration::from_secs(300)),
                ),
                overall: RollingWindow::new(OVERALL_SAMPLES, None),
            }),
        }
    }

    /// Record one completed transaction.
    pub fn record_sample(&self, duration: Duration) {
        self.record_sample_at(duration, Instant::now());
    }

    pub(crate) fn record_sample_at(&self, duration: Duration, at: Instant) {
        let mut inner = self.inner.lock();
        inner.total += 1;
        inner.one_minute.push(at, duration);
        inner.five_minutes.push(at, duration);
        inner.overall.push(at, duration);
    }

    pub fn increment_open(&self) {
        self.inner.lock().open += 1;
    }

    pub fn decrement_open(&self) {
        let mut inner = self.inner.lock();
        inner.open = inner.open.saturating_sub(1);
    }

    pub fn open_connections(&self) -> u64 {
        self.inner.lock().open
    }

    pub fn total_connections(&self) -> u64 {
        self.inner.lock().total
    }

    /// Number of samples currently held by the (1m, 5m, overall) windows.
    pub fn window_sizes(&self) -> (usize, usize, usize) {
        let inner = self.inner.lock();
        (
            inner.one_minute.len(),
            inner.five_minutes.len(),
            inner.overall.len(),
        )
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub(crate) fn snapshot_at(&self, now: Instant) -> StatsSnapshot {
        let mut inner = self.inner.lock();
        inner.one_minute.expire(now);
        inner.five_minutes.expire(now);

        let mut sorted: Vec<Duration> = inner.overall.samples.iter().map(|(_, d)| *d).collect();
        sorted.sort_unstable();

        StatsSnapshot {
            total_connections: inner.total,
            open_connections: inner.open,
            avg_response_time_1m: inner.one_minute.mean_ms(),
            avg_response_time_5m: inner.five_minutes.mean_ms(),
            p50_response_time: percentile_ms(&sorted, 50),
            p90_response_time: percentile_ms(&sorted, 90),
        }
    }

    /// Clear totals and windows. The in-flight gauge is kept, its requests
    /// still decrement it.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.total = 0;
        inner.one_minute.clear();
        inner.five_minutes.clear();
        inner.overall.clear();
    }
}

/// Index-based percentile of an ascending slice, no interpolation.
fn percentile_ms(sorted: &[Duration], pct: usize) -> f64 {
    let idx = sorted.len() * pct / 100;
    sorted.get(idx).map(|d| as_ms(*d)).unwrap_or(0.0)
}

fn as_ms(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}
