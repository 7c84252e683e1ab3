//! Measurement state for one run.
//!
//! Latency is recorded per response. Requests and throughput are recorded
//! once per sampling tick as interval totals, so their histograms describe
//! rates rather than individual events. The run-wide rate histograms get one
//! sample per tick holding the sum over every title.

use hdrhistogram::Histogram;

use crate::error::{Error, Result};

mod report;
mod result;
mod summary;

pub use report::ShardReport;
pub use result::{RunResult, StatusCounts, TitleResult};
pub use summary::{PERCENTILES, Percentile, Summary};

pub const LATENCY_MAX_MS: u64 = 10_000;
pub const REQUESTS_MAX: u64 = 1_000_000;
pub const THROUGHPUT_MAX: u64 = 100_000_000_000;

pub(crate) fn latency_histogram() -> Result<Histogram<u64>> {
    new_histogram(LATENCY_MAX_MS, 5)
}

pub(crate) fn requests_histogram() -> Result<Histogram<u64>> {
    new_histogram(REQUESTS_MAX, 3)
}

pub(crate) fn throughput_histogram() -> Result<Histogram<u64>> {
    new_histogram(THROUGHPUT_MAX, 3)
}

fn new_histogram(high: u64, sigfig: u8) -> Result<Histogram<u64>> {
    Histogram::new_with_bounds(1, high, sigfig).map_err(|e| Error::Histogram(e.to_string()))
}

/// Bucket index 0..=4 for 1xx..5xx, `None` for anything else.
pub fn status_class(status: u16) -> Option<usize> {
    let class = (status / 100) as usize;
    (1..=5).contains(&class).then(|| class - 1)
}

/// Which responses feed counts and histograms.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordPolicy {
    /// Record latency and bytes of non-2xx responses too.
    pub include_error_stats: bool,
    /// Leave non-2xx responses out of completed counts.
    pub exclude_error_stats: bool,
}

/// Measurements for one request title.
pub struct HistogramSet {
    pub title: String,
    pub latency: Histogram<u64>,
    pub requests: Histogram<u64>,
    pub throughput: Histogram<u64>,
    pub status: [u64; 5],
    pub completed: u64,
    pub bytes: u64,
    interval_completed: u64,
    interval_bytes: u64,
}

impl HistogramSet {
    pub fn new(title: impl Into<String>) -> Result<Self> {
        Ok(Self {
            title: title.into(),
            latency: latency_histogram()?,
            requests: requests_histogram()?,
            throughput: throughput_histogram()?,
            status: [0; 5],
            completed: 0,
            bytes: 0,
            interval_completed: 0,
            interval_bytes: 0,
        })
    }

    /// `expected_interval_ms` turns on coordinated-omission correction for
    /// paced connections.
    pub fn record_response(
        &mut self,
        status: u16,
        bytes: u64,
        latency_ms: u64,
        expected_interval_ms: Option<u64>,
        policy: RecordPolicy,
    ) {
        let class = status_class(status);
        if let Some(class) = class {
            self.status[class] += 1;
        }
        let success = class == Some(1);

        if success || !policy.exclude_error_stats {
            self.completed += 1;
            self.interval_completed += 1;
        }

        if success || policy.include_error_stats {
            self.bytes += bytes;
            self.interval_bytes += bytes;

            let latency_ms = latency_ms.min(self.latency.high());
            match expected_interval_ms {
                Some(interval) => {
                    let _ = self.latency.record_correct(latency_ms, interval);
                }
                None => self.latency.saturating_record(latency_ms),
            }
        }
    }

    pub fn has_interval_activity(&self) -> bool {
        self.interval_completed > 0 || self.interval_bytes > 0
    }

    /// Closes the current sampling interval and returns its
    /// `(completed, bytes)`.
    pub fn sample(&mut self) -> (u64, u64) {
        let counts = (self.interval_completed, self.interval_bytes);
        self.requests.saturating_record(counts.0);
        self.throughput.saturating_record(counts.1);
        self.interval_completed = 0;
        self.interval_bytes = 0;
        counts
    }

    pub fn reset(&mut self) {
        self.latency.reset();
        self.requests.reset();
        self.throughput.reset();
        self.status = [0; 5];
        self.completed = 0;
        self.bytes = 0;
        self.interval_completed = 0;
        self.interval_bytes = 0;
    }
}

/// Run-wide counters plus one `HistogramSet` per title.
pub struct Stats {
    pub sets: Vec<HistogramSet>,
    pub requests: Histogram<u64>,
    pub throughput: Histogram<u64>,
    pub sent: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub mismatches: u64,
    pub resets: u64,
}

impl Stats {
    pub fn new(titles: &[String]) -> Result<Self> {
        Ok(Self {
            sets: titles
                .iter()
                .map(HistogramSet::new)
                .collect::<Result<Vec<_>>>()?,
            requests: requests_histogram()?,
            throughput: throughput_histogram()?,
            sent: 0,
            errors: 0,
            timeouts: 0,
            mismatches: 0,
            resets: 0,
        })
    }

    pub fn reset(&mut self) {
        for set in &mut self.sets {
            set.reset();
        }
        self.requests.reset();
        self.throughput.reset();
        self.sent = 0;
        self.errors = 0;
        self.timeouts = 0;
        self.mismatches = 0;
        self.resets = 0;
    }

    /// Closes the sampling interval of every title and records their sum as
    /// one run-wide sample. Returns each title's `(completed, bytes)`.
    pub fn sample(&mut self) -> Vec<(u64, u64)> {
        let counts: Vec<_> = self.sets.iter_mut().map(HistogramSet::sample).collect();
        self.record_totals(&counts);
        counts
    }

    /// The last interval of a round is cut short; only titles that saw
    /// traffic in it get a sample, and nothing is recorded if none did.
    pub fn sample_partial(&mut self) {
        let counts: Vec<_> = self
            .sets
            .iter_mut()
            .filter(|set| set.has_interval_activity())
            .map(HistogramSet::sample)
            .collect();
        if !counts.is_empty() {
            self.record_totals(&counts);
        }
    }

    fn record_totals(&mut self, counts: &[(u64, u64)]) {
        let (completed, bytes) = counts
            .iter()
            .fold((0, 0), |(c, b), &(completed, bytes)| (c + completed, b + bytes));
        self.requests.saturating_record(completed);
        self.throughput.saturating_record(bytes);
    }

    /// Errors and mismatches so far, the figure a bailout is checked against.
    pub fn failures(&self) -> u64 {
        self.errors + self.mismatches
    }
}
