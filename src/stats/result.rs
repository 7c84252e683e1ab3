use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};

use super::{Stats, Summary, latency_histogram};
use crate::config::Settings;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    #[serde(rename = "1xx")]
    pub informational: u64,
    #[serde(rename = "2xx")]
    pub success: u64,
    #[serde(rename = "3xx")]
    pub redirection: u64,
    #[serde(rename = "4xx")]
    pub client_error: u64,
    #[serde(rename = "5xx")]
    pub server_error: u64,
}

impl StatusCounts {
    pub fn from_buckets(buckets: [u64; 5]) -> Self {
        Self {
            informational: buckets[0],
            success: buckets[1],
            redirection: buckets[2],
            client_error: buckets[3],
            server_error: buckets[4],
        }
    }

    pub fn buckets(&self) -> [u64; 5] {
        [
            self.informational,
            self.success,
            self.redirection,
            self.client_error,
            self.server_error,
        ]
    }

    pub fn add(&mut self, other: &StatusCounts) {
        self.informational += other.informational;
        self.success += other.success;
        self.redirection += other.redirection;
        self.client_error += other.client_error;
        self.server_error += other.server_error;
    }

    pub fn non_2xx(&self) -> u64 {
        self.informational + self.redirection + self.client_error + self.server_error
    }
}

#[derive(Clone)]
pub(crate) struct TitleHistograms {
    pub(crate) latency: Histogram<u64>,
    pub(crate) requests: Histogram<u64>,
    pub(crate) throughput: Histogram<u64>,
}

impl TitleHistograms {
    fn add(&mut self, other: &TitleHistograms) -> Result<()> {
        let added = self
            .latency
            .add(&other.latency)
            .and_then(|_| self.requests.add(&other.requests))
            .and_then(|_| self.throughput.add(&other.throughput));
        added.map_err(|e| Error::Histogram(format!("{:?}", e)))
    }
}

/// Run-wide requests and bytes per tick. These are not the sum of the
/// title histograms: each tick contributes one sample of the combined total.
#[derive(Clone)]
pub(crate) struct RateHistograms {
    pub(crate) requests: Histogram<u64>,
    pub(crate) throughput: Histogram<u64>,
}

impl RateHistograms {
    fn add(&mut self, other: &RateHistograms) -> Result<()> {
        let added = self
            .requests
            .add(&other.requests)
            .and_then(|_| self.throughput.add(&other.throughput));
        added.map_err(|e| Error::Histogram(format!("{:?}", e)))
    }
}

impl fmt::Debug for RateHistograms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateHistograms")
            .field("requests", &self.requests.len())
            .field("throughput", &self.throughput.len())
            .finish()
    }
}

impl fmt::Debug for TitleHistograms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TitleHistograms")
            .field("latency", &self.latency.len())
            .field("requests", &self.requests.len())
            .field("throughput", &self.throughput.len())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TitleResult {
    pub title: String,
    pub completed: u64,
    pub bytes: u64,
    #[serde(flatten)]
    pub status: StatusCounts,
    pub latency: Summary,
    pub requests: Summary,
    pub throughput: Summary,
    #[serde(skip)]
    pub(crate) histograms: TitleHistograms,
}

impl TitleResult {
    pub(crate) fn new(
        title: String,
        completed: u64,
        bytes: u64,
        status: StatusCounts,
        histograms: TitleHistograms,
    ) -> Self {
        let mut result = Self {
            title,
            completed,
            bytes,
            status,
            latency: Summary::default(),
            requests: Summary::default(),
            throughput: Summary::default(),
            histograms,
        };
        result.refresh();
        result
    }

    fn refresh(&mut self) {
        self.latency = Summary::of(&self.histograms.latency, self.histograms.latency.len());
        self.requests = Summary::of(&self.histograms.requests, self.completed);
        self.throughput = Summary::of(&self.histograms.throughput, self.bytes);
    }
}

/// Outcome of one round of one shard, or of several merged shards.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub url: Vec<String>,
    pub connections: usize,
    pub pipelining: usize,
    /// Seconds.
    pub duration: f64,
    pub start: SystemTime,
    pub finish: SystemTime,

    pub errors: u64,
    pub timeouts: u64,
    pub mismatches: u64,
    pub resets: u64,
    pub non_2xx: u64,
    #[serde(flatten)]
    pub status: StatusCounts,

    pub total_requests: u64,
    pub total_completed_requests: u64,
    pub total_bytes: u64,

    /// Across every title; identical to the title's own summary when there
    /// is only one.
    pub latency: Summary,
    /// Per tick totals over every title.
    pub requests: Summary,
    pub throughput: Summary,

    pub titles: Vec<TitleResult>,
    #[serde(skip)]
    pub(crate) rates: RateHistograms,
}

impl RunResult {
    pub(crate) fn from_stats(
        stats: &Stats,
        settings: &Settings,
        start: SystemTime,
        finish: SystemTime,
        elapsed: Duration,
    ) -> Result<Self> {
        let titles = stats
            .sets
            .iter()
            .map(|set| {
                TitleResult::new(
                    set.title.clone(),
                    set.completed,
                    set.bytes,
                    StatusCounts::from_buckets(set.status),
                    TitleHistograms {
                        latency: set.latency.clone(),
                        requests: set.requests.clone(),
                        throughput: set.throughput.clone(),
                    },
                )
            })
            .collect();

        let mut result = Self {
            url: settings.urls(),
            connections: settings.connections,
            pipelining: settings.pipelining,
            duration: elapsed.as_secs_f64(),
            start,
            finish,
            errors: stats.errors,
            timeouts: stats.timeouts,
            mismatches: stats.mismatches,
            resets: stats.resets,
            non_2xx: 0,
            status: StatusCounts::default(),
            total_requests: stats.sent,
            total_completed_requests: 0,
            total_bytes: 0,
            latency: Summary::default(),
            requests: Summary::default(),
            throughput: Summary::default(),
            titles,
            rates: RateHistograms {
                requests: stats.requests.clone(),
                throughput: stats.throughput.clone(),
            },
        };
        result.refresh()?;
        Ok(result)
    }

    pub fn title(&self, title: &str) -> Option<&TitleResult> {
        self.titles.iter().find(|t| t.title == title)
    }

    /// Recomputes the run-wide figures from the per-title data.
    pub(crate) fn refresh(&mut self) -> Result<()> {
        let mut latency = latency_histogram()?;
        let mut status = StatusCounts::default();
        let mut completed = 0;
        let mut bytes = 0;

        for title in &mut self.titles {
            title.refresh();
            latency
                .add(&title.histograms.latency)
                .map_err(|e| Error::Histogram(format!("{:?}", e)))?;
            status.add(&title.status);
            completed += title.completed;
            bytes += title.bytes;
        }

        self.status = status;
        self.non_2xx = status.non_2xx();
        self.total_completed_requests = completed;
        self.total_bytes = bytes;
        self.latency = Summary::of(&latency, latency.len());
        self.requests = Summary::of(&self.rates.requests, completed);
        self.throughput = Summary::of(&self.rates.throughput, bytes);
        Ok(())
    }

    /// Folds another shard's result into this one. Histograms are added
    /// value by value and every percentile is derived again from the sum.
    pub fn merge(&mut self, other: &RunResult) -> Result<()> {
        for theirs in &other.titles {
            match self.titles.iter_mut().find(|t| t.title == theirs.title) {
                Some(ours) => {
                    ours.histograms.add(&theirs.histograms)?;
                    ours.completed += theirs.completed;
                    ours.bytes += theirs.bytes;
                    ours.status.add(&theirs.status);
                }
                None => self.titles.push(theirs.clone()),
            }
        }

        self.rates.add(&other.rates)?;

        for url in &other.url {
            if !self.url.contains(url) {
                self.url.push(url.clone());
            }
        }
        self.connections += other.connections;
        self.pipelining = self.pipelining.max(other.pipelining);

        self.start = self.start.min(other.start);
        self.finish = self.finish.max(other.finish);
        let span = self
            .finish
            .duration_since(self.start)
            .map(|span| span.as_secs_f64())
            .unwrap_or(0.0);
        self.duration = self.duration.max(other.duration).max(span);

        self.errors += other.errors;
        self.timeouts += other.timeouts;
        self.mismatches += other.mismatches;
        self.resets += other.resets;
        self.total_requests += other.total_requests;

        self.refresh()
    }

    pub fn merge_all(results: impl IntoIterator<Item = RunResult>) -> Result<RunResult> {
        let mut results = results.into_iter();
        let mut merged = results
            .next()
            .ok_or_else(|| Error::Report("no shard results to merge".to_string()))?;
        for result in results {
            merged.merge(&result)?;
        }
        Ok(merged)
    }
}
