use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

pub const PERCENTILES: [f64; 15] = [
    0.001, 0.01, 0.1, 1.0, 2.5, 10.0, 25.0, 50.0, 75.0, 90.0, 97.5, 99.0, 99.9, 99.99, 99.999,
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Percentile {
    pub percentile: f64,
    pub value: u64,
}

/// Derived view of one histogram.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// Role-specific total: responses for latency, completed requests for
    /// requests, bytes for throughput.
    pub total: u64,
    /// Number of values recorded in the histogram.
    pub samples: u64,
    pub mean: f64,
    pub stddev: f64,
    pub min: u64,
    pub max: u64,
    pub percentiles: Vec<Percentile>,
}

impl Summary {
    pub fn of(histogram: &Histogram<u64>, total: u64) -> Self {
        Self {
            total,
            samples: histogram.len(),
            mean: round2(histogram.mean()),
            stddev: round2(histogram.stdev()),
            min: histogram.min(),
            max: histogram.max(),
            percentiles: PERCENTILES
                .iter()
                .map(|&percentile| Percentile {
                    percentile,
                    value: histogram.value_at_percentile(percentile),
                })
                .collect(),
        }
    }

    pub fn percentile(&self, percentile: f64) -> Option<u64> {
        self.percentiles
            .iter()
            .find(|p| (p.percentile - percentile).abs() < f64::EPSILON)
            .map(|p| p.value)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
