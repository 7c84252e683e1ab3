use hdrhistogram::Histogram;
use hdrhistogram::serialization::{Deserializer, Serializer, V2Serializer};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::SystemTime;

use super::result::{RateHistograms, RunResult, StatusCounts, TitleHistograms, TitleResult};
use super::Summary;
use crate::error::{Error, Result};

/// What a worker shard hands back to the host: its final result in a
/// byte envelope, histograms included so the host can merge them exactly.
#[derive(Debug, Clone)]
pub struct ShardReport {
    pub shard: usize,
    pub result: RunResult,
}

#[derive(Serialize, Deserialize)]
struct WireReport {
    shard: usize,
    url: Vec<String>,
    connections: usize,
    pipelining: usize,
    duration: f64,
    start: SystemTime,
    finish: SystemTime,
    errors: u64,
    timeouts: u64,
    mismatches: u64,
    resets: u64,
    total_requests: u64,
    requests: Vec<u8>,
    throughput: Vec<u8>,
    titles: Vec<WireTitle>,
}

#[derive(Serialize, Deserialize)]
struct WireTitle {
    title: String,
    completed: u64,
    bytes: u64,
    status: [u64; 5],
    latency: Vec<u8>,
    requests: Vec<u8>,
    throughput: Vec<u8>,
}

impl ShardReport {
    pub fn new(shard: usize, result: RunResult) -> Self {
        Self { shard, result }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut serializer = V2Serializer::new();
        let titles = self
            .result
            .titles
            .iter()
            .map(|title| {
                Ok(WireTitle {
                    title: title.title.clone(),
                    completed: title.completed,
                    bytes: title.bytes,
                    status: title.status.buckets(),
                    latency: encode(&mut serializer, &title.histograms.latency)?,
                    requests: encode(&mut serializer, &title.histograms.requests)?,
                    throughput: encode(&mut serializer, &title.histograms.throughput)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let result = &self.result;
        let wire = WireReport {
            shard: self.shard,
            url: result.url.clone(),
            connections: result.connections,
            pipelining: result.pipelining,
            duration: result.duration,
            start: result.start,
            finish: result.finish,
            errors: result.errors,
            timeouts: result.timeouts,
            mismatches: result.mismatches,
            resets: result.resets,
            total_requests: result.total_requests,
            requests: encode(&mut serializer, &result.rates.requests)?,
            throughput: encode(&mut serializer, &result.rates.throughput)?,
            titles,
        };
        bincode::serialize(&wire).map_err(|e| Error::Report(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let wire: WireReport =
            bincode::deserialize(bytes).map_err(|e| Error::Report(e.to_string()))?;

        let mut deserializer = Deserializer::new();
        let titles = wire
            .titles
            .into_iter()
            .map(|title| {
                let histograms = TitleHistograms {
                    latency: decode(&mut deserializer, &title.latency)?,
                    requests: decode(&mut deserializer, &title.requests)?,
                    throughput: decode(&mut deserializer, &title.throughput)?,
                };
                Ok(TitleResult::new(
                    title.title,
                    title.completed,
                    title.bytes,
                    StatusCounts::from_buckets(title.status),
                    histograms,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        let rates = RateHistograms {
            requests: decode(&mut deserializer, &wire.requests)?,
            throughput: decode(&mut deserializer, &wire.throughput)?,
        };

        let mut result = RunResult {
            url: wire.url,
            connections: wire.connections,
            pipelining: wire.pipelining,
            duration: wire.duration,
            start: wire.start,
            finish: wire.finish,
            errors: wire.errors,
            timeouts: wire.timeouts,
            mismatches: wire.mismatches,
            resets: wire.resets,
            non_2xx: 0,
            status: StatusCounts::default(),
            total_requests: wire.total_requests,
            total_completed_requests: 0,
            total_bytes: 0,
            latency: Summary::default(),
            requests: Summary::default(),
            throughput: Summary::default(),
            titles,
            rates,
        };
        result.refresh()?;

        Ok(Self {
            shard: wire.shard,
            result,
        })
    }
}

fn encode(serializer: &mut V2Serializer, histogram: &Histogram<u64>) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    serializer
        .serialize(histogram, &mut bytes)
        .map_err(|e| Error::Report(format!("{:?}", e)))?;
    Ok(bytes)
}

fn decode(deserializer: &mut Deserializer, bytes: &[u8]) -> Result<Histogram<u64>> {
    deserializer
        .deserialize(&mut Cursor::new(bytes))
        .map_err(|e| Error::Report(format!("{:?}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::result::tests::sample_result;

    #[test]
    fn report_survives_the_envelope() {
        let result = sample_result("api", &[3, 30, 300], 2, 0);
        let bytes = ShardReport::new(3, result.clone()).to_bytes().unwrap();
        let report = ShardReport::from_bytes(&bytes).unwrap();

        assert_eq!(report.shard, 3);
        assert_eq!(report.result.latency, result.latency);
        assert_eq!(report.result.requests, result.requests);
        assert_eq!(report.result.status, result.status);
        assert_eq!(report.result.errors, 2);
        assert_eq!(report.result.start, result.start);
        assert_eq!(report.result.title("api").unwrap().bytes, 300);
    }

    #[test]
    fn decoded_reports_merge_like_local_ones() {
        let a = sample_result("api", &[1, 2, 3], 0, 0);
        let b = sample_result("api", &[100, 200], 1, 1);

        let local = RunResult::merge_all(vec![a.clone(), b.clone()]).unwrap();
        let decoded = [a, b]
            .into_iter()
            .enumerate()
            .map(|(shard, r)| ShardReport::new(shard, r).to_bytes().unwrap())
            .map(|bytes| ShardReport::from_bytes(&bytes).unwrap().result);
        let remote = RunResult::merge_all(decoded).unwrap();

        assert_eq!(local.latency, remote.latency);
        assert_eq!(local.throughput, remote.throughput);
        assert_eq!(local.total_requests, remote.total_requests);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(ShardReport::from_bytes(&[1, 2, 3]).is_err());
    }
}
