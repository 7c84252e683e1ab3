use serde::Deserialize;
use std::collections::BTreeMap;
use std::collections::HashMap;

use crate::run::distribute;

mod settings;

pub use settings::{Settings, Target, TargetAddr};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub url: Vec<String>,
    pub socket_path: Option<String>,
    pub connections: usize,
    pub pipelining: usize,
    /// Seconds. Ignored when `amount` is set.
    pub duration: f64,
    pub amount: Option<u64>,
    /// Seconds.
    pub timeout: f64,

    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub title: Option<String>,
    pub requests: Vec<RequestConfig>,

    pub setup_client: Option<String>,
    pub verify_body: Option<String>,
    pub initial_context: HashMap<String, String>,
    pub id_replacement: bool,

    pub connection_rate: Option<u64>,
    pub overall_rate: Option<u64>,
    pub max_connection_requests: Option<u64>,
    pub max_overall_requests: Option<u64>,
    pub bailout: Option<u64>,
    pub forever: bool,

    pub exclude_error_stats: bool,
    pub include_error_stats: bool,
    pub ignore_coordinated_omission: bool,
    pub sample_interval_ms: u64,

    /// Number of shards the host splits the load into.
    pub workers: usize,

    pub tls: TlsConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RequestConfig {
    pub method: Option<String>,
    pub path: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
    pub body: Option<String>,
    pub title: Option<String>,
    pub setup_request: Option<String>,
    pub on_response: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TlsConfig {
    pub servername: Option<String>,
    pub reject_unauthorized: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            servername: None,
            reject_unauthorized: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: Vec::new(),
            socket_path: None,
            connections: 10,
            pipelining: 1,
            duration: 10.0,
            amount: None,
            timeout: 10.0,
            method: "GET".to_string(),
            headers: BTreeMap::new(),
            body: None,
            title: None,
            requests: Vec::new(),
            setup_client: None,
            verify_body: None,
            initial_context: HashMap::new(),
            id_replacement: false,
            connection_rate: None,
            overall_rate: None,
            max_connection_requests: None,
            max_overall_requests: None,
            bailout: None,
            forever: false,
            exclude_error_stats: false,
            include_error_stats: false,
            ignore_coordinated_omission: false,
            sample_interval_ms: 1000,
            workers: 1,
            tls: TlsConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: vec![url.into()],
            ..Self::default()
        }
    }

    /// The slice of this configuration run by shard `index` of `count`.
    /// Connection counts, totals and the overall rate are divided so the
    /// shards add back up to the configured values.
    pub fn for_shard(&self, index: usize, count: usize) -> Config {
        let count = count.max(1);
        let split = |total: u64| distribute(total, count, index);

        let mut shard = self.clone();
        shard.workers = 1;
        shard.connections = split(self.connections as u64) as usize;
        shard.amount = self.amount.map(split);
        shard.max_overall_requests = self.max_overall_requests.map(split);
        shard.overall_rate = self.overall_rate.map(split);
        shard
    }
}
