use http::Uri;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use super::{Config, RequestConfig, TlsConfig};
use crate::connection::TlsTarget;
use crate::error::{Error, Result};
use crate::hooks::{HookRegistry, SetupClient, VerifyBody};
use crate::request::{Context, IdGenerator, RequestTemplate, titles_of};

#[derive(Debug, Clone)]
pub enum TargetAddr {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Target {
    pub url: String,
    pub addr: TargetAddr,
    pub host_header: String,
    pub path: String,
    pub tls: Option<TlsTarget>,
}

/// A validated, immutable run configuration. Built once, before any
/// connection exists.
#[derive(Clone)]
pub struct Settings {
    pub targets: Vec<Target>,
    pub templates: Vec<RequestTemplate>,
    pub titles: Vec<String>,

    /// Effective connection count after capping to the rate and totals.
    pub connections: usize,
    pub pipelining: usize,
    /// `None` when the run is bounded by a request total instead.
    pub duration: Option<Duration>,
    pub amount: Option<u64>,
    pub timeout: Duration,

    pub initial_context: Context,
    pub id_replacement: bool,
    pub ids: IdGenerator,

    pub connection_rate: Option<u64>,
    pub overall_rate: Option<u64>,
    pub max_connection_requests: Option<u64>,
    pub max_overall_requests: Option<u64>,
    pub bailout: Option<u64>,
    pub forever: bool,

    pub exclude_error_stats: bool,
    pub include_error_stats: bool,
    pub ignore_coordinated_omission: bool,
    pub sample_interval: Duration,

    pub setup_client: Option<SetupClient>,
    pub verify_body: Option<VerifyBody>,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("targets", &self.targets)
            .field("templates", &self.templates)
            .field("connections", &self.connections)
            .field("pipelining", &self.pipelining)
            .field("duration", &self.duration)
            .field("amount", &self.amount)
            .field("timeout", &self.timeout)
            .field("forever", &self.forever)
            .finish_non_exhaustive()
    }
}

impl Settings {
    pub fn from_config(config: &Config, hooks: &HookRegistry) -> Result<Self> {
        if config.url.is_empty() && config.socket_path.is_none() {
            return Err(Error::config("a target url or socket path is required"));
        }
        if config.connections == 0 {
            return Err(Error::config("connections must be at least 1"));
        }
        if config.pipelining == 0 {
            return Err(Error::config("pipelining must be at least 1"));
        }
        if config.amount.is_none() && !(config.duration.is_finite() && config.duration > 0.0) {
            return Err(Error::config(format!(
                "duration must be a positive number of seconds, got {}",
                config.duration
            )));
        }
        if !(config.timeout.is_finite() && config.timeout > 0.0) {
            return Err(Error::config(format!(
                "timeout must be a positive number of seconds, got {}",
                config.timeout
            )));
        }
        for (name, value) in [
            ("amount", config.amount),
            ("connection_rate", config.connection_rate),
            ("overall_rate", config.overall_rate),
            ("max_connection_requests", config.max_connection_requests),
            ("max_overall_requests", config.max_overall_requests),
            ("bailout", config.bailout),
        ] {
            if value == Some(0) {
                return Err(Error::config(format!("{} must be at least 1", name)));
            }
        }
        if config.sample_interval_ms == 0 {
            return Err(Error::config("sample_interval_ms must be at least 1"));
        }

        let urls = if config.url.is_empty() {
            vec!["http://localhost".to_string()]
        } else {
            config.url.clone()
        };
        let targets = urls
            .iter()
            .map(|url| parse_target(url, config.socket_path.as_deref(), &config.tls))
            .collect::<Result<Vec<_>>>()?;

        let templates = build_templates(config, &targets[0].path, hooks)?;
        let titles = titles_of(&templates);

        let mut connections = config.connections;
        for (name, cap) in [
            ("overall_rate", config.overall_rate),
            ("amount", config.amount),
            ("max_overall_requests", config.max_overall_requests),
        ] {
            if let Some(cap) = cap {
                if (cap as usize) < connections {
                    warn!(
                        "Capping connections from {} to {} to match {}",
                        connections, cap, name
                    );
                    connections = cap as usize;
                }
            }
        }

        let setup_client = config
            .setup_client
            .as_deref()
            .map(|name| hooks.setup_client(name))
            .transpose()?;
        let verify_body = config
            .verify_body
            .as_deref()
            .map(|name| hooks.verify_body(name))
            .transpose()?;

        info!(
            "Validated run: {} target(s), {} connection(s), pipelining {}, {} template(s)",
            targets.len(),
            connections,
            config.pipelining,
            templates.len()
        );

        Ok(Self {
            targets,
            templates,
            titles,
            connections,
            pipelining: config.pipelining,
            duration: match config.amount {
                Some(_) => None,
                None => Some(Duration::from_secs_f64(config.duration)),
            },
            amount: config.amount,
            timeout: Duration::from_secs_f64(config.timeout),
            initial_context: config.initial_context.clone(),
            id_replacement: config.id_replacement,
            ids: IdGenerator::new(),
            connection_rate: config.connection_rate,
            overall_rate: config.overall_rate,
            max_connection_requests: config.max_connection_requests,
            max_overall_requests: config.max_overall_requests,
            bailout: config.bailout,
            forever: config.forever,
            exclude_error_stats: config.exclude_error_stats,
            include_error_stats: config.include_error_stats,
            ignore_coordinated_omission: config.ignore_coordinated_omission,
            sample_interval: Duration::from_millis(config.sample_interval_ms),
            setup_client,
            verify_body,
        })
    }

    pub fn urls(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.url.clone()).collect()
    }
}

fn parse_target(url: &str, socket_path: Option<&str>, tls: &TlsConfig) -> Result<Target> {
    let with_scheme = if url.contains("://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    };
    let uri: Uri = with_scheme
        .parse()
        .map_err(|e| Error::config(format!("invalid url '{}': {}", url, e)))?;

    let secure = match uri.scheme_str() {
        Some("http") => false,
        Some("https") => true,
        other => {
            return Err(Error::config(format!(
                "unsupported url scheme '{}' in '{}'",
                other.unwrap_or(""),
                url
            )));
        }
    };
    let raw_host = uri
        .host()
        .ok_or_else(|| Error::config(format!("url '{}' has no host", url)))?;
    let host = raw_host.trim_start_matches('[').trim_end_matches(']').to_string();
    let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });
    let host_header = match uri.port_u16() {
        Some(port) => format!("{}:{}", raw_host, port),
        None => raw_host.to_string(),
    };
    let path = uri
        .path_and_query()
        .map(|p| p.as_str())
        .filter(|p| !p.is_empty())
        .unwrap_or("/")
        .to_string();

    let tls = if secure {
        let server_name = tls.servername.as_deref().unwrap_or(&host);
        Some(TlsTarget::new(server_name, tls.reject_unauthorized)?)
    } else {
        None
    };

    let addr = match socket_path {
        Some(path) => TargetAddr::Unix(PathBuf::from(path)),
        None => TargetAddr::Tcp { host, port },
    };

    Ok(Target {
        url: url.to_string(),
        addr,
        host_header,
        path,
        tls,
    })
}

fn build_templates(
    config: &Config,
    default_path: &str,
    hooks: &HookRegistry,
) -> Result<Vec<RequestTemplate>> {
    let requests = if config.requests.is_empty() {
        vec![RequestConfig::default()]
    } else {
        config.requests.clone()
    };

    requests
        .iter()
        .map(|request| {
            let method = request.method.as_deref().unwrap_or(&config.method);
            let path = request.path.as_deref().unwrap_or(default_path);
            let mut template = RequestTemplate::new(method, path)?
                .with_headers(request.headers.clone().unwrap_or_else(|| config.headers.clone()))
                .with_title(
                    request
                        .title
                        .clone()
                        .or_else(|| config.title.clone())
                        .unwrap_or_default(),
                );
            if let Some(body) = request.body.as_ref().or(config.body.as_ref()) {
                template = template.with_body(body.as_bytes());
            }
            if let Some(name) = &request.setup_request {
                template.setup_request = Some(hooks.setup_request(name)?);
            }
            if let Some(name) = &request.on_response {
                template.on_response = Some(hooks.on_response(name)?);
            }
            Ok(template)
        })
        .collect()
}
