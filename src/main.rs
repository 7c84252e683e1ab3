use anyhow::{Context, Result};
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use volley::{Config, HookRegistry, Run, RunEvent, RunResult, ShardReport};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "volley=info".into()),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "volley.toml".to_string());
    info!("Loading config from {}", config_path);

    let config = Config::from_file(&config_path)
        .with_context(|| format!("failed to load {}", config_path))?;
    let hooks = HookRegistry::new();

    let shard_count = shard_count(&config);
    // every shard is validated before any of them connects
    let runs = (0..shard_count)
        .map(|shard| Run::new(&config.for_shard(shard, shard_count), &hooks))
        .collect::<volley::Result<Vec<_>>>()?;
    let handles: Vec<_> = runs.iter().map(Run::handle).collect();
    info!("Running {} shard(s)", shard_count);

    let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
    for (shard, run) in runs.into_iter().enumerate() {
        let reports = reports_tx.clone();
        thread::Builder::new()
            .name(format!("volley-shard-{}", shard))
            .spawn(move || {
                let _ = reports.send(run_shard(shard, run));
            })?;
    }
    drop(reports_tx);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let encoded = runtime.block_on(async move {
        let mut encoded = Vec::with_capacity(shard_count);
        let mut interrupted = false;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c(), if !interrupted => {
                    warn!("Interrupted, stopping {} shard(s)", handles.len());
                    for handle in &handles {
                        handle.stop();
                    }
                    interrupted = true;
                }
                report = reports_rx.recv() => match report {
                    Some(report) => encoded.push(report?),
                    None => break,
                }
            }
        }
        anyhow::Ok(encoded)
    })?;

    let results = encoded
        .iter()
        .map(|bytes| ShardReport::from_bytes(bytes).map(|report| report.result))
        .collect::<volley::Result<Vec<_>>>()?;
    let merged = RunResult::merge_all(results)?;

    print!("{}", toml::to_string_pretty(&merged)?);
    Ok(())
}

/// Never more shards than there are connections, or units of any total
/// that gets divided between them.
fn shard_count(config: &Config) -> usize {
    [
        Some(config.connections as u64),
        config.amount,
        config.max_overall_requests,
        config.overall_rate,
    ]
    .into_iter()
    .flatten()
    .fold(config.workers.max(1) as u64, u64::min)
    .max(1) as usize
}

/// Runs one shard on its own single-threaded runtime and returns its encoded
/// report.
fn run_shard(shard: usize, mut run: Run) -> Result<Vec<u8>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        if run.settings().forever {
            let mut events = run.subscribe();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if let RunEvent::Done(result) = event {
                        info!(
                            "Shard {} round: {} completed, {} errors, p99 latency {}ms",
                            shard,
                            result.total_completed_requests,
                            result.errors,
                            result.latency.percentile(99.0).unwrap_or(0)
                        );
                    }
                }
            });
        }

        let result = run.execute().await?;
        debug!("Shard {} finished after {:.2}s", shard, result.duration);
        anyhow::Ok(ShardReport::new(shard, result).to_bytes()?)
    })
}
