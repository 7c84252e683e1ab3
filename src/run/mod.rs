//! Run orchestration for one shard.
//!
//! A `Run` owns every counter and histogram of its shard. Connections run as
//! tasks and only report `ConnectionEvent`s over a channel; the run's loop is
//! the single consumer and the single writer of the statistics.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};
use tracing::{debug, error, info, warn};

use crate::config::{Config, Settings};
use crate::connection::{Connection, ConnectionEvent, ConnectionPlan};
use crate::error::Result;
use crate::hooks::HookRegistry;
use crate::stats::{RecordPolicy, RunResult, Stats};

pub mod distribute;

pub use distribute::distribute;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Starting,
    Running,
    Stopping,
    Done,
}

/// Progress notifications for whoever observes a run.
#[derive(Debug, Clone)]
pub enum RunEvent {
    Start,
    /// Totals of one title over the sampling interval that just closed.
    Tick {
        title: usize,
        count: u64,
        bytes: u64,
    },
    Response {
        connection: usize,
        status: u16,
        bytes: usize,
        duration_ms: u64,
        template: usize,
    },
    ReqError(String),
    ReqMismatch(String),
    Reset,
    /// One per round; a `forever` run produces a stream of these.
    Done(Box<RunResult>),
    Error(String),
}

/// Controls a run from outside its loop, e.g. from a signal handler.
#[derive(Clone)]
pub struct RunHandle {
    stop: Arc<watch::Sender<bool>>,
    state: watch::Receiver<RunState>,
}

impl RunHandle {
    /// Idempotent. Connections start no new write after this returns and no
    /// new round is started; responses already in flight are not waited for.
    pub fn stop(&self) {
        if !self.stop.send_replace(true) {
            info!("Stop requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Resolves on the next `Done`. A `forever` run passes through `Done`
    /// after every round.
    pub async fn finished(&mut self) {
        let _ = self.state.wait_for(|state| *state == RunState::Done).await;
    }
}

pub struct Run {
    settings: Settings,
    stop: Arc<watch::Sender<bool>>,
    state: watch::Sender<RunState>,
    observer: Option<mpsc::UnboundedSender<RunEvent>>,
}

struct Round {
    start: SystemTime,
    started: Instant,
    running: usize,
    /// Expected interval between requests per connection, when coordinated
    /// omission is corrected for.
    expected_intervals: Vec<Option<u64>>,
    tasks: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl Run {
    /// Validates `config` and resolves its hook names. Nothing is connected
    /// until `execute`.
    pub fn new(config: &Config, hooks: &HookRegistry) -> Result<Self> {
        Ok(Self::from_settings(Settings::from_config(config, hooks)?))
    }

    pub fn from_settings(settings: Settings) -> Self {
        let (stop, _) = watch::channel(false);
        let (state, _) = watch::channel(RunState::Starting);
        Self {
            settings,
            stop: Arc::new(stop),
            state,
            observer: None,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn handle(&self) -> RunHandle {
        RunHandle {
            stop: self.stop.clone(),
            state: self.state.subscribe(),
        }
    }

    /// Events of this run from now on. Replaces any earlier subscriber.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<RunEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observer = Some(tx);
        rx
    }

    /// Runs rounds until the run is stopped or, without `forever`, until the
    /// first round ends. Returns the last round's result.
    pub async fn execute(self) -> Result<RunResult> {
        let mut stats = Stats::new(&self.settings.titles)?;
        self.emit(RunEvent::Start);

        let mut round_number = 1;
        loop {
            self.state.send_replace(RunState::Running);
            info!(
                "Starting round {} with {} connection(s) against {}",
                round_number,
                self.settings.connections,
                self.settings.urls().join(", ")
            );

            let result = match self.round(&mut stats).await {
                Ok(result) => result,
                Err(e) => {
                    error!("Run failed: {}", e);
                    self.emit(RunEvent::Error(e.to_string()));
                    self.state.send_replace(RunState::Done);
                    return Err(e);
                }
            };
            info!(
                "Round {} finished: {} sent, {} completed, {} errors in {:.2}s",
                round_number,
                result.total_requests,
                result.total_completed_requests,
                result.errors,
                result.duration
            );

            let restart = self.settings.forever && !*self.stop.borrow();
            self.emit(RunEvent::Done(Box::new(result.clone())));
            self.state.send_replace(RunState::Done);

            if !restart || *self.stop.borrow() {
                return Ok(result);
            }
            stats.reset();
            round_number += 1;
        }
    }

    async fn round(&self, stats: &mut Stats) -> Result<RunResult> {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut round = self.spawn_connections(events_tx)?;
        let mut stop = self.stop.subscribe();

        let sample_interval = self.settings.sample_interval;
        let mut ticker = interval_at(Instant::now() + sample_interval, sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = self.settings.duration.map(|duration| round.started + duration);

        loop {
            tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => {
                    debug!("Round interrupted by stop");
                    break;
                }
                _ = sleep_until(deadline.unwrap_or(round.started)), if deadline.is_some() => {
                    debug!("Round duration elapsed");
                    break;
                }
                _ = ticker.tick() => self.sample(stats),
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if self.apply(event, stats, &mut round).is_break() {
                        break;
                    }
                }
            }
        }

        self.state.send_replace(RunState::Stopping);
        let finish = SystemTime::now();
        let elapsed = round.started.elapsed();
        let start = round.start;
        Self::teardown(round).await;

        stats.sample_partial();

        RunResult::from_stats(stats, &self.settings, start, finish, elapsed)
    }

    fn spawn_connections(&self, events: mpsc::UnboundedSender<ConnectionEvent>) -> Result<Round> {
        let count = self.settings.connections;
        let mut connections = Vec::with_capacity(count);
        let mut expected_intervals = Vec::with_capacity(count);

        for index in 0..count {
            let plan = self.plan(index);
            expected_intervals.push(self.expected_interval(&plan));
            let connection = Connection::new(index, &self.settings, plan, events.clone())?;
            connections.push(connection.with_stop(self.stop.subscribe()));
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tasks = connections
            .into_iter()
            .map(|connection| tokio::spawn(connection.run(shutdown_rx.clone())))
            .collect();

        Ok(Round {
            start: SystemTime::now(),
            started: Instant::now(),
            running: count,
            expected_intervals,
            tasks,
            shutdown,
        })
    }

    /// Target, request quota and rate of connection `index`.
    fn plan(&self, index: usize) -> ConnectionPlan {
        let settings = &self.settings;
        let count = settings.connections;
        let share = |total: u64| distribute(total, count, index);

        let quota = [
            settings.amount.map(share),
            settings.max_overall_requests.map(share),
            settings.max_connection_requests,
        ]
        .into_iter()
        .flatten()
        .min();

        let rate = settings
            .connection_rate
            .or_else(|| settings.overall_rate.map(share))
            .filter(|rate| *rate > 0);

        ConnectionPlan {
            target: index % settings.targets.len(),
            quota,
            rate,
        }
    }

    fn expected_interval(&self, plan: &ConnectionPlan) -> Option<u64> {
        if self.settings.ignore_coordinated_omission {
            return None;
        }
        plan.rate.map(|rate| 1000 / rate).filter(|ms| *ms > 0)
    }

    fn apply(&self, event: ConnectionEvent, stats: &mut Stats, round: &mut Round) -> ControlFlow<()> {
        match event {
            ConnectionEvent::Sent { .. } => stats.sent += 1,
            ConnectionEvent::Response {
                connection,
                status,
                bytes,
                duration_ms,
                title,
                template,
            } => {
                let policy = RecordPolicy {
                    include_error_stats: self.settings.include_error_stats,
                    exclude_error_stats: self.settings.exclude_error_stats,
                };
                let expected = round.expected_intervals.get(connection).copied().flatten();
                if let Some(set) = stats.sets.get_mut(title) {
                    set.record_response(status, bytes as u64, duration_ms, expected, policy);
                }
                self.emit(RunEvent::Response {
                    connection,
                    status,
                    bytes,
                    duration_ms,
                    template,
                });
            }
            ConnectionEvent::Error { error, .. } => {
                stats.errors += 1;
                self.emit(RunEvent::ReqError(error));
                return self.check_bailout(stats);
            }
            ConnectionEvent::Timeout { .. } => {
                stats.errors += 1;
                stats.timeouts += 1;
                self.emit(RunEvent::ReqError("request timed out".to_string()));
                return self.check_bailout(stats);
            }
            ConnectionEvent::Mismatch { body, .. } => {
                stats.mismatches += 1;
                self.emit(RunEvent::ReqMismatch(body));
                return self.check_bailout(stats);
            }
            ConnectionEvent::Reset { .. } => {
                stats.resets += 1;
                self.emit(RunEvent::Reset);
            }
            ConnectionEvent::Exhausted { connection } => {
                round.running = round.running.saturating_sub(1);
                debug!(
                    "Connection {} exhausted its quota, {} still running",
                    connection, round.running
                );
                if round.running == 0 {
                    return ControlFlow::Break(());
                }
            }
        }
        ControlFlow::Continue(())
    }

    fn check_bailout(&self, stats: &Stats) -> ControlFlow<()> {
        match self.settings.bailout {
            Some(limit) if stats.failures() >= limit => {
                warn!(
                    "Bailing out after {} errors and {} mismatches",
                    stats.errors, stats.mismatches
                );
                self.stop.send_replace(true);
                ControlFlow::Break(())
            }
            _ => ControlFlow::Continue(()),
        }
    }

    fn sample(&self, stats: &mut Stats) {
        for (title, (count, bytes)) in stats.sample().into_iter().enumerate() {
            self.emit(RunEvent::Tick { title, count, bytes });
        }
    }

    /// Sockets are closed by aborting their tasks; in-flight responses are
    /// not drained.
    async fn teardown(round: Round) {
        round.shutdown.send_replace(true);
        for task in &round.tasks {
            task.abort();
        }
        let joined = tokio::time::timeout(
            Duration::from_secs(5),
            futures::future::join_all(round.tasks),
        )
        .await;
        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        if !e.is_cancelled() {
                            error!("Connection task failed: {}", e);
                        }
                    }
                }
            }
            Err(_) => warn!("Connection tasks did not finish after abort"),
        }
    }

    fn emit(&self, event: RunEvent) {
        if let Some(observer) = &self.observer {
            let _ = observer.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(config: Config) -> Run {
        Run::new(&config, &HookRegistry::new()).unwrap()
    }

    #[test]
    fn quotas_are_split_across_connections() {
        let run = run(Config {
            connections: 4,
            amount: Some(10),
            ..Config::for_url("http://localhost")
        });

        let quotas: Vec<_> = (0..4).map(|i| run.plan(i).quota.unwrap()).collect();
        assert_eq!(quotas, vec![3, 3, 2, 2]);
    }

    #[test]
    fn per_connection_cap_wins_when_smaller() {
        let run = run(Config {
            connections: 2,
            max_overall_requests: Some(100),
            max_connection_requests: Some(7),
            ..Config::for_url("http://localhost")
        });
        assert_eq!(run.plan(0).quota, Some(7));
        assert_eq!(run.plan(1).quota, Some(7));
    }

    #[test]
    fn overall_rate_is_distributed() {
        let run = run(Config {
            connections: 3,
            overall_rate: Some(10),
            ..Config::for_url("http://localhost")
        });
        let rates: Vec<_> = (0..3).map(|i| run.plan(i).rate.unwrap()).collect();
        assert_eq!(rates, vec![4, 3, 3]);
        assert_eq!(run.expected_interval(&run.plan(0)), Some(250));
        assert_eq!(run.plan(0).quota, None);
    }

    #[test]
    fn targets_are_assigned_round_robin() {
        let run = run(Config {
            connections: 5,
            url: vec!["http://a".to_string(), "http://b".to_string()],
            ..Config::default()
        });
        let targets: Vec<_> = (0..5).map(|i| run.plan(i).target).collect();
        assert_eq!(targets, vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn coordinated_omission_correction_can_be_ignored() {
        let run = run(Config {
            connection_rate: Some(10),
            ignore_coordinated_omission: true,
            ..Config::for_url("http://localhost")
        });
        assert_eq!(run.plan(0).rate, Some(10));
        assert_eq!(run.expected_interval(&run.plan(0)), None);
    }

    #[test]
    fn stop_is_idempotent() {
        let run = run(Config::for_url("http://localhost"));
        let handle = run.handle();
        assert_eq!(handle.state(), RunState::Starting);
        assert!(!handle.is_stopped());

        handle.stop();
        handle.clone().stop();
        assert!(handle.is_stopped());
    }

    #[tokio::test]
    async fn stopped_run_still_reports_a_result() {
        let mut run = run(Config {
            connections: 1,
            timeout: 0.5,
            ..Config::for_url("http://127.0.0.1:1")
        });
        let mut events = run.subscribe();
        let mut handle = run.handle();
        handle.stop();

        let result = run.execute().await.unwrap();
        handle.finished().await;

        assert_eq!(handle.state(), RunState::Done);
        assert!(result.duration < 1.0);
        assert!(matches!(events.recv().await, Some(RunEvent::Start)));
        let mut saw_done = false;
        while let Ok(event) = events.try_recv() {
            saw_done |= matches!(event, RunEvent::Done(_));
        }
        assert!(saw_done);
    }
}
