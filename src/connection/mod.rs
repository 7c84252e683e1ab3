use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep, sleep_until, timeout_at};
use tracing::{debug, trace};

use crate::config::{Settings, Target};
use crate::error::{Error, Result};
use crate::hooks::VerifyBody;
use crate::request::{Context, Prepared, RequestSequencer, RequestTemplate};

mod pacer;
mod parser;
mod transport;

pub use pacer::Pacer;
pub use parser::{ParseError, ParseEvent, ResponseParser};
pub use transport::{Transport, TlsTarget, connect};

const READ_BUFFER_SIZE: usize = 16 * 1024;
const RECONNECT_DELAY: Duration = Duration::from_millis(100);

/// What a connection reports to its run. Payloads are plain values; the run
/// owns every counter.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Sent {
        connection: usize,
    },
    Response {
        connection: usize,
        status: u16,
        bytes: usize,
        duration_ms: u64,
        title: usize,
        template: usize,
    },
    Error {
        connection: usize,
        error: String,
    },
    Timeout {
        connection: usize,
    },
    Mismatch {
        connection: usize,
        body: String,
    },
    Reset {
        connection: usize,
    },
    /// The connection used up its request quota and has shut down.
    Exhausted {
        connection: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Reconnecting,
    Destroyed,
}

/// How the run sets up one connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionPlan {
    pub target: usize,
    pub quota: Option<u64>,
    pub rate: Option<u64>,
}

#[derive(Debug)]
struct Slot {
    template: usize,
    title: usize,
    head: bool,
    written_at: Instant,
    status: Option<u16>,
    headers: Vec<(String, String)>,
}

impl Slot {
    fn new(prepared: &Prepared, written_at: Instant) -> Self {
        Self {
            template: prepared.template,
            title: prepared.title,
            head: prepared.head,
            written_at,
            status: None,
            headers: Vec::new(),
        }
    }
}

enum Outcome {
    Reconnect,
    Exhausted,
    Shutdown,
}

/// One socket cycling pipelined requests against a target.
pub struct Connection {
    id: usize,
    target: Target,
    pipelining: usize,
    timeout: Duration,
    sequencer: RequestSequencer,
    context: Context,
    initial_context: Context,
    verify_body: Option<VerifyBody>,
    in_flight: VecDeque<Slot>,
    remaining: Option<u64>,
    pacer: Option<Pacer>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    stop: Option<watch::Receiver<bool>>,
    state: ConnectionState,
}

impl Connection {
    pub fn new(
        id: usize,
        settings: &Settings,
        plan: ConnectionPlan,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Self> {
        let target = settings.targets[plan.target % settings.targets.len()].clone();
        let mut sequencer = RequestSequencer::new(settings.templates.clone(), target.host_header.clone());
        if settings.id_replacement {
            sequencer = sequencer.with_id_replacement(settings.ids.clone());
        }

        let mut connection = Self {
            id,
            target,
            pipelining: settings.pipelining,
            timeout: settings.timeout,
            sequencer,
            context: settings.initial_context.clone(),
            initial_context: settings.initial_context.clone(),
            verify_body: settings.verify_body.clone(),
            in_flight: VecDeque::with_capacity(settings.pipelining),
            remaining: plan.quota,
            pacer: plan.rate.map(Pacer::per_second),
            events,
            stop: None,
            state: ConnectionState::Connecting,
        };

        if let Some(setup) = settings.setup_client.clone() {
            setup(&mut connection)?;
        }
        Ok(connection)
    }

    /// Ties the connection to its run's stop signal. Once it is set nothing
    /// more is written and `run` returns, without waiting for the round's
    /// shutdown.
    pub fn with_stop(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = Some(stop);
        self
    }

    fn is_stopped(&self) -> bool {
        self.stop.as_ref().is_some_and(|stop| *stop.borrow())
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn pipelining(&self) -> usize {
        self.pipelining
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    pub fn set_headers(&mut self, headers: BTreeMap<String, String>) -> Result<()> {
        self.ensure_mutable("set_headers")?;
        self.sequencer.set_headers(headers);
        Ok(())
    }

    pub fn set_body(&mut self, body: Option<Vec<u8>>) -> Result<()> {
        self.ensure_mutable("set_body")?;
        self.sequencer.set_body(body);
        Ok(())
    }

    pub fn set_headers_and_body(
        &mut self,
        headers: BTreeMap<String, String>,
        body: Option<Vec<u8>>,
    ) -> Result<()> {
        self.ensure_mutable("set_headers_and_body")?;
        self.sequencer.set_headers_and_body(headers, body);
        Ok(())
    }

    pub fn set_request(&mut self, request: RequestTemplate) -> Result<()> {
        self.ensure_mutable("set_request")?;
        self.sequencer.set_request(request);
        Ok(())
    }

    fn ensure_mutable(&self, operation: &str) -> Result<()> {
        if self.pipelining > 1 {
            return Err(Error::InvalidOperation(format!(
                "{} is not allowed with pipelining {}: the in-flight request to change is ambiguous",
                operation, self.pipelining
            )));
        }
        Ok(())
    }

    /// Terminal. The socket is closed when `run` unwinds and no reconnect
    /// follows.
    pub fn destroy(&mut self) {
        if self.state == ConnectionState::Destroyed {
            return;
        }
        self.state = ConnectionState::Destroyed;
        self.in_flight.clear();
        debug!("Connection {} destroyed", self.id);
    }

    /// Connects and cycles requests until the quota is used up, `shutdown`
    /// fires or the run is stopped.
    ///
    /// A refused connect is reported as an error and retried after a short
    /// delay. It is not charged against the quota, so a quota-bound
    /// connection to an unreachable target keeps retrying until the run is
    /// stopped or bails out.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        debug!("Connection {} targeting {}", self.id, self.target.url);

        loop {
            if *shutdown.borrow() || self.is_stopped() {
                break;
            }
            if self.remaining == Some(0) {
                self.emit(ConnectionEvent::Exhausted { connection: self.id });
                break;
            }

            self.state = ConnectionState::Connecting;
            let deadline = Instant::now() + self.timeout;
            let connected = tokio::select! {
                _ = shutdown.changed() => break,
                _ = stopped(self.stop.clone()) => break,
                result = timeout_at(deadline, connect(&self.target)) => result,
            };

            let stream = match connected {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!("Connection {} failed to connect: {}", self.id, e);
                    self.emit(ConnectionEvent::Error {
                        connection: self.id,
                        error: e.to_string(),
                    });
                    self.state = ConnectionState::Reconnecting;
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = stopped(self.stop.clone()) => break,
                        _ = sleep(RECONNECT_DELAY) => continue,
                    }
                }
                Err(_) => {
                    debug!("Connection {} timed out connecting", self.id);
                    for _ in 0..self.pipelining {
                        self.emit(ConnectionEvent::Timeout { connection: self.id });
                    }
                    self.state = ConnectionState::Reconnecting;
                    continue;
                }
            };

            if self.state == ConnectionState::Reconnecting {
                // slots missed while disconnected are not made up in a burst
                if let Some(pacer) = self.pacer.as_mut() {
                    pacer.restart();
                }
            }
            self.state = ConnectionState::Active;
            match self.drive(stream, &mut shutdown).await {
                Outcome::Shutdown => break,
                Outcome::Exhausted => {
                    self.emit(ConnectionEvent::Exhausted { connection: self.id });
                    break;
                }
                Outcome::Reconnect => self.state = ConnectionState::Reconnecting,
            }
        }

        self.destroy();
    }

    async fn drive(&mut self, stream: Transport, shutdown: &mut watch::Receiver<bool>) -> Outcome {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut parser = ResponseParser::new(self.verify_body.is_some() || self.sequencer.needs_body());
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut deadline = Instant::now() + self.timeout;

        if let Err(e) = self.fill(&mut writer, &mut deadline).await {
            return self.lost(Some(e.to_string()));
        }

        loop {
            if self.in_flight.is_empty() && self.remaining == Some(0) {
                return Outcome::Exhausted;
            }
            let paced_write = self.paced_write_at();

            tokio::select! {
                _ = shutdown.changed() => return Outcome::Shutdown,
                _ = stopped(self.stop.clone()) => return Outcome::Shutdown,
                _ = sleep_until(deadline), if !self.in_flight.is_empty() => {
                    self.on_timeout();
                    if self.remaining == Some(0) {
                        return Outcome::Exhausted;
                    }
                    return Outcome::Reconnect;
                }
                _ = sleep_until(paced_write.unwrap_or(deadline)), if paced_write.is_some() => {
                    if let Err(e) = self.fill(&mut writer, &mut deadline).await {
                        return self.lost(Some(e.to_string()));
                    }
                }
                read = reader.read(&mut buf) => {
                    let n = match read {
                        Ok(0) => {
                            if let Some(ParseEvent::Complete { status, bytes, body }) = parser.finish() {
                                self.on_complete(status, bytes, body);
                            }
                            let error = (!self.in_flight.is_empty()).then(|| {
                                format!("connection closed with {} request(s) in flight", self.in_flight.len())
                            });
                            debug!("Connection {} closed by peer", self.id);
                            return self.lost(error);
                        }
                        Ok(n) => n,
                        Err(e) => return self.lost(Some(e.to_string())),
                    };

                    parser.feed(&buf[..n]);
                    loop {
                        let head_request = self.in_flight.front().is_some_and(|slot| slot.head);
                        match parser.poll(head_request) {
                            Ok(Some(ParseEvent::Headers { status, headers })) => {
                                if let Some(slot) = self.in_flight.front_mut() {
                                    slot.status = Some(status);
                                    slot.headers = headers;
                                }
                            }
                            Ok(Some(ParseEvent::Complete { status, bytes, body })) => {
                                self.on_complete(status, bytes, body);
                                deadline = Instant::now() + self.timeout;
                            }
                            Ok(None) => break,
                            Err(e) => return self.lost(Some(format!("invalid response: {}", e))),
                        }
                    }

                    if let Err(e) = self.fill(&mut writer, &mut deadline).await {
                        return self.lost(Some(e.to_string()));
                    }
                }
            }
        }
    }

    fn can_write(&self, now: Instant) -> bool {
        self.in_flight.len() < self.pipelining
            && self.remaining != Some(0)
            && !self.is_stopped()
            && self.pacer.as_ref().is_none_or(|pacer| pacer.is_ready(now))
    }

    /// Set while a free slot is waiting on the pacer.
    fn paced_write_at(&self) -> Option<Instant> {
        if self.in_flight.len() >= self.pipelining || self.remaining == Some(0) || self.is_stopped() {
            return None;
        }
        self.pacer.as_ref().and_then(Pacer::next_slot)
    }

    /// Writes requests into every free slot the quota and pacer allow, as
    /// one batch.
    async fn fill<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        deadline: &mut Instant,
    ) -> std::io::Result<()> {
        let now = Instant::now();
        let mut batch = Vec::new();

        while self.can_write(now) {
            if self.in_flight.is_empty() {
                *deadline = now + self.timeout;
            }
            if let Some(pacer) = self.pacer.as_mut() {
                pacer.advance(now);
            }
            if let Some(remaining) = self.remaining.as_mut() {
                *remaining -= 1;
            }

            let prepared = self.sequencer.next_request(&mut self.context);
            batch.extend_from_slice(&prepared.bytes);
            self.in_flight.push_back(Slot::new(&prepared, now));
            self.emit(ConnectionEvent::Sent { connection: self.id });
        }

        if !batch.is_empty() {
            trace!("Connection {} writing {} bytes", self.id, batch.len());
            writer.write_all(&batch).await?;
        }
        Ok(())
    }

    fn on_complete(&mut self, status: u16, bytes: usize, body: Option<Vec<u8>>) {
        let Some(slot) = self.in_flight.pop_front() else {
            debug!("Connection {} received an unsolicited {} response", self.id, status);
            return;
        };
        let duration_ms = slot.written_at.elapsed().as_millis() as u64;
        trace!(
            "Connection {} got {} ({} headers) in {}ms",
            self.id,
            slot.status.unwrap_or(status),
            slot.headers.len(),
            duration_ms
        );

        let body = body
            .map(|body| String::from_utf8_lossy(&body).into_owned())
            .unwrap_or_default();
        self.sequencer
            .on_response(slot.template, status, &body, &mut self.context);

        self.emit(ConnectionEvent::Response {
            connection: self.id,
            status,
            bytes,
            duration_ms,
            title: slot.title,
            template: slot.template,
        });

        let verified = self.verify_body.as_ref().is_none_or(|verify| verify(&body));
        if !verified {
            self.emit(ConnectionEvent::Mismatch {
                connection: self.id,
                body,
            });
            self.reset();
        }
    }

    /// Restarts the request cycle from the first template without touching
    /// the socket. Requests already in flight stay queued and their
    /// responses are still recorded.
    fn reset(&mut self) {
        self.sequencer.reset();
        self.context = self.initial_context.clone();
        self.emit(ConnectionEvent::Reset { connection: self.id });
    }

    fn on_timeout(&mut self) {
        debug!(
            "Connection {} timed out with {} request(s) in flight",
            self.id,
            self.in_flight.len()
        );
        for _ in 0..self.in_flight.len() {
            self.emit(ConnectionEvent::Timeout { connection: self.id });
        }
        // timed out requests stay charged against the quota
        self.in_flight.clear();
    }

    /// Transport failure. Unanswered requests go back to the quota and are
    /// sent again after reconnecting.
    fn lost(&mut self, error: Option<String>) -> Outcome {
        if let Some(error) = error {
            debug!("Connection {} error: {}", self.id, error);
            self.emit(ConnectionEvent::Error {
                connection: self.id,
                error,
            });
        }
        let unanswered = self.in_flight.len() as u64;
        self.in_flight.clear();
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining += unanswered;
        }
        Outcome::Reconnect
    }

    fn emit(&self, event: ConnectionEvent) {
        // the run may already be gone during teardown
        let _ = self.events.send(event);
    }
}

/// Resolves once the run is stopped. Pending forever without a stop signal
/// or once its sender is gone.
async fn stopped(stop: Option<watch::Receiver<bool>>) {
    if let Some(mut stop) = stop {
        if stop.wait_for(|stopped| *stopped).await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::hooks::HookRegistry;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_test::{assert_err, assert_ok};

    const OK: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nhello world";

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    /// Reads from the socket until `count` request heads have arrived.
    async fn read_requests(socket: &mut TcpStream, count: usize) -> String {
        let mut seen = Vec::new();
        let mut buf = [0u8; 4096];
        while String::from_utf8_lossy(&seen).matches("\r\n\r\n").count() < count {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed early");
            seen.extend_from_slice(&buf[..n]);
        }
        String::from_utf8_lossy(&seen).into_owned()
    }

    fn settings_for(config: Config) -> Settings {
        settings_with(config, &HookRegistry::new())
    }

    fn settings_with(config: Config, hooks: &HookRegistry) -> Settings {
        Settings::from_config(&config, hooks).unwrap()
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = matches!(event, ConnectionEvent::Exhausted { .. });
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    fn responses(events: &[ConnectionEvent]) -> Vec<u16> {
        events
            .iter()
            .filter_map(|event| match event {
                ConnectionEvent::Response { status, .. } => Some(*status),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn writes_the_whole_pipeline_before_any_response() {
        let (listener, url) = listener().await;
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let requests = read_requests(&mut socket, 3).await;
            for _ in 0..3 {
                socket.write_all(OK).await.unwrap();
            }
            requests
        });

        let settings = settings_for(Config {
            pipelining: 3,
            ..Config::for_url(url)
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let plan = ConnectionPlan {
            quota: Some(3),
            ..ConnectionPlan::default()
        };
        let connection = Connection::new(0, &settings, plan, tx).unwrap();
        let (_stop, shutdown) = watch::channel(false);
        tokio::spawn(connection.run(shutdown));

        let events = collect(rx).await;
        assert_eq!(responses(&events), vec![200, 200, 200]);
        let sent = events
            .iter()
            .filter(|e| matches!(e, ConnectionEvent::Sent { .. }))
            .count();
        assert_eq!(sent, 3);

        let requests = server.await.unwrap();
        assert_eq!(requests.matches("GET / HTTP/1.1\r\n").count(), 3);
    }

    #[tokio::test]
    async fn silent_peer_produces_timeouts() {
        let (listener, url) = listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            while socket.read(&mut buf).await.unwrap_or(0) > 0 {}
        });

        let settings = settings_for(Config {
            timeout: 0.2,
            ..Config::for_url(url)
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let plan = ConnectionPlan {
            quota: Some(1),
            ..ConnectionPlan::default()
        };
        let connection = Connection::new(0, &settings, plan, tx).unwrap();
        let (_stop, shutdown) = watch::channel(false);

        let started = std::time::Instant::now();
        tokio::spawn(connection.run(shutdown));
        let events = collect(rx).await;

        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(matches!(events[0], ConnectionEvent::Sent { .. }));
        assert!(matches!(events[1], ConnectionEvent::Timeout { .. }));
        assert!(matches!(events[2], ConnectionEvent::Exhausted { .. }));
    }

    #[tokio::test]
    async fn reconnects_after_peer_close_and_resends() {
        let (listener, url) = listener().await;
        tokio::spawn(async move {
            let (mut first, _) = listener.accept().await.unwrap();
            read_requests(&mut first, 1).await;
            drop(first);

            let (mut second, _) = listener.accept().await.unwrap();
            read_requests(&mut second, 1).await;
            second.write_all(OK).await.unwrap();
            let mut buf = [0u8; 64];
            let _ = second.read(&mut buf).await;
        });

        let settings = settings_for(Config::for_url(url));
        let (tx, rx) = mpsc::unbounded_channel();
        let plan = ConnectionPlan {
            quota: Some(1),
            ..ConnectionPlan::default()
        };
        let connection = Connection::new(0, &settings, plan, tx).unwrap();
        let (_stop, shutdown) = watch::channel(false);
        tokio::spawn(connection.run(shutdown));

        let events = collect(rx).await;
        assert!(events.iter().any(|e| matches!(e, ConnectionEvent::Error { .. })));
        assert_eq!(responses(&events), vec![200]);
    }

    #[tokio::test]
    async fn body_mismatch_resets_without_reconnecting() {
        let (listener, url) = listener().await;
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            for _ in 0..2 {
                read_requests(&mut socket, 1).await;
                socket.write_all(OK).await.unwrap();
            }
            // a second accept would mean the client reconnected
            tokio::time::timeout(Duration::from_millis(100), listener.accept())
                .await
                .is_err()
        });

        let hooks = HookRegistry::new();
        hooks.register_verify_body("expects-bye", |body| body == "bye");
        let settings = settings_with(
            Config {
                verify_body: Some("expects-bye".to_string()),
                ..Config::for_url(url)
            },
            &hooks,
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let plan = ConnectionPlan {
            quota: Some(2),
            ..ConnectionPlan::default()
        };
        let connection = Connection::new(0, &settings, plan, tx).unwrap();
        let (_stop, shutdown) = watch::channel(false);
        tokio::spawn(connection.run(shutdown));

        let events = collect(rx).await;
        let mismatches = events
            .iter()
            .filter(|e| matches!(e, ConnectionEvent::Mismatch { body, .. } if body == "hello world"))
            .count();
        let resets = events
            .iter()
            .filter(|e| matches!(e, ConnectionEvent::Reset { .. }))
            .count();
        assert_eq!(mismatches, 2);
        assert_eq!(resets, 2);
        assert!(server.await.unwrap(), "client reconnected after a mismatch");
    }

    #[tokio::test]
    async fn shutdown_stops_a_connection() {
        let (listener, url) = listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            while socket.read(&mut buf).await.unwrap_or(0) > 0 {}
        });

        let settings = settings_for(Config::for_url(url));
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = Connection::new(0, &settings, ConnectionPlan::default(), tx).unwrap();
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(connection.run(shutdown));

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.send_replace(true);
        assert_ok!(tokio::time::timeout(Duration::from_secs(1), task).await);
    }

    #[tokio::test]
    async fn nothing_is_written_once_the_run_stops() {
        let (listener, url) = listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let count = String::from_utf8_lossy(&buf[..n]).matches("\r\n\r\n").count();
                        for _ in 0..count {
                            if socket.write_all(OK).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        let settings = settings_for(Config {
            pipelining: 2,
            ..Config::for_url(url)
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop, stop_rx) = watch::channel(false);
        let connection = Connection::new(0, &settings, ConnectionPlan::default(), tx)
            .unwrap()
            .with_stop(stop_rx);
        let (_shutdown, shutdown) = watch::channel(false);
        let task = tokio::spawn(connection.run(shutdown));

        while !matches!(rx.recv().await, Some(ConnectionEvent::Response { .. })) {}
        while rx.try_recv().is_ok() {}
        stop.send_replace(true);

        assert_ok!(tokio::time::timeout(Duration::from_secs(1), task).await);
        while let Ok(event) = rx.try_recv() {
            assert!(
                !matches!(event, ConnectionEvent::Sent { .. }),
                "request written after stop"
            );
        }
    }

    #[tokio::test]
    async fn mismatch_keeps_the_rest_of_the_pipeline() {
        let (listener, url) = listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_requests(&mut socket, 2).await;
            socket.write_all(OK).await.unwrap();
            socket.write_all(OK).await.unwrap();
            let mut buf = [0u8; 64];
            let _ = socket.read(&mut buf).await;
        });

        let hooks = HookRegistry::new();
        hooks.register_verify_body("expects-bye", |body| body == "bye");
        let settings = settings_with(
            Config {
                pipelining: 2,
                verify_body: Some("expects-bye".to_string()),
                ..Config::for_url(url)
            },
            &hooks,
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let plan = ConnectionPlan {
            quota: Some(2),
            ..ConnectionPlan::default()
        };
        let connection = Connection::new(0, &settings, plan, tx).unwrap();
        let (_stop, shutdown) = watch::channel(false);
        tokio::spawn(connection.run(shutdown));

        let events = collect(rx).await;
        assert_eq!(responses(&events), vec![200, 200]);
        let resets = events
            .iter()
            .filter(|e| matches!(e, ConnectionEvent::Reset { .. }))
            .count();
        assert_eq!(resets, 2);
    }

    #[tokio::test]
    async fn refused_connects_are_retried_after_a_delay() {
        // bound then dropped, so nothing listens there
        let (listener, url) = listener().await;
        drop(listener);

        let settings = settings_for(Config::for_url(url));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let plan = ConnectionPlan {
            quota: Some(1),
            ..ConnectionPlan::default()
        };
        let connection = Connection::new(0, &settings, plan, tx).unwrap();
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(connection.run(shutdown));

        tokio::time::sleep(Duration::from_millis(350)).await;
        stop.send_replace(true);
        assert_ok!(tokio::time::timeout(Duration::from_secs(1), task).await);

        let mut errors = 0;
        while let Ok(event) = rx.try_recv() {
            assert!(matches!(event, ConnectionEvent::Error { .. }));
            errors += 1;
        }
        assert!((2..=5).contains(&errors), "{} connect errors", errors);
    }

    #[test]
    fn mutation_is_refused_with_pipelining() {
        let settings = settings_for(Config {
            pipelining: 2,
            ..Config::for_url("http://localhost")
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut connection = Connection::new(0, &settings, ConnectionPlan::default(), tx).unwrap();

        let error = assert_err!(connection.set_body(Some(b"x".to_vec())));
        assert!(matches!(error, Error::InvalidOperation(_)));
        assert_err!(connection.set_headers(BTreeMap::new()));
        assert_eq!(connection.state(), ConnectionState::Connecting);

        connection.destroy();
        assert_eq!(connection.state(), ConnectionState::Destroyed);
    }

    #[test]
    fn setup_client_can_rewrite_the_request() {
        let hooks = HookRegistry::new();
        hooks.register_setup_client("auth", |connection: &mut Connection| {
            let mut headers = BTreeMap::new();
            headers.insert("authorization".to_string(), "Bearer abc".to_string());
            connection.set_headers(headers)?;
            connection
                .context_mut()
                .insert("user".to_string(), "42".to_string());
            Ok(())
        });
        let settings = settings_with(
            Config {
                setup_client: Some("auth".to_string()),
                ..Config::for_url("http://localhost")
            },
            &hooks,
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut connection = Connection::new(7, &settings, ConnectionPlan::default(), tx).unwrap();

        assert_eq!(connection.id(), 7);
        assert_eq!(connection.context_mut()["user"], "42");
        let prepared = connection.sequencer.next_request(&mut Context::new());
        let text = String::from_utf8(prepared.bytes.to_vec()).unwrap();
        assert!(text.contains("authorization: Bearer abc\r\n"));
    }
}
