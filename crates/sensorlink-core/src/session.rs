//! Client session controller.
//!
//! Owns the connection for its whole lifetime. [`ClientSession::start`] spawns
//! the ingestion loop on a dedicated thread (it only ever reads the socket),
//! then runs the request pacer on the calling thread (it only ever writes).
//! Shutdown is cooperative: clearing the running flag stops the pacer after
//! its current request and the ingestion loop at its next poll timeout, after
//! which the thread is joined and the socket is shut down.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::error::{ConfigError, ConnectError, TransportError};
use crate::ingest::{IngestOutcome, IngestStats, Ingestor, run_ingest_loop};
use crate::pacer::{DEFAULT_FREQUENCY_HZ, Pacer, PacerStats, SEND_BACKOFF, period_for};
use crate::window::{Aggregator, DEFAULT_WINDOW_SIZE, ReportPolicy, WindowAverage};

/// Bound on connection establishment.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on each steady-state readiness wait.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Configuration for a client session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub frequency_hz: f64,
    pub window_size: usize,
    pub report_policy: ReportPolicy,
    pub connect_timeout: Duration,
    pub poll_timeout: Duration,
    pub send_backoff: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            frequency_hz: DEFAULT_FREQUENCY_HZ,
            window_size: DEFAULT_WINDOW_SIZE,
            report_policy: ReportPolicy::FirstFill,
            connect_timeout: CONNECT_TIMEOUT,
            poll_timeout: POLL_TIMEOUT,
            send_backoff: SEND_BACKOFF,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        period_for(self.frequency_hz)?;
        if self.window_size == 0 {
            return Err(ConfigError::EmptyWindow);
        }
        // Zero read/write timeouts are rejected by the socket layer.
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("connect timeout"));
        }
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("poll timeout"));
        }
        Ok(())
    }

    /// `host:port` as shown in logs and errors.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

// ---------------------------------------------------------------------------
// Stop handle
// ---------------------------------------------------------------------------

/// Clonable handle that asks a running session to stop.
#[derive(Debug, Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// How a session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// Stopped through [`StopHandle`] or [`ClientSession::stop`].
    Stopped,
    /// The server closed the connection.
    PeerClosed,
    /// The pacer hit a hard send fault.
    SendFault(TransportError),
    /// The ingestion loop hit a hard read fault.
    ReadFault(io::Error),
}

impl SessionOutcome {
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::SendFault(_) | Self::ReadFault(_))
    }
}

impl std::fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::PeerClosed => write!(f, "closed by server"),
            Self::SendFault(e) => write!(f, "send fault: {e}"),
            Self::ReadFault(e) => write!(f, "read fault: {e}"),
        }
    }
}

fn serialize_display<T: std::fmt::Display, S: Serializer>(value: &T, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(value)
}

/// End-of-session statistics.
#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub peer: SocketAddr,
    pub elapsed: Duration,
    pub pacer: PacerStats,
    pub ingest: IngestStats,
    #[serde(serialize_with = "serialize_display")]
    pub outcome: SessionOutcome,
}

impl SessionSummary {
    /// Average request rate actually achieved.
    pub fn achieved_rate_hz(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.pacer.requests_sent as f64 / secs
        } else {
            0.0
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A connected client session.
pub struct ClientSession {
    id: Uuid,
    config: ClientConfig,
    period: Duration,
    template: Aggregator,
    stream: Arc<TcpStream>,
    peer: SocketAddr,
    running: Arc<AtomicBool>,
    reports_tx: Option<Sender<WindowAverage>>,
    ingest: Option<JoinHandle<(IngestOutcome, IngestStats)>>,
    started: bool,
}

impl ClientSession {
    /// Resolve and connect, waiting at most `config.connect_timeout`.
    pub fn connect(config: ClientConfig) -> Result<Self, ConnectError> {
        config.validate()?;
        let period = period_for(config.frequency_hz)?;
        let template = Aggregator::new(config.window_size, config.report_policy)?;
        let address = config.address();

        let addrs: Vec<SocketAddr> = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|_| ConnectError::AddressInvalid {
                address: address.clone(),
            })?
            .collect();
        if addrs.is_empty() {
            return Err(ConnectError::AddressInvalid { address });
        }

        let stream = connect_within(&addrs, config.connect_timeout, |addr, budget| {
            debug!("connecting to {addr} ({budget:?} left)");
            TcpStream::connect_timeout(addr, budget)
        })
        .map_err(|e| classify_connect_error(address.clone(), config.connect_timeout, e))?;

        let setup = |stream: &TcpStream| -> io::Result<SocketAddr> {
            stream.set_nodelay(true)?;
            stream.set_read_timeout(Some(config.poll_timeout))?;
            stream.set_write_timeout(Some(config.poll_timeout))?;
            stream.peer_addr()
        };
        let peer = setup(&stream).map_err(|source| ConnectError::Io {
            address: address.clone(),
            source,
        })?;

        let id = Uuid::new_v4();
        info!("connected to sensor server at {peer} (session {id})");

        Ok(Self {
            id,
            config,
            period,
            template,
            stream: Arc::new(stream),
            peer,
            running: Arc::new(AtomicBool::new(true)),
            reports_tx: None,
            ingest: None,
            started: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Receive every window average surfaced by [`start`](Self::start).
    ///
    /// Must be called before `start`. Once the session has started the
    /// returned receiver is already disconnected, so iterating it ends at once.
    pub fn reports(&mut self) -> Receiver<WindowAverage> {
        let (tx, rx) = mpsc::channel();
        if self.started {
            warn!("reports requested after session {} started", self.id);
        } else {
            self.reports_tx = Some(tx);
        }
        rx
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: Arc::clone(&self.running),
        }
    }

    /// Run the session until stopped, closed by the server, or faulted.
    ///
    /// Blocks the calling thread, which becomes the request pacer. The `Err`
    /// case is limited to failing to start the ingestion thread; how a running
    /// session ended is reported in [`SessionSummary::outcome`].
    pub fn start(&mut self) -> Result<SessionSummary, TransportError> {
        let started = Instant::now();
        self.started = true;
        self.spawn_ingest()?;

        let mut pacer = Pacer::with_period(self.config.frequency_hz, self.period, started)
            .with_backoff(self.config.send_backoff);
        let mut writer: &TcpStream = &self.stream;
        let sent = pacer.run(&mut writer, &self.running);
        if let Err(e) = &sent {
            if is_peer_close(e) {
                info!("server closed the connection: {e}");
            } else {
                error!("request loop terminated: {e}");
            }
        }

        let (ingest_outcome, ingest_stats) = self.shutdown();
        let outcome = session_outcome(sent, ingest_outcome);

        let summary = SessionSummary {
            session_id: self.id,
            peer: self.peer,
            elapsed: started.elapsed(),
            pacer: pacer.stats(),
            ingest: ingest_stats,
            outcome,
        };
        info!(
            "session {} ended ({}): {} requests, {} records, {} reports in {:.1?}",
            summary.session_id,
            summary.outcome,
            summary.pacer.requests_sent,
            summary.ingest.records,
            summary.ingest.reports,
            summary.elapsed
        );
        Ok(summary)
    }

    /// Stop the session: clear the flag, join the ingestion loop, close the socket.
    pub fn stop(&mut self) {
        self.shutdown();
    }

    fn spawn_ingest(&mut self) -> Result<(), TransportError> {
        let stream = Arc::clone(&self.stream);
        let running = Arc::clone(&self.running);
        let reports = self.reports_tx.take();
        let mut ingestor = Ingestor::with_aggregator(self.template.clone());

        let handle = std::thread::Builder::new()
            .name("sensorlink-ingest".to_string())
            .spawn(move || {
                let mut reader: &TcpStream = &stream;
                let outcome = run_ingest_loop(&mut reader, &running, &mut ingestor, reports.as_ref());
                // Take the pacer down with us when the connection ends first.
                running.store(false, Ordering::Release);
                (outcome, ingestor.stats())
            })?;
        self.ingest = Some(handle);
        Ok(())
    }

    fn shutdown(&mut self) -> (IngestOutcome, IngestStats) {
        self.running.store(false, Ordering::Release);

        let result = match self.ingest.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                (
                    IngestOutcome::Fault(io::Error::other("ingestion thread panicked")),
                    IngestStats::default(),
                )
            }),
            None => (IngestOutcome::Stopped, IngestStats::default()),
        };

        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                warn!("socket shutdown failed: {e}");
            }
        }
        result
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Combine how both loops ended. A server close can surface on either side
/// first (EOF on read, EPIPE or reset on write), so it wins over faults.
fn session_outcome(sent: Result<(), TransportError>, ingest: IngestOutcome) -> SessionOutcome {
    match (sent, ingest) {
        (_, IngestOutcome::EndOfStream) => SessionOutcome::PeerClosed,
        (Err(e), _) if is_peer_close(&e) => SessionOutcome::PeerClosed,
        (Err(e), _) => SessionOutcome::SendFault(e),
        (Ok(()), IngestOutcome::Fault(e)) if is_peer_close_kind(e.kind()) => SessionOutcome::PeerClosed,
        (Ok(()), IngestOutcome::Fault(e)) => SessionOutcome::ReadFault(e),
        (Ok(()), IngestOutcome::Stopped) => SessionOutcome::Stopped,
    }
}

fn is_peer_close(e: &TransportError) -> bool {
    match e {
        TransportError::Closed => true,
        TransportError::Io(e) => is_peer_close_kind(e.kind()),
    }
}

fn is_peer_close_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

/// Try each address in turn, all within one shared `timeout`.
fn connect_within<T>(
    addrs: &[SocketAddr],
    timeout: Duration,
    mut attempt: impl FnMut(&SocketAddr, Duration) -> io::Result<T>,
) -> io::Result<T> {
    let deadline = Instant::now() + timeout;
    let mut last_err = None;
    for addr in addrs {
        let budget = deadline.saturating_duration_since(Instant::now());
        if budget.is_zero() {
            return Err(io::ErrorKind::TimedOut.into());
        }
        match attempt(addr, budget) {
            Ok(conn) => return Ok(conn),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no addresses to connect to")))
}

fn classify_connect_error(address: String, timeout: Duration, e: io::Error) -> ConnectError {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => ConnectError::Refused { address },
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ConnectError::Timeout { address, timeout },
        _ => ConnectError::Io { address, source: e },
    }
}
