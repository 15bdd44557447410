//! Fixed-rate request pacing with drift compensation.
//!
//! The schedule is an absolute deadline that advances by exactly one period
//! per request. It is never re-derived from the current time, so time spent
//! sending or being descheduled does not accumulate into the average rate.
//! When a deadline has already passed the pacer logs that it is falling behind
//! and sends the next request immediately.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::Serialize;

use crate::error::{ConfigError, TransportError};
use crate::record::REQUEST_MARKER;

/// Default request rate.
pub const DEFAULT_FREQUENCY_HZ: f64 = 600.0;

/// Pause before retrying a send that would block.
pub const SEND_BACKOFF: Duration = Duration::from_micros(100);

/// Longest accepted inter-send period (lowest rate is one request per hour).
pub const MAX_PERIOD: Duration = Duration::from_secs(3600);

/// Longest uninterrupted sleep between checks of the running flag.
pub const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Inter-send period for a target frequency.
pub fn period_for(frequency_hz: f64) -> Result<Duration, ConfigError> {
    if !frequency_hz.is_finite() || frequency_hz <= 0.0 {
        return Err(ConfigError::InvalidFrequency(frequency_hz));
    }
    match Duration::try_from_secs_f64(1.0 / frequency_hz) {
        Ok(period) if !period.is_zero() && period <= MAX_PERIOD => Ok(period),
        _ => Err(ConfigError::InvalidFrequency(frequency_hz)),
    }
}

/// Sleep for `d` in slices, returning early with `false` once `running` clears.
fn sleep_while_running(d: Duration, running: &AtomicBool) -> bool {
    let deadline = Instant::now() + d;
    loop {
        if !running.load(Ordering::Acquire) {
            return false;
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return true;
        }
        std::thread::sleep(left.min(STOP_CHECK_INTERVAL));
    }
}

/// What the caller should do after a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
    /// Sleep this long to hit the next deadline.
    Sleep(Duration),
    /// The deadline passed this long ago; send again right away.
    Behind(Duration),
}

/// Counters kept by the pacer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PacerStats {
    pub requests_sent: u64,
    pub would_block_retries: u64,
    pub behind_count: u64,
}

/// Drift-compensated request scheduler.
#[derive(Debug, Clone)]
pub struct Pacer {
    frequency_hz: f64,
    period: Duration,
    next_deadline: Instant,
    backoff: Duration,
    stats: PacerStats,
}

impl Pacer {
    /// Schedule anchored at `start`; the first request goes out immediately.
    pub fn new(frequency_hz: f64, start: Instant) -> Result<Self, ConfigError> {
        Ok(Self::with_period(frequency_hz, period_for(frequency_hz)?, start))
    }

    /// Schedule with an already validated period.
    pub fn with_period(frequency_hz: f64, period: Duration, start: Instant) -> Self {
        Self {
            frequency_hz,
            period,
            next_deadline: start,
            backoff: SEND_BACKOFF,
            stats: PacerStats::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn next_deadline(&self) -> Instant {
        self.next_deadline
    }

    pub fn stats(&self) -> PacerStats {
        self.stats
    }

    /// Advance the deadline by one period and compare it with `now`.
    pub fn step(&mut self, now: Instant) -> Pace {
        self.next_deadline += self.period;
        if now < self.next_deadline {
            Pace::Sleep(self.next_deadline - now)
        } else {
            Pace::Behind(now - self.next_deadline)
        }
    }

    /// Send requests on `writer` at the configured rate until `running` clears.
    ///
    /// Returns `Ok(())` when stopped. Would-block sends back off and retry
    /// without consuming a deadline; any other write fault ends the loop.
    pub fn run<W: Write>(&mut self, writer: &mut W, running: &AtomicBool) -> Result<(), TransportError> {
        debug!(
            "pacer started at {} Hz (period {:?})",
            self.frequency_hz, self.period
        );

        while running.load(Ordering::Acquire) {
            if !self.send_request(writer, running)? {
                break;
            }
            self.stats.requests_sent += 1;

            match self.step(Instant::now()) {
                Pace::Sleep(d) => {
                    if !sleep_while_running(d, running) {
                        break;
                    }
                }
                Pace::Behind(lag) => {
                    self.stats.behind_count += 1;
                    warn!(
                        "falling behind {} Hz request rate by {:?}",
                        self.frequency_hz, lag
                    );
                }
            }
        }

        debug!("pacer stopped after {} requests", self.stats.requests_sent);
        Ok(())
    }

    /// Write one request marker. `Ok(false)` means the flag cleared mid-retry.
    fn send_request<W: Write>(&mut self, writer: &mut W, running: &AtomicBool) -> Result<bool, TransportError> {
        let mut written = 0;
        while written < REQUEST_MARKER.len() {
            match writer.write(&REQUEST_MARKER[written..]) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => written += n,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    self.stats.would_block_retries += 1;
                    if !running.load(Ordering::Acquire) {
                        return Ok(false);
                    }
                    std::thread::sleep(self.backoff);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
        Ok(true)
    }
}
