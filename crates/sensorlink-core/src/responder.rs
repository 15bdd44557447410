//! Server-side request handling: simulated sensors and the request responder.
//!
//! Every sensor source owns its generator. Nothing here touches shared global
//! RNG state, so a seeded source produces the same sequence on every run.

use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::ingest::{LineAssembler, MAX_PENDING_LINE};
use crate::record::{Reading, encode_reading, is_request};

/// Half-open value ranges of the simulated quantities.
pub const AZIMUTH_RANGE: std::ops::Range<f64> = 0.0..360.0;
pub const ELEVATION_RANGE: std::ops::Range<f64> = 0.0..90.0;
pub const TEMPERATURE_RANGE: std::ops::Range<f64> = 20.0..30.0;
pub const HUMIDITY_RANGE: std::ops::Range<f64> = 40.0..80.0;

/// Anything that can produce one four-quantity reading on demand.
pub trait SensorSource: Send {
    fn sample(&mut self) -> Reading;
}

/// Independent uniform draws over each quantity's range.
#[derive(Debug, Clone)]
pub struct RandomSensors<R = StdRng> {
    rng: R,
}

impl RandomSensors<StdRng> {
    /// Deterministic source for reproducible runs and tests.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    /// Source seeded from the operating system.
    pub fn from_entropy() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }
}

impl<R: Rng> RandomSensors<R> {
    pub fn with_rng(rng: R) -> Self {
        Self { rng }
    }
}

impl<R: Rng + Send> SensorSource for RandomSensors<R> {
    fn sample(&mut self) -> Reading {
        Reading {
            azimuth: self.rng.random_range(AZIMUTH_RANGE),
            elevation: self.rng.random_range(ELEVATION_RANGE),
            temperature: self.rng.random_range(TEMPERATURE_RANGE),
            humidity: self.rng.random_range(HUMIDITY_RANGE),
        }
    }
}

/// Always answers with the same reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedSensors(pub Reading);

impl SensorSource for FixedSensors {
    fn sample(&mut self) -> Reading {
        self.0
    }
}

/// Turns request bytes from one connection into reply bytes.
///
/// Requests are line-framed like replies, so a `GET_DATA` split across reads
/// or several requests coalesced into one read are each answered exactly once.
#[derive(Debug)]
pub struct Responder<S> {
    source: S,
    assembler: LineAssembler,
    replies: u64,
}

impl<S: SensorSource> Responder<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            assembler: LineAssembler::new(),
            replies: 0,
        }
    }

    /// Consume received bytes; returns the encoded replies owed, possibly empty.
    pub fn handle(&mut self, bytes: &[u8]) -> Vec<u8> {
        self.assembler.extend(bytes);
        let mut out = Vec::new();
        while let Some(line) = self.assembler.next_line() {
            if !is_request(&line) {
                debug!("ignoring unexpected request line {line:?}");
                continue;
            }
            let reading = self.source.sample();
            debug!(
                "sending AZ: {} EL: {} TE: {} HU: {}",
                reading.azimuth, reading.elevation, reading.temperature, reading.humidity
            );
            out.extend_from_slice(encode_reading(&reading).as_bytes());
            self.replies += 1;
        }
        let dropped = self.assembler.enforce_limit(MAX_PENDING_LINE);
        if dropped > 0 {
            warn!("discarded {dropped} bytes of unterminated request input");
        }
        out
    }

    /// Bytes of a request line still waiting for its terminator.
    pub fn pending(&self) -> usize {
        self.assembler.pending().len()
    }

    /// Number of readings sent so far.
    pub fn replies(&self) -> u64 {
        self.replies
    }
}
