//! Ingestion loop: stream reassembly, decoding and window aggregation.
//!
//! The loop owns the read half of the connection. Each cycle waits for data
//! with a bounded timeout (the socket's read timeout), drains one chunk of at
//! most [`READ_CHUNK`] bytes into the reassembly buffer, and routes every
//! complete line through the codec into the aggregator. A partial trailing
//! line stays buffered until the rest arrives.
//!
//! ```text
//! Idle → WaitingReadable ⇄ Draining
//!             │
//!             └─ stop flag / EOF / hard fault → Terminated
//! ```

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;

use log::{debug, error, info, trace, warn};
use serde::Serialize;

use crate::error::{ConfigError, DecodeError};
use crate::record::decode_line;
use crate::window::{Aggregator, ReportPolicy, WindowAverage};

/// Upper bound on a single read.
pub const READ_CHUNK: usize = 2048;

/// A partial line longer than this is discarded rather than buffered forever.
pub const MAX_PENDING_LINE: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Reassembly
// ---------------------------------------------------------------------------

/// Reassembly buffer that turns arbitrary byte chunks into complete lines.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buf: Vec<u8>,
    /// Offset of the first unconsumed byte in `buf`.
    start: usize,
    /// Bytes past `start` already known to hold no `\n`.
    scanned: usize,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete line, without its `\n`.
    pub fn next_line(&mut self) -> Option<String> {
        let rest = &self.buf[self.start..];
        let Some(pos) = rest[self.scanned..].iter().position(|&b| b == b'\n') else {
            self.scanned = rest.len();
            return None;
        };
        let end = self.scanned + pos;
        let line = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.start += end + 1;
        self.scanned = 0;
        Some(line)
    }

    /// Bytes of the trailing incomplete line.
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    /// Drop a buffered partial line. Returns how many bytes were discarded.
    pub fn discard_pending(&mut self) -> usize {
        let n = self.buf.len() - self.start;
        self.buf.clear();
        self.start = 0;
        self.scanned = 0;
        n
    }

    /// Discard the partial line once it grows past `limit` bytes.
    ///
    /// Call after draining complete lines. Returns the bytes dropped, zero
    /// when the partial line is within bounds.
    pub fn enforce_limit(&mut self, limit: usize) -> usize {
        if self.pending().len() > limit {
            self.discard_pending()
        } else {
            0
        }
    }
}

// ---------------------------------------------------------------------------
// Ingestor
// ---------------------------------------------------------------------------

/// Where the ingestion loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestState {
    #[default]
    Idle,
    WaitingReadable,
    Draining,
    Terminated,
}

/// Counters kept by the ingestion loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub bytes_received: u64,
    pub reads: u64,
    pub poll_timeouts: u64,
    pub records: u64,
    pub unknown_lines: u64,
    pub malformed_lines: u64,
    pub discarded_bytes: u64,
    pub reports: u64,
}

/// Reassembly + decoding + aggregation, independent of any socket.
#[derive(Debug)]
pub struct Ingestor {
    assembler: LineAssembler,
    aggregator: Aggregator,
    stats: IngestStats,
    state: IngestState,
}

impl Ingestor {
    pub fn new(window_size: usize, policy: ReportPolicy) -> Result<Self, ConfigError> {
        Ok(Self::with_aggregator(Aggregator::new(window_size, policy)?))
    }

    pub fn with_aggregator(aggregator: Aggregator) -> Self {
        Self {
            assembler: LineAssembler::new(),
            aggregator,
            stats: IngestStats::default(),
            state: IngestState::Idle,
        }
    }

    /// Consume one received chunk; returns the averages it surfaced.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<WindowAverage> {
        self.stats.bytes_received += bytes.len() as u64;
        self.assembler.extend(bytes);

        let mut reports = Vec::new();
        while let Some(line) = self.assembler.next_line() {
            match decode_line(&line) {
                Ok(record) => {
                    self.stats.records += 1;
                    trace!("received {}: {}", record.tag, record.value);
                    if let Some(avg) = self.aggregator.push(record) {
                        self.stats.reports += 1;
                        info!(
                            "{} average ({} samples): {}",
                            avg.tag.label(),
                            avg.samples,
                            avg.mean
                        );
                        reports.push(avg);
                    }
                }
                Err(DecodeError::UnrecognizedLine(line)) => {
                    self.stats.unknown_lines += 1;
                    debug!("dropping unrecognized line {line:?}");
                }
                Err(DecodeError::MalformedNumber(line)) => {
                    self.stats.malformed_lines += 1;
                    debug!("dropping line with malformed value {line:?}");
                }
            }
        }

        let n = self.assembler.enforce_limit(MAX_PENDING_LINE);
        if n > 0 {
            self.stats.discarded_bytes += n as u64;
            warn!("discarded {n} bytes of unterminated input");
        }
        reports
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    pub fn state(&self) -> IngestState {
        self.state
    }

    /// Bytes held back waiting for a line terminator.
    pub fn pending(&self) -> &[u8] {
        self.assembler.pending()
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// Why the ingestion loop returned.
#[derive(Debug)]
pub enum IngestOutcome {
    /// The running flag was cleared.
    Stopped,
    /// The peer closed its write half.
    EndOfStream,
    /// A hard read fault.
    Fault(io::Error),
}

impl std::fmt::Display for IngestOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::EndOfStream => write!(f, "end of stream"),
            Self::Fault(e) => write!(f, "read fault: {e}"),
        }
    }
}

/// Run the ingestion loop until stopped, end of stream, or a hard fault.
///
/// `reader` must return `WouldBlock` or `TimedOut` when no data arrives within
/// the poll interval (a `TcpStream` with a read timeout does); that timeout is
/// the point at which `running` is re-checked. An in-flight read is never
/// interrupted. Reports are logged and, when `reports` is given, forwarded;
/// a dropped receiver is ignored.
pub fn run_ingest_loop<R: Read>(
    reader: &mut R,
    running: &AtomicBool,
    ingestor: &mut Ingestor,
    reports: Option<&Sender<WindowAverage>>,
) -> IngestOutcome {
    let mut scratch = [0u8; READ_CHUNK];

    let outcome = loop {
        if !running.load(Ordering::Acquire) {
            break IngestOutcome::Stopped;
        }

        ingestor.state = IngestState::WaitingReadable;
        match reader.read(&mut scratch) {
            // The session only shuts the socket down after this loop returns,
            // so EOF always comes from the peer.
            Ok(0) => break IngestOutcome::EndOfStream,
            Ok(n) => {
                ingestor.state = IngestState::Draining;
                ingestor.stats.reads += 1;
                for avg in ingestor.feed(&scratch[..n]) {
                    if let Some(tx) = reports {
                        let _ = tx.send(avg);
                    }
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                ingestor.stats.poll_timeouts += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                break if running.load(Ordering::Acquire) {
                    IngestOutcome::Fault(e)
                } else {
                    IngestOutcome::Stopped
                };
            }
        }
    };

    ingestor.state = IngestState::Terminated;
    match &outcome {
        IngestOutcome::Fault(e) => error!("ingestion loop terminated: {e}"),
        other => debug!("ingestion loop terminated: {other}"),
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Reading, Record, Tag, encode_reading};
    use std::collections::VecDeque;
    use std::sync::mpsc;

    /// Reader that replays a script of read results, then reports EOF.
    struct ScriptedReader {
        script: VecDeque<io::Result<Vec<u8>>>,
    }

    impl ScriptedReader {
        fn new(script: Vec<io::Result<Vec<u8>>>) -> Self {
            Self {
                script: script.into(),
            }
        }
    }

    impl Read for ScriptedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.script.pop_front() {
                Some(Ok(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }
    }

    fn would_block() -> io::Result<Vec<u8>> {
        Err(io::Error::from(io::ErrorKind::WouldBlock))
    }

    fn sample_batch() -> Vec<u8> {
        encode_reading(&Reading {
            azimuth: 187.25,
            elevation: 45.5,
            temperature: 22.125,
            humidity: 61.0,
        })
        .into_bytes()
    }

    fn window_contents(ingestor: &Ingestor) -> Vec<Vec<f64>> {
        Tag::ALL
            .iter()
            .map(|&tag| ingestor.aggregator().window(tag).values().collect())
            .collect()
    }

    // -----------------------------------------------------------------------
    // LineAssembler
    // -----------------------------------------------------------------------

    #[test]
    fn test_assembler_keeps_partial_tail() {
        let mut asm = LineAssembler::new();
        asm.extend(b"AZ:1\nEL:");
        assert_eq!(asm.next_line().as_deref(), Some("AZ:1"));
        assert_eq!(asm.next_line(), None);
        assert_eq!(asm.pending(), b"EL:");
        asm.extend(b"2\n");
        assert_eq!(asm.next_line().as_deref(), Some("EL:2"));
        assert!(asm.pending().is_empty());
    }

    #[test]
    fn test_assembler_empty_lines() {
        let mut asm = LineAssembler::new();
        asm.extend(b"\n\nHU:3\n");
        assert_eq!(asm.next_line().as_deref(), Some(""));
        assert_eq!(asm.next_line().as_deref(), Some(""));
        assert_eq!(asm.next_line().as_deref(), Some("HU:3"));
        assert_eq!(asm.next_line(), None);
    }

    #[test]
    fn test_assembler_resumes_scan_after_unterminated_chunks() {
        let mut asm = LineAssembler::new();
        for chunk in [&b"GET"[..], b"_DA", b"TA", b"\nAZ", b":9"] {
            asm.extend(chunk);
            if let Some(line) = asm.next_line() {
                assert_eq!(line, "GET_DATA");
            }
        }
        assert_eq!(asm.pending(), b"AZ:9");
        asm.extend(b"\n");
        assert_eq!(asm.next_line().as_deref(), Some("AZ:9"));
    }

    #[test]
    fn test_assembler_limit_drops_only_oversized_tail() {
        let mut asm = LineAssembler::new();
        asm.extend(b"12345");
        assert_eq!(asm.next_line(), None);
        assert_eq!(asm.enforce_limit(5), 0);
        asm.extend(b"6");
        assert_eq!(asm.next_line(), None);
        assert_eq!(asm.enforce_limit(5), 6);
        assert!(asm.pending().is_empty());
        asm.extend(b"HU:1\n");
        assert_eq!(asm.next_line().as_deref(), Some("HU:1"));
    }

    // -----------------------------------------------------------------------
    // Ingestor
    // -----------------------------------------------------------------------

    #[test]
    fn test_split_at_every_offset_matches_whole() {
        let batch = sample_batch();

        let mut whole = Ingestor::new(50, ReportPolicy::FirstFill).unwrap();
        whole.feed(&batch);
        let expected = window_contents(&whole);
        assert!(expected.iter().all(|w| w.len() == 1));

        for split in 0..=batch.len() {
            let mut parts = Ingestor::new(50, ReportPolicy::FirstFill).unwrap();
            parts.feed(&batch[..split]);
            parts.feed(&batch[split..]);
            assert_eq!(window_contents(&parts), expected, "split at {split}");
            assert!(parts.pending().is_empty());
            assert_eq!(parts.stats().records, 4);
        }
    }

    #[test]
    fn test_byte_at_a_time_delivery() {
        let mut ingestor = Ingestor::new(1, ReportPolicy::EveryFullWindow).unwrap();
        let mut reports = Vec::new();
        for b in sample_batch() {
            reports.extend(ingestor.feed(&[b]));
        }
        let got: Vec<Record> = reports
            .iter()
            .map(|avg| Record {
                tag: avg.tag,
                value: avg.mean,
            })
            .collect();
        assert_eq!(got[0].tag, Tag::Azimuth);
        assert_eq!(got[0].value, 187.25);
        assert_eq!(got.len(), 4);
        assert_eq!(got[3].value, 61.0);
    }

    #[test]
    fn test_unknown_and_malformed_lines_are_skipped() {
        let mut ingestor = Ingestor::new(50, ReportPolicy::FirstFill).unwrap();
        ingestor.feed(b"AZ:1\nBOGUS:7\nEL:2\nTE:oops\nTE:3\nHU:4\n");
        let stats = ingestor.stats();
        assert_eq!(stats.records, 4);
        assert_eq!(stats.unknown_lines, 1);
        assert_eq!(stats.malformed_lines, 1);
        assert_eq!(
            window_contents(&ingestor),
            vec![vec![1.0], vec![2.0], vec![3.0], vec![4.0]]
        );
    }

    #[test]
    fn test_oversized_partial_line_is_discarded() {
        let mut ingestor = Ingestor::new(50, ReportPolicy::FirstFill).unwrap();
        let junk = vec![b'x'; MAX_PENDING_LINE + 1];
        ingestor.feed(&junk);
        assert!(ingestor.pending().is_empty());
        assert_eq!(ingestor.stats().discarded_bytes, junk.len() as u64);

        ingestor.feed(b"AZ:5\n");
        assert_eq!(ingestor.stats().records, 1);
    }

    #[test]
    fn test_fifty_batches_report_each_tag_once() {
        let mut ingestor = Ingestor::new(50, ReportPolicy::FirstFill).unwrap();
        let batch = b"AZ:10.0\nEL:20.0\nTE:25.0\nHU:50.0\n";
        for _ in 0..49 {
            assert!(ingestor.feed(batch).is_empty());
        }
        let reports = ingestor.feed(batch);
        let means: Vec<(Tag, f64)> = reports.iter().map(|a| (a.tag, a.mean)).collect();
        assert_eq!(
            means,
            vec![
                (Tag::Azimuth, 10.0),
                (Tag::Elevation, 20.0),
                (Tag::Temperature, 25.0),
                (Tag::Humidity, 50.0),
            ]
        );
        for _ in 0..100 {
            assert!(ingestor.feed(batch).is_empty());
        }
    }

    // -----------------------------------------------------------------------
    // run_ingest_loop
    // -----------------------------------------------------------------------

    #[test]
    fn test_loop_stops_immediately_when_flag_clear() {
        let running = AtomicBool::new(false);
        let mut reader = ScriptedReader::new(vec![Ok(sample_batch())]);
        let mut ingestor = Ingestor::new(50, ReportPolicy::FirstFill).unwrap();
        let outcome = run_ingest_loop(&mut reader, &running, &mut ingestor, None);
        assert!(matches!(outcome, IngestOutcome::Stopped));
        assert_eq!(ingestor.stats().reads, 0);
        assert_eq!(ingestor.state(), IngestState::Terminated);
    }

    #[test]
    fn test_loop_survives_timeouts_and_reassembles() {
        let batch = sample_batch();
        let (a, b) = batch.split_at(7);
        let running = AtomicBool::new(true);
        let mut reader = ScriptedReader::new(vec![
            would_block(),
            Ok(a.to_vec()),
            Err(io::Error::from(io::ErrorKind::TimedOut)),
            Err(io::Error::from(io::ErrorKind::Interrupted)),
            Ok(b.to_vec()),
            would_block(),
        ]);
        let mut ingestor = Ingestor::new(1, ReportPolicy::FirstFill).unwrap();
        let (tx, rx) = mpsc::channel();

        let outcome = run_ingest_loop(&mut reader, &running, &mut ingestor, Some(&tx));
        assert!(matches!(outcome, IngestOutcome::EndOfStream));

        let stats = ingestor.stats();
        assert_eq!(stats.reads, 2);
        assert_eq!(stats.poll_timeouts, 3);
        assert_eq!(stats.records, 4);
        assert_eq!(stats.bytes_received, batch.len() as u64);

        let tags: Vec<Tag> = rx.try_iter().map(|avg| avg.tag).collect();
        assert_eq!(tags, Tag::ALL.to_vec());
    }

    #[test]
    fn test_loop_reports_hard_fault() {
        let running = AtomicBool::new(true);
        let mut reader = ScriptedReader::new(vec![
            Ok(b"AZ:1\n".to_vec()),
            Err(io::Error::from(io::ErrorKind::ConnectionReset)),
        ]);
        let mut ingestor = Ingestor::new(50, ReportPolicy::FirstFill).unwrap();
        let outcome = run_ingest_loop(&mut reader, &running, &mut ingestor, None);
        match outcome {
            IngestOutcome::Fault(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("expected fault, got {other}"),
        }
        assert_eq!(ingestor.stats().records, 1);
    }

    #[test]
    fn test_eof_after_stop_is_still_end_of_stream() {
        struct ClosingReader<'a>(&'a AtomicBool);
        impl Read for ClosingReader<'_> {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                // Stop requested while the peer's FIN was already in flight.
                self.0.store(false, Ordering::Release);
                Ok(0)
            }
        }

        let running = AtomicBool::new(true);
        let mut ingestor = Ingestor::new(50, ReportPolicy::FirstFill).unwrap();
        let outcome = run_ingest_loop(&mut ClosingReader(&running), &running, &mut ingestor, None);
        assert!(matches!(outcome, IngestOutcome::EndOfStream), "{outcome}");
    }

    #[test]
    fn test_dropped_receiver_does_not_stop_loop() {
        let running = AtomicBool::new(true);
        let mut reader = ScriptedReader::new(vec![Ok(sample_batch()), Ok(sample_batch())]);
        let mut ingestor = Ingestor::new(1, ReportPolicy::EveryFullWindow).unwrap();
        let (tx, rx) = mpsc::channel();
        drop(rx);
        let outcome = run_ingest_loop(&mut reader, &running, &mut ingestor, Some(&tx));
        assert!(matches!(outcome, IngestOutcome::EndOfStream));
        assert_eq!(ingestor.stats().reports, 8);
    }
}
