//! # sensorlink-core
//!
//! Continuous telemetry polling over a plain TCP byte stream.
//!
//! A client asks a sensor server for data at a fixed rate (`GET_DATA\n`); the
//! server answers every request with four `TAG:value` lines (azimuth,
//! elevation, temperature, humidity). The client reassembles the reply stream
//! across arbitrary read boundaries, decodes each line, and keeps a fixed-size
//! sliding window per quantity whose average is reported once the window fills.
//!
//! ## Quick Start
//!
//! ```no_run
//! use sensorlink_core::{ClientConfig, ClientSession};
//!
//! let mut session = ClientSession::connect(ClientConfig {
//!     host: "127.0.0.1".into(),
//!     port: 8080,
//!     ..Default::default()
//! })?;
//!
//! let stop = session.stop_handle();
//! let reports = session.reports();
//! std::thread::spawn(move || {
//!     for avg in reports {
//!         println!("{} average: {:.3}", avg.tag.label(), avg.mean);
//!     }
//! });
//!
//! // Blocks until `stop.stop()` is called or the connection ends.
//! let summary = session.start()?;
//! println!("sent {} requests", summary.pacer.requests_sent);
//! # drop(stop);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Pacer → socket → Responder → socket → Ingestion loop → Codec → Aggregator → log
//! ```
//!
//! The pacer runs on the caller's thread and only writes; the ingestion loop
//! runs on its own thread and only reads. They share nothing but the socket
//! and the running flag.

pub mod error;
pub mod ingest;
pub mod pacer;
pub mod record;
pub mod responder;
pub mod session;
pub mod window;

pub use error::{ConfigError, ConnectError, DecodeError, TransportError};
pub use ingest::{IngestOutcome, IngestState, IngestStats, Ingestor, LineAssembler, run_ingest_loop};
pub use pacer::{Pace, Pacer, PacerStats, period_for};
pub use record::{REQUEST_MARKER, Reading, Record, Tag, decode_line, encode_reading, is_request};
pub use responder::{FixedSensors, RandomSensors, Responder, SensorSource};
pub use session::{ClientConfig, ClientSession, SessionOutcome, SessionSummary, StopHandle};
pub use window::{Aggregator, ReportPolicy, SlidingWindow, WindowAverage};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
