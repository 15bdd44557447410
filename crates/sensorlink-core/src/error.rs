//! Error taxonomy for the telemetry pipeline.
//!
//! Would-block outcomes never appear here: both loops absorb them with a short
//! backoff. Everything that does surface is terminal for the loop or call that
//! produced it, except [`DecodeError`], which only ever drops a single line.

use std::io;
use std::time::Duration;

/// Failure to establish the client connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// Host/port did not resolve to any socket address.
    #[error("invalid server address {address}")]
    AddressInvalid { address: String },
    /// The server actively refused the connection.
    #[error("connection to {address} refused")]
    Refused { address: String },
    /// Establishment did not complete within the bound.
    #[error("connection to {address} timed out after {timeout:?}")]
    Timeout { address: String, timeout: Duration },
    /// The session configuration was rejected before connecting.
    #[error("invalid client configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    /// Any other establishment failure (unreachable network, socket setup).
    #[error("connection to {address} failed: {source}")]
    Io {
        address: String,
        #[source]
        source: io::Error,
    },
}

/// Terminal fault on an established connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer closed the stream.
    #[error("connection closed by peer")]
    Closed,
    /// Hard read or write fault.
    #[error("transport I/O fault: {0}")]
    Io(#[from] io::Error),
}

/// Why a received line did not produce a record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The line starts with none of the reserved tag prefixes.
    #[error("unrecognized line {0:?}")]
    UnrecognizedLine(String),
    /// A reserved prefix followed by something that is not a finite number.
    #[error("malformed number in line {0:?}")]
    MalformedNumber(String),
}

/// Rejected client or pacer configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("request frequency must be a finite positive number of Hz, got {0}")]
    InvalidFrequency(f64),
    #[error("window size must be at least 1")]
    EmptyWindow,
    #[error("{0} must be non-zero")]
    ZeroTimeout(&'static str),
}
