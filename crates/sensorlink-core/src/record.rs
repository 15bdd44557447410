//! Wire codec for the `TAG:value` line protocol.
//!
//! The schema is closed: four reserved tags, one finite `f64` each, one record
//! per `\n`-terminated line. Values are written with Rust's shortest
//! round-trip formatting, which never produces exponent notation and parses
//! back to the identical `f64`.

use std::fmt::Write as _;

use serde::Serialize;

use crate::error::DecodeError;

/// Request line sent by the client, newline included.
pub const REQUEST_MARKER: &[u8] = b"GET_DATA\n";

/// The request line without its terminator.
pub const REQUEST_LINE: &str = "GET_DATA";

/// One of the four simulated physical quantities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tag {
    /// Antenna azimuth in degrees, `[0, 360)`.
    Azimuth,
    /// Antenna elevation in degrees, `[0, 90)`.
    Elevation,
    /// Temperature in °C, `[20, 30)`.
    Temperature,
    /// Relative humidity in %, `[40, 80)`.
    Humidity,
}

impl Tag {
    /// Wire order of a reply batch.
    pub const ALL: [Tag; 4] = [Tag::Azimuth, Tag::Elevation, Tag::Temperature, Tag::Humidity];

    /// Two-letter wire prefix (without the colon).
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Azimuth => "AZ",
            Self::Elevation => "EL",
            Self::Temperature => "TE",
            Self::Humidity => "HU",
        }
    }

    /// Position in [`Tag::ALL`], used to index per-tag storage.
    pub fn index(self) -> usize {
        match self {
            Self::Azimuth => 0,
            Self::Elevation => 1,
            Self::Temperature => 2,
            Self::Humidity => 3,
        }
    }

    /// Human-readable quantity name for log output.
    pub fn label(self) -> &'static str {
        match self {
            Self::Azimuth => "azimuth",
            Self::Elevation => "elevation",
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
        }
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A single decoded sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Record {
    pub tag: Tag,
    pub value: f64,
}

/// One full four-quantity reply.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reading {
    pub azimuth: f64,
    pub elevation: f64,
    pub temperature: f64,
    pub humidity: f64,
}

impl Reading {
    pub fn get(&self, tag: Tag) -> f64 {
        match tag {
            Tag::Azimuth => self.azimuth,
            Tag::Elevation => self.elevation,
            Tag::Temperature => self.temperature,
            Tag::Humidity => self.humidity,
        }
    }

    /// The reading as records in wire order.
    pub fn records(&self) -> [Record; 4] {
        Tag::ALL.map(|tag| Record {
            tag,
            value: self.get(tag),
        })
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode one line (terminator already stripped).
///
/// A trailing `\r` is ignored. Lines without a reserved `TAG:` prefix are
/// [`DecodeError::UnrecognizedLine`]; a reserved prefix followed by anything
/// other than a finite decimal is [`DecodeError::MalformedNumber`]. Neither is
/// fatal to the caller.
pub fn decode_line(line: &str) -> Result<Record, DecodeError> {
    let line = line.strip_suffix('\r').unwrap_or(line);

    let Some(tag) = Tag::ALL.into_iter().find(|tag| {
        line.strip_prefix(tag.prefix())
            .is_some_and(|rest| rest.starts_with(':'))
    }) else {
        return Err(DecodeError::UnrecognizedLine(line.to_string()));
    };

    let text = &line[tag.prefix().len() + 1..];
    match text.trim().parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(Record { tag, value }),
        _ => Err(DecodeError::MalformedNumber(line.to_string())),
    }
}

/// Whether a line (terminator already stripped) is a data request.
pub fn is_request(line: &str) -> bool {
    line.trim() == REQUEST_LINE
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode one reading as four newline-terminated lines in [`Tag::ALL`] order.
pub fn encode_reading(reading: &Reading) -> String {
    let mut out = String::with_capacity(64);
    for record in reading.records() {
        // Writing into a String cannot fail.
        let _ = writeln!(out, "{}:{}", record.tag, record.value);
    }
    out
}
