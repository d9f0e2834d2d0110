//! The validated measurement and the raw line it is parsed from.

use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp layout used by the CSV log and the dashboard.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One validated heart-rate / SpO2 measurement.
///
/// Only constructed by the record parser (or reloaded from a log that the parser's
/// output was written to), so both values are always finite and inside the
/// configured plausibility bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Local wall-clock time the line was parsed, whole seconds.
    pub timestamp: NaiveDateTime,
    /// Beats per minute.
    pub heart_rate: f64,
    /// Blood-oxygen saturation in percent.
    pub spo2: f64,
}

impl Reading {
    /// Build a reading, truncating the timestamp to second resolution.
    pub fn new(timestamp: NaiveDateTime, heart_rate: f64, spo2: f64) -> Self {
        Self {
            timestamp: truncate_to_seconds(timestamp),
            heart_rate,
            spo2,
        }
    }

    /// Timestamp rendered as `YYYY-MM-DD HH:MM:SS`.
    pub fn timestamp_string(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }
}

/// Current local time at second resolution.
pub fn now_seconds() -> NaiveDateTime {
    truncate_to_seconds(chrono::Local::now().naive_local())
}

fn truncate_to_seconds(ts: NaiveDateTime) -> NaiveDateTime {
    ts.with_nanosecond(0).unwrap_or(ts)
}

/// A single decoded line from a source, trailing whitespace and newline removed.
///
/// May be malformed; it only lives until the parser has looked at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine(String);

impl RawLine {
    /// Wrap a decoded line, stripping trailing whitespace.
    pub fn new(line: impl Into<String>) -> Self {
        let mut line = line.into();
        let trimmed = line.trim_end().len();
        line.truncate(trimmed);
        Self(line)
    }

    /// The line text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether nothing but whitespace was received.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RawLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
