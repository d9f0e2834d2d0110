//! Label-anchored parsing of oximeter text lines.
//!
//! The firmware prints lines such as
//!
//! ```text
//! [max30102] Heart rate: 75.00 bpm, SpO2: 98.00 %
//! ```
//!
//! possibly with extra log noise around them. The parser looks for the
//! `Heart rate:` and `SpO2:` labels anywhere in the line, in either order, and reads the
//! number between each label and its unit (`bpm`, `%`). Everything else on the line is
//! ignored.

use crate::error::RejectionReason;
use crate::measurement::reading::{now_seconds, RawLine, Reading};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

const HEART_RATE_LABEL: &str = "Heart rate:";
const HEART_RATE_UNIT: &str = "bpm";
const SPO2_LABEL: &str = "SpO2:";
const SPO2_UNIT: &str = "%";

/// Physiological plausibility bounds.
///
/// Heart rate is accepted when `heart_rate_min < hr < heart_rate_max`; SpO2 when
/// `spo2_min < spo2 <= spo2_max`. NaN and infinities never pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlausibilityBounds {
    /// Exclusive lower bound for heart rate (bpm).
    #[serde(default = "default_heart_rate_min")]
    pub heart_rate_min: f64,
    /// Exclusive upper bound for heart rate (bpm).
    #[serde(default = "default_heart_rate_max")]
    pub heart_rate_max: f64,
    /// Exclusive lower bound for SpO2 (%).
    #[serde(default = "default_spo2_min")]
    pub spo2_min: f64,
    /// Inclusive upper bound for SpO2 (%).
    #[serde(default = "default_spo2_max")]
    pub spo2_max: f64,
}

fn default_heart_rate_min() -> f64 {
    0.0
}

fn default_heart_rate_max() -> f64 {
    300.0
}

fn default_spo2_min() -> f64 {
    0.0
}

fn default_spo2_max() -> f64 {
    100.0
}

impl Default for PlausibilityBounds {
    fn default() -> Self {
        Self {
            heart_rate_min: default_heart_rate_min(),
            heart_rate_max: default_heart_rate_max(),
            spo2_min: default_spo2_min(),
            spo2_max: default_spo2_max(),
        }
    }
}

impl PlausibilityBounds {
    /// Whether a heart rate value is plausible.
    pub fn heart_rate_ok(&self, hr: f64) -> bool {
        hr.is_finite() && hr > self.heart_rate_min && hr < self.heart_rate_max
    }

    /// Whether an SpO2 value is plausible.
    pub fn spo2_ok(&self, spo2: f64) -> bool {
        spo2.is_finite() && spo2 > self.spo2_min && spo2 <= self.spo2_max
    }
}

/// Turns raw lines into validated [`Reading`]s.
#[derive(Debug, Clone, Default)]
pub struct RecordParser {
    bounds: PlausibilityBounds,
}

impl RecordParser {
    /// Create a parser with the given plausibility bounds.
    pub fn new(bounds: PlausibilityBounds) -> Self {
        Self { bounds }
    }

    /// Bounds this parser validates against.
    pub fn bounds(&self) -> &PlausibilityBounds {
        &self.bounds
    }

    /// Parse a line, stamping the reading with the current time.
    pub fn parse(&self, line: &RawLine) -> Result<Reading, RejectionReason> {
        self.parse_at(line, now_seconds())
    }

    /// Parse a line, stamping the reading with `timestamp`.
    pub fn parse_at(
        &self,
        line: &RawLine,
        timestamp: NaiveDateTime,
    ) -> Result<Reading, RejectionReason> {
        let text = line.as_str();
        let heart_rate = labelled_value(text, HEART_RATE_LABEL, HEART_RATE_UNIT)?;
        let spo2 = labelled_value(text, SPO2_LABEL, SPO2_UNIT)?;

        // 0/0 is what the sensor prints with no finger on it.
        if heart_rate == 0.0 && spo2 == 0.0 {
            return Err(RejectionReason::OutOfRange);
        }
        if !self.bounds.heart_rate_ok(heart_rate) || !self.bounds.spo2_ok(spo2) {
            return Err(RejectionReason::OutOfRange);
        }

        Ok(Reading::new(timestamp, heart_rate, spo2))
    }
}

/// Number between `label` and the first `unit` after it.
fn labelled_value(text: &str, label: &str, unit: &str) -> Result<f64, RejectionReason> {
    let start = text
        .find(label)
        .map(|idx| idx + label.len())
        .ok_or(RejectionReason::MalformedFormat)?;
    let rest = &text[start..];
    let end = rest.find(unit).ok_or(RejectionReason::MalformedFormat)?;
    rest[..end]
        .trim()
        .parse::<f64>()
        .map_err(|_| RejectionReason::MalformedFormat)
}
