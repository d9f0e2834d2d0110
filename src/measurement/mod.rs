//! Measurement types and the line parser that produces them.

pub mod parser;
pub mod reading;

pub use parser::{PlausibilityBounds, RecordParser};
pub use reading::{RawLine, Reading, TIMESTAMP_FORMAT};
