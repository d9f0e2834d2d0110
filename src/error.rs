//! Custom error types for the ingestion pipeline.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate, plus the
//! per-line `RejectionReason` produced by the record parser. Using the `thiserror` crate,
//! it provides one consistent way to describe what can go wrong between the device and
//! the history buffer.
//!
//! ## Error Hierarchy
//!
//! `DaqError` consolidates the failure sources of the pipeline:
//!
//! - **`Config`**: Wraps errors from `figment`, typically a malformed TOML file or an
//!   environment override of the wrong type.
//! - **`Configuration`**: Semantic errors in the configuration, such as an empty serial
//!   port name or inverted plausibility bounds. Caught by `Settings::validate`.
//! - **`Io`**: Wraps `std::io::Error` for file I/O outside the persistence path.
//! - **`Decode`**: A line from a byte transport was not valid UTF-8. Recovered per line.
//! - **`LineTooLong`**: No terminator within the framing limit. The buffered bytes are
//!   dropped and the line counts as malformed.
//! - **`Transport`**: A transient read failure. The ingestion loop backs off and retries.
//! - **`Disconnected`**: The transport is permanently gone. The ingestion loop stops and
//!   reports it.
//! - **`Persistence`**: A durable write or reload failed. Writes are best-effort, so the
//!   loop logs these and keeps the in-memory history current.
//!
//! `RejectionReason` is not a `DaqError` variant: rejected lines are
//! counted and logged, never propagated.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors produced anywhere in the pipeline.
#[derive(Error, Debug)]
pub enum DaqError {
    /// The configuration could not be loaded or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// A configuration value failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File I/O outside the persistence path.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A line was not valid UTF-8.
    #[error("Line is not valid UTF-8: {0}")]
    Decode(String),

    /// A line grew past the framing limit before its terminator arrived.
    #[error("Line longer than {limit} bytes")]
    LineTooLong {
        /// Configured maximum line length in bytes.
        limit: usize,
    },

    /// Transient read failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The transport is gone for good.
    #[error("Transport disconnected: {0}")]
    Disconnected(String),

    /// Writing or reloading the CSV log failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// `start()` was called on a loop that is not ready.
    #[error("Ingestion loop already started")]
    AlreadyStarted,

    /// The ingestion task ended abnormally.
    #[error("Ingestion task failed: {0}")]
    TaskFailed(String),
}

impl DaqError {
    /// Whether the source behind this error can never produce data again.
    pub fn is_permanent(&self) -> bool {
        matches!(self, DaqError::Disconnected(_))
    }
}

impl From<csv::Error> for DaqError {
    fn from(err: csv::Error) -> Self {
        DaqError::Persistence(err.to_string())
    }
}

/// Why a single line was not turned into a reading.
///
/// Not stored anywhere; used for counters and logging only.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectionReason {
    /// Labels or units missing, or the value between them is not a number.
    #[error("malformed format")]
    MalformedFormat,
    /// Value outside the plausibility bounds, including the idle 0/0 sentinel.
    #[error("out of range")]
    OutOfRange,
    /// Bytes from the transport were not valid UTF-8.
    #[error("decode error")]
    DecodeError,
}
