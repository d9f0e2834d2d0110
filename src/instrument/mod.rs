//! Line sources: where oximeter text comes from.
//!
//! A [`LineSource`] yields one decoded line per call, or reports that no line is
//! available. Three implementations cover the ways the pipeline is fed:
//!
//! - [`mock::SimulatedSource`]: synthetic readings on a fixed tick.
//! - [`serial::SerialSource`]: a serial / Bluetooth SPP byte stream (or any `AsyncRead`).
//! - [`replay::ReplaySource`]: a persisted CSV log or a raw device transcript, read once
//!   or followed while another process appends to it.
//!
//! Sources report transport failures as `Err(DaqError)` values and never panic on bad
//! input. Whether an end of stream is temporary or final is decided by the source, not
//! guessed by the caller.

use crate::config::{SourceConfig, SourceKind};
use crate::error::{AppResult, DaqError};
use crate::measurement::RawLine;
use async_trait::async_trait;

pub mod mock;
pub mod replay;
pub mod serial;

pub use mock::SimulatedSource;
pub use replay::{ReplayFormat, ReplaySource};
pub use serial::SerialSource;

/// What a source produced on one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// One decoded line.
    Line(RawLine),
    /// No line this time.
    EndOfStream(StreamEnd),
}

/// Kind of end-of-stream a source reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Nothing arrived within the read timeout; try again later.
    Idle,
    /// The source will never produce another line.
    Exhausted,
}

/// Produces one line of oximeter text per call.
#[async_trait]
pub trait LineSource: Send {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    /// Wait for the next line.
    ///
    /// Must return within a bounded time (read timeout or tick interval) so the caller
    /// can observe a stop request.
    async fn next_line(&mut self) -> AppResult<SourceEvent>;

    /// Release the underlying transport.
    async fn close(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// Render values in the firmware's line format.
pub fn device_line(heart_rate: f64, spo2: f64) -> String {
    format!("Heart rate: {:.2} bpm, SpO2: {:.2} %", heart_rate, spo2)
}

/// Open the source selected by `[source]`.
pub async fn open_source(config: &SourceConfig) -> AppResult<Box<dyn LineSource>> {
    match config.kind {
        SourceKind::Simulated => {
            let mut source = SimulatedSource::new(config.interval, config.seed);
            if let Some(limit) = config.limit {
                source = source.with_limit(limit);
            }
            Ok(Box::new(source))
        }
        SourceKind::Replay => {
            let path = config.replay_path.as_ref().ok_or_else(|| {
                DaqError::Configuration("source.replay_path is required for replay".to_string())
            })?;
            let format = if config.replay_raw {
                ReplayFormat::Transcript
            } else {
                ReplayFormat::Log
            };
            let source = match (config.replay_follow, format) {
                (true, format) => ReplaySource::follow(path, format, config.interval).await?,
                (false, ReplayFormat::Transcript) => {
                    ReplaySource::open_transcript(path, config.interval).await?
                }
                (false, ReplayFormat::Log) => ReplaySource::open_log(path, config.interval)?,
            };
            Ok(Box::new(source))
        }
        SourceKind::Serial => open_serial(config).await,
    }
}

#[cfg(feature = "tokio_serial")]
async fn open_serial(config: &SourceConfig) -> AppResult<Box<dyn LineSource>> {
    let source = SerialSource::open(&config.port, config.baud_rate, config.read_timeout)
        .await?
        .with_max_line_length(config.max_line_length);
    Ok(Box::new(source))
}

#[cfg(not(feature = "tokio_serial"))]
async fn open_serial(config: &SourceConfig) -> AppResult<Box<dyn LineSource>> {
    Err(DaqError::Configuration(format!(
        "cannot open {}: built without the `tokio_serial` feature",
        config.port
    )))
}
