//! # oxi_daq Core Library
//!
//! Ingestion pipeline for a pulse oximeter that prints one text line per sample. The
//! library holds everything between the byte stream and the dashboard, so the CLI in
//! `main.rs` and the integration tests drive the same code.
//!
//! ## Data Flow
//!
//! ```text
//! LineSource -> RecordParser -> { HistoryBuffer, PersistenceSink }
//!                                      ^
//!                                      | snapshot() on a fixed interval
//!                               DashboardFeed
//! ```
//!
//! ## Crate Structure
//!
//! - **`config`**: Layered `Settings` (defaults, TOML file, `OXI_DAQ_*` environment)
//!   with validation.
//! - **`dashboard`**: `DashboardFrame` snapshots and the periodic `DashboardFeed`.
//! - **`data`**: The bounded `HistoryBuffer` with its read-only `HistoryView`, and the
//!   CSV `PersistenceSink`.
//! - **`error`**: The crate-wide `DaqError` and the per-line `RejectionReason`.
//! - **`ingest`**: `IngestionLoop`, which owns the pipeline on a background task.
//! - **`instrument`**: `LineSource` implementations: simulated, serial / stdin and
//!   replay.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`measurement`**: `Reading`, `RawLine` and the `RecordParser`.
//! - **`validation`**: Small checks used by `Settings::validate`.

pub mod config;
pub mod dashboard;
pub mod data;
pub mod error;
pub mod ingest;
pub mod instrument;
pub mod logging;
pub mod measurement;
pub mod validation;
