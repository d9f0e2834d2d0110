//! In-memory history and durable storage of readings.
pub mod history;
pub mod storage;

pub use history::{HistoryBuffer, HistoryView, DEFAULT_CAPACITY};
pub use storage::{load_log, CsvSink, PersistenceSink, LOG_HEADER};
