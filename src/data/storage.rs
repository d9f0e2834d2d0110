//! Durable CSV log of accepted readings.
//!
//! The log is a plain UTF-8 CSV file:
//!
//! ```text
//! Timestamp,HeartRate,SpO2
//! 2024-03-01 12:30:05,75.0,98.0
//! ```
//!
//! Opening a [`CsvSink`] truncates the file and writes the header, so every run starts a
//! fresh session. Each row is encoded in memory and handed to the file in a single
//! append; if that write fails part-way the file is cut back to the last complete row.
//! [`load_log`] drops a trailing row without a newline, which is what a crash in the
//! middle of a write leaves behind.

use crate::error::{AppResult, DaqError};
use crate::measurement::{Reading, TIMESTAMP_FORMAT};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Header row of the CSV log.
pub const LOG_HEADER: [&str; 3] = ["Timestamp", "HeartRate", "SpO2"];

/// Somewhere accepted readings are written for later inspection.
///
/// Durability is best-effort: the ingestion loop logs a failed write and carries on.
#[async_trait]
pub trait PersistenceSink: Send {
    /// Append one reading.
    async fn write(&mut self, reading: &Reading) -> AppResult<()>;

    /// Flush and release the underlying storage.
    async fn shutdown(&mut self) -> AppResult<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LogRow {
    #[serde(rename = "Timestamp")]
    timestamp: String,
    #[serde(rename = "HeartRate")]
    heart_rate: f64,
    #[serde(rename = "SpO2")]
    spo2: f64,
}

/// Byte-level handle under a [`CsvSink`].
trait LogFile: Write + Seek + Send + std::fmt::Debug {
    /// Cut the file to `len` bytes. The cursor is left where it was.
    fn truncate_to(&mut self, len: u64) -> std::io::Result<()>;

    fn sync(&mut self) -> std::io::Result<()>;
}

impl LogFile for File {
    fn truncate_to(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.sync_data()
    }
}

/// Append-only CSV writer for readings.
#[derive(Debug)]
pub struct CsvSink {
    path: PathBuf,
    file: Option<Box<dyn LogFile>>,
    committed_len: u64,
    sync_each_row: bool,
    rows: u64,
}

impl CsvSink {
    /// Create (or truncate) the log at `path` and write the header.
    ///
    /// With `sync_each_row`, every row is `fsync`ed before `write` returns.
    pub fn create(path: impl AsRef<Path>, sync_each_row: bool) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DaqError::Persistence(format!("Failed to create '{}': {}", parent.display(), e))
            })?;
        }

        let mut header = csv::Writer::from_writer(Vec::new());
        header.write_record(LOG_HEADER)?;
        let header = header
            .into_inner()
            .map_err(|e| DaqError::Persistence(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| {
                DaqError::Persistence(format!("Failed to create CSV log '{}': {}", path.display(), e))
            })?;
        file.write_all(&header)
            .and_then(|_| file.sync_all())
            .map_err(|e| DaqError::Persistence(e.to_string()))?;

        tracing::info!(path = %path.display(), "CSV log initialised");

        Ok(Self {
            path,
            file: Some(Box::new(file)),
            committed_len: header.len() as u64,
            sync_each_row,
            rows: 0,
        })
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written since the log was created.
    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    fn encode_row(reading: &Reading) -> AppResult<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer.serialize(LogRow {
            timestamp: reading.timestamp_string(),
            heart_rate: reading.heart_rate,
            spo2: reading.spo2,
        })?;
        writer
            .into_inner()
            .map_err(|e| DaqError::Persistence(e.to_string()))
    }

    fn append_row(&mut self, row: &[u8]) -> AppResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| DaqError::Persistence("CSV log already closed".to_string()))?;

        let written = file.write_all(row).and_then(|_| {
            if self.sync_each_row {
                file.sync()
            } else {
                Ok(())
            }
        });

        match written {
            Ok(()) => {
                self.committed_len += row.len() as u64;
                self.rows += 1;
                Ok(())
            }
            Err(e) => {
                // Cut a partial row back off and put the cursor on the row boundary.
                let committed = self.committed_len;
                let rollback = file
                    .truncate_to(committed)
                    .and_then(|_| file.seek(SeekFrom::Start(committed)));
                if let Err(rollback) = rollback {
                    // The file no longer ends on a row boundary; refuse further rows.
                    tracing::error!(error = %rollback, "Failed to roll back partial CSV row");
                    self.file = None;
                }
                Err(DaqError::Persistence(format!(
                    "Failed to append to '{}': {}",
                    self.path.display(),
                    e
                )))
            }
        }
    }
}

#[async_trait]
impl PersistenceSink for CsvSink {
    async fn write(&mut self, reading: &Reading) -> AppResult<()> {
        let row = Self::encode_row(reading)?;
        self.append_row(&row)
    }

    async fn shutdown(&mut self) -> AppResult<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .and_then(|_| file.sync())
                .map_err(|e| DaqError::Persistence(e.to_string()))?;
            tracing::info!(path = %self.path.display(), rows = self.rows, "CSV log closed");
        }
        Ok(())
    }
}

/// Read a CSV log back into readings, oldest first.
///
/// A final row without a terminating newline is treated as torn and skipped.
pub fn load_log(path: impl AsRef<Path>) -> AppResult<Vec<Reading>> {
    let path = path.as_ref();
    let mut text = std::fs::read_to_string(path).map_err(|e| {
        DaqError::Persistence(format!("Failed to read CSV log '{}': {}", path.display(), e))
    })?;

    if !text.ends_with('\n') {
        let keep = text.rfind('\n').map_or(0, |idx| idx + 1);
        if keep < text.len() {
            tracing::warn!(
                path = %path.display(),
                bytes = text.len() - keep,
                "Ignoring incomplete trailing row"
            );
        }
        text.truncate(keep);
    }

    parse_log(text.as_bytes())
}

fn parse_log(bytes: &[u8]) -> AppResult<Vec<Reading>> {
    let mut reader = csv::Reader::from_reader(bytes);
    if !bytes.is_empty() {
        let headers = reader.headers()?;
        if headers.iter().ne(LOG_HEADER.iter().copied()) {
            return Err(DaqError::Persistence(format!(
                "Unexpected CSV header: {:?}",
                headers
            )));
        }
    }

    reader
        .deserialize::<LogRow>()
        .map(|row| row_to_reading(row?))
        .collect()
}

/// Decode one row of a log, as read back while the log is still being written.
///
/// Returns `None` for a blank line or a header row (the writer restarted the log).
pub(crate) fn parse_log_row(line: &str) -> Option<AppResult<Reading>> {
    if line.trim().is_empty() {
        return None;
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(line.as_bytes());
    let record = match reader.records().next()? {
        Ok(record) => record,
        Err(e) => return Some(Err(e.into())),
    };
    if record.iter().eq(LOG_HEADER.iter().copied()) {
        return None;
    }
    Some(
        record
            .deserialize::<LogRow>(None)
            .map_err(DaqError::from)
            .and_then(row_to_reading),
    )
}

fn row_to_reading(row: LogRow) -> AppResult<Reading> {
    let timestamp = NaiveDateTime::parse_from_str(&row.timestamp, TIMESTAMP_FORMAT)
        .map_err(|e| DaqError::Persistence(format!("Bad timestamp '{}': {}", row.timestamp, e)))?;
    Ok(Reading::new(timestamp, row.heart_rate, row.spo2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use parking_lot::Mutex;
    use std::io::Cursor;
    use std::sync::Arc;

    fn reading(sec: u32, hr: f64, spo2: f64) -> Reading {
        let ts = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(12, 0, sec)
            .unwrap();
        Reading::new(ts, hr, spo2)
    }

    #[tokio::test]
    async fn create_writes_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        let _sink = CsvSink::create(&path, false).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "Timestamp,HeartRate,SpO2\n");
        assert!(load_log(&path).unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_truncates_previous_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        std::fs::write(&path, "Timestamp,HeartRate,SpO2\n2020-01-01 00:00:00,70,97\n").unwrap();
        let _sink = CsvSink::create(&path, false).unwrap();
        assert!(load_log(&path).unwrap().is_empty());
    }

    #[tokio::test]
    async fn rows_use_log_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/session/data.csv");
        let mut sink = CsvSink::create(&path, true).unwrap();
        sink.write(&reading(5, 75.0, 98.5)).await.unwrap();
        sink.shutdown().await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "Timestamp,HeartRate,SpO2\n2024-03-01 12:00:05,75.0,98.5\n");
        assert_eq!(sink.rows_written(), 1);
    }

    #[tokio::test]
    async fn reload_returns_written_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        let written = vec![
            reading(1, 70.0, 97.0),
            reading(2, 71.25, 96.5),
            reading(2, 71.25, 96.5),
            reading(4, 120.0, 100.0),
        ];

        let mut sink = CsvSink::create(&path, false).unwrap();
        for r in &written {
            sink.write(r).await.unwrap();
        }
        sink.shutdown().await.unwrap();

        assert_eq!(load_log(&path).unwrap(), written);
        assert_eq!(load_log(&path).unwrap(), written);
    }

    /// In-memory log file that accepts only `budget` more bytes before failing once.
    #[derive(Debug, Clone, Default)]
    struct ShortFile {
        bytes: Arc<Mutex<Cursor<Vec<u8>>>>,
        budget: Arc<Mutex<Option<usize>>>,
    }

    impl Write for ShortFile {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut budget = self.budget.lock();
            let n = match *budget {
                Some(0) => {
                    *budget = None;
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "file size limit exceeded",
                    ));
                }
                Some(left) => {
                    let n = left.min(buf.len());
                    *budget = Some(left - n);
                    n
                }
                None => buf.len(),
            };
            self.bytes.lock().write(&buf[..n])
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Seek for ShortFile {
        fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
            self.bytes.lock().seek(pos)
        }
    }

    impl LogFile for ShortFile {
        fn truncate_to(&mut self, len: u64) -> std::io::Result<()> {
            self.bytes.lock().get_mut().truncate(len as usize);
            Ok(())
        }

        fn sync(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn torn_append_is_rolled_back_and_log_stays_loadable() {
        let header = format!("{}\n", LOG_HEADER.join(","));
        let file = ShortFile::default();
        file.bytes.lock().write_all(header.as_bytes()).unwrap();
        let mut sink = CsvSink {
            path: PathBuf::from("mem.csv"),
            file: Some(Box::new(file.clone())),
            committed_len: header.len() as u64,
            sync_each_row: false,
            rows: 0,
        };

        sink.write(&reading(1, 70.0, 97.0)).await.unwrap();
        *file.budget.lock() = Some(10);
        assert!(matches!(
            sink.write(&reading(2, 71.0, 96.0)).await,
            Err(DaqError::Persistence(_))
        ));
        sink.write(&reading(3, 72.0, 95.0)).await.unwrap();
        assert_eq!(sink.rows_written(), 2);

        let bytes = file.bytes.lock().get_ref().clone();
        assert!(!bytes.contains(&0), "gap left in log: {:?}", String::from_utf8_lossy(&bytes));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        std::fs::write(&path, &bytes).unwrap();
        assert_eq!(
            load_log(&path).unwrap(),
            vec![reading(1, 70.0, 97.0), reading(3, 72.0, 95.0)]
        );
    }

    #[tokio::test]
    async fn write_after_shutdown_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::create(dir.path().join("data.csv"), false).unwrap();
        sink.shutdown().await.unwrap();
        assert!(matches!(
            sink.write(&reading(1, 70.0, 97.0)).await,
            Err(DaqError::Persistence(_))
        ));
    }

    #[test]
    fn load_skips_torn_last_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        std::fs::write(
            &path,
            "Timestamp,HeartRate,SpO2\n2024-03-01 12:00:01,70,97\n2024-03-01 12:00:02,7",
        )
        .unwrap();
        assert_eq!(load_log(&path).unwrap(), vec![reading(1, 70.0, 97.0)]);
    }

    #[test]
    fn single_rows_decode_independently() {
        assert!(parse_log_row("Timestamp,HeartRate,SpO2").is_none());
        assert!(parse_log_row("  ").is_none());
        assert_eq!(
            parse_log_row("2024-03-01 12:00:01,70.0,97.0").unwrap().unwrap(),
            reading(1, 70.0, 97.0)
        );
        assert!(matches!(
            parse_log_row("2024-03-01 12:00:02,abc,97.0"),
            Some(Err(DaqError::Persistence(_)))
        ));
        assert!(matches!(
            parse_log_row("2024-03-01 12:00:02"),
            Some(Err(DaqError::Persistence(_)))
        ));
    }

    #[test]
    fn load_rejects_foreign_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.csv");
        std::fs::write(&path, "time,value\n1,2\n").unwrap();
        assert!(matches!(load_log(&path), Err(DaqError::Persistence(_))));
    }

    #[test]
    fn load_missing_file_is_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_log(dir.path().join("absent.csv")),
            Err(DaqError::Persistence(_))
        ));
    }
}
