//! Replay of recorded sessions.
//!
//! Two inputs are supported: a CSV log written by [`CsvSink`](crate::data::CsvSink),
//! whose rows are turned back into device-format lines, and a raw transcript of device
//! output with one line per text line. Lines are replayed at a fixed pace.
//!
//! A replay opened with [`ReplaySource::open_log`] or [`ReplaySource::open_transcript`]
//! is exhausted after the last line. [`ReplaySource::follow`] instead tails a file that
//! another process is still appending to: at the end of the file it reports `Idle`, and
//! complete lines written later are picked up from the last byte offset read.
use crate::data::load_log;
use crate::data::storage::parse_log_row;
use crate::error::{AppResult, DaqError};
use crate::instrument::{device_line, LineSource, SourceEvent, StreamEnd};
use crate::measurement::RawLine;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Layout of a replayed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayFormat {
    /// CSV log written by `CsvSink`.
    Log,
    /// Raw device output, one record per line.
    Transcript,
}

#[derive(Debug)]
struct Follow {
    path: PathBuf,
    format: ReplayFormat,
    offset: u64,
}

/// Replays lines from memory or from a file.
pub struct ReplaySource {
    name: String,
    lines: VecDeque<AppResult<String>>,
    pace: Duration,
    ticker: Option<Interval>,
    follow: Option<Follow>,
}

impl std::fmt::Debug for ReplaySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplaySource")
            .field("name", &self.name)
            .field("remaining", &self.lines.len())
            .field("pace", &self.pace)
            .field("follow", &self.follow)
            .finish()
    }
}

impl ReplaySource {
    /// Replay `lines` one per `pace`; a zero pace replays as fast as the loop consumes.
    pub fn from_lines<I, S>(name: impl Into<String>, lines: I, pace: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            lines: lines.into_iter().map(|line| Ok(line.into())).collect(),
            pace,
            ticker: None,
            follow: None,
        }
    }

    /// Replay the readings stored in a CSV log.
    pub fn open_log(path: impl AsRef<Path>, pace: Duration) -> AppResult<Self> {
        let path = path.as_ref();
        let lines = load_log(path)?
            .into_iter()
            .map(|reading| device_line(reading.heart_rate, reading.spo2));
        let source = Self::from_lines(path.display().to_string(), lines, pace);
        tracing::info!(source = %source.name, lines = source.remaining(), "Loaded CSV log for replay");
        Ok(source)
    }

    /// Replay a raw device transcript, one record per line.
    ///
    /// Lines that are not valid UTF-8 are replayed as decode errors.
    pub async fn open_transcript(path: impl AsRef<Path>, pace: Duration) -> AppResult<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            DaqError::Disconnected(format!("Failed to read transcript '{}': {}", path.display(), e))
        })?;
        let mut source = Self::from_lines(path.display().to_string(), Vec::<String>::new(), pace);
        source.lines.extend(transcript_lines(&bytes));
        tracing::info!(source = %source.name, lines = source.remaining(), "Loaded transcript for replay");
        Ok(source)
    }

    /// Tail `path` while another process appends to it.
    ///
    /// The file must exist when following starts. If it later shrinks (the writer
    /// started a new session) it is read again from the top.
    pub async fn follow(
        path: impl AsRef<Path>,
        format: ReplayFormat,
        pace: Duration,
    ) -> AppResult<Self> {
        let path = path.as_ref();
        tokio::fs::metadata(path).await.map_err(|e| {
            DaqError::Disconnected(format!("Cannot follow '{}': {}", path.display(), e))
        })?;
        let mut source = Self::from_lines(path.display().to_string(), Vec::<String>::new(), pace);
        source.follow = Some(Follow {
            path: path.to_path_buf(),
            format,
            offset: 0,
        });
        tracing::info!(source = %source.name, ?format, "Following file for replay");
        Ok(source)
    }

    /// Lines read but not yet replayed.
    pub fn remaining(&self) -> usize {
        self.lines.len()
    }

    /// Queue complete lines appended since the last poll.
    async fn poll_file(&mut self) -> AppResult<()> {
        let Some(follow) = self.follow.as_mut() else {
            return Ok(());
        };

        let mut file = match tokio::fs::File::open(&follow.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(source = %self.name, "Followed file is missing");
                follow.offset = 0;
                return Ok(());
            }
            Err(e) => return Err(DaqError::Transport(format!("{}: {}", self.name, e))),
        };
        let transport = |e: std::io::Error| DaqError::Transport(e.to_string());

        let len = file.metadata().await.map_err(transport)?.len();
        if len < follow.offset {
            tracing::info!(source = %self.name, "Followed file shrank, reading from the top");
            follow.offset = 0;
        }
        if len == follow.offset {
            return Ok(());
        }

        file.seek(SeekFrom::Start(follow.offset))
            .await
            .map_err(transport)?;
        let mut chunk = Vec::new();
        file.read_to_end(&mut chunk).await.map_err(transport)?;

        // Leave a row that is still being written for the next poll.
        let Some(end) = chunk.iter().rposition(|&b| b == b'\n') else {
            return Ok(());
        };
        chunk.truncate(end + 1);
        follow.offset += chunk.len() as u64;

        match follow.format {
            ReplayFormat::Transcript => self.lines.extend(transcript_lines(&chunk)),
            ReplayFormat::Log => self.lines.extend(log_lines(&self.name, &chunk)),
        }
        Ok(())
    }

    async fn wait_turn(&mut self) {
        if self.pace.is_zero() {
            tokio::task::yield_now().await;
            return;
        }
        let pace = self.pace;
        let ticker = self.ticker.get_or_insert_with(|| {
            let mut ticker = interval(pace);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        ticker.tick().await;
    }
}

/// Split raw device output into lines, decoding each one on its own.
fn transcript_lines(bytes: &[u8]) -> Vec<AppResult<String>> {
    bytes
        .split(|&b| b == b'\n')
        .filter_map(|raw| {
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            match std::str::from_utf8(raw) {
                Ok(text) if text.trim().is_empty() => None,
                Ok(text) => Some(Ok(text.to_string())),
                Err(e) => Some(Err(DaqError::Decode(e.to_string()))),
            }
        })
        .collect()
}

/// Turn appended log rows into device lines.
///
/// A row that does not decode is passed through as-is so the parser rejects it.
fn log_lines(name: &str, bytes: &[u8]) -> Vec<AppResult<String>> {
    transcript_lines(bytes)
        .into_iter()
        .filter_map(|line| match line {
            Ok(text) => match parse_log_row(&text)? {
                Ok(reading) => Some(Ok(device_line(reading.heart_rate, reading.spo2))),
                Err(e) => {
                    tracing::warn!(source = %name, row = %text, error = %e, "Unreadable log row");
                    Some(Ok(text))
                }
            },
            Err(e) => Some(Err(e)),
        })
        .collect()
}

#[async_trait]
impl LineSource for ReplaySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_line(&mut self) -> AppResult<SourceEvent> {
        if self.lines.is_empty() {
            if self.follow.is_none() {
                return Ok(SourceEvent::EndOfStream(StreamEnd::Exhausted));
            }
            self.poll_file().await?;
            if self.lines.is_empty() {
                return Ok(SourceEvent::EndOfStream(StreamEnd::Idle));
            }
        }
        self.wait_turn().await;
        match self.lines.pop_front() {
            Some(Ok(line)) => Ok(SourceEvent::Line(RawLine::new(line))),
            Some(Err(e)) => Err(e),
            None => Ok(SourceEvent::EndOfStream(StreamEnd::Idle)),
        }
    }

    async fn close(&mut self) -> AppResult<()> {
        self.lines.clear();
        self.follow = None;
        Ok(())
    }
}
