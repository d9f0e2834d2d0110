//! Line framing over a serial / Bluetooth SPP byte stream.
//!
//! [`SerialSource`] works over any `AsyncRead`, so the same framing serves a real port
//! (`tokio_serial::SerialStream`), standard input, or a `tokio::io::duplex` pair in
//! tests. Bytes are accumulated until `\n`; a read timeout bounds every call so the
//! ingestion loop can notice a stop request while the device is quiet.
//!
//! A line may hold at most `max_line_length` bytes. Past that the buffered bytes are
//! dropped, the line is reported as [`DaqError::LineTooLong`], and everything up to the
//! next `\n` is skipped. A device talking at the wrong baud rate therefore costs a
//! bounded amount of memory.
//!
//! # Feature Flag
//!
//! Opening a physical port needs the `tokio_serial` feature:
//!
//! ```toml
//! [dependencies]
//! oxi_daq = { path = "..", features = ["tokio_serial"] }
//! ```

use crate::error::{AppResult, DaqError};
use crate::instrument::{LineSource, SourceEvent, StreamEnd};
use crate::measurement::RawLine;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Default time to wait for a complete line.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Default baud rate of the oximeter firmware.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default limit on one line, terminator excluded.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4096;

/// Result of one framing step.
enum Frame {
    /// `pending` holds a complete line.
    Line,
    /// The current line passed the length limit and was dropped.
    Overflow,
    /// The stream is closed.
    Eof,
}

/// Newline-framed text source over a byte stream.
pub struct SerialSource<R> {
    name: String,
    reader: BufReader<R>,
    pending: Vec<u8>,
    read_timeout: Duration,
    max_line_length: usize,
    discarding: bool,
    eof: bool,
}

impl<R> std::fmt::Debug for SerialSource<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialSource")
            .field("name", &self.name)
            .field("pending_bytes", &self.pending.len())
            .field("read_timeout", &self.read_timeout)
            .field("max_line_length", &self.max_line_length)
            .field("discarding", &self.discarding)
            .field("eof", &self.eof)
            .finish()
    }
}

impl<R: AsyncRead + Unpin + Send> SerialSource<R> {
    /// Frame lines from `reader`, waiting at most `read_timeout` per call.
    pub fn new(name: impl Into<String>, reader: R, read_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            reader: BufReader::new(reader),
            pending: Vec::new(),
            read_timeout,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            discarding: false,
            eof: false,
        }
    }

    /// Drop lines longer than `limit` bytes.
    pub fn with_max_line_length(mut self, limit: usize) -> Self {
        self.max_line_length = limit.max(1);
        self
    }

    /// Move bytes from the reader into `pending` until a frame boundary.
    ///
    /// State only changes between awaits, so a timeout that cancels this future loses
    /// nothing.
    async fn read_frame(&mut self) -> std::io::Result<Frame> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(Frame::Eof);
            }
            let newline = available.iter().position(|&b| b == b'\n');
            let take = newline.map_or(available.len(), |idx| idx + 1);

            if self.discarding {
                self.reader.consume(take);
                if newline.is_some() {
                    self.discarding = false;
                }
                continue;
            }

            let line_length = self.pending.len() + newline.unwrap_or(available.len());
            if line_length > self.max_line_length {
                self.pending.clear();
                self.discarding = newline.is_none();
                self.reader.consume(take);
                return Ok(Frame::Overflow);
            }

            self.pending.extend_from_slice(&available[..take]);
            self.reader.consume(take);
            if newline.is_some() {
                return Ok(Frame::Line);
            }
        }
    }

    fn take_line(&mut self) -> AppResult<RawLine> {
        let bytes = std::mem::take(&mut self.pending);
        String::from_utf8(bytes)
            .map(RawLine::new)
            .map_err(|e| DaqError::Decode(e.to_string()))
    }
}

#[cfg(feature = "tokio_serial")]
impl SerialSource<tokio_serial::SerialStream> {
    /// Open a serial port (8N1, no flow control).
    ///
    /// Port opening runs on the blocking pool so the runtime is not stalled while the
    /// OS sets the line up.
    pub async fn open(port: &str, baud_rate: u32, read_timeout: Duration) -> AppResult<Self> {
        use tokio_serial::SerialPortBuilderExt;

        let port_owned = port.to_string();
        let stream = tokio::task::spawn_blocking(move || {
            tokio_serial::new(&port_owned, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
        })
        .await
        .map_err(|e| DaqError::TaskFailed(e.to_string()))?
        .map_err(|e| DaqError::Disconnected(format!("Failed to open serial port {}: {}", port, e)))?;

        tracing::info!(port, baud_rate, "Serial port opened");
        Ok(Self::new(port, stream, read_timeout))
    }
}

fn classify_io_error(source: &str, err: std::io::Error) -> DaqError {
    match err.kind() {
        ErrorKind::BrokenPipe
        | ErrorKind::NotConnected
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotFound
        | ErrorKind::PermissionDenied => DaqError::Disconnected(format!("{}: {}", source, err)),
        _ => DaqError::Transport(format!("{}: {}", source, err)),
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> LineSource for SerialSource<R> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_line(&mut self) -> AppResult<SourceEvent> {
        loop {
            if self.eof {
                if self.pending.is_empty() {
                    return Ok(SourceEvent::EndOfStream(StreamEnd::Exhausted));
                }
                // Unterminated final line.
                return self.take_line().map(SourceEvent::Line);
            }

            let frame = tokio::time::timeout(self.read_timeout, self.read_frame()).await;

            match frame {
                Err(_) => return Ok(SourceEvent::EndOfStream(StreamEnd::Idle)),
                Ok(Err(e)) => return Err(classify_io_error(&self.name, e)),
                Ok(Ok(Frame::Eof)) => {
                    tracing::info!(source = %self.name, "Byte stream closed");
                    self.eof = true;
                }
                Ok(Ok(Frame::Overflow)) => {
                    tracing::warn!(
                        source = %self.name,
                        limit = self.max_line_length,
                        "Dropping line without terminator"
                    );
                    return Err(DaqError::LineTooLong {
                        limit: self.max_line_length,
                    });
                }
                Ok(Ok(Frame::Line)) => {
                    let line = self.take_line()?;
                    if line.is_empty() {
                        continue;
                    }
                    return Ok(SourceEvent::Line(line));
                }
            }
        }
    }

    async fn close(&mut self) -> AppResult<()> {
        self.eof = true;
        self.discarding = false;
        self.pending.clear();
        tracing::debug!(source = %self.name, "Line source closed");
        Ok(())
    }
}
