//! Ingestion loop: pull, parse, store.
//!
//! [`IngestionLoop`] owns the line source, the parser, the optional persistence sink
//! and the [`HistoryBuffer`]. `start()` moves the pipeline onto its own tokio task;
//! the presentation side only ever holds a [`HistoryView`] and the shared
//! [`IngestStats`].
//!
//! Failure handling happens in one place, the loop body:
//!
//! | Event | Effect |
//! |---|---|
//! | parsed reading | appended to history, forwarded to the sink |
//! | rejected line / invalid UTF-8 / overlong line | counted per reason, loop continues |
//! | source idle | backoff, then retry |
//! | transient transport error | counted, backoff, then retry |
//! | panic in source or parser | caught, counted as a fault, loop continues |
//! | sink write failure | counted, history still updated |
//! | permanent disconnect | loop exits with [`LoopExit::Disconnected`] |
//! | source exhausted | loop exits with [`LoopExit::Exhausted`] |
//!
//! `stop()` signals the task and waits for it, so once it returns the history is
//! frozen.

use crate::config::Settings;
use crate::data::{HistoryBuffer, HistoryView, PersistenceSink};
use crate::error::{AppResult, DaqError, RejectionReason};
use crate::instrument::{LineSource, SourceEvent, StreamEnd};
use crate::measurement::{RawLine, RecordParser};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Why the loop ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "exit", content = "detail", rename_all = "snake_case")]
pub enum LoopExit {
    /// `stop()` was called.
    Stopped,
    /// The source reported that no more lines will come.
    Exhausted,
    /// The transport went away permanently.
    Disconnected(String),
}

impl std::fmt::Display for LoopExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopExit::Stopped => write!(f, "stopped"),
            LoopExit::Exhausted => write!(f, "source exhausted"),
            LoopExit::Disconnected(msg) => write!(f, "disconnected: {}", msg),
        }
    }
}

/// Loop tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestConfig {
    /// Pause after an idle read or a transient transport error
    pub retry_backoff: Duration,
    /// History length
    pub history_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            retry_backoff: Duration::from_millis(500),
            history_capacity: crate::data::DEFAULT_CAPACITY,
        }
    }
}

impl IngestConfig {
    /// Take the backoff from `[source]` and the capacity from `[history]`.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            retry_backoff: settings.source.retry_backoff,
            history_capacity: settings.history.capacity,
        }
    }
}

/// Counters shared between the loop and its observers.
#[derive(Debug, Default)]
pub struct IngestStats {
    lines: AtomicU64,
    accepted: AtomicU64,
    malformed: AtomicU64,
    out_of_range: AtomicU64,
    decode_errors: AtomicU64,
    idle_polls: AtomicU64,
    transport_errors: AtomicU64,
    persistence_errors: AtomicU64,
    faults: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStatsSnapshot {
    /// Lines handed to the parser, plus lines lost to framing or decoding.
    pub lines: u64,
    /// Readings appended to history.
    pub accepted: u64,
    /// Lines rejected as [`RejectionReason::MalformedFormat`].
    pub malformed: u64,
    /// Lines rejected as [`RejectionReason::OutOfRange`].
    pub out_of_range: u64,
    /// Lines rejected as [`RejectionReason::DecodeError`].
    pub decode_errors: u64,
    /// Polls that found no line.
    pub idle_polls: u64,
    /// Transient source errors.
    pub transport_errors: u64,
    /// Failed sink writes.
    pub persistence_errors: u64,
    /// Panics caught in the source or parser.
    pub faults: u64,
}

impl IngestStatsSnapshot {
    /// Lines rejected for any reason.
    pub fn rejected(&self) -> u64 {
        self.malformed + self.out_of_range + self.decode_errors
    }
}

impl IngestStats {
    /// Copy every counter.
    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            lines: self.lines.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            out_of_range: self.out_of_range.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            idle_polls: self.idle_polls.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            persistence_errors: self.persistence_errors.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }

    /// Rejections recorded for `reason`.
    pub fn rejections(&self, reason: RejectionReason) -> u64 {
        self.counter_for(reason).load(Ordering::Relaxed)
    }

    fn record_rejection(&self, reason: RejectionReason) {
        self.counter_for(reason).fetch_add(1, Ordering::Relaxed);
    }

    fn counter_for(&self, reason: RejectionReason) -> &AtomicU64 {
        match reason {
            RejectionReason::MalformedFormat => &self.malformed,
            RejectionReason::OutOfRange => &self.out_of_range,
            RejectionReason::DecodeError => &self.decode_errors,
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Everything the background task owns.
struct Pipeline {
    source: Box<dyn LineSource>,
    parser: RecordParser,
    sink: Option<Box<dyn PersistenceSink>>,
    history: Arc<HistoryBuffer>,
    stats: Arc<IngestStats>,
    retry_backoff: Duration,
}

enum Phase {
    Ready(Box<Pipeline>),
    Running(JoinHandle<LoopExit>),
    Finished(LoopExit),
    Failed(String),
}

/// Drives `LineSource -> RecordParser -> {HistoryBuffer, PersistenceSink}`.
pub struct IngestionLoop {
    history: Arc<HistoryBuffer>,
    stats: Arc<IngestStats>,
    phase: Mutex<Phase>,
    shutdown_tx: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
}

impl std::fmt::Debug for IngestionLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionLoop")
            .field("history_len", &self.history.len())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl IngestionLoop {
    /// Build a loop around `source`. Nothing runs until [`start`](Self::start).
    pub fn new(source: Box<dyn LineSource>, parser: RecordParser, config: IngestConfig) -> Self {
        let history = Arc::new(HistoryBuffer::new(config.history_capacity));
        let stats = Arc::new(IngestStats::default());
        let pipeline = Pipeline {
            source,
            parser,
            sink: None,
            history: Arc::clone(&history),
            stats: Arc::clone(&stats),
            retry_backoff: config.retry_backoff,
        };
        Self {
            history,
            stats,
            phase: Mutex::new(Phase::Ready(Box::new(pipeline))),
            shutdown_tx: parking_lot::Mutex::new(None),
        }
    }

    /// Forward accepted readings to `sink` as well.
    pub fn with_sink(mut self, sink: Box<dyn PersistenceSink>) -> Self {
        if let Phase::Ready(pipeline) = self.phase.get_mut() {
            pipeline.sink = Some(sink);
        }
        self
    }

    /// Read-only handle for the presentation layer.
    pub fn history(&self) -> HistoryView {
        HistoryView::new(Arc::clone(&self.history))
    }

    /// Shared counters, updated while the loop runs.
    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    /// Spawn the loop on its own task. Fails if it was already started or stopped.
    pub async fn start(&self) -> AppResult<()> {
        let mut phase = self.phase.lock().await;
        let pipeline = match std::mem::replace(&mut *phase, Phase::Finished(LoopExit::Stopped)) {
            Phase::Ready(pipeline) => pipeline,
            other => {
                *phase = other;
                return Err(DaqError::AlreadyStarted);
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let span = tracing::info_span!("ingest", source = %pipeline.source.name());
        let handle = tokio::spawn(pipeline.run(shutdown_rx).instrument(span));

        *self.shutdown_tx.lock() = Some(shutdown_tx);
        *phase = Phase::Running(handle);
        Ok(())
    }

    /// Ask the loop to stop and wait until it has.
    ///
    /// Idempotent: later calls return the same exit. Calling it before `start()`
    /// releases the source and leaves the loop unstartable.
    pub async fn stop(&self) -> AppResult<LoopExit> {
        // Signal before taking the phase lock: a pending `join()` holds it until the task ends.
        self.signal_shutdown();

        let mut phase = self.phase.lock().await;
        // A `start()` that won the lock after the first signal has installed a new sender.
        self.signal_shutdown();
        if matches!(*phase, Phase::Ready(_)) {
            if let Phase::Ready(mut pipeline) =
                std::mem::replace(&mut *phase, Phase::Finished(LoopExit::Stopped))
            {
                pipeline.release().await;
            }
            info!("Ingestion loop stopped before it was started");
        }
        Self::settle(&mut phase).await
    }

    fn signal_shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Wait for the loop to end on its own (source exhausted or disconnected).
    pub async fn join(&self) -> AppResult<LoopExit> {
        let mut phase = self.phase.lock().await;
        if matches!(*phase, Phase::Ready(_)) {
            return Err(DaqError::Configuration(
                "ingestion loop was never started".to_string(),
            ));
        }
        Self::settle(&mut phase).await
    }

    /// True once the loop has ended for any reason.
    pub async fn is_finished(&self) -> bool {
        match &*self.phase.lock().await {
            Phase::Running(handle) => handle.is_finished(),
            Phase::Ready(_) => false,
            Phase::Finished(_) | Phase::Failed(_) => true,
        }
    }

    async fn settle(phase: &mut Phase) -> AppResult<LoopExit> {
        if let Phase::Running(handle) = phase {
            *phase = match handle.await {
                Ok(exit) => Phase::Finished(exit),
                Err(e) => {
                    error!(error = %e, "Ingestion task failed");
                    Phase::Failed(e.to_string())
                }
            };
        }
        match phase {
            Phase::Finished(exit) => Ok(exit.clone()),
            Phase::Failed(msg) => Err(DaqError::TaskFailed(msg.clone())),
            Phase::Ready(_) | Phase::Running(_) => Err(DaqError::TaskFailed(
                "ingestion loop in unexpected state".to_string(),
            )),
        }
    }
}

impl Pipeline {
    async fn run(mut self: Box<Self>, mut shutdown_rx: oneshot::Receiver<()>) -> LoopExit {
        info!(capacity = self.history.capacity(), "Ingestion loop started");

        let exit = loop {
            let event = tokio::select! {
                biased;
                _ = &mut shutdown_rx => break LoopExit::Stopped,
                event = AssertUnwindSafe(self.source.next_line()).catch_unwind() => event,
            };

            match event {
                Ok(Ok(SourceEvent::Line(line))) => self.ingest(&line).await,
                Ok(Ok(SourceEvent::EndOfStream(StreamEnd::Idle))) => {
                    IngestStats::bump(&self.stats.idle_polls);
                    debug!("No data from source");
                    if pause(self.retry_backoff, &mut shutdown_rx).await {
                        break LoopExit::Stopped;
                    }
                }
                Ok(Ok(SourceEvent::EndOfStream(StreamEnd::Exhausted))) => {
                    info!("Source exhausted");
                    break LoopExit::Exhausted;
                }
                Ok(Err(DaqError::LineTooLong { limit })) => {
                    IngestStats::bump(&self.stats.lines);
                    self.stats.record_rejection(RejectionReason::MalformedFormat);
                    debug!(reason = %RejectionReason::MalformedFormat, limit, "Dropped overlong line");
                }
                Ok(Err(DaqError::Decode(msg))) => {
                    IngestStats::bump(&self.stats.lines);
                    self.stats.record_rejection(RejectionReason::DecodeError);
                    debug!(reason = %RejectionReason::DecodeError, error = %msg, "Rejected line");
                }
                Ok(Err(e)) if e.is_permanent() => {
                    error!(error = %e, "Source disconnected");
                    break LoopExit::Disconnected(e.to_string());
                }
                Ok(Err(e)) => {
                    IngestStats::bump(&self.stats.transport_errors);
                    warn!(error = %e, "Transient source error");
                    if pause(self.retry_backoff, &mut shutdown_rx).await {
                        break LoopExit::Stopped;
                    }
                }
                Err(panic) => {
                    IngestStats::bump(&self.stats.faults);
                    error!(panic = %panic_message(panic.as_ref()), "Line source panicked");
                    if pause(self.retry_backoff, &mut shutdown_rx).await {
                        break LoopExit::Stopped;
                    }
                }
            }
        };

        self.release().await;
        let stats = self.stats.snapshot();
        info!(
            %exit,
            lines = stats.lines,
            accepted = stats.accepted,
            rejected = stats.rejected(),
            faults = stats.faults,
            "Ingestion loop finished"
        );
        exit
    }

    async fn ingest(&mut self, line: &RawLine) {
        IngestStats::bump(&self.stats.lines);
        let parser = &self.parser;
        let parsed = std::panic::catch_unwind(AssertUnwindSafe(|| parser.parse(line)));

        match parsed {
            Ok(Ok(reading)) => {
                self.history.append(reading);
                IngestStats::bump(&self.stats.accepted);
                if let Some(sink) = self.sink.as_mut() {
                    if let Err(e) = sink.write(&reading).await {
                        IngestStats::bump(&self.stats.persistence_errors);
                        warn!(error = %e, "Failed to persist reading");
                    }
                }
            }
            Ok(Err(reason)) => {
                self.stats.record_rejection(reason);
                debug!(%reason, line = line.as_str(), "Rejected line");
            }
            Err(panic) => {
                IngestStats::bump(&self.stats.faults);
                error!(
                    panic = %panic_message(panic.as_ref()),
                    line = line.as_str(),
                    "Parser panicked"
                );
            }
        }
    }

    async fn release(&mut self) {
        if let Err(e) = self.source.close().await {
            warn!(error = %e, "Failed to close line source");
        }
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.shutdown().await {
                warn!(error = %e, "Failed to shut down persistence sink");
            }
        }
    }
}

/// Sleep for `backoff`; true if a stop arrived meanwhile.
async fn pause(backoff: Duration, shutdown_rx: &mut oneshot::Receiver<()>) -> bool {
    tokio::select! {
        biased;
        _ = shutdown_rx => true,
        _ = tokio::time::sleep(backoff) => false,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::SimulatedSource;
    use crate::measurement::Reading;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tracing_test::traced_test;

    enum Step {
        Line(&'static str),
        Idle,
        Transport,
        Decode,
        Overlong,
        Disconnect,
        Panic,
    }

    struct ScriptedSource {
        steps: VecDeque<Step>,
        closed: Arc<std::sync::atomic::AtomicBool>,
    }

    impl ScriptedSource {
        fn boxed(steps: Vec<Step>) -> (Box<dyn LineSource>, Arc<std::sync::atomic::AtomicBool>) {
            let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
            let source = Self {
                steps: steps.into(),
                closed: Arc::clone(&closed),
            };
            (Box::new(source), closed)
        }
    }

    #[async_trait]
    impl LineSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn next_line(&mut self) -> AppResult<SourceEvent> {
            match self.steps.pop_front() {
                Some(Step::Line(text)) => Ok(SourceEvent::Line(RawLine::new(text))),
                Some(Step::Idle) => Ok(SourceEvent::EndOfStream(StreamEnd::Idle)),
                Some(Step::Transport) => Err(DaqError::Transport("framing error".into())),
                Some(Step::Decode) => Err(DaqError::Decode("invalid utf-8".into())),
                Some(Step::Overlong) => Err(DaqError::LineTooLong { limit: 16 }),
                Some(Step::Disconnect) => Err(DaqError::Disconnected("unplugged".into())),
                Some(Step::Panic) => panic!("driver bug"),
                None => Ok(SourceEvent::EndOfStream(StreamEnd::Exhausted)),
            }
        }

        async fn close(&mut self) -> AppResult<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        rows: Arc<parking_lot::Mutex<Vec<Reading>>>,
        fail: bool,
    }

    #[async_trait]
    impl PersistenceSink for RecordingSink {
        async fn write(&mut self, reading: &Reading) -> AppResult<()> {
            if self.fail {
                return Err(DaqError::Persistence("disk full".into()));
            }
            self.rows.lock().push(*reading);
            Ok(())
        }
    }

    const GOOD: &str = "Heart rate: 75.00 bpm, SpO2: 98.00 %";

    fn config() -> IngestConfig {
        IngestConfig {
            retry_backoff: Duration::from_millis(10),
            history_capacity: 100,
        }
    }

    #[tokio::test]
    async fn accepts_rejects_and_continues_to_exhaustion() {
        let (source, closed) = ScriptedSource::boxed(vec![
            Step::Line(GOOD),
            Step::Line("garbage"),
            Step::Line("Heart rate: 0.00 bpm, SpO2: 0.00 %"),
            Step::Decode,
            Step::Line("Heart rate: 80.00 bpm, SpO2: 97.00 %"),
        ]);
        let ingest = IngestionLoop::new(source, RecordParser::default(), config());
        ingest.start().await.unwrap();

        assert_eq!(ingest.join().await.unwrap(), LoopExit::Exhausted);
        assert!(closed.load(Ordering::SeqCst));

        let history = ingest.history().snapshot();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].heart_rate, 75.0);
        assert_eq!(history[1].heart_rate, 80.0);

        let stats = ingest.stats().snapshot();
        assert_eq!(stats.lines, 5);
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.out_of_range, 1);
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.rejected(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_back_off_and_retry() {
        let (source, _) = ScriptedSource::boxed(vec![
            Step::Idle,
            Step::Transport,
            Step::Line(GOOD),
        ]);
        let ingest = IngestionLoop::new(source, RecordParser::default(), config());
        ingest.start().await.unwrap();

        assert_eq!(ingest.join().await.unwrap(), LoopExit::Exhausted);
        let stats = ingest.stats().snapshot();
        assert_eq!(stats.idle_polls, 1);
        assert_eq!(stats.transport_errors, 1);
        assert_eq!(stats.accepted, 1);
    }

    #[tokio::test]
    async fn permanent_disconnect_ends_loop() {
        let (source, closed) =
            ScriptedSource::boxed(vec![Step::Line(GOOD), Step::Disconnect, Step::Line(GOOD)]);
        let ingest = IngestionLoop::new(source, RecordParser::default(), config());
        ingest.start().await.unwrap();

        let exit = ingest.join().await.unwrap();
        assert!(matches!(exit, LoopExit::Disconnected(ref msg) if msg.contains("unplugged")));
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(ingest.history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn source_panic_is_contained() {
        let (source, _) =
            ScriptedSource::boxed(vec![Step::Panic, Step::Line(GOOD), Step::Panic]);
        let ingest = IngestionLoop::new(source, RecordParser::default(), config());
        ingest.start().await.unwrap();

        assert_eq!(ingest.join().await.unwrap(), LoopExit::Exhausted);
        let stats = ingest.stats().snapshot();
        assert_eq!(stats.faults, 2);
        assert_eq!(stats.accepted, 1);
    }

    #[tokio::test]
    async fn sink_receives_accepted_readings_only() {
        let (source, _) =
            ScriptedSource::boxed(vec![Step::Line(GOOD), Step::Line("junk"), Step::Line(GOOD)]);
        let sink = RecordingSink::default();
        let rows = Arc::clone(&sink.rows);
        let ingest = IngestionLoop::new(source, RecordParser::default(), config())
            .with_sink(Box::new(sink));
        ingest.start().await.unwrap();
        ingest.join().await.unwrap();

        assert_eq!(rows.lock().len(), 2);
        assert_eq!(*rows.lock(), ingest.history().snapshot());
    }

    #[tokio::test]
    async fn sink_failure_keeps_history_updated() {
        let (source, _) = ScriptedSource::boxed(vec![Step::Line(GOOD), Step::Line(GOOD)]);
        let sink = RecordingSink {
            fail: true,
            ..Default::default()
        };
        let ingest = IngestionLoop::new(source, RecordParser::default(), config())
            .with_sink(Box::new(sink));
        ingest.start().await.unwrap();

        assert_eq!(ingest.join().await.unwrap(), LoopExit::Exhausted);
        assert_eq!(ingest.history().len(), 2);
        assert_eq!(ingest.stats().snapshot().persistence_errors, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_prompt_idempotent_and_freezes_history() {
        let source = SimulatedSource::new(Duration::from_millis(100), Some(1));
        let ingest = IngestionLoop::new(Box::new(source), RecordParser::default(), config());
        ingest.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(550)).await;
        assert_eq!(ingest.stop().await.unwrap(), LoopExit::Stopped);
        let frozen = ingest.history().total_appended();
        assert!(frozen >= 5);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(ingest.history().total_appended(), frozen);
        assert_eq!(ingest.stop().await.unwrap(), LoopExit::Stopped);
        assert!(ingest.is_finished().await);
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let source = SimulatedSource::new(Duration::from_millis(10), None);
        let ingest = IngestionLoop::new(Box::new(source), RecordParser::default(), config());
        ingest.start().await.unwrap();
        assert!(matches!(ingest.start().await, Err(DaqError::AlreadyStarted)));
        ingest.stop().await.unwrap();
        assert!(matches!(ingest.start().await, Err(DaqError::AlreadyStarted)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_racing_start_never_hangs() {
        for _ in 0..200 {
            let source = SimulatedSource::new(Duration::from_millis(1), None);
            let ingest = Arc::new(IngestionLoop::new(
                Box::new(source),
                RecordParser::default(),
                config(),
            ));
            let starter = tokio::spawn({
                let ingest = Arc::clone(&ingest);
                async move { ingest.start().await }
            });
            let stopper = tokio::spawn({
                let ingest = Arc::clone(&ingest);
                async move { ingest.stop().await }
            });

            let exit = tokio::time::timeout(Duration::from_secs(2), stopper)
                .await
                .expect("stop hung while start was in flight")
                .unwrap()
                .unwrap();
            assert_eq!(exit, LoopExit::Stopped);
            // Whichever won, the loop is finished and cannot be started again.
            let _ = starter.await.unwrap();
            assert!(ingest.is_finished().await);
            assert!(ingest.start().await.is_err());
        }
    }

    #[tokio::test]
    async fn stop_unblocks_pending_join() {
        let source = SimulatedSource::new(Duration::from_millis(5), None);
        let ingest = Arc::new(IngestionLoop::new(
            Box::new(source),
            RecordParser::default(),
            config(),
        ));
        ingest.start().await.unwrap();

        let joiner = tokio::spawn({
            let ingest = Arc::clone(&ingest);
            async move { ingest.join().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let exit = tokio::time::timeout(Duration::from_secs(1), ingest.stop())
            .await
            .expect("stop blocked behind join")
            .unwrap();
        assert_eq!(exit, LoopExit::Stopped);
        assert_eq!(joiner.await.unwrap().unwrap(), LoopExit::Stopped);
    }

    #[tokio::test]
    async fn overlong_lines_count_as_malformed() {
        let (source, _) = ScriptedSource::boxed(vec![Step::Overlong, Step::Line(GOOD)]);
        let ingest = IngestionLoop::new(source, RecordParser::default(), config());
        ingest.start().await.unwrap();
        assert_eq!(ingest.join().await.unwrap(), LoopExit::Exhausted);

        let stats = ingest.stats().snapshot();
        assert_eq!(stats.lines, 2);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.accepted, 1);
    }

    #[tokio::test]
    async fn stop_before_start_releases_source() {
        let (source, closed) = ScriptedSource::boxed(vec![Step::Line(GOOD)]);
        let ingest = IngestionLoop::new(source, RecordParser::default(), config());
        assert!(ingest.join().await.is_err());
        assert_eq!(ingest.stop().await.unwrap(), LoopExit::Stopped);
        assert!(closed.load(Ordering::SeqCst));
        assert!(ingest.start().await.is_err());
        assert!(ingest.history().is_empty());
    }

    #[tokio::test]
    async fn history_respects_capacity() {
        let lines: Vec<Step> = (0..25).map(|_| Step::Line(GOOD)).collect();
        let (source, _) = ScriptedSource::boxed(lines);
        let ingest = IngestionLoop::new(
            source,
            RecordParser::default(),
            IngestConfig {
                history_capacity: 10,
                ..config()
            },
        );
        ingest.start().await.unwrap();
        ingest.join().await.unwrap();

        let view = ingest.history();
        assert_eq!(view.len(), 10);
        assert_eq!(view.total_appended(), 25);
    }

    #[tokio::test]
    #[traced_test]
    async fn rejections_are_logged_with_reason() {
        let (source, _) = ScriptedSource::boxed(vec![Step::Line("SpO2 only: 97 %")]);
        let ingest = IngestionLoop::new(source, RecordParser::default(), config());
        ingest.start().await.unwrap();
        ingest.join().await.unwrap();

        assert!(logs_contain("Rejected line"));
        assert!(logs_contain("malformed format"));
        assert!(logs_contain("Ingestion loop finished"));
    }

    #[test]
    fn stats_snapshot_serializes() {
        let stats = IngestStats::default();
        stats.record_rejection(RejectionReason::OutOfRange);
        IngestStats::bump(&stats.accepted);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["out_of_range"], 1);
        assert_eq!(json["accepted"], 1);
        assert_eq!(stats.rejections(RejectionReason::OutOfRange), 1);
    }

    #[test]
    fn loop_exit_display() {
        assert_eq!(LoopExit::Exhausted.to_string(), "source exhausted");
        assert_eq!(
            LoopExit::Disconnected("gone".into()).to_string(),
            "disconnected: gone"
        );
    }
}
