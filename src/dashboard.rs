//! Presentation pull.
//!
//! The presentation layer never touches the ingestion task. It takes a snapshot of the
//! [`HistoryView`] on its own schedule and renders a [`DashboardFrame`]: the plotted
//! series, the table rows and the two "current value" indicators. [`DashboardFeed`]
//! does that on a fixed interval and publishes each frame through a
//! `tokio::sync::watch` channel, so any number of consumers see the latest frame.
//!
//! A frame whose newest reading is older than `stale_after` (or that has no readings)
//! is marked `stale`, which is how a silent source shows up on screen.

use crate::config::DashboardConfig;
use crate::data::HistoryView;
use crate::error::{AppResult, DaqError};
use crate::measurement::reading::now_seconds;
use crate::measurement::Reading;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Label shown when there is no reading.
pub const NO_VALUE: &str = "-";

/// One plotted / tabulated row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardPoint {
    /// `YYYY-MM-DD HH:MM:SS`
    pub timestamp: String,
    /// Oxygen saturation in percent
    pub spo2: f64,
    /// Beats per minute
    pub heart_rate: f64,
}

impl From<&Reading> for DashboardPoint {
    fn from(reading: &Reading) -> Self {
        Self {
            timestamp: reading.timestamp_string(),
            spo2: reading.spo2,
            heart_rate: reading.heart_rate,
        }
    }
}

/// Everything a dashboard needs for one refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardFrame {
    /// History in arrival order
    pub points: Vec<DashboardPoint>,
    /// Newest reading, if any
    pub current: Option<DashboardPoint>,
    /// No reading, or the newest one is older than `stale_after`
    pub stale: bool,
    /// SpO2 indicator, e.g. `98%`
    pub spo2_label: String,
    /// Heart rate indicator, e.g. `75 BPM`
    pub heart_rate_label: String,
    /// Readings accepted since start, including evicted ones
    pub total_readings: u64,
}

impl Default for DashboardFrame {
    fn default() -> Self {
        Self {
            points: Vec::new(),
            current: None,
            stale: true,
            spo2_label: NO_VALUE.to_string(),
            heart_rate_label: NO_VALUE.to_string(),
            total_readings: 0,
        }
    }
}

impl DashboardFrame {
    /// Snapshot `view` now.
    pub fn capture(view: &HistoryView, stale_after: Duration) -> Self {
        Self::capture_at(view, stale_after, now_seconds())
    }

    /// Snapshot `view` as seen at `now`.
    pub fn capture_at(view: &HistoryView, stale_after: Duration, now: NaiveDateTime) -> Self {
        let readings = view.snapshot();
        let total_readings = view.total_appended();
        let Some(latest) = readings.last() else {
            return Self {
                total_readings,
                ..Self::default()
            };
        };

        let stale = match chrono::Duration::from_std(stale_after) {
            Ok(limit) => now - latest.timestamp > limit,
            Err(_) => false,
        };

        Self {
            current: Some(DashboardPoint::from(latest)),
            stale,
            spo2_label: format!("{}%", latest.spo2),
            heart_rate_label: format!("{} BPM", latest.heart_rate),
            points: readings.iter().map(DashboardPoint::from).collect(),
            total_readings,
        }
    }

    /// Serialize the frame as one JSON object.
    pub fn to_json(&self) -> AppResult<String> {
        serde_json::to_string(self).map_err(|e| DaqError::Io(e.into()))
    }
}

/// Periodic frame publisher.
pub struct DashboardFeed {
    frames: watch::Receiver<DashboardFrame>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl DashboardFeed {
    /// Start refreshing from `view` every `config.refresh_interval`.
    pub fn spawn(view: HistoryView, config: &DashboardConfig) -> Self {
        let refresh = config.refresh_interval.max(Duration::from_millis(1));
        let stale_after = config.stale_after;
        let (frame_tx, frames) = watch::channel(DashboardFrame::default());
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresh);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        frame_tx.send_replace(DashboardFrame::capture(&view, stale_after));
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
            tracing::debug!("Dashboard feed stopped");
        });

        Self {
            frames,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// New receiver; `changed()` fires on every refresh.
    pub fn subscribe(&self) -> watch::Receiver<DashboardFrame> {
        self.frames.clone()
    }

    /// Most recently published frame.
    pub fn latest(&self) -> DashboardFrame {
        self.frames.borrow().clone()
    }

    /// Stop refreshing and wait for the task. Safe to call twice.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
