//! A simulated oximeter that generates synthetic lines.
//!
//! Values are drawn uniformly from whole numbers in 60..=100 bpm and 90..=100 % SpO2,
//! which sit inside the default plausibility bounds, so simulated data is never
//! rejected as out of range.
use crate::error::AppResult;
use crate::instrument::{device_line, LineSource, SourceEvent, StreamEnd};
use crate::measurement::RawLine;
use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::ops::RangeInclusive;
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Simulated heart rate range (bpm).
pub const HEART_RATE_RANGE: RangeInclusive<u32> = 60..=100;
/// Simulated SpO2 range (%).
pub const SPO2_RANGE: RangeInclusive<u32> = 90..=100;

/// Default simulated sample period.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Synthetic line generator, one line per tick.
pub struct SimulatedSource {
    rng: ChaCha8Rng,
    period: Duration,
    ticker: Option<Interval>,
    limit: Option<u64>,
    produced: u64,
}

impl std::fmt::Debug for SimulatedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedSource")
            .field("period", &self.period)
            .field("limit", &self.limit)
            .field("produced", &self.produced)
            .finish()
    }
}

impl Default for SimulatedSource {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL, None)
    }
}

impl SimulatedSource {
    /// Create a generator ticking every `period`.
    ///
    /// With a `seed` the sequence of values is reproducible.
    pub fn new(period: Duration, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            rng,
            period: period.max(Duration::from_millis(1)),
            ticker: None,
            limit: None,
            produced: 0,
        }
    }

    /// Stop after `count` lines, then report the stream as exhausted.
    pub fn with_limit(mut self, count: u64) -> Self {
        self.limit = Some(count);
        self
    }

    /// Lines produced so far.
    pub fn produced(&self) -> u64 {
        self.produced
    }

    fn generate(&mut self) -> String {
        let heart_rate = self.rng.gen_range(HEART_RATE_RANGE);
        let spo2 = self.rng.gen_range(SPO2_RANGE);
        device_line(f64::from(heart_rate), f64::from(spo2))
    }
}

#[async_trait]
impl LineSource for SimulatedSource {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn next_line(&mut self) -> AppResult<SourceEvent> {
        if self.limit.is_some_and(|limit| self.produced >= limit) {
            return Ok(SourceEvent::EndOfStream(StreamEnd::Exhausted));
        }

        let period = self.period;
        let ticker = self.ticker.get_or_insert_with(|| {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        ticker.tick().await;

        self.produced += 1;
        Ok(SourceEvent::Line(RawLine::new(self.generate())))
    }
}
