//! Configuration System using Figment
//!
//! Strongly-typed configuration for the ingestion pipeline. Values are layered:
//! 1. Built-in defaults (`Settings::default()`)
//! 2. A TOML file (`config/oxi_daq.toml` unless another path is given)
//! 3. Environment variables prefixed with `OXI_DAQ_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use oxi_daq::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("History length: {}", settings.history.capacity);
//! # Ok::<(), oxi_daq::error::DaqError>(())
//! ```
//!
//! ```toml
//! [history]
//! capacity = 100
//!
//! [source]
//! kind = "serial"
//! port = "/dev/rfcomm0"
//! baud_rate = 115200
//! read_timeout = "2s"
//! ```

use crate::error::{AppResult, DaqError};
use crate::logging::OutputFormat;
use crate::measurement::PlausibilityBounds;
use crate::validation;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/oxi_daq.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "OXI_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// In-memory history
    #[serde(default)]
    pub history: HistoryConfig,
    /// Plausibility bounds applied by the parser
    #[serde(default)]
    pub bounds: PlausibilityBounds,
    /// Where lines come from
    #[serde(default)]
    pub source: SourceConfig,
    /// Durable CSV log
    #[serde(default)]
    pub storage: StorageConfig,
    /// Presentation pull cadence
    #[serde(default)]
    pub dashboard: DashboardConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }
}

/// History buffer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Readings kept in memory
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

/// Which line source feeds the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Synthetic generator
    #[default]
    Simulated,
    /// Serial or Bluetooth SPP device
    Serial,
    /// Recorded CSV log or transcript
    Replay,
}

/// Line source configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source variant
    #[serde(default)]
    pub kind: SourceKind,
    /// Tick period for simulated and replayed lines
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Seed for the simulated generator
    #[serde(default)]
    pub seed: Option<u64>,
    /// Stop the simulated generator after this many lines
    #[serde(default)]
    pub limit: Option<u64>,
    /// Serial port path (e.g. `/dev/ttyUSB0`, `/dev/rfcomm0`, `COM3`)
    #[serde(default = "default_port")]
    pub port: String,
    /// Serial baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Longest wait for one line before reporting the source idle
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
    /// File to replay
    #[serde(default)]
    pub replay_path: Option<PathBuf>,
    /// Treat `replay_path` as a raw device transcript instead of a CSV log
    #[serde(default)]
    pub replay_raw: bool,
    /// Keep tailing `replay_path` after its end instead of finishing
    #[serde(default)]
    pub replay_follow: bool,
    /// Longest line a byte stream may send before it is dropped as malformed
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    /// Pause after an idle read or a transient transport error
    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::default(),
            interval: default_interval(),
            seed: None,
            limit: None,
            port: default_port(),
            baud_rate: default_baud_rate(),
            read_timeout: default_read_timeout(),
            replay_path: None,
            replay_raw: false,
            replay_follow: false,
            max_line_length: default_max_line_length(),
            retry_backoff: default_retry_backoff(),
        }
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Write accepted readings to the CSV log
    #[serde(default)]
    pub enabled: bool,
    /// CSV log location (truncated at startup)
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    /// fsync after every row
    #[serde(default)]
    pub sync_each_row: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_storage_path(),
            sync_each_row: false,
        }
    }
}

/// Presentation pull configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardConfig {
    /// How often a snapshot is taken
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,
    /// Latest reading older than this is reported as stale
    #[serde(default = "default_stale_after", with = "humantime_serde")]
    pub stale_after: Duration,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
            stale_after: default_stale_after(),
        }
    }
}

// Default value functions
fn default_name() -> String {
    "oxi_daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_capacity() -> usize {
    crate::data::DEFAULT_CAPACITY
}

fn default_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    crate::instrument::serial::DEFAULT_BAUD_RATE
}

fn default_read_timeout() -> Duration {
    crate::instrument::serial::DEFAULT_READ_TIMEOUT
}

fn default_max_line_length() -> usize {
    crate::instrument::serial::DEFAULT_MAX_LINE_LENGTH
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("data.csv")
}

fn default_refresh_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_stale_after() -> Duration {
    Duration::from_secs(5)
}

impl Settings {
    /// Load from `config/oxi_daq.toml` (if present) and environment variables.
    ///
    /// Environment variables override the file, e.g.
    /// `OXI_DAQ_HISTORY__CAPACITY=250` or `OXI_DAQ_SOURCE__KIND=serial`.
    pub fn load() -> AppResult<Self> {
        Self::figment(Some(Path::new(DEFAULT_CONFIG_PATH)))
            .extract()
            .map_err(DaqError::from)
    }

    /// Load from a specific file, which must exist.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(DaqError::Configuration(format!(
                "Config file '{}' not found",
                path.display()
            )));
        }
        Self::figment(Some(path)).extract().map_err(DaqError::from)
    }

    /// Parse TOML text layered over the defaults (no environment).
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::string(toml))
            .extract()
            .map_err(DaqError::from)
    }

    fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |field: &str, msg: &str| {
            DaqError::Configuration(format!("{}: {}", field, msg))
        };

        validation::is_valid_log_level(&self.application.log_level)
            .map_err(|m| invalid("application.log_level", m))?;

        validation::is_in_range(self.history.capacity, 1..=1_000_000)
            .map_err(|m| invalid("history.capacity", m))?;

        validation::is_ordered_bounds(self.bounds.heart_rate_min, self.bounds.heart_rate_max)
            .map_err(|m| invalid("bounds.heart_rate", m))?;
        validation::is_ordered_bounds(self.bounds.spo2_min, self.bounds.spo2_max)
            .map_err(|m| invalid("bounds.spo2", m))?;

        validation::is_positive_duration(self.source.retry_backoff)
            .map_err(|m| invalid("source.retry_backoff", m))?;
        validation::is_in_range(self.source.max_line_length, 64..=1_048_576)
            .map_err(|m| invalid("source.max_line_length", m))?;

        match self.source.kind {
            SourceKind::Simulated => {
                validation::is_positive_duration(self.source.interval)
                    .map_err(|m| invalid("source.interval", m))?;
            }
            SourceKind::Serial => {
                validation::is_not_empty(&self.source.port)
                    .map_err(|m| invalid("source.port", m))?;
                validation::is_in_range(self.source.baud_rate, 300..=4_000_000)
                    .map_err(|m| invalid("source.baud_rate", m))?;
                validation::is_positive_duration(self.source.read_timeout)
                    .map_err(|m| invalid("source.read_timeout", m))?;
            }
            SourceKind::Replay => {
                let path = self
                    .source
                    .replay_path
                    .as_ref()
                    .ok_or_else(|| invalid("source.replay_path", "required for replay"))?;
                validation::is_valid_path(&path.to_string_lossy())
                    .map_err(|m| invalid("source.replay_path", m))?;
            }
        }

        if self.storage.enabled {
            validation::is_valid_path(&self.storage.path.to_string_lossy())
                .map_err(|m| invalid("storage.path", m))?;
        }

        validation::is_positive_duration(self.dashboard.refresh_interval)
            .map_err(|m| invalid("dashboard.refresh_interval", m))?;
        validation::is_positive_duration(self.dashboard.stale_after)
            .map_err(|m| invalid("dashboard.stale_after", m))?;

        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| DaqError::Configuration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.history.capacity, 100);
        assert_eq!(settings.source.kind, SourceKind::Simulated);
        assert_eq!(settings.source.baud_rate, 115_200);
        assert_eq!(settings.dashboard.refresh_interval, Duration::from_millis(1000));
        assert!(!settings.storage.enabled);
    }

    #[test]
    fn toml_overrides_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [history]
            capacity = 20

            [source]
            kind = "serial"
            port = "/dev/rfcomm0"
            read_timeout = "250ms"

            [bounds]
            heart_rate_max = 220.0
            "#,
        )
        .unwrap();

        assert_eq!(settings.history.capacity, 20);
        assert_eq!(settings.source.kind, SourceKind::Serial);
        assert_eq!(settings.source.port, "/dev/rfcomm0");
        assert_eq!(settings.source.read_timeout, Duration::from_millis(250));
        assert_eq!(settings.bounds.heart_rate_max, 220.0);
        assert_eq!(settings.bounds.spo2_max, 100.0);
        assert_eq!(settings.source.baud_rate, 115_200);
    }

    #[test]
    fn invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        assert!(matches!(settings.validate(), Err(DaqError::Configuration(_))));
    }

    #[test]
    fn zero_capacity_rejected() {
        let mut settings = Settings::default();
        settings.history.capacity = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn inverted_bounds_rejected() {
        let mut settings = Settings::default();
        settings.bounds.spo2_min = 100.0;
        settings.bounds.spo2_max = 90.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn replay_requires_path() {
        let mut settings = Settings::default();
        settings.source.kind = SourceKind::Replay;
        assert!(settings.validate().is_err());
        settings.source.replay_path = Some(PathBuf::from("data.csv"));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn follow_and_line_limit_from_toml() {
        let settings = Settings::from_toml_str(
            r#"
            [source]
            kind = "replay"
            replay_path = "data.csv"
            replay_follow = true
            max_line_length = 1024
            "#,
        )
        .unwrap();
        assert!(settings.source.replay_follow);
        assert_eq!(settings.source.max_line_length, 1024);
        assert!(settings.validate().is_ok());

        let mut tiny = settings;
        tiny.source.max_line_length = 8;
        assert!(tiny.validate().is_err());
    }

    #[test]
    fn serial_requires_port() {
        let mut settings = Settings::default();
        settings.source.kind = SourceKind::Serial;
        settings.source.port = String::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn toml_round_trip() {
        let mut settings = Settings::default();
        settings.source.seed = Some(9);
        settings.storage.enabled = true;
        let text = settings.to_toml().unwrap();
        assert!(text.contains("[history]"));
        assert_eq!(Settings::from_toml_str(&text).unwrap(), settings);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        assert!(matches!(
            Settings::load_from("/nonexistent/oxi_daq.toml"),
            Err(DaqError::Configuration(_))
        ));
    }
}
