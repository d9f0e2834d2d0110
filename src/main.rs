//! CLI Entry Point for oxi_daq
//!
//! Runs the oximeter ingestion pipeline against one of its line sources and prints a
//! dashboard frame on every refresh:
//! - `simulate`: synthetic readings
//! - `serial`: a live device on a serial / Bluetooth SPP port
//! - `replay`: a previously recorded CSV log or raw transcript
//! - `stdin`: device-format lines piped into the process
//! - `config`: print the effective configuration
//!
//! # Usage
//!
//! ```bash
//! oxi_daq simulate --interval 500ms --seed 7
//! oxi_daq --log-csv data.csv serial --port /dev/rfcomm0
//! oxi_daq --json replay data.csv
//! oxi_daq replay --follow data.csv
//! ```
//!
//! Ctrl-C stops ingestion cleanly and prints the ingest statistics.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use oxi_daq::config::{Settings, SourceKind};
use oxi_daq::dashboard::{DashboardFeed, DashboardFrame};
use oxi_daq::data::CsvSink;
use oxi_daq::ingest::{IngestConfig, IngestionLoop, LoopExit};
use oxi_daq::instrument::{open_source, LineSource, SerialSource};
use oxi_daq::logging;
use oxi_daq::measurement::RecordParser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "oxi_daq")]
#[command(about = "Pulse-oximeter ingestion pipeline", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/oxi_daq.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also append accepted readings to this CSV log
    #[arg(long, global = true)]
    log_csv: Option<PathBuf>,

    /// Print dashboard frames as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate synthetic readings
    Simulate {
        /// Time between readings (e.g. 1s, 250ms)
        #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
        interval: Option<Duration>,

        /// Seed for reproducible values
        #[arg(long)]
        seed: Option<u64>,

        /// Stop after this many readings
        #[arg(long)]
        count: Option<u64>,
    },

    /// Read a live device
    Serial {
        /// Serial port (e.g. /dev/ttyUSB0, /dev/rfcomm0, COM3)
        #[arg(long)]
        port: Option<String>,

        /// Baud rate
        #[arg(long)]
        baud: Option<u32>,
    },

    /// Replay a recorded session
    Replay {
        /// CSV log written with --log-csv, or a raw transcript with --raw
        path: PathBuf,

        /// Treat the file as raw device output, one line per reading
        #[arg(long)]
        raw: bool,

        /// Keep reading lines that another process appends to the file
        #[arg(long)]
        follow: bool,
    },

    /// Read device-format lines from standard input
    Stdin,

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .context("Failed to load configuration")?;
    apply_cli(&mut settings, &cli);
    settings.validate().context("Invalid configuration")?;

    if let Commands::Config = cli.command {
        print!("{}", settings.to_toml()?);
        return Ok(());
    }

    logging::init_from_settings(&settings).map_err(anyhow::Error::msg)?;

    let source: Box<dyn LineSource> = match cli.command {
        Commands::Stdin => Box::new(
            SerialSource::new("stdin", tokio::io::stdin(), settings.source.read_timeout)
                .with_max_line_length(settings.source.max_line_length),
        ),
        _ => open_source(&settings.source)
            .await
            .with_context(|| format!("Failed to open {:?} source", settings.source.kind))?,
    };

    run(settings, source, cli.json).await
}

/// Fold command-line choices into the loaded settings.
fn apply_cli(settings: &mut Settings, cli: &Cli) {
    if let Some(path) = &cli.log_csv {
        settings.storage.enabled = true;
        settings.storage.path = path.clone();
    }

    match &cli.command {
        Commands::Simulate {
            interval,
            seed,
            count,
        } => {
            settings.source.kind = SourceKind::Simulated;
            if let Some(interval) = interval {
                settings.source.interval = *interval;
            }
            settings.source.seed = seed.or(settings.source.seed);
            settings.source.limit = count.or(settings.source.limit);
        }
        Commands::Serial { port, baud } => {
            settings.source.kind = SourceKind::Serial;
            if let Some(port) = port {
                settings.source.port = port.clone();
            }
            if let Some(baud) = baud {
                settings.source.baud_rate = *baud;
            }
        }
        Commands::Replay { path, raw, follow } => {
            settings.source.kind = SourceKind::Replay;
            settings.source.replay_path = Some(path.clone());
            settings.source.replay_raw = *raw;
            settings.source.replay_follow = *follow;
        }
        Commands::Stdin | Commands::Config => {}
    }
}

async fn run(settings: Settings, source: Box<dyn LineSource>, json: bool) -> Result<()> {
    let parser = RecordParser::new(settings.bounds);
    let mut ingest = IngestionLoop::new(source, parser, IngestConfig::from_settings(&settings));
    if settings.storage.enabled {
        let sink = CsvSink::create(&settings.storage.path, settings.storage.sync_each_row)
            .with_context(|| {
                format!("Failed to create log {}", settings.storage.path.display())
            })?;
        ingest = ingest.with_sink(Box::new(sink));
    }

    ingest.start().await?;
    let mut feed = DashboardFeed::spawn(ingest.history(), &settings.dashboard);
    let mut frames = feed.subscribe();
    tracing::info!(
        source = ?settings.source.kind,
        storage = settings.storage.enabled,
        "Ingestion running - press Ctrl+C to stop"
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let exit = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Ctrl-C received, stopping");
                break ingest.stop().await?;
            }
            changed = frames.changed() => {
                if changed.is_err() {
                    break ingest.stop().await?;
                }
                let frame = frames.borrow_and_update().clone();
                render(&frame, json)?;
                if ingest.is_finished().await {
                    break ingest.join().await?;
                }
            }
        }
    };

    feed.stop().await;
    let stats = ingest.stats().snapshot();
    if json {
        println!(
            "{}",
            serde_json::json!({ "exit": exit, "stats": stats })
        );
    } else {
        println!();
        println!("Ingestion ended: {}", exit);
        println!(
            "  lines: {}  accepted: {}  rejected: {} (malformed {}, out of range {}, decode {})",
            stats.lines,
            stats.accepted,
            stats.rejected(),
            stats.malformed,
            stats.out_of_range,
            stats.decode_errors
        );
        println!(
            "  transport errors: {}  persistence errors: {}  faults: {}",
            stats.transport_errors, stats.persistence_errors, stats.faults
        );
    }

    match exit {
        LoopExit::Disconnected(msg) => Err(anyhow::anyhow!("Source disconnected: {}", msg)),
        LoopExit::Stopped | LoopExit::Exhausted => Ok(()),
    }
}

fn render(frame: &DashboardFrame, json: bool) -> Result<()> {
    if json {
        println!("{}", frame.to_json()?);
    } else if frame.stale {
        tracing::info!(
            spo2 = %frame.spo2_label,
            heart_rate = %frame.heart_rate_label,
            readings = frame.points.len(),
            "No recent data"
        );
    } else {
        tracing::info!(
            spo2 = %frame.spo2_label,
            heart_rate = %frame.heart_rate_label,
            readings = frame.points.len(),
            "Current values"
        );
    }
    Ok(())
}
