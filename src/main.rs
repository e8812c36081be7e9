//! CLI entry point for instrument-core
//!
//! Provides:
//! - `config`: print the effective settings (defaults, file, `INSTR_` env) as TOML or JSON
//! - `demo`: a simulated sweep over two triggered instruments
//!
//! # Usage
//!
//! ```bash
//! instrument-core config --config settings.toml
//! instrument-core config --json
//! instrument-core demo --points 5 --delay 0.01
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use instrument_core::async_api;
use instrument_core::config::Settings;
use instrument_core::device::{write_row, DeviceBuilder, OptionValues, ScpiBackend};
use instrument_core::instrument::{Instrument, ScriptedHooks};
use instrument_core::limits::Limits;
use instrument_core::logging;
use instrument_core::transport::MockTransport;
use instrument_core::value::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "instrument-core")]
#[command(about = "Laboratory instrument control core", long_about = None)]
struct Cli {
    /// Settings file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective settings
    Config {
        /// JSON instead of TOML
        #[arg(long)]
        json: bool,
    },

    /// Run a simulated triggered sweep and print tab-separated rows
    Demo {
        /// Number of sweep points
        #[arg(long, default_value = "5")]
        points: usize,

        /// Pre-trigger delay of the meter, in seconds
        #[arg(long, default_value = "0.0")]
        delay: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => Settings::load_from(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => Settings::load().context("Failed to load settings")?,
    };
    logging::init(&settings.application.log_level)?;

    match cli.command {
        Commands::Config { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&settings)?);
            } else {
                print!("{}", settings.to_toml()?);
            }
            Ok(())
        }
        Commands::Demo { points, delay } => run_demo(&settings, points, delay).await,
    }
}

async fn run_demo(settings: &Settings, points: usize, delay: f64) -> Result<()> {
    let source_io = Arc::new(MockTransport::new().with_name("SIM::SOURCE"));
    let source = Instrument::builder("source", Arc::clone(&source_io))
        .settings(settings)
        .build()?;
    let level = source.add_device(
        DeviceBuilder::scpi("level", "SOUR:VOLT")
            .limits(Limits::range(-10.0, 10.0))
            .doc("Output voltage"),
    )?;

    let meter_io = Arc::new(MockTransport::new().with_name("SIM::METER"));
    let meter_hooks = {
        let level = Arc::clone(&level);
        let io = Arc::clone(&meter_io);
        Arc::new(ScriptedHooks::new().with_polls(2).on_trigger(move |_| {
            let v = level.getcache()?.and_then(|v| v.as_f64()).unwrap_or_default();
            io.set_reply("FETCH?", format!("{:?}", v * 0.98 + 0.001));
            Ok(())
        }))
    };
    let meter = Instrument::builder("meter", Arc::clone(&meter_io))
        .shared_lock("sim", &settings.lock.shared_dir())?
        .settings(settings)
        .hooks(meter_hooks)
        .build()?;
    meter.device("async_delay")?.set(delay)?;
    let reading = meter.add_device(
        DeviceBuilder::new("reading")
            .backend(ScpiBackend::query("FETCH?"))
            .trig()
            .doc("Triggered voltage reading"),
    )?;

    let counter_io = Arc::new(MockTransport::new().with_name("SIM::COUNTER"));
    let counter_hooks = {
        let level = Arc::clone(&level);
        let io = Arc::clone(&counter_io);
        Arc::new(ScriptedHooks::new().on_trigger(move |_| {
            let v = level.getcache()?.and_then(|v| v.as_f64()).unwrap_or_default();
            io.set_reply("COUNT?", ((v.abs() * 1000.0).round() as i64).to_string());
            Ok(())
        }))
    };
    let counter = Instrument::builder("counter", Arc::clone(&counter_io))
        .settings(settings)
        .hooks(counter_hooks)
        .build()?;
    let counts = counter.add_device(
        DeviceBuilder::new("counts")
            .backend(ScpiBackend::query("COUNT?"))
            .codec(Arc::new(instrument_core::codec::IntCodec))
            .trig(),
    )?;

    level.set(0.0)?;
    let format = reading.getformat(&OptionValues::new())?;
    for line in format.header_lines(&reading)? {
        println!("#{line}");
    }
    println!(
        "#{}\t{}\t{}",
        level.full_name(),
        reading.full_name(),
        counts.full_name()
    );

    let mut out = std::io::stdout();
    let step = if points > 1 { 2.0 / (points - 1) as f64 } else { 0.0 };
    for i in 0..points {
        let v = -1.0 + step * i as f64;
        level.set(v)?;
        let values = async_api::read_all(vec![
            (Arc::clone(&reading), OptionValues::new()),
            (Arc::clone(&counts), OptionValues::new()),
        ])
        .await?;
        let mut row = vec![Value::Float(v)];
        row.extend(values);
        write_row(&mut out, &row)?;
    }
    info!(points, "Sweep complete");
    Ok(())
}
