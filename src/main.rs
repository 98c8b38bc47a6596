//! CLI Entry Point for force-stage
//!
//! One subcommand per device operation, plus the calibration procedures.
//!
//! # Usage
//!
//! ```bash
//! force-stage --port /dev/ttyACM0 move 20
//! force-stage stream 50 100
//! force-stage --simulate calibrate 2.0
//! ```
//!
//! Talking to real hardware needs the `instrument_serial` feature; `--simulate` runs
//! against an in-process simulated instrument.

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use force_stage::logging::{self, OutputFormat, TracingConfig};
use force_stage::{sim, DriverConfig, DriverError, ForceStage, PartialPolicy};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "force-stage", version)]
#[command(about = "Drive a load-cell / stepper force stage over serial", long_about = None)]
struct Cli {
    /// Configuration file (defaults to force_stage.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Serial port, overrides the configuration
    #[arg(long, global = true)]
    port: Option<String>,

    /// Use a simulated instrument instead of a serial port
    #[arg(long, global = true)]
    simulate: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Log level (trace, debug, info, warn, error); overrides -v
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Move the stage to an absolute position (mm)
    Move { position: i64 },
    /// Print the current position (mm)
    Position,
    /// Print the velocity, or set it when a value is given (mm/s)
    Velocity { value: Option<i64> },
    /// Start the homing sequence
    Home,
    /// Emergency stop
    Stop,
    /// Tare the device display
    Tare,
    /// Read calibrated force
    Read {
        /// Readings discarded first
        #[arg(long, default_value_t = 0)]
        skips: usize,
        /// Readings averaged
        #[arg(long, default_value_t = 1)]
        samples: usize,
    },
    /// Continuous read: COUNT samples every INTERVAL ms
    Stream {
        count: u32,
        interval: u32,
        /// Print samples received before a failure
        #[arg(long)]
        keep_partial: bool,
    },
    /// Re-zero with no load applied
    Gauge {
        #[arg(long)]
        samples: Option<usize>,
        #[arg(long)]
        skips: Option<usize>,
    },
    /// Derive the scale factor from a known applied FORCE
    Calibrate {
        force: f64,
        #[arg(long, default_value_t = 10)]
        samples: usize,
    },
    /// Switch the device display flag
    Display {
        #[arg(action = ArgAction::Set)]
        enabled: bool,
    },
    /// Print the firmware version
    Version,
    /// Print the device identification
    Id,
    /// Print the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let format = if cli.json_logs {
        OutputFormat::Json
    } else {
        OutputFormat::Compact
    };
    let tracing_config = match &cli.log_level {
        Some(level) => TracingConfig::new(logging::parse_log_level(level)?),
        None => TracingConfig::from_verbosity(cli.verbose),
    };
    logging::init(tracing_config.with_format(format))?;

    let mut config = match &cli.config {
        Some(path) => DriverConfig::load_from(path),
        None => DriverConfig::load(),
    }
    .context("Failed to load configuration")?;
    if let Some(port) = &cli.port {
        config.port = port.clone();
    }

    if let Commands::ShowConfig = cli.command {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let stage = connect(&config, cli.simulate).await?;
    run(&stage, &config, cli.command).await
}

async fn connect(config: &DriverConfig, simulate: bool) -> Result<ForceStage> {
    if !simulate {
        return open_hardware(config).await;
    }
    let (port, _sim, _task) = sim::spawn(config);
    Ok(ForceStage::new(port, config)?)
}

#[cfg(feature = "instrument_serial")]
async fn open_hardware(config: &DriverConfig) -> Result<ForceStage> {
    ForceStage::open(config)
        .await
        .with_context(|| format!("Failed to open force stage on {}", config.port))
}

#[cfg(not(feature = "instrument_serial"))]
async fn open_hardware(_config: &DriverConfig) -> Result<ForceStage> {
    bail!("built without serial support; rebuild with --features instrument_serial or pass --simulate")
}

async fn run(stage: &ForceStage, config: &DriverConfig, command: Commands) -> Result<()> {
    match command {
        Commands::Move { position } => stage.set_position(position).await?,
        Commands::Position => println!("{}", stage.get_position().await?),
        Commands::Velocity { value: Some(v) } => stage.set_velocity(v).await?,
        Commands::Velocity { value: None } => println!("{}", stage.get_velocity().await?),
        Commands::Home => stage.home().await?,
        Commands::Stop => stage.stop().await?,
        Commands::Tare => stage.tare().await?,
        Commands::Read { skips, samples } => {
            let force = stage.read_force_averaged(skips, samples).await?;
            println!("{}", force);
        }
        Commands::Stream {
            count,
            interval,
            keep_partial,
        } => {
            let policy = if keep_partial {
                PartialPolicy::Keep
            } else {
                PartialPolicy::Discard
            };
            match stage.stream_with(count, interval, policy).await {
                Ok(readings) => {
                    for r in readings {
                        println!("{}\t{}", r.timestamp_millis(), r.force);
                    }
                }
                Err(DriverError::StreamInterrupted { source, partial }) => {
                    for r in &partial {
                        println!("{}\t{}", r.timestamp_millis(), r.force);
                    }
                    bail!("stream interrupted after {} samples: {}", partial.len(), source);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Gauge { samples, skips } => {
            let samples = samples.unwrap_or(config.gauge_samples);
            let skips = skips.unwrap_or(config.gauge_skips);
            let gauge = stage.re_gauge(samples, skips).await?;
            println!("gauge_value = {}", gauge);
        }
        Commands::Calibrate { force, samples } => {
            let upc = stage.calibrate_scale(force, samples).await?;
            println!("units_per_count = {}", upc);
        }
        Commands::Display { enabled } => stage.set_display(enabled).await?,
        Commands::Version => println!("{}", stage.version().await?),
        Commands::Id => println!("{}", stage.id().await?),
        Commands::ShowConfig => print!("{}", toml::to_string_pretty(config)?),
    }
    Ok(())
}
