//! AutoPatterning workstation command-line driver.
//!
//! - `run`: start the probe and stream timers and log telemetry until Ctrl-C
//! - `probe`: probe the stage controller until it answers
//! - `position`: print one position sample
//! - `flip on|off`: engage or disengage the laser flip mount

use anyhow::{Context, Result};
use autopattern_daq::config::{HardwareMode, Settings, DEFAULT_CONFIG_PATH};
use autopattern_daq::stage::ConnectionState;
use autopattern_daq::workstation::{HardwareSet, Workstation};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// AutoPatterning stage telemetry and laser control
#[derive(Parser, Debug)]
#[command(name = "autopattern")]
#[command(version)]
struct Args {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use simulated devices regardless of the configured mode
    #[arg(long, global = true)]
    mock: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the stage and stream telemetry until interrupted
    Run,

    /// Probe the stage controller and print its identity
    Probe {
        /// Give up after this many probes
        #[arg(short, long, default_value = "5")]
        attempts: u32,
    },

    /// Print the current stage position
    Position,

    /// Drive the laser flip mount
    Flip {
        /// Desired laser state
        #[arg(value_enum)]
        state: LaserState,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LaserState {
    /// Engage the flip mount
    On,
    /// Disengage the flip mount
    Off,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = Settings::load_from(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if args.mock {
        settings.application.mode = HardwareMode::Mock;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let hardware = HardwareSet::from_settings(&settings)?;
    let station = Workstation::init(settings, hardware).await?;

    let outcome = match args.command {
        Command::Run => run(&station).await,
        Command::Probe { attempts } => probe(&station, attempts).await,
        Command::Position => position(&station).await,
        Command::Flip { state } => flip(&station, state).await,
    };

    station.shutdown().await;
    outcome
}

async fn run(station: &Workstation) -> Result<()> {
    station.start_polling().await;
    let mut telemetry = station.subscribe_telemetry();
    let mut state = station.subscribe_state();

    loop {
        tokio::select! {
            changed = telemetry.changed() => {
                if changed.is_err() {
                    break;
                }
                let sample = *telemetry.borrow_and_update();
                info!(
                    "x = {:.4} mm, y = {:.4} mm, z = {:.4} mm (t = {:.3})",
                    sample.x, sample.y, sample.z, sample.timestamp_seconds
                );
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                info!("Stage connection: {:?}", current);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }
    Ok(())
}

async fn probe(station: &Workstation, attempts: u32) -> Result<()> {
    for attempt in 1..=attempts {
        if station.probe_tick().await == ConnectionState::Established {
            let details = station.details().await;
            println!(
                "{} on {}",
                details.identity.unwrap_or_default(),
                details.endpoint
            );
            return Ok(());
        }
        warn!("Probe {}/{}: no answer", attempt, attempts);
        if attempt < attempts {
            tokio::time::sleep(station.polling_policy().probe_fast).await;
        }
    }
    anyhow::bail!("Stage controller did not answer after {} probes", attempts)
}

async fn position(station: &Workstation) -> Result<()> {
    station.probe_tick().await;
    let sample = station.stream_tick().await;
    println!(
        "x = {:.4} mm\ny = {:.4} mm\nz = {:.4} mm\nt = {:.3}",
        sample.x, sample.y, sample.z, sample.timestamp_seconds
    );
    Ok(())
}

async fn flip(station: &Workstation, state: LaserState) -> Result<()> {
    let desired = matches!(state, LaserState::On);
    let confirmation = station.toggle_actuator(desired).await?;
    println!("{}", confirmation);
    Ok(())
}
