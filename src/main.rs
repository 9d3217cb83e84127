//! `gefran-pid`: read, set and monitor a Gefran PID controller from the shell.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::providers::Serialized;
use gefran_pid::logging::{self, LogFormat};
use gefran_pid::{DeviceSession, PidConfig, StabilityCriteria};
use tracing::info;

/// Command line access to a Gefran PID temperature controller
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, default_value = "gefran.toml")]
    config: PathBuf,

    /// Serial port, overrides the configuration file
    #[arg(long, global = true)]
    port: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the process value and setpoint
    Read,
    /// Write a new setpoint in °C
    Set {
        /// Setpoint in °C
        value: f64,
    },
    /// Log temperatures in the background for a while
    Monitor {
        /// How long to log, in seconds
        #[arg(long, default_value = "60")]
        duration: u64,
    },
    /// Block until the temperature settles around the setpoint
    WaitStable {
        /// Number of samples that must be within tolerance
        #[arg(long, default_value = "10")]
        n: usize,
        /// Allowed deviation from the setpoint in °C
        #[arg(long, default_value = "1.5")]
        tolerance: f64,
        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
}

fn load_config(cli: &Cli) -> Result<PidConfig> {
    let mut figment = PidConfig::figment(&cli.config);
    if let Some(port) = &cli.port {
        figment = figment.merge(Serialized::default("port", port));
    }
    let config: PidConfig = figment
        .extract()
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = logging::parse_level(&cli.log_level).map_err(anyhow::Error::msg)?;
    logging::init(level, LogFormat::Compact).map_err(anyhow::Error::msg)?;

    let config = load_config(&cli)?;
    let session = DeviceSession::connect_serial(&config)
        .await
        .with_context(|| format!("Failed to connect on {}", config.port))?;

    let outcome = run(&session, &cli.command).await;
    let closed = session.disconnect().await;
    outcome?;
    closed.context("Failed to disconnect cleanly")?;
    Ok(())
}

async fn run(session: &DeviceSession, command: &Command) -> Result<()> {
    match command {
        Command::Read => {
            let pv = session.read_process_value().await?;
            let sp = session.read_setpoint().await?;
            println!("Process value: {pv} °C");
            println!("Setpoint:      {sp} °C");
        }
        Command::Set { value } => {
            session.write_setpoint(*value).await?;
            let sp = session.read_setpoint().await?;
            println!("Setpoint now {sp} °C");
        }
        Command::Monitor { duration } => {
            session.start_polling().await?;
            info!("Logging temperatures for {}s, Ctrl+C to stop early", duration);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(*duration)) => {}
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
            session.stop_polling().await?;

            let samples = session.samples().await;
            println!("Collected {} sample(s)", samples.len());
            if let Some(last) = samples.last() {
                println!(
                    "Last: PV {} °C, SP {} °C at {}",
                    last.process_value,
                    last.setpoint,
                    last.timestamp.format("%H:%M:%S")
                );
            }
            if let Some(paths) = session.log_paths() {
                println!("Temperature log: {}", paths.temperature.display());
            }
        }
        Command::WaitStable {
            n,
            tolerance,
            timeout,
        } => {
            let mut criteria = StabilityCriteria::default()
                .with_samples(*n)
                .with_tolerance(*tolerance);
            if let Some(secs) = timeout {
                criteria = criteria.with_timeout(Duration::from_secs(*secs));
            }
            let stable = session.wait_until_stable(criteria).await?;
            if stable {
                println!("Temperature has stabilized");
            } else {
                println!("Temperature has not stabilized before the timeout");
            }
        }
    }
    Ok(())
}
