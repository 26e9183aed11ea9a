//! Command-line interface for Sextant.
//!
//! - `sextant check` loads and validates a configuration and prints what the
//!   driver would be built from.
//! - `sextant simulate` runs the driver against the static sky, observing
//!   every target it issues.
//!
//! The configuration defaults to `~/.sextant/config.toml`; `--config`
//! overrides it.

mod format;
mod simulate;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::driver::Driver;
use crate::logbook::Logbook;
use crate::sky::StaticSky;

use format::{format_degrees, format_summary, format_topology};

/// Sextant: schedule a telescope survey.
#[derive(Debug, Parser)]
#[command(name = "sextant", version)]
pub struct Cli {
    /// Configuration file. Defaults to `~/.sextant/config.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Validate the configuration and print the survey layout.
    Check,

    /// Run the scheduler against the static sky.
    ///
    /// Every issued target is observed as soon as it is issued. Filter swaps
    /// requested by the driver are carried out during the day.
    Simulate {
        /// Nights to simulate.
        #[arg(long, default_value_t = 1)]
        nights: u32,

        /// Seconds to wait when there is nothing to observe.
        #[arg(long, default_value_t = 60.0)]
        step: f64,

        /// Append targets, observations and night boundaries to this JSONL file.
        #[arg(long)]
        logbook: Option<PathBuf>,
    },
}

/// Parses the command line and runs the chosen command.
pub fn run() -> Result<(), String> {
    let cli = Cli::parse();
    let path = match cli.config {
        Some(path) => path,
        None => Config::default_path().map_err(|e| e.to_string())?,
    };
    let config = Config::load(&path).map_err(|e| e.to_string())?;

    match cli.command {
        Command::Check => cmd_check(&config, &path),
        Command::Simulate {
            nights,
            step,
            logbook,
        } => cmd_simulate(&config, nights, step, logbook),
    }
}

fn build_driver(config: &Config) -> Result<Driver, String> {
    let catalog = config.load_catalog().map_err(|e| e.to_string())?;
    let sky = StaticSky::new(config.sky.clone(), &catalog);
    Driver::new(config, catalog, Box::new(sky)).map_err(|e| e.to_string())
}

fn cmd_check(config: &Config, path: &Path) -> Result<(), String> {
    let catalog_size = config.load_catalog().map_err(|e| e.to_string())?.len();
    let driver = build_driver(config)?;

    println!("Config: {}", path.display());
    println!("Fields: {catalog_size}");
    print!("{}", format_topology(&driver.survey_topology()));

    let park = driver.observatory().state();
    println!(
        "Park: alt {} az {} filter {} (mounted: {})",
        format_degrees(park.tel_alt_rad),
        format_degrees(park.tel_az_rad),
        park.filter,
        park.mounted_filters.join(" ")
    );

    if let Some(curve) = config.driver.cost_curve() {
        let samples: Vec<String> = [2.0, 5.0, 30.0, 60.0, 150.0]
            .iter()
            .map(|&t| format!("{t:.0}s={:.3}", curve.cost(t)))
            .collect();
        println!("Slew cost: {}", samples.join(" "));
    }
    Ok(())
}

fn cmd_simulate(
    config: &Config,
    nights: u32,
    step: f64,
    logbook: Option<PathBuf>,
) -> Result<(), String> {
    if !(step.is_finite() && step > 0.0) {
        return Err(format!("step must be a positive number of seconds, got {step}"));
    }
    let logbook = logbook
        .map(Logbook::new)
        .transpose()
        .map_err(|e| e.to_string())?;
    let mut driver = build_driver(config)?;

    let summary = simulate::run(
        &mut driver,
        config.survey.start_time(),
        nights,
        step,
        logbook.as_ref(),
    )
    .map_err(|e| e.to_string())?;

    print!("{}", format_summary(&summary, driver.proposals()));
    if let Some(logbook) = &logbook {
        eprintln!("Logbook written to {}", logbook.path().display());
    }
    Ok(())
}
