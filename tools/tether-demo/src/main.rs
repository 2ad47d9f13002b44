//! Host-side demo of the tether driver model.
//!
//! Every subcommand builds one [`Registry`], drives it through a scenario,
//! and prints what the registry looks like. The registry is torn down on
//! exit, so every bound driver's remove runs before the process ends.

mod button;
mod cli;
mod driver_model;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tether_bus::{BusSnapshot, Registry, RegistryConfig};
use tether_core::log::{LogSink, StderrSink};

fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    let stderr: Arc<dyn LogSink> = Arc::new(StderrSink::new(config.log_level));
    tether_core::log::init(vec![stderr]).context("failed to install logger")?;

    let registry = Registry::builder()
        .config(config)
        .build()
        .context("failed to start registry")?;

    match cli.command {
        cli::Command::DriverModel => driver_model::run(&registry),
        cli::Command::Button(ref args) => button::run(&registry, args.presses),
        cli::Command::Snapshot(ref args) => cmd_snapshot(&registry, args.json),
    }
}

/// Load the registry configuration, or the defaults if no file was given.
fn load_config(path: Option<&Path>) -> Result<RegistryConfig> {
    let Some(path) = path else {
        return Ok(RegistryConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("invalid configuration in {}", path.display()))
}

fn cmd_snapshot(registry: &Registry, json: bool) -> Result<()> {
    driver_model::setup(registry)?;
    button::setup(registry)?;

    let snapshots: Vec<BusSnapshot> = registry
        .list_buses()
        .iter()
        .map(|bus| registry.snapshot(bus))
        .collect();
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
    } else {
        for snapshot in &snapshots {
            println!("{snapshot}\n");
        }
    }
    Ok(())
}
