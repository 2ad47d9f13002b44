//! Command-line interface definitions for tether-demo.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tether_core::log::LogLevel;

/// Walk through the tether driver model on the host.
#[derive(Parser)]
#[command(name = "tether-demo", version, about)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Registry configuration file (TOML).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Log level (overrides the configuration file).
    #[arg(long, short = 'l', global = true)]
    pub log_level: Option<LogLevel>,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Register a bus, a device, and a driver, then tear them down.
    DriverModel,
    /// Bind a button driver to an interrupt line and simulate presses.
    Button(ButtonArgs),
    /// Set up every scenario and print the resulting buses.
    Snapshot(SnapshotArgs),
}

/// Arguments for the `button` subcommand.
#[derive(Parser)]
pub struct ButtonArgs {
    /// Number of edges to raise on the button's line.
    #[arg(long, short = 'n', default_value_t = 4)]
    pub presses: u32,
}

/// Arguments for the `snapshot` subcommand.
#[derive(Parser)]
pub struct SnapshotArgs {
    /// Print JSON instead of the sysfs-style tree.
    #[arg(long)]
    pub json: bool,
}
