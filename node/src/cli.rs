//! # CLI Interface
//!
//! Defines the command-line argument structure for `sluice-node` using
//! `clap` derive. Supports three subcommands: `run`, `init`, and
//! `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// SLUICE payment-orchestration daemon.
///
/// Opens the durable store and runs the reconciliation worker: event
/// subscriptions, the durable job queue, and the periodic sweep that
/// drives every pending pay-in and invoice forward to a terminal state.
#[derive(Parser, Debug)]
#[command(
    name = "sluice-node",
    about = "SLUICE payment-orchestration daemon",
    version,
    propagate_version = true
)]
pub struct SluiceNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the sluice-node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the daemon.
    Run(RunArgs),
    /// Initialize a new data directory.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the data directory where the store lives.
    ///
    /// Created on first run if it does not exist.
    #[arg(long, short = 'd', env = "SLUICE_DATA_DIR", default_value = ".sluice")]
    pub data_dir: PathBuf,

    /// Log output format: "pretty" or "json".
    #[arg(long, env = "SLUICE_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,

    /// Default log level when RUST_LOG is not set.
    #[arg(long, env = "SLUICE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Seconds between full reconciliation sweeps.
    #[arg(long, env = "SLUICE_SWEEP_INTERVAL", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Run against the in-memory mock payment network instead of a real
    /// backend. Useful for development; pointless in production.
    #[arg(long, default_value_t = false)]
    pub mock_network: bool,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Path to the data directory to initialize.
    #[arg(long, short = 'd', env = "SLUICE_DATA_DIR", default_value = ".sluice")]
    pub data_dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        // Ensures the derive macros produce a valid CLI definition.
        SluiceNodeCli::command().debug_assert();
    }
}
