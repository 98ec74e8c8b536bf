// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # SLUICE Daemon
//!
//! Entry point for the `sluice-node` binary. Parses CLI arguments,
//! initializes logging, opens the durable store, and runs the
//! reconciliation worker until interrupted.
//!
//! The binary supports three subcommands:
//!
//! - `run`     — open the store and run the reconciliation worker
//! - `init`    — initialize the data directory
//! - `version` — print build version information
//!
//! The engine's paid-action registry and wallet directory are wired by
//! the embedding application; this daemon runs with an empty registry
//! and exists to drive already-persisted pay-ins and forwards to their
//! terminal states. With `--mock-network` it runs against the in-memory
//! mock node, which is handy for poking at the store locally.

mod cli;
mod logging;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use sluice_engine::action::ActionRegistry;
use sluice_engine::config::EngineConfig;
use sluice_engine::lightning::mock::MockNode;
use sluice_engine::store::Store;
use sluice_engine::wallet::StaticWalletDirectory;
use sluice_engine::worker::ReconcileWorker;
use sluice_engine::Deps;

use cli::{Commands, InitArgs, RunArgs, SluiceNodeCli};
use logging::{init_logging, LogFormat};

fn main() -> Result<()> {
    let cli = SluiceNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run(args),
        Commands::Init(args) => init(args),
        Commands::Version => {
            println!("sluice-node {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn run(args: RunArgs) -> Result<()> {
    init_logging(&args.log_level, LogFormat::from_str_lossy(&args.log_format));

    if !args.mock_network {
        anyhow::bail!(
            "no payment-network backend configured; run with --mock-network \
             or embed the engine with a real LightningNode implementation"
        );
    }

    let store = Store::open(args.data_dir.join("db"))
        .with_context(|| format!("opening store under {}", args.data_dir.display()))?;

    let mut config = EngineConfig::default();
    config.sweep_interval = std::time::Duration::from_secs(args.sweep_interval_secs);

    let deps = Deps::new(
        Arc::new(store),
        Arc::new(MockNode::new()),
        Arc::new(ActionRegistry::new()),
        Arc::new(StaticWalletDirectory::new()),
        config,
    );

    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    runtime.block_on(async move {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(ReconcileWorker::new(deps).run(shutdown_rx));

        signal::ctrl_c().await.context("waiting for ctrl-c")?;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);

        worker.await.context("joining worker")?;
        Ok::<_, anyhow::Error>(())
    })?;

    info!("sluice-node stopped cleanly");
    Ok(())
}

fn init(args: InitArgs) -> Result<()> {
    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("creating {}", args.data_dir.display()))?;
    // Opening once creates the store files.
    Store::open(args.data_dir.join("db")).context("initializing store")?;
    println!("initialized data directory at {}", args.data_dir.display());
    Ok(())
}
