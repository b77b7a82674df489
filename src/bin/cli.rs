// SPDX-License-Identifier: GPL-3.0-only

//! CLI wrapper around the btrfs-health library for testing and manual runs

use anyhow::Result;
use btrfs_health::{
    collect_error_counts, discover_mounted_volumes, BtrfsCli, CancelToken, LiveIdentity,
    MountTable, ScrubOrchestrator, ScrubStatusStore,
};
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::PathBuf;
use uuid::Uuid;

/// Health inspection and scrub orchestration for mounted BTRFS filesystems
#[derive(Parser)]
#[command(name = "btrfs-health-cli")]
#[command(about = "BTRFS health monitoring CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List mounted volumes and their devices
    Volumes,
    /// Sum cumulative error counters per device
    Errors,
    /// Dump the persisted scrub-status records
    ScrubStatus {
        /// Status directory (defaults to the tool's well-known location)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Run a scrub over the given volumes and wait for completion
    Scrub {
        /// Volume UUIDs to scrub
        #[arg(required = true)]
        uuids: Vec<Uuid>,
        /// Status directory (defaults to the tool's well-known location)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    // Logs to stderr, JSON results to stdout
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Volumes => {
            let tool = BtrfsCli::new()?;
            let volumes = discover_mounted_volumes(&tool)?;
            println!("{}", serde_json::to_string(&volumes)?);
        }
        Commands::Errors => {
            let tool = BtrfsCli::new()?;
            let volumes = discover_mounted_volumes(&tool)?;
            let counts = collect_error_counts(&tool, &volumes)?;
            println!("{}", serde_json::to_string(&counts)?);
        }
        Commands::ScrubStatus { dir } => {
            let store = match dir {
                Some(dir) => ScrubStatusStore::with_dir(dir),
                None => ScrubStatusStore::new(),
            };
            let statuses = store.read_all_statuses()?;
            println!("{}", serde_json::to_string(&statuses)?);
        }
        Commands::Scrub { uuids, dir } => {
            let tool = BtrfsCli::new()?;
            let store = match dir {
                Some(dir) => ScrubStatusStore::with_dir(dir),
                None => ScrubStatusStore::new(),
            };
            let orchestrator = ScrubOrchestrator::new(
                tool.clone(),
                store,
                LiveIdentity::new(tool, MountTable::new()),
            );
            let targets: BTreeSet<Uuid> = uuids.into_iter().collect();
            let snapshot = orchestrator.run(&targets, &CancelToken::new())?;
            println!("{}", serde_json::to_string(&snapshot)?);
        }
    }

    Ok(())
}
