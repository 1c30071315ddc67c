//! CLI command definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// teardown - deferred deletion daemon
#[derive(Parser, Debug)]
#[command(name = "teardown")]
#[command(version)]
#[command(about = "Drives queued virtual desktops through stop, delete and confirm")]
#[command(
    long_about = "teardown keeps a durable queue of machines awaiting deletion and reconciles each one against its hypervisor until it is confirmed gone or marked failed."
)]
pub struct Cli {
    /// Daemon configuration file
    #[arg(short, long, default_value = "teardown.toml")]
    pub config: PathBuf,

    /// Queue state file (overrides `state_file` from the configuration)
    #[arg(short, long)]
    pub state: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Reconcile the queue periodically until Ctrl+C
    Run {
        /// Stop after this many ticks
        #[arg(long)]
        max_ticks: Option<u64>,
    },

    /// Run exactly one reconciliation pass
    Tick,

    /// Queue a resource for deletion
    Enqueue {
        /// Resource identifier on the provider
        #[arg(short, long)]
        id: String,

        /// Registered provider name
        #[arg(short, long)]
        provider: String,
    },

    /// Print queue depth and per-record detail
    Report {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = ReportFormat::Csv)]
        format: ReportFormat,
    },

    /// Remove DELETED and FAILED records from the queue
    Purge,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Csv,
    Json,
}
