//! # teardown - deferred deletion daemon
//!
//! ## Startup Sequence
//!
//! 1. **Tracing** - `RUST_LOG` filter, `info` by default
//! 2. **Configuration** - `teardown.toml` (or `--config`), defaults when absent
//! 3. **Queue** - JSON state file opened and kept in sync on every change
//! 4. **Providers** - one command adapter per `[[providers]]` entry
//! 5. **Command** - `run`, `tick`, `enqueue`, `report` or `purge`
//!
//! ## Shutdown
//!
//! `run` stops on Ctrl+C once the current tick has committed.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use teardown::cli::Cli;
use teardown::commands::execute_command;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    execute_command(cli).await
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
