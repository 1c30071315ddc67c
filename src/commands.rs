//! CLI command handlers.
//!
//! All commands follow functional patterns:
//! - Zero unwraps, zero panics
//! - anyhow::Result with context on every fallible step

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use teardown_reconciler::{
    DeletionLoop, DeletionWorker, FileRecordStore, LoopConfig, RecordStore, ResourceId,
    TickSummary, TracingRecordStore,
};
use tokio::signal;
use tracing::{error, info, warn};

use crate::cli::{Cli, Commands, ReportFormat};
use crate::settings::DaemonConfig;

/// Execute a CLI command.
///
/// This is the main command dispatcher that routes to the appropriate handler.
///
/// # Errors
///
/// Returns an error if configuration, the state file or the command fails.
pub async fn execute_command(cli: Cli) -> Result<()> {
    let mut settings = DaemonConfig::load_or_default(&cli.config).await?;
    if let Some(state) = cli.state {
        settings.state_file = state;
    }
    let worker = open_worker(&settings).await?;

    match cli.command {
        Commands::Run { max_ticks } => cmd_run(worker, &settings, max_ticks).await,
        Commands::Tick => cmd_tick(&worker).await,
        Commands::Enqueue { id, provider } => cmd_enqueue(&worker, id, provider).await,
        Commands::Report { format } => cmd_report(&worker, format).await,
        Commands::Purge => cmd_purge(&worker).await,
    }
}

/// Build a worker over the persisted queue and the configured providers.
///
/// # Errors
///
/// Returns an error if the state file cannot be opened or the worker
/// configuration is invalid.
pub async fn open_worker(settings: &DaemonConfig) -> Result<DeletionWorker> {
    let store = FileRecordStore::open(&settings.state_file)
        .await
        .with_context(|| {
            format!(
                "Failed to open queue state {}",
                settings.state_file.display()
            )
        })?;
    let store: Arc<dyn RecordStore> = Arc::new(TracingRecordStore::new(store));

    let providers = settings.registry();
    if providers.is_empty() {
        warn!("No providers configured; queued records will fail as unknown");
    }

    DeletionWorker::builder()
        .with_store(store)
        .with_providers(providers)
        .with_config(settings.deletion.clone())
        .build()
        .context("Failed to build deletion worker")
}

/// Reconcile until Ctrl+C or `max_ticks`.
async fn cmd_run(
    worker: DeletionWorker,
    settings: &DaemonConfig,
    max_ticks: Option<u64>,
) -> Result<()> {
    let config = LoopConfig::from_deletion(&settings.deletion);
    let config = match max_ticks {
        Some(max) => config.with_max_ticks(max),
        None => config,
    };

    info!(
        owner = %worker.owner(),
        state_file = %settings.state_file.display(),
        interval = ?config.interval,
        "teardown is running. Press Ctrl+C to stop."
    );

    let mut driver = DeletionLoop::new(worker, config);
    let stopper = driver.stopper();
    let watcher = tokio::spawn(async move {
        wait_for_shutdown().await;
        stopper.stop();
    });

    let stats = driver.run().await;
    watcher.abort();

    info!(
        ticks = stats.ticks,
        claimed = stats.claimed,
        deleted = stats.deleted,
        failed = stats.failed,
        errors = stats.errors,
        "teardown stopped"
    );
    Ok(())
}

/// Run one pass and print what it did.
async fn cmd_tick(worker: &DeletionWorker) -> Result<()> {
    let summary = worker.tick().await;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &TickSummary) {
    println!(
        "claimed {} advanced {} retried {} deleted {} failed {} errors {}",
        summary.claimed,
        summary.advanced,
        summary.retried,
        summary.deleted.len(),
        summary.failed.len(),
        summary.errors.len()
    );
    for id in &summary.deleted {
        println!("deleted {id}");
    }
    for id in &summary.failed {
        println!("failed {id}");
    }
    for err in &summary.errors {
        match &err.id {
            Some(id) => println!("error {id}: {}", err.reason),
            None => println!("error: {}", err.reason),
        }
    }
}

async fn cmd_enqueue(worker: &DeletionWorker, id: String, provider: String) -> Result<()> {
    let record = worker
        .enqueue(ResourceId::new(id), provider)
        .await
        .context("Failed to queue resource")?;
    println!(
        "queued {} on '{}' in {}",
        record.id(),
        record.provider(),
        record.phase()
    );
    Ok(())
}

async fn cmd_report(worker: &DeletionWorker, format: ReportFormat) -> Result<()> {
    let report = worker
        .report_at(chrono::Utc::now())
        .await
        .context("Failed to collect queue report")?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match format {
        ReportFormat::Csv => report
            .write_csv(&mut out)
            .context("Failed to write CSV report")?,
        ReportFormat::Json => report
            .write_json(&mut out)
            .context("Failed to write JSON report")?,
    }
    out.flush().context("Failed to flush report")
}

async fn cmd_purge(worker: &DeletionWorker) -> Result<()> {
    let purged = worker
        .purge_terminal()
        .await
        .context("Failed to purge terminal records")?;
    for id in &purged {
        println!("purged {id}");
    }
    info!(count = purged.len(), "Purged terminal records");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C).
async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, finishing current tick"),
        Err(err) => error!("Failed to listen for shutdown signal: {}", err),
    }
}
