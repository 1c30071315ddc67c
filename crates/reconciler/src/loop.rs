//! Periodic tick driver.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::DeletionConfig;
use crate::worker::{DeletionWorker, TickSummary};

/// Configuration for the tick driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    /// Time between tick starts.
    pub interval: Duration,
    /// Stop after this many ticks; `None` runs until stopped.
    pub max_ticks: Option<u64>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::from_deletion(&DeletionConfig::default())
    }
}

impl LoopConfig {
    pub fn from_deletion(config: &DeletionConfig) -> Self {
        Self {
            interval: config.tick_interval(),
            max_ticks: None,
        }
    }

    #[must_use]
    pub fn with_max_ticks(mut self, max_ticks: u64) -> Self {
        self.max_ticks = Some(max_ticks);
        self
    }
}

/// Handle that stops a running [`DeletionLoop`] after its current tick.
#[derive(Debug, Clone)]
pub struct LoopStopper {
    tx: Arc<watch::Sender<bool>>,
}

impl LoopStopper {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Totals over the life of a loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub ticks: u64,
    pub claimed: usize,
    pub deleted: usize,
    pub failed: usize,
    pub errors: usize,
}

impl LoopStats {
    fn absorb(&mut self, summary: &TickSummary) {
        self.ticks += 1;
        self.claimed += summary.claimed;
        self.deleted += summary.deleted.len();
        self.failed += summary.failed.len();
        self.errors += summary.errors.len();
    }
}

/// Runs [`DeletionWorker::tick`] on a fixed period until stopped.
///
/// A tick in progress always runs to completion; stopping takes effect
/// between ticks.
pub struct DeletionLoop {
    worker: DeletionWorker,
    config: LoopConfig,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl DeletionLoop {
    pub fn new(worker: DeletionWorker, config: LoopConfig) -> Self {
        let (tx, stop_rx) = watch::channel(false);
        Self {
            worker,
            config,
            stop_tx: Arc::new(tx),
            stop_rx,
        }
    }

    pub fn stopper(&self) -> LoopStopper {
        LoopStopper {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    /// Tick until stopped or `max_ticks` is reached.
    pub async fn run(&mut self) -> LoopStats {
        let mut stats = LoopStats::default();
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            owner = %self.worker.owner(),
            interval_ms = u64::try_from(self.config.interval.as_millis()).unwrap_or(u64::MAX),
            "Deletion loop started"
        );

        while !*self.stop_rx.borrow() {
            if self.config.max_ticks.is_some_and(|max| stats.ticks >= max) {
                break;
            }

            tokio::select! {
                biased;
                changed = self.stop_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    let summary = self.worker.tick().await;
                    stats.absorb(&summary);
                    debug!(tick = stats.ticks, "Loop tick done");
                }
            }
        }

        info!(
            ticks = stats.ticks,
            deleted = stats.deleted,
            failed = stats.failed,
            "Deletion loop stopped"
        );
        stats
    }
}
