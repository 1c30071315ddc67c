//! Deferred deletion reconciliation for virtual desktops.
//!
//! Tearing a machine down is asynchronous on every hypervisor: a call returns
//! at once and completion has to be polled. This crate drives each queued
//! resource through
//!
//! ```text
//! TO_STOP -> STOPPING -> TO_DELETE -> DELETING -> DELETED
//!     \__________\___________\___________\______> FAILED
//! ```
//!
//! # Key Concepts
//!
//! - **Records** ([`ResourceRecord`]): one per resource, carrying the phase,
//!   retry counters and the next instant it may be looked at.
//! - **Phase machine** ([`machine`]): pure `plan`/`apply` functions mapping a
//!   provider outcome to the next phase and counters.
//! - **Backoff** ([`RetryPolicy`]): the check interval stretches with how slow
//!   the provider was, and further after fatal errors.
//! - **Worker** ([`DeletionWorker`]): leases due records from a
//!   [`RecordStore`], calls the [`ProviderAdapter`] under a timeout and a
//!   concurrency bound, and commits the result.
//! - **Reports** ([`QueueReport`]): queue depth and per-record detail, as CSV
//!   or JSON.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use teardown_reconciler::{
//!     DeletionLoop, DeletionWorker, InMemoryRecordStore, LoopConfig, ResourceId,
//! };
//!
//! #[tokio::main]
//! async fn main() -> teardown_reconciler::Result<()> {
//!     let worker = DeletionWorker::builder()
//!         .with_store(InMemoryRecordStore::new_arc())
//!         .with_provider("vsphere", Arc::new(my_vsphere_adapter()))
//!         .build()?;
//!
//!     worker.enqueue(ResourceId::new("vm-42"), "vsphere").await?;
//!
//!     let mut driver = DeletionLoop::new(worker, LoopConfig::default());
//!     driver.run().await;
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod backoff;
pub mod config;
pub mod error;
pub mod file_store;
pub mod r#loop;
pub mod machine;
pub mod provider;
pub mod report;
pub mod store;
pub mod types;
pub mod worker;

// Re-export main types
pub use backoff::{ExecutionTimer, RetryPolicy};
pub use config::DeletionConfig;
pub use error::{Error, Result};
pub use file_store::FileRecordStore;
pub use r#loop::{DeletionLoop, LoopConfig, LoopStats, LoopStopper};
pub use machine::{Capabilities, Directive, ProviderCall, Transition};
pub use provider::{
    BlockingAdapter, BlockingProvider, CallFinished, CallSlot, ErrorClassifier, ProviderAdapter,
    ProviderError, ProviderRegistry, ProviderResult,
};
pub use report::{QueueReport, ReportEntry};
pub use store::{InMemoryRecordStore, RecordStore, TracingRecordStore};
pub use types::{Group, Lease, OperationOutcome, Phase, ResourceId, ResourceRecord, WorkerId};
pub use worker::{DeletionWorker, DeletionWorkerBuilder, TickError, TickSummary};
