//! Deletion worker.
//!
//! One [`DeletionWorker::tick`] walks the groups in lifecycle order. For each
//! group it leases a batch of due records, runs their provider calls as
//! parallel tasks bounded by a semaphore, feeds every outcome to the phase
//! machine and commits the result. Provider trouble never escapes a tick; it
//! becomes counters and backoff on the record. Only bookkeeping failures are
//! reported back, per record, in the [`TickSummary`].
//!
//! A provider call holds its permit and its record's lease until the call has
//! really returned. When a call outlives its timeout the tick records the
//! timeout and moves on, and the commit waits for the call in the background.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use teardown_core::ResultExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::backoff::{ExecutionTimer, RetryPolicy};
use crate::config::DeletionConfig;
use crate::error::{Error, Result};
use crate::machine::{self, Capabilities, Directive, ProviderCall, Transition};
use crate::provider::{
    CallFinished, CallSlot, ErrorClassifier, ProviderAdapter, ProviderError, ProviderRegistry,
};
use crate::report::QueueReport;
use crate::store::RecordStore;
use crate::types::{Group, Lease, OperationOutcome, ResourceId, ResourceRecord, WorkerId};

/// Bookkeeping failure seen during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickError {
    /// Record concerned, if the failure is about one record.
    pub id: Option<ResourceId>,
    pub reason: String,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Records leased across all groups.
    pub claimed: usize,
    /// Records that entered a new non-terminal phase.
    pub advanced: usize,
    /// Records that stayed in their phase.
    pub retried: usize,
    pub deleted: Vec<ResourceId>,
    pub failed: Vec<ResourceId>,
    pub errors: Vec<TickError>,
}

impl TickSummary {
    /// Nothing was due.
    pub fn is_idle(&self) -> bool {
        self.claimed == 0 && self.errors.is_empty()
    }

    fn record(&mut self, id: ResourceId, transition: Transition) {
        match transition.directive {
            Directive::Advance => self.advanced += 1,
            Directive::Retry | Directive::Reissued => self.retried += 1,
            Directive::Done => self.deleted.push(id),
            Directive::Fail => self.failed.push(id),
        }
    }

    fn error(&mut self, id: Option<ResourceId>, reason: impl Into<String>) {
        self.errors.push(TickError {
            id,
            reason: reason.into(),
        });
    }
}

struct WorkerInner {
    store: Arc<dyn RecordStore>,
    providers: ProviderRegistry,
    config: DeletionConfig,
    policy: RetryPolicy,
    classifier: ErrorClassifier,
    owner: WorkerId,
    permits: Arc<Semaphore>,
}

/// Drives queued resources towards deletion.
#[derive(Clone)]
pub struct DeletionWorker {
    inner: Arc<WorkerInner>,
}

impl DeletionWorker {
    /// Start building a worker.
    pub fn builder() -> DeletionWorkerBuilder {
        DeletionWorkerBuilder::new()
    }

    pub fn owner(&self) -> &WorkerId {
        &self.inner.owner
    }

    pub fn config(&self) -> &DeletionConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.inner.store
    }

    /// Queue a resource for deletion, due immediately.
    ///
    /// # Errors
    ///
    /// Returns `Error::DuplicateRecord` if the resource is already queued, or
    /// a store error.
    pub async fn enqueue(
        &self,
        id: ResourceId,
        provider: impl Into<String>,
    ) -> Result<ResourceRecord> {
        self.enqueue_at(id, provider, Utc::now()).await
    }

    /// [`enqueue`](Self::enqueue) with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`enqueue`](Self::enqueue).
    pub async fn enqueue_at(
        &self,
        id: ResourceId,
        provider: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<ResourceRecord> {
        let record = ResourceRecord::new(id, provider, now);
        if !self.inner.providers.contains(record.provider()) {
            warn!(
                resource_id = %record.id(),
                provider = record.provider(),
                "Queued resource names an unregistered provider"
            );
        }
        self.inner.store.insert(record.clone()).await?;
        info!(
            resource_id = %record.id(),
            provider = record.provider(),
            "Resource queued for deletion"
        );
        Ok(record)
    }

    /// Run one reconciliation pass now.
    pub async fn tick(&self) -> TickSummary {
        self.tick_at(Utc::now()).await
    }

    /// Run one reconciliation pass as of `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickSummary {
        let mut summary = TickSummary::default();
        for group in Group::ALL {
            self.process_group(group, now, &mut summary).await;
        }

        if summary.is_idle() {
            debug!("Nothing due");
        } else {
            info!(
                claimed = summary.claimed,
                advanced = summary.advanced,
                retried = summary.retried,
                deleted = summary.deleted.len(),
                failed = summary.failed.len(),
                errors = summary.errors.len(),
                "Tick complete"
            );
        }
        summary
    }

    /// Remove every DELETED and FAILED record.
    ///
    /// # Errors
    ///
    /// Returns a store error if the queue cannot be listed or a record cannot
    /// be removed.
    pub async fn purge_terminal(&self) -> Result<Vec<ResourceId>> {
        let mut purged = Vec::new();
        for record in self.inner.store.list().await? {
            if record.is_terminal() {
                self.inner.store.remove(record.id()).await?;
                info!(resource_id = %record.id(), phase = %record.phase(), "Record purged");
                purged.push(record.id().clone());
            }
        }
        Ok(purged)
    }

    /// Snapshot of the queue as of `now`.
    ///
    /// # Errors
    ///
    /// Returns a store error if the queue cannot be listed.
    pub async fn report_at(&self, now: DateTime<Utc>) -> Result<QueueReport> {
        QueueReport::collect(self.inner.store.as_ref(), now).await
    }

    async fn process_group(&self, group: Group, now: DateTime<Utc>, summary: &mut TickSummary) {
        let inner = &self.inner;
        let lease = Lease::new(inner.owner.clone(), inner.lease_expiry(now));
        let claimed = match inner
            .store
            .claim_due(group, now, &lease, inner.config.max_deletions_at_once)
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(group = %group, error = %e, "Failed to claim due records");
                summary.error(None, e.to_string());
                return;
            }
        };

        if claimed.is_empty() {
            return;
        }
        debug!(group = %group, claimed = claimed.len(), "Processing group");
        summary.claimed += claimed.len();

        let mut tasks = JoinSet::new();
        for record in claimed {
            let inner = Arc::clone(inner);
            tasks.spawn(async move { inner.process_record(record, now).await });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok(transition))) => summary.record(id, transition),
                Ok((id, Err(e))) => {
                    error!(resource_id = %id, error = %e, "Record bookkeeping failed");
                    summary.error(Some(id), e.to_string());
                }
                Err(e) => {
                    error!(group = %group, error = %e, "Record task aborted");
                    summary.error(None, e.to_string());
                }
            }
        }
    }
}

impl WorkerInner {
    fn lease_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.lease_ttl())
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    async fn process_record(
        self: Arc<Self>,
        mut record: ResourceRecord,
        now: DateTime<Utc>,
    ) -> (ResourceId, Result<Transition>) {
        let id = record.id().clone();
        let adapter = self.providers.get(record.provider());
        let capabilities = adapter
            .as_ref()
            .map_or_else(Capabilities::default, |a| a.capabilities());

        let Some(call) = machine::plan(&record, capabilities, &self.policy) else {
            self.release(&id).await;
            let err = Error::invalid_transition(record.phase().as_str(), "none");
            return (id, Err(err));
        };
        debug!(resource_id = %id, phase = %record.phase(), call = %call, "Planned call");

        let (outcome, elapsed, mut finished) = match adapter {
            None => (
                OperationOutcome::fatal(format!("unknown provider '{}'", record.provider())),
                Duration::ZERO,
                None,
            ),
            Some(_) if call == ProviderCall::Skip => {
                (OperationOutcome::Success, Duration::ZERO, None)
            }
            Some(adapter) => match self.call_provider(adapter.as_ref(), call, &id).await {
                Ok((outcome, elapsed, finished)) => (outcome, elapsed, Some(finished)),
                Err(e) => {
                    self.release(&id).await;
                    return (id, Err(e));
                }
            },
        };

        let completed = chrono::Duration::from_std(elapsed)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(now);
        let transition = match machine::apply(
            &mut record,
            call,
            &outcome,
            &self.policy,
            completed,
            elapsed,
        ) {
            Ok(transition) => transition,
            Err(e) => {
                self.release(&id).await;
                return (id, Err(e));
            }
        };
        log_transition(&id, call, &outcome, &transition);

        let still_running = finished.as_mut().is_some_and(|f| !f.is_finished());
        match finished {
            Some(finished) if still_running => {
                warn!(
                    resource_id = %id,
                    call = %call,
                    "Provider call still running after timeout, commit deferred"
                );
                let inner = Arc::clone(&self);
                tokio::spawn(async move {
                    finished.wait().await;
                    let id = record.id().clone();
                    if let Err(e) = inner.commit(record).await {
                        error!(resource_id = %id, error = %e, "Deferred commit failed");
                    }
                });
                (id, Ok(transition))
            }
            _ => {
                let committed = self.commit(record).await;
                (id, committed.map(|()| transition))
            }
        }
    }

    /// Commit `record`, giving the lease back if the commit fails.
    async fn commit(&self, record: ResourceRecord) -> Result<()> {
        let id = record.id().clone();
        let committed = self.store.commit(record, &self.owner).await;
        if committed.is_err() {
            self.release(&id).await;
        }
        committed
    }

    async fn call_provider(
        &self,
        adapter: &dyn ProviderAdapter,
        call: ProviderCall,
        id: &ResourceId,
    ) -> Result<(OperationOutcome, Duration, CallFinished)> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::PermitsClosed)?;
        let (slot, finished) = CallSlot::new(permit);

        let limit = self.config.operation_timeout();
        let timer = ExecutionTimer::start();
        let answer = timeout(
            limit,
            AssertUnwindSafe(adapter.execute(call, id, slot)).catch_unwind(),
        )
        .await;
        let elapsed = timer.elapsed();

        let outcome = match answer {
            Ok(Ok(Ok(outcome))) => outcome,
            Ok(Ok(Err(e))) => self.classifier.classify(&e),
            Ok(Err(payload)) => self
                .classifier
                .classify(&ProviderError::panicked(panic_message(payload.as_ref()))),
            Err(_) => self.classifier.classify(&ProviderError::Timeout(limit)),
        };
        Ok((outcome, elapsed, finished))
    }

    async fn release(&self, id: &ResourceId) {
        self.store
            .release(id, &self.owner)
            .await
            .into_option_logged("lease release");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn log_transition(
    id: &ResourceId,
    call: ProviderCall,
    outcome: &OperationOutcome,
    transition: &Transition,
) {
    let Transition { from, to, directive } = *transition;
    match directive {
        Directive::Fail => {
            error!(resource_id = %id, from = %from, call = %call, outcome = %outcome, "Resource marked FAILED");
        }
        Directive::Done => info!(resource_id = %id, from = %from, "Resource deleted"),
        Directive::Advance => {
            info!(resource_id = %id, from = %from, to = %to, call = %call, "Phase advanced");
        }
        Directive::Reissued => {
            warn!(resource_id = %id, phase = %to, call = %call, "Operation re-issued");
        }
        Directive::Retry => match outcome {
            OperationOutcome::FatalError(detail) => {
                error!(resource_id = %id, phase = %to, call = %call, detail = %detail, "Fatal provider error");
            }
            OperationOutcome::RetryableError(detail) => {
                warn!(resource_id = %id, phase = %to, call = %call, detail = %detail, "Retryable provider error");
            }
            _ => debug!(resource_id = %id, phase = %to, call = %call, "Still pending"),
        },
    }
}

/// Builder for [`DeletionWorker`].
pub struct DeletionWorkerBuilder {
    store: Option<Arc<dyn RecordStore>>,
    providers: ProviderRegistry,
    config: DeletionConfig,
    owner: Option<WorkerId>,
}

impl DeletionWorkerBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            store: None,
            providers: ProviderRegistry::new(),
            config: DeletionConfig::default(),
            owner: None,
        }
    }

    /// Set the record store.
    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the provider registry.
    pub fn with_providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    /// Register a single provider.
    pub fn with_provider(
        mut self,
        name: impl Into<String>,
        adapter: Arc<dyn ProviderAdapter>,
    ) -> Self {
        self.providers.register(name, adapter);
        self
    }

    /// Set the configuration.
    pub fn with_config(mut self, config: DeletionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the lease owner identity; defaults to a generated one.
    pub fn with_owner(mut self, owner: WorkerId) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Build the worker.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if no store was set or the config does
    /// not validate.
    pub fn build(self) -> Result<DeletionWorker> {
        let store = self
            .store
            .ok_or_else(|| Error::invalid_config("record store is required"))?;
        self.config.validate()?;
        let classifier = ErrorClassifier::from_patterns(&self.config.permanent_error_patterns)?;

        Ok(DeletionWorker {
            inner: Arc::new(WorkerInner {
                store,
                providers: self.providers,
                policy: RetryPolicy::from_config(&self.config),
                classifier,
                owner: self.owner.unwrap_or_default(),
                permits: Arc::new(Semaphore::new(self.config.max_deletions_at_once)),
                config: self.config,
            }),
        })
    }
}

impl Default for DeletionWorkerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
