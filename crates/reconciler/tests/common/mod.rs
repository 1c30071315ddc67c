//! Scripted provider adapter shared by the behavioral tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use teardown_reconciler::{
    DeletionConfig, DeletionWorker, InMemoryRecordStore, OperationOutcome, ProviderAdapter,
    ProviderCall, ProviderError, ProviderResult, RecordStore, ResourceId, Result,
};
use tokio::sync::Mutex;

/// What the provider does for one call.
#[derive(Debug, Clone)]
pub enum Answer {
    Outcome(OperationOutcome),
    Fail(ProviderError),
    Panic(String),
    Hang,
}

impl From<OperationOutcome> for Answer {
    fn from(outcome: OperationOutcome) -> Self {
        Self::Outcome(outcome)
    }
}

/// Provider answering from per-call scripts, `Success` once a script runs dry.
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<ProviderCall, VecDeque<Answer>>>,
    calls: Mutex<Vec<(ProviderCall, ResourceId)>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
    must_stop: bool,
    soft: bool,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay: Duration::ZERO,
            must_stop: true,
            soft: false,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn without_stop(mut self) -> Self {
        self.must_stop = false;
        self
    }

    pub fn with_soft_shutdown(mut self) -> Self {
        self.soft = true;
        self
    }

    pub async fn script(&self, call: ProviderCall, answers: impl IntoIterator<Item = Answer>) {
        self.scripts
            .lock()
            .await
            .entry(call)
            .or_default()
            .extend(answers);
    }

    pub async fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().await.iter().map(|(c, _)| *c).collect()
    }

    pub async fn calls_for(&self, id: &ResourceId) -> Vec<ProviderCall> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|(_, i)| i == id)
            .map(|(c, _)| *c)
            .collect()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    #[allow(clippy::panic)]
    async fn answer(&self, call: ProviderCall, id: &ResourceId) -> ProviderResult {
        self.calls.lock().await.push((call, id.clone()));
        let answer = self
            .scripts
            .lock()
            .await
            .get_mut(&call)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Answer::Outcome(OperationOutcome::Success));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match answer {
            Answer::Outcome(outcome) => Ok(outcome),
            Answer::Fail(err) => Err(err),
            Answer::Panic(message) => panic!("{message}"),
            Answer::Hang => {
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                Ok(OperationOutcome::Pending)
            }
        }
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stop(&self, id: &ResourceId) -> ProviderResult {
        self.answer(ProviderCall::Stop, id).await
    }

    async fn shutdown(&self, id: &ResourceId) -> ProviderResult {
        self.answer(ProviderCall::Shutdown, id).await
    }

    async fn is_stopped(&self, id: &ResourceId) -> ProviderResult {
        self.answer(ProviderCall::IsStopped, id).await
    }

    async fn delete(&self, id: &ResourceId) -> ProviderResult {
        self.answer(ProviderCall::Delete, id).await
    }

    async fn is_deleted(&self, id: &ResourceId) -> ProviderResult {
        self.answer(ProviderCall::IsDeleted, id).await
    }

    fn must_stop_before_deletion(&self) -> bool {
        self.must_stop
    }

    fn prefers_soft_shutdown(&self) -> bool {
        self.soft
    }
}

/// Worker over an in-memory store with `provider` registered as "scripted".
pub fn worker_with(
    provider: Arc<ScriptedProvider>,
    config: DeletionConfig,
) -> Result<DeletionWorker> {
    DeletionWorker::builder()
        .with_store(InMemoryRecordStore::new_arc())
        .with_provider("scripted", provider)
        .with_config(config)
        .build()
}

/// Worker over a shared store.
pub fn worker_on(
    store: Arc<dyn RecordStore>,
    provider: Arc<ScriptedProvider>,
) -> Result<DeletionWorker> {
    DeletionWorker::builder()
        .with_store(store)
        .with_provider("scripted", provider)
        .build()
}

/// Far enough past any backoff delay for a record to be due again.
pub fn later(now: DateTime<Utc>) -> DateTime<Utc> {
    now + chrono::Duration::seconds(200)
}
