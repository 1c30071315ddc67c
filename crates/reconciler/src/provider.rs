//! Provider adapter boundary.
//!
//! A provider adapter knows how to stop, delete and observe machines on one
//! infrastructure backend. Adapters answer with an [`OperationOutcome`]; an
//! `Err` is reserved for failures the adapter did not anticipate, which the
//! worker classifies through an [`ErrorClassifier`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, oneshot};

use crate::error::{Error, Result};
use crate::machine::{Capabilities, ProviderCall};
use crate::types::{OperationOutcome, ResourceId};

/// Unanticipated failure inside a provider adapter.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider call panicked: {0}")]
    Panicked(String),

    #[error("provider I/O error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Create an I/O error.
    pub fn io(reason: impl Into<String>) -> Self {
        Self::Io(reason.into())
    }

    /// Create a free-form error.
    pub fn other(reason: impl Into<String>) -> Self {
        Self::Other(reason.into())
    }

    /// Create a panic error.
    pub fn panicked(reason: impl Into<String>) -> Self {
        Self::Panicked(reason.into())
    }
}

/// Result of one adapter call.
pub type ProviderResult = std::result::Result<OperationOutcome, ProviderError>;

/// One unit of the worker's provider-call budget, held for a single call.
///
/// The worker counts a call as finished only once its slot is dropped, and
/// keeps the record leased until then.
#[derive(Debug)]
pub struct CallSlot {
    _permit: OwnedSemaphorePermit,
    _finished: oneshot::Sender<()>,
}

impl CallSlot {
    pub fn new(permit: OwnedSemaphorePermit) -> (Self, CallFinished) {
        let (tx, rx) = oneshot::channel();
        let slot = Self {
            _permit: permit,
            _finished: tx,
        };
        (slot, CallFinished(rx))
    }
}

/// Observes when the matching [`CallSlot`] is dropped.
#[derive(Debug)]
pub struct CallFinished(oneshot::Receiver<()>);

impl CallFinished {
    pub fn is_finished(&mut self) -> bool {
        matches!(
            self.0.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        )
    }

    pub async fn wait(self) {
        let _ = self.0.await;
    }
}

/// One infrastructure backend.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Request a hard stop.
    async fn stop(&self, id: &ResourceId) -> ProviderResult;

    /// Request a soft, guest-initiated shutdown.
    async fn shutdown(&self, id: &ResourceId) -> ProviderResult {
        self.stop(id).await
    }

    /// `Success` once stopped, `Pending` while stopping.
    async fn is_stopped(&self, id: &ResourceId) -> ProviderResult;

    /// Request deletion.
    async fn delete(&self, id: &ResourceId) -> ProviderResult;

    /// `Success` once gone, `Pending` while deleting.
    async fn is_deleted(&self, id: &ResourceId) -> ProviderResult;

    /// Whether a machine must be stopped before it can be deleted.
    fn must_stop_before_deletion(&self) -> bool {
        true
    }

    /// Whether the first stop should be a soft shutdown.
    fn prefers_soft_shutdown(&self) -> bool {
        false
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            must_stop_before_deletion: self.must_stop_before_deletion(),
            prefers_soft_shutdown: self.prefers_soft_shutdown(),
        }
    }

    /// Dispatch `call` to the matching method while holding `slot`.
    ///
    /// The default drops the slot together with the future, which is right
    /// for adapters whose work stops when the future is cancelled. Adapters
    /// whose work outlives cancellation must keep the slot until that work
    /// ends.
    async fn execute(
        &self,
        call: ProviderCall,
        id: &ResourceId,
        slot: CallSlot,
    ) -> ProviderResult {
        let _slot = slot;
        match call {
            ProviderCall::Skip => Ok(OperationOutcome::Success),
            ProviderCall::Shutdown => self.shutdown(id).await,
            ProviderCall::Stop => self.stop(id).await,
            ProviderCall::IsStopped => self.is_stopped(id).await,
            ProviderCall::Delete => self.delete(id).await,
            ProviderCall::IsDeleted => self.is_deleted(id).await,
        }
    }
}

/// Lookup table from provider name to adapter, handed to the worker.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` under `name`, returning the adapter it replaced.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        adapter: Arc<dyn ProviderAdapter>,
    ) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.insert(name.into(), adapter)
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(name, adapter);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

/// Decides whether an adapter failure is retryable or fatal.
///
/// Timeouts are always retryable. Other failures are fatal only when their
/// message matches one of the configured patterns.
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    permanent: Vec<Regex>,
}

impl ErrorClassifier {
    /// Compile the permanent-error patterns.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` for the first pattern that fails to
    /// compile.
    pub fn from_patterns(patterns: &[String]) -> Result<Self> {
        let permanent = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    Error::invalid_config(format!("permanent error pattern '{p}': {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { permanent })
    }

    /// Map an adapter failure onto the outcome taxonomy.
    pub fn classify(&self, error: &ProviderError) -> OperationOutcome {
        let message = error.to_string();
        match error {
            ProviderError::Timeout(_) => OperationOutcome::RetryableError(message),
            _ if self.permanent.iter().any(|re| re.is_match(&message)) => {
                OperationOutcome::FatalError(message)
            }
            _ => OperationOutcome::RetryableError(message),
        }
    }
}

/// Synchronous provider whose calls block on I/O.
///
/// Wrap it in a [`BlockingAdapter`] to run each call on tokio's blocking
/// pool.
pub trait BlockingProvider: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn stop(&self, id: &ResourceId) -> ProviderResult;

    fn shutdown(&self, id: &ResourceId) -> ProviderResult {
        self.stop(id)
    }

    fn is_stopped(&self, id: &ResourceId) -> ProviderResult;

    fn delete(&self, id: &ResourceId) -> ProviderResult;

    fn is_deleted(&self, id: &ResourceId) -> ProviderResult;

    fn must_stop_before_deletion(&self) -> bool {
        true
    }

    fn prefers_soft_shutdown(&self) -> bool {
        false
    }
}

fn dispatch<P: BlockingProvider>(
    provider: &P,
    call: ProviderCall,
    id: &ResourceId,
) -> ProviderResult {
    match call {
        ProviderCall::Skip => Ok(OperationOutcome::Success),
        ProviderCall::Shutdown => provider.shutdown(id),
        ProviderCall::Stop => provider.stop(id),
        ProviderCall::IsStopped => provider.is_stopped(id),
        ProviderCall::Delete => provider.delete(id),
        ProviderCall::IsDeleted => provider.is_deleted(id),
    }
}

/// Runs a [`BlockingProvider`] on the blocking thread pool.
///
/// A blocking call cannot be interrupted, so after a timeout it keeps its
/// [`CallSlot`] until the thread returns.
pub struct BlockingAdapter<P> {
    inner: Arc<P>,
}

impl<P: BlockingProvider> BlockingAdapter<P> {
    pub fn new(provider: P) -> Self {
        Self {
            inner: Arc::new(provider),
        }
    }

    async fn run<F>(&self, id: &ResourceId, call: F) -> ProviderResult
    where
        F: FnOnce(&P, &ResourceId) -> ProviderResult + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let id = id.clone();
        tokio::task::spawn_blocking(move || call(&inner, &id))
            .await
            .unwrap_or_else(|e| Err(ProviderError::panicked(e.to_string())))
    }
}

#[async_trait]
impl<P: BlockingProvider> ProviderAdapter for BlockingAdapter<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn stop(&self, id: &ResourceId) -> ProviderResult {
        self.run(id, |p, id| p.stop(id)).await
    }

    async fn shutdown(&self, id: &ResourceId) -> ProviderResult {
        self.run(id, |p, id| p.shutdown(id)).await
    }

    async fn is_stopped(&self, id: &ResourceId) -> ProviderResult {
        self.run(id, |p, id| p.is_stopped(id)).await
    }

    async fn delete(&self, id: &ResourceId) -> ProviderResult {
        self.run(id, |p, id| p.delete(id)).await
    }

    async fn is_deleted(&self, id: &ResourceId) -> ProviderResult {
        self.run(id, |p, id| p.is_deleted(id)).await
    }

    fn must_stop_before_deletion(&self) -> bool {
        self.inner.must_stop_before_deletion()
    }

    fn prefers_soft_shutdown(&self) -> bool {
        self.inner.prefers_soft_shutdown()
    }

    async fn execute(
        &self,
        call: ProviderCall,
        id: &ResourceId,
        slot: CallSlot,
    ) -> ProviderResult {
        let inner = Arc::clone(&self.inner);
        let id = id.clone();
        tokio::task::spawn_blocking(move || {
            let _slot = slot;
            dispatch(inner.as_ref(), call, &id)
        })
        .await
        .unwrap_or_else(|e| Err(ProviderError::panicked(e.to_string())))
    }
}
