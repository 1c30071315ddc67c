//! Core types for the reconciler crate.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Stable identifier of a resource under deletion.
///
/// Matches the id of the owning user-service entity; opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Create a resource id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ResourceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a worker holding leases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    /// Create a worker id from a fixed name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Create a fresh, unique worker id.
    pub fn generate() -> Self {
        Self(format!("worker-{}", Ulid::new()))
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::generate()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle phase of a resource record.
///
/// Ordered by lifecycle position; `Deleted` and `Failed` are terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Queued; the stop call has not been accepted yet.
    ToStop,
    /// Stop issued; polling until the machine is stopped.
    Stopping,
    /// Stopped; the delete call has not been accepted yet.
    ToDelete,
    /// Delete issued; polling until the machine is gone.
    Deleting,
    /// Terminal: the resource no longer exists.
    Deleted,
    /// Terminal: a retry budget was exhausted.
    Failed,
}

impl Phase {
    /// Every phase, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::ToStop,
        Self::Stopping,
        Self::ToDelete,
        Self::Deleting,
        Self::Deleted,
        Self::Failed,
    ];

    /// Check if this is a terminal phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deleted | Self::Failed)
    }

    /// Processing group of the phase; terminal phases have none.
    pub fn group(&self) -> Option<Group> {
        match self {
            Self::ToStop => Some(Group::ToStop),
            Self::Stopping => Some(Group::Stopping),
            Self::ToDelete => Some(Group::ToDelete),
            Self::Deleting => Some(Group::Deleting),
            Self::Deleted | Self::Failed => None,
        }
    }

    /// Check if transition to target phase is valid.
    pub fn can_transition_to(&self, target: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, target),
            (ToStop, Stopping)
                | (ToStop, ToDelete) // Provider does not need a stop
                | (Stopping, ToDelete)
                | (ToDelete, Deleting)
                | (Deleting, Deleted)
                | (ToStop | Stopping | ToDelete, Deleted) // Already gone
                | (ToStop | Stopping | ToDelete | Deleting, Failed)
        )
    }

    /// Upper-case name used in reports and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToStop => "TO_STOP",
            Self::Stopping => "STOPPING",
            Self::ToDelete => "TO_DELETE",
            Self::Deleting => "DELETING",
            Self::Deleted => "DELETED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Group a non-terminal record is processed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Group {
    ToStop,
    Stopping,
    ToDelete,
    Deleting,
}

impl Group {
    /// Groups in the order a tick processes them.
    pub const ALL: [Self; 4] = [Self::ToStop, Self::Stopping, Self::ToDelete, Self::Deleting];

    /// The phase records of this group are in.
    pub fn phase(&self) -> Phase {
        match self {
            Self::ToStop => Phase::ToStop,
            Self::Stopping => Phase::Stopping,
            Self::ToDelete => Phase::ToDelete,
            Self::Deleting => Phase::Deleting,
        }
    }
}

impl std::fmt::Display for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.phase().as_str())
    }
}

/// Result of one provider call, as seen by the phase machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationOutcome {
    /// The call completed, or the polled condition holds.
    Success,
    /// The polled condition does not hold yet.
    Pending,
    /// The resource no longer exists on the provider.
    Gone,
    /// Transient failure; try again later.
    RetryableError(String),
    /// Failure not expected to clear on its own; bounded by a small budget.
    FatalError(String),
}

impl OperationOutcome {
    /// Create a retryable error outcome.
    pub fn retryable(detail: impl Into<String>) -> Self {
        Self::RetryableError(detail.into())
    }

    /// Create a fatal error outcome.
    pub fn fatal(detail: impl Into<String>) -> Self {
        Self::FatalError(detail.into())
    }

    /// Check if this outcome is an error.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::RetryableError(_) | Self::FatalError(_))
    }

    /// Error detail, if any.
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::RetryableError(detail) | Self::FatalError(detail) => Some(detail),
            Self::Success | Self::Pending | Self::Gone => None,
        }
    }
}

impl std::fmt::Display for OperationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Pending => write!(f, "pending"),
            Self::Gone => write!(f, "gone"),
            Self::RetryableError(detail) => write!(f, "retryable error: {detail}"),
            Self::FatalError(detail) => write!(f, "fatal error: {detail}"),
        }
    }
}

/// Exclusive claim a worker holds on a record while processing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: WorkerId,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Create a lease held by `owner` until `expires_at`.
    pub fn new(owner: WorkerId, expires_at: DateTime<Utc>) -> Self {
        Self { owner, expires_at }
    }

    /// A lease is live until its expiry instant.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// Check if `owner` holds this lease.
    pub fn is_held_by(&self, owner: &WorkerId) -> bool {
        &self.owner == owner
    }
}

/// Persistent state of one resource moving towards deletion.
///
/// Phase and counters change only through [`crate::machine::apply`]; the
/// fields are crate-private so no caller can move a record by hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub(crate) id: ResourceId,
    pub(crate) provider: String,
    pub(crate) phase: Phase,
    pub(crate) retries: u32,
    pub(crate) retries_to_retry: u32,
    pub(crate) fatal_retries: u32,
    pub(crate) next_check: DateTime<Utc>,
    pub(crate) last_check_duration: Duration,
    pub(crate) created: DateTime<Utc>,
    pub(crate) last_state_change: DateTime<Utc>,
    #[serde(default)]
    pub(crate) last_error: Option<String>,
    #[serde(default)]
    pub(crate) lease: Option<Lease>,
}

impl ResourceRecord {
    /// Create a record in TO_STOP, due immediately.
    pub fn new(id: ResourceId, provider: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            provider: provider.into(),
            phase: Phase::ToStop,
            retries: 0,
            retries_to_retry: 0,
            fatal_retries: 0,
            next_check: now,
            last_check_duration: Duration::ZERO,
            created: now,
            last_state_change: now,
            last_error: None,
            lease: None,
        }
    }

    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Processing group, derived from the phase.
    pub fn group(&self) -> Option<Group> {
        self.phase.group()
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn retries_to_retry(&self) -> u32 {
        self.retries_to_retry
    }

    pub fn fatal_retries(&self) -> u32 {
        self.fatal_retries
    }

    pub fn next_check(&self) -> DateTime<Utc> {
        self.next_check
    }

    pub fn last_check_duration(&self) -> Duration {
        self.last_check_duration
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn last_state_change(&self) -> DateTime<Utc> {
        self.last_state_change
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Non-terminal and past its next check.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal() && self.next_check <= now
    }

    /// Due, and nobody holds a live lease on it.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.is_due(now) && self.lease.as_ref().is_none_or(|lease| !lease.is_live(now))
    }

    /// Time spent in the current phase.
    pub fn age_in_phase(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.last_state_change)
    }

    pub(crate) fn set_lease(&mut self, lease: Lease) {
        self.lease = Some(lease);
    }

    pub(crate) fn clear_lease(&mut self) {
        self.lease = None;
    }
}
