//! Phase state machine.
//!
//! Pure and synchronous: [`plan`] picks the provider call for a record, and
//! [`apply`] folds the call's outcome back into the record. The worker owns
//! the I/O in between.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::backoff::RetryPolicy;
use crate::error::{Error, Result};
use crate::types::{OperationOutcome, Phase, ResourceRecord};

/// Provider call chosen for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderCall {
    /// No call; the provider does not need the machine stopped.
    Skip,
    /// Soft, guest-initiated stop.
    Shutdown,
    /// Hard stop.
    Stop,
    IsStopped,
    Delete,
    IsDeleted,
}

impl ProviderCall {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Shutdown => "shutdown",
            Self::Stop => "stop",
            Self::IsStopped => "is_stopped",
            Self::Delete => "delete",
            Self::IsDeleted => "is_deleted",
        }
    }

    /// Polls ask whether an issued operation has finished.
    pub fn is_poll(&self) -> bool {
        matches!(self, Self::IsStopped | Self::IsDeleted)
    }
}

impl std::fmt::Display for ProviderCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a provider is able to do, as far as planning is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub must_stop_before_deletion: bool,
    pub prefers_soft_shutdown: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            must_stop_before_deletion: true,
            prefers_soft_shutdown: false,
        }
    }
}

/// How a record moved after one outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Entered the next phase.
    Advance,
    /// Stays in the phase and is checked again later.
    Retry,
    /// Stays in the phase; the stop/delete call was issued again.
    Reissued,
    /// The resource is gone.
    Done,
    /// A retry budget ran out.
    Fail,
}

/// Result of applying one outcome to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Phase,
    pub to: Phase,
    pub directive: Directive,
}

impl Transition {
    pub fn changed_phase(&self) -> bool {
        self.from != self.to
    }
}

/// Choose the provider call for `record`.
///
/// Returns `None` for terminal records: they never reach a provider again.
pub fn plan(
    record: &ResourceRecord,
    capabilities: Capabilities,
    policy: &RetryPolicy,
) -> Option<ProviderCall> {
    let call = match record.phase {
        Phase::ToStop if !capabilities.must_stop_before_deletion => ProviderCall::Skip,
        // Soft shutdown only on the first attempt; later attempts use the hard stop.
        Phase::ToStop if capabilities.prefers_soft_shutdown && record.retries == 0 => {
            ProviderCall::Shutdown
        }
        Phase::ToStop => ProviderCall::Stop,
        Phase::Stopping if policy.should_reissue(record.retries_to_retry) => ProviderCall::Stop,
        Phase::Stopping => ProviderCall::IsStopped,
        Phase::ToDelete => ProviderCall::Delete,
        Phase::Deleting if policy.should_reissue(record.retries_to_retry) => ProviderCall::Delete,
        Phase::Deleting => ProviderCall::IsDeleted,
        Phase::Deleted | Phase::Failed => return None,
    };
    Some(call)
}

/// Fold `outcome` of `call` into `record`.
///
/// `now` is the completion instant of the call and `duration` its measured
/// wall time; together they set `next_check`.
///
/// # Errors
///
/// Returns `Error::InvalidTransition` if `call` is not one [`plan`] could
/// have chosen for the record's phase. The record is left untouched.
pub fn apply(
    record: &mut ResourceRecord,
    call: ProviderCall,
    outcome: &OperationOutcome,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
    duration: Duration,
) -> Result<Transition> {
    let from = record.phase;
    let step = step_for(from, call)
        .ok_or_else(|| Error::invalid_transition(from.as_str(), call.as_str()))?;

    record.last_check_duration = duration;

    let directive = match outcome {
        OperationOutcome::Gone => {
            enter(record, Phase::Deleted, now);
            Directive::Done
        }
        OperationOutcome::FatalError(detail) => {
            record.fatal_retries = record.fatal_retries.saturating_add(1);
            record.last_error = Some(detail.clone());
            if policy.fatal_exhausted(record.fatal_retries) {
                fail(record, now, "fatal error budget exhausted", detail);
                Directive::Fail
            } else {
                record.next_check = policy.next_check(now, duration, true);
                Directive::Retry
            }
        }
        OperationOutcome::RetryableError(detail) => {
            record.last_error = Some(detail.clone());
            if call.is_poll() {
                record.retries_to_retry = record.retries_to_retry.saturating_add(1);
            }
            count_retry(record, policy, now, duration, detail)
        }
        OperationOutcome::Success | OperationOutcome::Pending => match step {
            Step::Issue { next } => {
                enter(record, next, now);
                if call != ProviderCall::Skip {
                    record.next_check = policy.next_check(now, duration, false);
                }
                Directive::Advance
            }
            Step::Reissue => {
                record.retries_to_retry = 0;
                record.next_check = policy.next_check(now, duration, false);
                Directive::Reissued
            }
            Step::Poll { next } if *outcome == OperationOutcome::Success => {
                enter(record, next, now);
                if next == Phase::Deleted {
                    Directive::Done
                } else {
                    record.next_check = policy.next_check(now, duration, false);
                    Directive::Advance
                }
            }
            Step::Poll { .. } => {
                record.retries_to_retry = record.retries_to_retry.saturating_add(1);
                count_retry(record, policy, now, duration, "still pending")
            }
        },
    };

    Ok(Transition {
        from,
        to: record.phase,
        directive,
    })
}

#[derive(Debug, Clone, Copy)]
enum Step {
    /// First stop/delete of the phase; acceptance advances.
    Issue { next: Phase },
    /// Stop/delete issued again while waiting.
    Reissue,
    /// Completion check; success advances.
    Poll { next: Phase },
}

fn step_for(phase: Phase, call: ProviderCall) -> Option<Step> {
    use Phase::*;
    use ProviderCall::*;
    match (phase, call) {
        (ToStop, Skip) => Some(Step::Issue { next: ToDelete }),
        (ToStop, Shutdown | Stop) => Some(Step::Issue { next: Stopping }),
        (Stopping, Stop) | (Deleting, Delete) => Some(Step::Reissue),
        (Stopping, IsStopped) => Some(Step::Poll { next: ToDelete }),
        (ToDelete, Delete) => Some(Step::Issue { next: Deleting }),
        (Deleting, IsDeleted) => Some(Step::Poll { next: Deleted }),
        _ => None,
    }
}

fn count_retry(
    record: &mut ResourceRecord,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
    duration: Duration,
    detail: &str,
) -> Directive {
    record.retries = record.retries.saturating_add(1);
    if policy.retryable_exhausted(record.retries) {
        fail(record, now, "retry budget exhausted", detail);
        Directive::Fail
    } else {
        record.next_check = policy.next_check(now, duration, false);
        Directive::Retry
    }
}

fn enter(record: &mut ResourceRecord, to: Phase, now: DateTime<Utc>) {
    record.phase = to;
    record.retries = 0;
    record.retries_to_retry = 0;
    record.fatal_retries = 0;
    record.last_state_change = now;
    record.last_error = None;
}

fn fail(record: &mut ResourceRecord, now: DateTime<Utc>, reason: &str, detail: &str) {
    let summary = format!(
        "{reason} in {} after {} retries, {} fatal: {detail}",
        record.phase, record.retries, record.fatal_retries
    );
    enter(record, Phase::Failed, now);
    record.last_error = Some(summary);
}
