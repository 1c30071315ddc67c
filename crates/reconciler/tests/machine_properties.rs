//! Phase machine and backoff properties.
//!
//! Tests verify that:
//! - Terminal records are never planned again
//! - `retries` is zero right after every phase change
//! - Budgets trip at exactly cap + 1 outcomes
//! - Backoff delay never shrinks as calls get slower, and stays capped

use std::time::Duration;

use chrono::{DateTime, Utc};
use proptest::prelude::*;
use teardown_reconciler::machine::{apply, plan};
use teardown_reconciler::{
    Capabilities, DeletionConfig, OperationOutcome, Phase, ResourceId, ResourceRecord,
    RetryPolicy,
};

/// Test helper: Unwrap a Result or panic with context
fn unwrap_result<T, E: std::fmt::Display>(result: std::result::Result<T, E>, context: &str) -> T {
    match result {
        Ok(value) => value,
        Err(e) => panic!("{}: {}", context, e),
    }
}

/// Plan and apply one outcome; `None` once the record is terminal.
fn drive(
    record: &mut ResourceRecord,
    outcome: &OperationOutcome,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
    duration: Duration,
) -> Option<teardown_reconciler::Transition> {
    let call = plan(record, Capabilities::default(), policy)?;
    Some(unwrap_result(
        apply(record, call, outcome, policy, now, duration),
        "planned call must apply",
    ))
}

fn outcome_strategy() -> impl Strategy<Value = OperationOutcome> {
    prop_oneof![
        4 => Just(OperationOutcome::Success),
        4 => Just(OperationOutcome::Pending),
        1 => Just(OperationOutcome::Gone),
        3 => "[a-z]{1,8}".prop_map(OperationOutcome::RetryableError),
        2 => "[a-z]{1,8}".prop_map(OperationOutcome::FatalError),
    ]
}

#[test]
fn exactly_budget_plus_one_retryable_errors_reach_failed() {
    // GIVEN: A fresh record under the default budget of 8192
    let policy = RetryPolicy::from_config(&DeletionConfig::default());
    let now = Utc::now();
    let mut record = ResourceRecord::new(ResourceId::new("vm-1"), "p", now);

    // WHEN: 8192 retryable errors
    for _ in 0..8192 {
        drive(&mut record, &OperationOutcome::retryable("busy"), &policy, now, Duration::ZERO);
    }

    // THEN: Still alive; one more fails it
    assert_eq!(record.phase(), Phase::ToStop);
    assert_eq!(record.retries(), 8192);
    drive(&mut record, &OperationOutcome::retryable("busy"), &policy, now, Duration::ZERO);
    assert_eq!(record.phase(), Phase::Failed);
}

#[test]
fn exactly_budget_plus_one_fatal_errors_reach_failed_in_every_phase() {
    let policy = RetryPolicy::default();
    let now = Utc::now();

    // Success from TO_STOP/STOPPING/TO_DELETE walks one phase forward each time.
    for advance in 0..4 {
        let mut record = ResourceRecord::new(ResourceId::new("vm-1"), "p", now);
        for _ in 0..advance {
            drive(&mut record, &OperationOutcome::Success, &policy, now, Duration::ZERO);
        }
        let phase = record.phase();

        for _ in 0..16 {
            drive(&mut record, &OperationOutcome::fatal("x"), &policy, now, Duration::ZERO);
        }
        assert_eq!(record.phase(), phase);

        drive(&mut record, &OperationOutcome::fatal("x"), &policy, now, Duration::ZERO);
        assert_eq!(record.phase(), Phase::Failed, "from {phase}");
    }
}

proptest! {
    /// Property: counters and phases obey their invariants for any outcome sequence
    #[test]
    fn prop_machine_invariants(outcomes in prop::collection::vec(outcome_strategy(), 1..200)) {
        let policy = RetryPolicy::default();
        let mut now = Utc::now();
        let mut record = ResourceRecord::new(ResourceId::new("vm-1"), "p", now);

        for outcome in &outcomes {
            let before = record.clone();
            let Some(transition) = drive(&mut record, outcome, &policy, now, Duration::ZERO) else {
                // Terminal: nothing may change any more
                prop_assert!(before.is_terminal());
                prop_assert!(plan(&record, Capabilities::default(), &policy).is_none());
                continue;
            };

            if transition.changed_phase() {
                prop_assert_eq!(record.retries(), 0);
                prop_assert_eq!(record.retries_to_retry(), 0);
                prop_assert!(transition.from.can_transition_to(transition.to));
            }
            if !record.is_terminal() {
                prop_assert!(record.retries() <= 8192);
                prop_assert!(record.fatal_retries() <= 16);
                prop_assert!(record.next_check() >= now);
            }
            now += chrono::Duration::seconds(100);
        }
    }

    /// Property: a slower call never yields an earlier next check, and the delay is capped
    #[test]
    fn prop_backoff_monotonic_and_capped(
        a_ms in 0u64..600_000,
        b_ms in 0u64..600_000,
        fatal in any::<bool>(),
    ) {
        let policy = RetryPolicy::default();
        let (fast, slow) = if a_ms <= b_ms { (a_ms, b_ms) } else { (b_ms, a_ms) };

        let d_fast = policy.next_delay(Duration::from_millis(fast), fatal);
        let d_slow = policy.next_delay(Duration::from_millis(slow), fatal);

        prop_assert!(d_fast <= d_slow);
        prop_assert!(d_slow <= policy.max_delay(fatal));
        prop_assert!(d_fast >= policy.next_delay(Duration::ZERO, fatal));
    }

    /// Property: fatal errors always wait at least as long as retryable ones
    #[test]
    fn prop_fatal_delay_not_shorter(ms in 0u64..600_000) {
        let policy = RetryPolicy::default();
        let d = Duration::from_millis(ms);
        prop_assert!(policy.next_delay(d, true) >= policy.next_delay(d, false));
    }
}
