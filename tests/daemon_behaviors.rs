//! Daemon wiring tests: TOML configuration, JSON queue file and
//! command-line providers working together.
//!
//! Following BDD naming convention: given_<context>_when_<action>_then_<outcome>

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use chrono::{DateTime, Utc};
use teardown::commands::open_worker;
use teardown::settings::DaemonConfig;
use teardown_reconciler::{Phase, RecordStore, ResourceId};

type TestResult = anyhow::Result<()>;

fn later(now: DateTime<Utc>) -> DateTime<Utc> {
    now + chrono::Duration::seconds(200)
}

/// Configuration whose single provider runs `sh -c` snippets.
fn shell_config(state_file: &std::path::Path, delete: &str) -> anyhow::Result<DaemonConfig> {
    let doc = format!(
        r#"
state_file = "{state}"

[deletion]
max_deletions_at_once = 4

[[providers]]
name = "sh"
stop = ["sh", "-c", "exit 0"]
is_stopped = ["sh", "-c", "exit 0"]
delete = ["sh", "-c", "{delete}"]
is_deleted = ["sh", "-c", "exit 0"]
"#,
        state = state_file.display(),
    );
    DaemonConfig::from_toml_str(&doc)
}

#[cfg(unix)]
#[tokio::test]
async fn given_shell_provider_when_ticking_then_resource_is_deleted_and_persisted() -> TestResult {
    // GIVEN: A worker over a fresh queue file and an always-succeeding provider
    let dir = tempfile::tempdir()?;
    let state = dir.path().join("queue.json");
    let settings = shell_config(&state, "exit 0")?;
    let worker = open_worker(&settings).await?;
    let mut now = Utc::now();
    worker.enqueue_at(ResourceId::new("vm-1"), "sh", now).await?;

    // WHEN: Ticking once per phase
    for _ in 0..4 {
        worker.tick_at(now).await;
        now = later(now);
    }

    // THEN: A second worker reading the same file sees the record DELETED
    let reopened = open_worker(&settings).await?;
    let record = reopened.store().get(&ResourceId::new("vm-1")).await?;
    assert_eq!(record.map(|r| r.phase()), Some(Phase::Deleted));

    let purged = reopened.purge_terminal().await?;
    assert_eq!(purged, vec![ResourceId::new("vm-1")]);
    assert!(reopened.store().list().await?.is_empty());
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn given_tempfail_exit_when_deleting_then_record_retries_with_stderr_detail() -> TestResult {
    // GIVEN: A provider whose delete exits with EX_TEMPFAIL
    let dir = tempfile::tempdir()?;
    let settings = shell_config(
        &dir.path().join("queue.json"),
        "echo datastore locked >&2; exit 75",
    )?;
    let worker = open_worker(&settings).await?;
    let mut now = Utc::now();
    worker.enqueue_at(ResourceId::new("vm-1"), "sh", now).await?;

    // WHEN: Ticking through stop and into the first delete attempt
    for _ in 0..3 {
        worker.tick_at(now).await;
        now = later(now);
    }

    // THEN: The record waits in TO_DELETE with the tool's message
    let record = worker.store().get(&ResourceId::new("vm-1")).await?;
    let record = record.ok_or_else(|| anyhow::anyhow!("record vanished"))?;
    assert_eq!(record.phase(), Phase::ToDelete);
    assert_eq!(record.retries(), 1);
    assert_eq!(record.last_error(), Some("datastore locked"));
    Ok(())
}

#[tokio::test]
async fn given_no_providers_when_ticking_repeatedly_then_record_fails_and_reports() -> TestResult {
    // GIVEN: Default settings pointing at a temporary queue file
    let dir = tempfile::tempdir()?;
    let settings = DaemonConfig {
        state_file: dir.path().join("queue.json"),
        ..DaemonConfig::default()
    };
    let worker = open_worker(&settings).await?;
    let mut now = Utc::now();
    worker
        .enqueue_at(ResourceId::new("vm-1"), "vsphere", now)
        .await?;

    // WHEN: Ticking past the fatal error budget
    let mut failed = Vec::new();
    for _ in 0..17 {
        failed.extend(worker.tick_at(now).await.failed);
        now = later(now);
    }

    // THEN: The record fails and the CSV report names the cause
    assert_eq!(failed, vec![ResourceId::new("vm-1")]);
    let report = worker.report_at(now).await?;
    assert_eq!(report.depth_of(Phase::Failed), 1);

    let mut csv = Vec::new();
    report.write_csv(&mut csv)?;
    let csv = String::from_utf8(csv)?;
    assert!(csv.contains("vm-1,vsphere,FAILED"));
    assert!(csv.contains("unknown provider"));
    Ok(())
}

#[tokio::test]
async fn given_duplicate_enqueue_when_queue_is_reopened_then_one_record_remains() -> TestResult {
    // GIVEN: A resource queued through one worker
    let dir = tempfile::tempdir()?;
    let settings = DaemonConfig {
        state_file: dir.path().join("nested").join("queue.json"),
        ..DaemonConfig::default()
    };
    let worker = open_worker(&settings).await?;
    worker.enqueue(ResourceId::new("vm-1"), "vsphere").await?;

    // WHEN: Queuing it again through a second process
    let second = open_worker(&settings).await?;
    let duplicate = second.enqueue(ResourceId::new("vm-1"), "vsphere").await;

    // THEN: The second enqueue is rejected and the file holds one record
    assert!(duplicate.is_err());
    assert_eq!(second.store().list().await?.len(), 1);
    Ok(())
}
