//! Read-only queue inspection.
//!
//! A [`QueueReport`] counts records per phase and lists every record that
//! still matters to an operator: the ones in flight and the FAILED ones.
//! DELETED records only show up in the counts.

use std::collections::BTreeMap;
use std::io::Write;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::store::RecordStore;
use crate::types::{Phase, ResourceId, ResourceRecord};

const CSV_HEADER: &str = "id,provider,phase,created,age_in_phase_secs,next_check,\
next_check_in_secs,retries,retries_to_retry,fatal_retries,last_check_duration_ms,last_error";

/// One record as shown in a report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportEntry {
    pub id: ResourceId,
    pub provider: String,
    pub phase: Phase,
    pub created: DateTime<Utc>,
    pub age_in_phase_secs: i64,
    pub next_check: DateTime<Utc>,
    /// Negative when the record is overdue.
    pub next_check_in_secs: i64,
    pub retries: u32,
    pub retries_to_retry: u32,
    pub fatal_retries: u32,
    pub last_check_duration_ms: u64,
    pub last_error: Option<String>,
}

impl ReportEntry {
    fn from_record(record: &ResourceRecord, now: DateTime<Utc>) -> Self {
        Self {
            id: record.id().clone(),
            provider: record.provider().to_string(),
            phase: record.phase(),
            created: record.created(),
            age_in_phase_secs: record.age_in_phase(now).num_seconds(),
            next_check: record.next_check(),
            next_check_in_secs: record.next_check().signed_duration_since(now).num_seconds(),
            retries: record.retries(),
            retries_to_retry: record.retries_to_retry(),
            fatal_retries: record.fatal_retries(),
            last_check_duration_ms: u64::try_from(record.last_check_duration().as_millis())
                .unwrap_or(u64::MAX),
            last_error: record.last_error().map(str::to_string),
        }
    }

    fn write_csv_row<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        writeln!(
            out,
            "{},{},{},{},{},{},{},{},{},{},{},{}",
            csv_field(self.id.as_str()),
            csv_field(&self.provider),
            self.phase,
            self.created.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.age_in_phase_secs,
            self.next_check.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.next_check_in_secs,
            self.retries,
            self.retries_to_retry,
            self.fatal_retries,
            self.last_check_duration_ms,
            csv_field(self.last_error.as_deref().unwrap_or_default()),
        )
    }
}

/// Snapshot of the deletion queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueReport {
    pub generated_at: DateTime<Utc>,
    /// Record count per phase; every phase is present.
    pub depth: BTreeMap<Phase, usize>,
    /// Non-DELETED records, earliest next check first.
    pub entries: Vec<ReportEntry>,
}

impl QueueReport {
    /// Build a report from records already in hand.
    pub fn build(records: &[ResourceRecord], now: DateTime<Utc>) -> Self {
        let mut depth: BTreeMap<Phase, usize> = Phase::ALL.iter().map(|p| (*p, 0)).collect();
        for record in records {
            *depth.entry(record.phase()).or_default() += 1;
        }

        let mut entries: Vec<ReportEntry> = records
            .iter()
            .filter(|r| r.phase() != Phase::Deleted)
            .map(|r| ReportEntry::from_record(r, now))
            .collect();
        entries.sort_by(|a, b| a.next_check.cmp(&b.next_check).then_with(|| a.id.cmp(&b.id)));

        Self {
            generated_at: now,
            depth,
            entries,
        }
    }

    /// Read the store and build a report. Takes no lease.
    ///
    /// # Errors
    ///
    /// Returns a store error if the queue cannot be listed.
    pub async fn collect(store: &dyn RecordStore, now: DateTime<Utc>) -> Result<Self> {
        let records = store.list().await?;
        Ok(Self::build(&records, now))
    }

    /// Records in `phase`.
    pub fn depth_of(&self, phase: Phase) -> usize {
        self.depth.get(&phase).copied().unwrap_or_default()
    }

    /// Records not yet in a terminal phase.
    pub fn in_flight(&self) -> usize {
        self.depth
            .iter()
            .filter(|(phase, _)| !phase.is_terminal())
            .map(|(_, count)| count)
            .sum()
    }

    /// Header line, one row per entry, a blank line, then `phase,count` rows.
    ///
    /// # Errors
    ///
    /// Returns any error raised by the sink.
    pub fn write_csv<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        writeln!(out, "{CSV_HEADER}")?;
        for entry in &self.entries {
            entry.write_csv_row(out)?;
        }
        writeln!(out)?;
        writeln!(out, "phase,count")?;
        for (phase, count) in &self.depth {
            writeln!(out, "{phase},{count}")?;
        }
        Ok(())
    }

    /// Pretty JSON document.
    ///
    /// # Errors
    ///
    /// Returns `Error::StoreFailed` if encoding or the sink fails.
    pub fn write_json<W: Write>(&self, out: &mut W) -> Result<()> {
        serde_json::to_writer_pretty(&mut *out, self)
            .map_err(|e| Error::store_failed("report", e.to_string()))?;
        writeln!(out).map_err(|e| Error::store_failed("report", e.to_string()))
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn records(now: DateTime<Utc>) -> Vec<ResourceRecord> {
        let mut stopping = ResourceRecord::new(ResourceId::new("b"), "static", now);
        stopping.phase = Phase::Stopping;
        stopping.retries = 4;
        stopping.last_error = Some("busy, try later".to_string());

        let mut failed = ResourceRecord::new(ResourceId::new("c"), "static", now);
        failed.phase = Phase::Failed;

        let mut deleted = ResourceRecord::new(ResourceId::new("d"), "static", now);
        deleted.phase = Phase::Deleted;

        vec![
            ResourceRecord::new(ResourceId::new("a"), "static", now),
            stopping,
            failed,
            deleted,
        ]
    }

    #[test]
    fn test_depth_counts_every_phase() {
        let now = Utc::now();
        let report = QueueReport::build(&records(now), now);

        assert_eq!(report.depth.len(), Phase::ALL.len());
        assert_eq!(report.depth_of(Phase::ToStop), 1);
        assert_eq!(report.depth_of(Phase::Deleted), 1);
        assert_eq!(report.depth_of(Phase::Deleting), 0);
        assert_eq!(report.in_flight(), 2);
    }

    #[test]
    fn test_failed_listed_deleted_hidden() {
        let now = Utc::now();
        let report = QueueReport::build(&records(now), now);

        let ids: Vec<&str> = report.entries.iter().map(|e| e.id.as_str()).collect();
        assert!(ids.contains(&"c"));
        assert!(!ids.contains(&"d"));
    }

    #[test]
    fn test_age_in_phase() {
        let then = Utc::now();
        let now = then + chrono::Duration::seconds(90);
        let report = QueueReport::build(&records(then), now);

        assert!(report.entries.iter().all(|e| e.age_in_phase_secs == 90));
        assert!(report.entries.iter().all(|e| e.next_check_in_secs == -90));
    }

    #[test]
    fn test_csv_header_first_and_quoting() {
        let now = Utc::now();
        let report = QueueReport::build(&records(now), now);
        let mut out = Vec::new();
        report.write_csv(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("id,provider,phase,"));
        assert!(text.contains("\"busy, try later\""));
        assert!(text.contains("\nphase,count\n"));
        assert!(text.contains("FAILED,1"));
    }

    #[test]
    fn test_json_is_parseable() {
        let now = Utc::now();
        let report = QueueReport::build(&records(now), now);
        let mut out = Vec::new();
        report.write_json(&mut out).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["depth"]["STOPPING"], 1);
        assert_eq!(value["entries"].as_array().map(Vec::len), Some(3));
    }
}
