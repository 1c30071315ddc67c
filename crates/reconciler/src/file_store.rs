//! JSON-file record store.
//!
//! The whole queue lives in one JSON document. Every operation takes an
//! advisory lock on a sidecar `.lock` file, reloads the document and, for
//! mutations, rewrites it through a temp file and a rename before letting
//! go. Several processes can therefore share one state file: an enqueue from
//! one is never overwritten by another, and two workers never claim the same
//! record.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::store::{RecordStore, RecordTable};
use crate::types::{Group, Lease, ResourceId, ResourceRecord, WorkerId};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    records: Vec<ResourceRecord>,
}

#[derive(Debug, Clone, Copy)]
enum LockMode {
    Shared,
    Exclusive,
}

/// Record store persisted to a JSON file.
pub struct FileRecordStore {
    path: PathBuf,
    lock_path: PathBuf,
    /// Serializes this process's operations before they queue on the file lock.
    gate: Mutex<()>,
}

impl FileRecordStore {
    /// Open the store at `path`, starting empty if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns `Error::StoreFailed` if the lock file cannot be created, or
    /// the state file exists but cannot be read or has an unsupported
    /// version.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let store = Self {
            lock_path: path.with_extension("lock"),
            path,
            gate: Mutex::new(()),
        };

        let records = store.read("open", |t| t.list().len()).await?;
        tracing::debug!(path = %store.path.display(), records, "Opened record file");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block on the sidecar lock file. The lock is held until the returned
    /// file is dropped.
    async fn lock(&self, mode: LockMode, operation: &str) -> Result<File> {
        let lock_path = self.lock_path.clone();
        let locked = tokio::task::spawn_blocking(move || -> std::io::Result<File> {
            if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&lock_path)?;
            match mode {
                LockMode::Shared => FileExt::lock_shared(&file)?,
                LockMode::Exclusive => FileExt::lock_exclusive(&file)?,
            }
            Ok(file)
        })
        .await
        .map_err(|e| Error::store_failed(operation, e.to_string()))?;

        locked.map_err(|e| {
            Error::store_failed(operation, format!("{}: {e}", self.lock_path.display()))
        })
    }

    async fn load(&self, operation: &str) -> Result<RecordTable> {
        let snapshot: Option<Snapshot> = teardown_core::fs::read_json_if_exists(&self.path)
            .await
            .map_err(|e| Error::store_failed(operation, e.to_string()))?;

        match snapshot {
            Some(s) if s.version == SNAPSHOT_VERSION => Ok(RecordTable::from_records(s.records)),
            Some(s) => Err(Error::store_failed(
                operation,
                format!("unsupported snapshot version {}", s.version),
            )),
            None => Ok(RecordTable::default()),
        }
    }

    async fn persist(&self, table: &RecordTable, operation: &str) -> Result<()> {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            records: table.list(),
        };
        teardown_core::fs::write_json_atomic(&self.path, &snapshot)
            .await
            .map_err(|e| Error::store_failed(operation, e.to_string()))
    }

    async fn read<T>(&self, operation: &str, view: impl FnOnce(&RecordTable) -> T) -> Result<T> {
        let _gate = self.gate.lock().await;
        let _lock = self.lock(LockMode::Shared, operation).await?;
        let table = self.load(operation).await?;
        Ok(view(&table))
    }

    /// Reload the table under the exclusive lock, apply `change` and write
    /// it back. A rejected change leaves the file untouched.
    async fn mutate<T>(
        &self,
        operation: &str,
        change: impl FnOnce(&mut RecordTable) -> Result<T>,
    ) -> Result<T> {
        let _gate = self.gate.lock().await;
        let _lock = self.lock(LockMode::Exclusive, operation).await?;
        let mut table = self.load(operation).await?;
        let value = change(&mut table)?;
        self.persist(&table, operation).await?;
        Ok(value)
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn insert(&self, record: ResourceRecord) -> Result<()> {
        self.mutate("insert", |t| t.insert(record)).await
    }

    async fn get(&self, id: &ResourceId) -> Result<Option<ResourceRecord>> {
        self.read("get", |t| t.get(id)).await
    }

    async fn list(&self) -> Result<Vec<ResourceRecord>> {
        self.read("list", RecordTable::list).await
    }

    async fn claim_due(
        &self,
        group: Group,
        now: DateTime<Utc>,
        lease: &Lease,
        limit: usize,
    ) -> Result<Vec<ResourceRecord>> {
        self.mutate("claim_due", |t| Ok(t.claim_due(group, now, lease, limit)))
            .await
    }

    async fn commit(&self, record: ResourceRecord, owner: &WorkerId) -> Result<()> {
        self.mutate("commit", |t| t.commit(record, owner)).await
    }

    async fn release(&self, id: &ResourceId, owner: &WorkerId) -> Result<()> {
        self.mutate("release", |t| t.release(id, owner)).await
    }

    async fn remove(&self, id: &ResourceId) -> Result<Option<ResourceRecord>> {
        self.mutate("remove", |t| Ok(t.remove(id))).await
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn should_start_empty_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRecordStore::open(dir.path().join("queue.json"))
            .await
            .unwrap();

        assert!(store.list().await.unwrap().is_empty());
        assert!(!store.path().exists());
        assert!(dir.path().join("queue.lock").exists());
    }

    #[tokio::test]
    async fn should_reject_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        tokio::fs::write(&path, br#"{"version": 99, "records": []}"#)
            .await
            .unwrap();

        let result = FileRecordStore::open(&path).await;
        assert!(matches!(result, Err(Error::StoreFailed { .. })));
    }

    #[tokio::test]
    async fn should_leave_file_untouched_on_rejected_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let store = FileRecordStore::open(&path).await.unwrap();
        let now = Utc::now();
        store
            .insert(ResourceRecord::new(ResourceId::new("vm-1"), "static", now))
            .await
            .unwrap();
        let before = tokio::fs::read(&path).await.unwrap();

        let dup = store
            .insert(ResourceRecord::new(ResourceId::new("vm-1"), "static", now))
            .await;

        assert!(dup.is_err());
        assert_eq!(tokio::fs::read(&path).await.unwrap(), before);
    }

    #[tokio::test]
    async fn should_see_records_written_after_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let reader = FileRecordStore::open(&path).await.unwrap();
        let writer = FileRecordStore::open(&path).await.unwrap();

        writer
            .insert(ResourceRecord::new(ResourceId::new("vm-1"), "static", Utc::now()))
            .await
            .unwrap();

        assert!(reader.get(&ResourceId::new("vm-1")).await.unwrap().is_some());
    }
}
