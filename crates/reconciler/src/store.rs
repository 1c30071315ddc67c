//! Record store trait and implementations.
//!
//! The store is the only place a record's lease is granted or checked:
//! `claim_due` hands out leases atomically and `commit` refuses a write from
//! anyone but the current holder. That is what keeps a resource to at most
//! one in-flight provider call, even with several workers on one store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::types::{Group, Lease, ResourceId, ResourceRecord, WorkerId};

/// Trait for record storage backends.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Add a new record; fails if the id is already present.
    async fn insert(&self, record: ResourceRecord) -> Result<()>;

    /// Fetch one record.
    async fn get(&self, id: &ResourceId) -> Result<Option<ResourceRecord>>;

    /// Every record, sorted by id.
    async fn list(&self) -> Result<Vec<ResourceRecord>>;

    /// Lease up to `limit` due records of `group`, earliest `next_check`
    /// first. Records under a live lease are skipped.
    async fn claim_due(
        &self,
        group: Group,
        now: DateTime<Utc>,
        lease: &Lease,
        limit: usize,
    ) -> Result<Vec<ResourceRecord>>;

    /// Persist a processed record and drop its lease.
    async fn commit(&self, record: ResourceRecord, owner: &WorkerId) -> Result<()>;

    /// Drop a lease without changing the record.
    async fn release(&self, id: &ResourceId, owner: &WorkerId) -> Result<()>;

    /// Delete a record; returns it if it existed.
    async fn remove(&self, id: &ResourceId) -> Result<Option<ResourceRecord>>;
}

/// Record map with the claim and lease rules shared by every backend.
#[derive(Debug, Default, Clone)]
pub(crate) struct RecordTable {
    records: HashMap<ResourceId, ResourceRecord>,
}

impl RecordTable {
    pub(crate) fn from_records(records: Vec<ResourceRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.id.clone(), r)).collect(),
        }
    }

    pub(crate) fn insert(&mut self, record: ResourceRecord) -> Result<()> {
        if self.records.contains_key(&record.id) {
            return Err(Error::duplicate_record(record.id.as_str()));
        }
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    pub(crate) fn get(&self, id: &ResourceId) -> Option<ResourceRecord> {
        self.records.get(id).cloned()
    }

    pub(crate) fn list(&self) -> Vec<ResourceRecord> {
        self.records
            .values()
            .sorted_by(|a, b| a.id.cmp(&b.id))
            .cloned()
            .collect()
    }

    pub(crate) fn claim_due(
        &mut self,
        group: Group,
        now: DateTime<Utc>,
        lease: &Lease,
        limit: usize,
    ) -> Vec<ResourceRecord> {
        let ids: Vec<ResourceId> = self
            .records
            .values()
            .filter(|r| r.group() == Some(group) && r.is_claimable(now))
            .sorted_by(|a, b| a.next_check.cmp(&b.next_check).then_with(|| a.id.cmp(&b.id)))
            .take(limit)
            .map(|r| r.id.clone())
            .collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(record) = self.records.get_mut(id) {
                record.set_lease(lease.clone());
                claimed.push(record.clone());
            }
        }
        claimed
    }

    pub(crate) fn commit(&mut self, mut record: ResourceRecord, owner: &WorkerId) -> Result<()> {
        let stored = self
            .records
            .get_mut(&record.id)
            .ok_or_else(|| Error::record_not_found(record.id.as_str()))?;
        if !stored.lease.as_ref().is_some_and(|l| l.is_held_by(owner)) {
            return Err(Error::lease_lost(record.id.as_str(), owner.as_str()));
        }
        record.clear_lease();
        *stored = record;
        Ok(())
    }

    pub(crate) fn release(&mut self, id: &ResourceId, owner: &WorkerId) -> Result<()> {
        let stored = self
            .records
            .get_mut(id)
            .ok_or_else(|| Error::record_not_found(id.as_str()))?;
        match stored.lease.as_ref() {
            Some(lease) if lease.is_held_by(owner) => {
                stored.clear_lease();
                Ok(())
            }
            Some(_) => Err(Error::lease_lost(id.as_str(), owner.as_str())),
            None => Ok(()),
        }
    }

    pub(crate) fn remove(&mut self, id: &ResourceId) -> Option<ResourceRecord> {
        self.records.remove(id)
    }
}

/// In-memory record store.
#[derive(Default)]
pub struct InMemoryRecordStore {
    table: RwLock<RecordTable>,
}

impl InMemoryRecordStore {
    /// Create a new in-memory record store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new in-memory record store wrapped in an Arc.
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert(&self, record: ResourceRecord) -> Result<()> {
        self.table.write().await.insert(record)
    }

    async fn get(&self, id: &ResourceId) -> Result<Option<ResourceRecord>> {
        Ok(self.table.read().await.get(id))
    }

    async fn list(&self) -> Result<Vec<ResourceRecord>> {
        Ok(self.table.read().await.list())
    }

    async fn claim_due(
        &self,
        group: Group,
        now: DateTime<Utc>,
        lease: &Lease,
        limit: usize,
    ) -> Result<Vec<ResourceRecord>> {
        Ok(self.table.write().await.claim_due(group, now, lease, limit))
    }

    async fn commit(&self, record: ResourceRecord, owner: &WorkerId) -> Result<()> {
        self.table.write().await.commit(record, owner)
    }

    async fn release(&self, id: &ResourceId, owner: &WorkerId) -> Result<()> {
        self.table.write().await.release(id, owner)
    }

    async fn remove(&self, id: &ResourceId) -> Result<Option<ResourceRecord>> {
        Ok(self.table.write().await.remove(id))
    }
}

/// A wrapper that adds tracing to a record store.
pub struct TracingRecordStore<S: RecordStore> {
    inner: S,
}

impl<S: RecordStore> TracingRecordStore<S> {
    /// Create a new tracing record store.
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: RecordStore> RecordStore for TracingRecordStore<S> {
    async fn insert(&self, record: ResourceRecord) -> Result<()> {
        tracing::debug!(
            resource_id = %record.id(),
            provider = record.provider(),
            "Inserting record"
        );
        self.inner.insert(record).await
    }

    async fn get(&self, id: &ResourceId) -> Result<Option<ResourceRecord>> {
        self.inner.get(id).await
    }

    async fn list(&self) -> Result<Vec<ResourceRecord>> {
        self.inner.list().await
    }

    async fn claim_due(
        &self,
        group: Group,
        now: DateTime<Utc>,
        lease: &Lease,
        limit: usize,
    ) -> Result<Vec<ResourceRecord>> {
        let result = self.inner.claim_due(group, now, lease, limit).await;
        if let Ok(ref claimed) = result {
            tracing::debug!(
                group = %group,
                owner = %lease.owner,
                claimed = claimed.len(),
                "Claimed due records"
            );
        }
        result
    }

    async fn commit(&self, record: ResourceRecord, owner: &WorkerId) -> Result<()> {
        tracing::debug!(
            resource_id = %record.id(),
            phase = %record.phase(),
            owner = %owner,
            "Committing record"
        );
        let id = record.id().clone();
        let result = self.inner.commit(record, owner).await;
        if let Err(ref e) = result {
            tracing::trace!(resource_id = %id, error = %e, "Commit rejected");
        }
        result
    }

    async fn release(&self, id: &ResourceId, owner: &WorkerId) -> Result<()> {
        tracing::debug!(resource_id = %id, owner = %owner, "Releasing lease");
        self.inner.release(id, owner).await
    }

    async fn remove(&self, id: &ResourceId) -> Result<Option<ResourceRecord>> {
        tracing::debug!(resource_id = %id, "Removing record");
        self.inner.remove(id).await
    }
}
