use super::{
    DedupKey, ExternalId, LockToken, NewProductRecord, ProductRecord, RecordStore, StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Process-local store used in tests and when no Redis is configured.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    records: BTreeMap<u64, ProductRecord>,
    dedup: HashMap<DedupKey, u64>,
    claimed: HashSet<u64>,
    locks: HashMap<String, (LockToken, Instant)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    pub async fn get(&self, id: u64) -> Option<ProductRecord> {
        self.inner.lock().await.records.get(&id).cloned()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn find_by_key(&self, key: &DedupKey) -> Result<Option<ProductRecord>, StoreError> {
        let guard = self.inner.lock().await;
        Ok(guard
            .dedup
            .get(key)
            .and_then(|id| guard.records.get(id))
            .cloned())
    }

    async fn find_by_catalog_url(
        &self,
        catalog_url: &str,
    ) -> Result<Vec<ProductRecord>, StoreError> {
        let guard = self.inner.lock().await;
        Ok(guard
            .records
            .values()
            .filter(|record| record.catalog_url.as_deref() == Some(catalog_url))
            .cloned()
            .collect())
    }

    async fn insert(&self, record: NewProductRecord) -> Result<ProductRecord, StoreError> {
        let mut guard = self.inner.lock().await;
        let now = Utc::now();
        let key = record.dedup_key();
        if let Some(key) = &key
            && let Some(owner) = guard.dedup.get(key).copied()
            && guard
                .records
                .get(&owner)
                .is_some_and(|existing| existing.expires_at > now)
        {
            return Err(StoreError::Conflict {
                existing: Some(owner),
            });
        }
        guard.next_id += 1;
        let id = guard.next_id;
        let stored = record.into_record(id, now);
        if let Some(key) = key {
            guard.dedup.insert(key, id);
        }
        guard.records.insert(id, stored.clone());
        Ok(stored)
    }

    async fn set_expiry(
        &self,
        id: u64,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<ProductRecord>, StoreError> {
        let mut guard = self.inner.lock().await;
        if guard.claimed.contains(&id) {
            return Ok(None);
        }
        Ok(guard.records.get_mut(&id).map(|record| {
            record.expires_at = expires_at;
            record.clone()
        }))
    }

    async fn expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProductRecord>, StoreError> {
        let guard = self.inner.lock().await;
        let mut due: Vec<ProductRecord> = guard
            .records
            .values()
            .filter(|record| record.expires_at < now)
            .cloned()
            .collect();
        due.sort_by_key(|record| (record.expires_at, record.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn claim_expired(
        &self,
        id: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<ProductRecord>, StoreError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let Some(record) = inner.records.get(&id) else {
            return Ok(None);
        };
        if record.expires_at >= now || !inner.claimed.insert(id) {
            return Ok(None);
        }
        Ok(Some(record.clone()))
    }

    async fn release_claim(&self, id: u64) -> Result<(), StoreError> {
        self.inner.lock().await.claimed.remove(&id);
        Ok(())
    }

    async fn delete(&self, id: u64) -> Result<bool, StoreError> {
        let mut guard = self.inner.lock().await;
        guard.claimed.remove(&id);
        let Some(record) = guard.records.remove(&id) else {
            return Ok(false);
        };
        if let Some(key) = record.dedup_key()
            && guard.dedup.get(&key) == Some(&id)
        {
            guard.dedup.remove(&key);
        }
        Ok(true)
    }

    async fn extend_by_external_ids(
        &self,
        external_ids: &[ExternalId],
        expires_at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut guard = self.inner.lock().await;
        let Inner {
            records, claimed, ..
        } = &mut *guard;
        let mut touched = 0;
        for record in records.values_mut() {
            if external_ids.contains(&record.external_product_id) && !claimed.contains(&record.id)
            {
                record.expires_at = expires_at;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn try_acquire_job_lock(
        &self,
        job: &str,
        ttl: Duration,
    ) -> Result<Option<LockToken>, StoreError> {
        let mut guard = self.inner.lock().await;
        let now = Instant::now();
        if let Some((_, until)) = guard.locks.get(job)
            && *until > now
        {
            return Ok(None);
        }
        let token = Uuid::new_v4().to_string();
        guard
            .locks
            .insert(job.to_string(), (token.clone(), now + ttl));
        Ok(Some(token))
    }

    async fn release_job_lock(&self, job: &str, token: &str) -> Result<bool, StoreError> {
        let mut guard = self.inner.lock().await;
        match guard.locks.get(job) {
            Some((owner, _)) if owner == token => {
                guard.locks.remove(job);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
