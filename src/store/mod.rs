//! Durable product records and the indexes the lifecycle needs: dedup key,
//! catalog URL, external product id and expiry.

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

#[cfg(test)]
pub(crate) mod contract;

use crate::models::ProductType;
use crate::provision::families::family;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Store-assigned product id on the remote shop.
pub type ExternalId = u64;

/// Proof of job lock ownership, handed back on release.
pub type LockToken = String;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("dedup key already claimed by record {existing:?}")]
    Conflict { existing: Option<u64> },
    #[error("store backend failed: {0}")]
    Backend(String),
    #[error("stored record is unreadable: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub product_type: ProductType,
    pub catalog_url: String,
}

impl DedupKey {
    pub fn new(product_type: ProductType, catalog_url: impl Into<String>) -> Self {
        Self {
            product_type,
            catalog_url: catalog_url.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProductRecord {
    pub id: u64,
    pub external_product_id: ExternalId,
    pub variant_id: Option<u64>,
    pub product_type: ProductType,
    pub title: String,
    pub artist: String,
    pub source_image_ref: Option<String>,
    pub catalog_url: Option<String>,
    pub storefront_url: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ProductRecord {
    /// Only deduplicated families with a catalog reference claim a key.
    pub fn dedup_key(&self) -> Option<DedupKey> {
        dedup_key_for(self.product_type, self.catalog_url.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct NewProductRecord {
    pub external_product_id: ExternalId,
    pub variant_id: Option<u64>,
    pub product_type: ProductType,
    pub title: String,
    pub artist: String,
    pub source_image_ref: Option<String>,
    pub catalog_url: Option<String>,
    pub storefront_url: String,
    pub expires_at: DateTime<Utc>,
}

impl NewProductRecord {
    pub fn dedup_key(&self) -> Option<DedupKey> {
        dedup_key_for(self.product_type, self.catalog_url.as_deref())
    }

    pub fn into_record(self, id: u64, created_at: DateTime<Utc>) -> ProductRecord {
        ProductRecord {
            id,
            external_product_id: self.external_product_id,
            variant_id: self.variant_id,
            product_type: self.product_type,
            title: self.title,
            artist: self.artist,
            source_image_ref: self.source_image_ref,
            catalog_url: self.catalog_url,
            storefront_url: self.storefront_url,
            expires_at: self.expires_at,
            created_at,
        }
    }
}

fn dedup_key_for(product_type: ProductType, catalog_url: Option<&str>) -> Option<DedupKey> {
    if !family(product_type).deduplicated {
        return None;
    }
    catalog_url
        .filter(|url| !url.trim().is_empty())
        .map(|url| DedupKey::new(product_type, url))
}

/// Persistence seam shared by the engine and the background jobs.
///
/// Implementations must make `insert` reject a second live record for the
/// same [`DedupKey`] with [`StoreError::Conflict`]. A key whose owner is
/// expired or missing is taken over by the new record.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find_by_key(&self, key: &DedupKey) -> Result<Option<ProductRecord>, StoreError>;

    async fn find_by_catalog_url(&self, catalog_url: &str)
    -> Result<Vec<ProductRecord>, StoreError>;

    async fn insert(&self, record: NewProductRecord) -> Result<ProductRecord, StoreError>;

    /// Overwrites `expires_at`. Returns `None` when the record is gone or
    /// claimed by the sweeper.
    async fn set_expiry(
        &self,
        id: u64,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<ProductRecord>, StoreError>;

    /// Records with `expires_at < now`, oldest first, at most `limit`.
    async fn expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProductRecord>, StoreError>;

    /// Marks a record as being swept, only if it is still expired at `now`
    /// and not already claimed. Claimed records ignore every expiry write
    /// until [`RecordStore::release_claim`] or `delete`.
    async fn claim_expired(
        &self,
        id: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<ProductRecord>, StoreError>;

    async fn release_claim(&self, id: u64) -> Result<(), StoreError>;

    async fn delete(&self, id: u64) -> Result<bool, StoreError>;

    /// Overwrites `expires_at` for every unclaimed record whose external
    /// product is listed.
    async fn extend_by_external_ids(
        &self,
        external_ids: &[ExternalId],
        expires_at: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// `None` while another holder owns the lock.
    async fn try_acquire_job_lock(
        &self,
        job: &str,
        ttl: Duration,
    ) -> Result<Option<LockToken>, StoreError>;

    /// Releases only if `token` still owns the lock; `false` otherwise.
    async fn release_job_lock(&self, job: &str, token: &str) -> Result<bool, StoreError>;
}
