//! In-process fakes for the remote collaborators and a store wrapper that
//! replays concurrent interleavings, shared by engine, job and router tests.

use crate::mockup::{MockupError, MockupMode, MockupSource};
use crate::shopify::{
    ExternalProduct, GatewayError, ImageRef, NewImage, NewProduct, Order, OrderFilter,
    StoreGateway, products::ExternalVariant,
};
use crate::store::{
    DedupKey, ExternalId, LockToken, MemoryStore, NewProductRecord, ProductRecord, RecordStore,
    StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct FakeGateway {
    next_id: AtomicU64,
    live: Mutex<HashSet<ExternalId>>,
    created: Mutex<Vec<NewProduct>>,
    attached: Mutex<Vec<(ExternalId, NewImage)>>,
    delete_calls: AtomicUsize,
    order_calls: AtomicUsize,
    fail_attach: bool,
    create_error: Option<fn() -> GatewayError>,
    transient_deletes: HashSet<ExternalId>,
    orders: Vec<Order>,
    order_filters: Mutex<Vec<OrderFilter>>,
}

impl Default for FakeGateway {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(9000),
            live: Mutex::new(HashSet::new()),
            created: Mutex::new(Vec::new()),
            attached: Mutex::new(Vec::new()),
            delete_calls: AtomicUsize::new(0),
            order_calls: AtomicUsize::new(0),
            fail_attach: false,
            create_error: None,
            transient_deletes: HashSet::new(),
            orders: Vec::new(),
            order_filters: Mutex::new(Vec::new()),
        }
    }
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failing_attach(mut self) -> Self {
        self.fail_attach = true;
        self
    }

    pub fn with_create_error(mut self, error: fn() -> GatewayError) -> Self {
        self.create_error = Some(error);
        self
    }

    pub fn with_live_products(self, ids: &[ExternalId]) -> Self {
        self.live
            .lock()
            .unwrap()
            .extend(ids.iter().copied());
        self
    }

    pub fn with_transient_delete(mut self, id: ExternalId) -> Self {
        self.transient_deletes.insert(id);
        self
    }

    pub fn with_orders(mut self, orders: Vec<Order>) -> Self {
        self.orders = orders;
        self
    }

    pub fn created(&self) -> Vec<NewProduct> {
        self.created.lock().unwrap().clone()
    }

    pub fn attached(&self) -> Vec<(ExternalId, NewImage)> {
        self.attached.lock().unwrap().clone()
    }

    pub fn create_calls(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn attach_calls(&self) -> usize {
        self.attached.lock().unwrap().len()
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn order_calls(&self) -> usize {
        self.order_calls.load(Ordering::SeqCst)
    }

    pub fn order_filters(&self) -> Vec<OrderFilter> {
        self.order_filters.lock().unwrap().clone()
    }

    pub fn is_live(&self, id: ExternalId) -> bool {
        self.live.lock().unwrap().contains(&id)
    }
}

#[async_trait]
impl StoreGateway for FakeGateway {
    async fn create_product(&self, product: &NewProduct) -> Result<ExternalProduct, GatewayError> {
        self.created.lock().unwrap().push(product.clone());
        if let Some(error) = self.create_error {
            return Err(error());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.live.lock().unwrap().insert(id);
        Ok(ExternalProduct {
            id,
            handle: product.handle.clone(),
            variants: vec![ExternalVariant { id: id * 10 }],
        })
    }

    async fn attach_image(
        &self,
        product_id: ExternalId,
        image: &NewImage,
    ) -> Result<ImageRef, GatewayError> {
        let mut attached = self.attached.lock().unwrap();
        attached.push((product_id, image.clone()));
        if self.fail_attach {
            return Err(GatewayError::Transient("HTTP 503: attach unavailable".into()));
        }
        Ok(ImageRef {
            id: attached.len() as u64,
            position: image.position,
            src: None,
        })
    }

    async fn delete_product(&self, product_id: ExternalId) -> Result<(), GatewayError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.transient_deletes.contains(&product_id) {
            return Err(GatewayError::Transient("HTTP 429: slow down".into()));
        }
        if self.live.lock().unwrap().remove(&product_id) {
            Ok(())
        } else {
            Err(GatewayError::NotFound)
        }
    }

    async fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, GatewayError> {
        self.order_calls.fetch_add(1, Ordering::SeqCst);
        self.order_filters.lock().unwrap().push(filter.clone());
        Ok(self.orders.clone())
    }
}

/// Renderer stand-in returning a fixed payload, or failing.
pub struct FakeMockups {
    payload: Result<Vec<u8>, fn() -> MockupError>,
    calls: AtomicUsize,
}

impl FakeMockups {
    pub fn returning(payload: Vec<u8>) -> Self {
        Self {
            payload: Ok(payload),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: fn() -> MockupError) -> Self {
        Self {
            payload: Err(error),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MockupSource for FakeMockups {
    async fn build_mockup(
        &self,
        sources: &[String],
        _mode: MockupMode,
        _cache_key: &str,
    ) -> Result<Vec<u8>, MockupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if sources.is_empty() {
            return Err(MockupError::NoSources);
        }
        match &self.payload {
            Ok(bytes) => Ok(bytes.clone()),
            Err(error) => Err(error()),
        }
    }

    fn describe(&self, _sources: &[String], mode: MockupMode, cache_key: &str) -> Option<String> {
        Some(format!("https://render.test/{mode:?}?v={cache_key}"))
    }

    fn refill_image_url(&self, image: &str) -> String {
        format!("https://render.test/imgrefill.php?albumImg={image}")
    }
}

/// Id reported by [`HookedStore::with_phantom_conflict`]; no record has it.
pub const PHANTOM_OWNER: u64 = 999_999;

/// [`MemoryStore`] wrapper that injects what a concurrent request or job
/// would do between two of our calls.
pub struct HookedStore {
    inner: Arc<MemoryStore>,
    stale_lookup: bool,
    phantom_conflicts: AtomicUsize,
    revive_after_scan: Option<ChronoDuration>,
}

impl HookedStore {
    pub fn wrapping(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            stale_lookup: false,
            phantom_conflicts: AtomicUsize::new(0),
            revive_after_scan: None,
        }
    }

    /// Key lookups always miss, as if the owner was inserted right after.
    pub fn with_stale_lookup(mut self) -> Self {
        self.stale_lookup = true;
        self
    }

    /// The next insert reports a conflict with an owner that is already gone.
    pub fn with_phantom_conflict(self) -> Self {
        self.phantom_conflicts.store(1, Ordering::SeqCst);
        self
    }

    /// Every record returned by `expired` is refreshed to `now + ttl` before
    /// the caller sees it.
    pub fn with_revive_after_scan(mut self, ttl: ChronoDuration) -> Self {
        self.revive_after_scan = Some(ttl);
        self
    }
}

#[async_trait]
impl RecordStore for HookedStore {
    async fn find_by_key(&self, key: &DedupKey) -> Result<Option<ProductRecord>, StoreError> {
        if self.stale_lookup {
            return Ok(None);
        }
        self.inner.find_by_key(key).await
    }

    async fn find_by_catalog_url(
        &self,
        catalog_url: &str,
    ) -> Result<Vec<ProductRecord>, StoreError> {
        self.inner.find_by_catalog_url(catalog_url).await
    }

    async fn insert(&self, record: NewProductRecord) -> Result<ProductRecord, StoreError> {
        let phantom = self
            .phantom_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if phantom {
            return Err(StoreError::Conflict {
                existing: Some(PHANTOM_OWNER),
            });
        }
        self.inner.insert(record).await
    }

    async fn set_expiry(
        &self,
        id: u64,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<ProductRecord>, StoreError> {
        self.inner.set_expiry(id, expires_at).await
    }

    async fn expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProductRecord>, StoreError> {
        let due = self.inner.expired(now, limit).await?;
        if let Some(ttl) = self.revive_after_scan {
            for record in &due {
                self.inner.set_expiry(record.id, Utc::now() + ttl).await?;
            }
        }
        Ok(due)
    }

    async fn claim_expired(
        &self,
        id: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<ProductRecord>, StoreError> {
        self.inner.claim_expired(id, now).await
    }

    async fn release_claim(&self, id: u64) -> Result<(), StoreError> {
        self.inner.release_claim(id).await
    }

    async fn delete(&self, id: u64) -> Result<bool, StoreError> {
        self.inner.delete(id).await
    }

    async fn extend_by_external_ids(
        &self,
        external_ids: &[ExternalId],
        expires_at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        self.inner.extend_by_external_ids(external_ids, expires_at).await
    }

    async fn try_acquire_job_lock(
        &self,
        job: &str,
        ttl: Duration,
    ) -> Result<Option<LockToken>, StoreError> {
        self.inner.try_acquire_job_lock(job, ttl).await
    }

    async fn release_job_lock(&self, job: &str, token: &str) -> Result<bool, StoreError> {
        self.inner.release_job_lock(job, token).await
    }
}
