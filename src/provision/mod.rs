//! Product lifecycle engine: dedup lookup, mockup, remote create, image
//! attach, local record with a TTL, plus explicit keep.

pub mod families;

use crate::mockup::fetcher::cache_key;
use crate::mockup::{AssetFormat, MockupError, MockupMode, MockupSource, Transcoded, Transcoder};
use crate::models::{BundleRequest, KeepRequest, KeychainRequest, ProductRequest, ProductType};
use crate::shopify::products::ProductStatus;
use crate::shopify::{
    ExternalProduct, GatewayError, ImageSource, NewImage, NewProduct, NewVariant, StoreGateway,
};
use crate::store::{DedupKey, NewProductRecord, ProductRecord, RecordStore, StoreError};
use chrono::{Duration, Utc};
use families::{ProductFamily, REFRESH_TTL_MINUTES, bundle, family};
use std::{future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{error, info, warn};

/// Base64 payloads this short cannot be a real image.
const MIN_ATTACHMENT_CHARS: usize = 100;

#[derive(Debug, Error)]
#[error("step `{step}` failed: {message}")]
pub struct ProvisionError {
    step: &'static str,
    message: String,
    kind: ProvisionErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionErrorKind {
    InvalidInput,
    AssetFetchFailed,
    NotFound,
    RemoteTransient,
    RemoteFatal,
    Storage,
}

impl ProvisionErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionErrorKind::InvalidInput => "invalid_input",
            ProvisionErrorKind::AssetFetchFailed => "asset_fetch_failed",
            ProvisionErrorKind::NotFound => "not_found",
            ProvisionErrorKind::RemoteTransient => "remote_transient",
            ProvisionErrorKind::RemoteFatal => "remote_fatal",
            ProvisionErrorKind::Storage => "storage",
        }
    }
}

impl ProvisionError {
    fn new(step: &'static str, message: impl Into<String>, kind: ProvisionErrorKind) -> Self {
        Self {
            step,
            message: message.into(),
            kind,
        }
    }

    pub fn invalid_input(step: &'static str, message: impl Into<String>) -> Self {
        Self::new(step, message, ProvisionErrorKind::InvalidInput)
    }

    pub fn asset_fetch(step: &'static str, err: MockupError) -> Self {
        Self::new(step, err.to_string(), ProvisionErrorKind::AssetFetchFailed)
    }

    pub fn not_found(step: &'static str, message: impl Into<String>) -> Self {
        Self::new(step, message, ProvisionErrorKind::NotFound)
    }

    pub fn storage(step: &'static str, err: StoreError) -> Self {
        Self::new(step, err.to_string(), ProvisionErrorKind::Storage)
    }

    /// A `NotFound` outside of delete means the request itself was wrong.
    pub fn remote(step: &'static str, err: GatewayError) -> Self {
        let kind = match err {
            GatewayError::Transient(_) => ProvisionErrorKind::RemoteTransient,
            GatewayError::NotFound | GatewayError::Fatal(_) => ProvisionErrorKind::RemoteFatal,
        };
        Self::new(step, err.to_string(), kind)
    }

    pub fn step(&self) -> &'static str {
        self.step
    }

    pub fn kind(&self) -> ProvisionErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

pub struct Provisioner {
    store: Arc<dyn RecordStore>,
    gateway: Arc<dyn StoreGateway>,
    mockups: Arc<dyn MockupSource>,
    transcoder: Transcoder,
    storefront_base: String,
}

impl Provisioner {
    pub fn new(
        store: Arc<dyn RecordStore>,
        gateway: Arc<dyn StoreGateway>,
        mockups: Arc<dyn MockupSource>,
        transcoder: Transcoder,
        storefront_base: &str,
    ) -> Self {
        Self {
            store,
            gateway,
            mockups,
            transcoder,
            storefront_base: storefront_base.trim_end_matches('/').to_string(),
        }
    }

    fn storefront_url(&self, handle: &str) -> String {
        format!("{}/products/{handle}", self.storefront_base)
    }

    /// Returns the live record for the request's dedup key, creating the
    /// remote product first when none exists.
    pub async fn submit(
        &self,
        request: &ProductRequest,
        product_type: ProductType,
    ) -> Result<ProductRecord, ProvisionError> {
        request.validate()?;
        let family = family(product_type);
        if !family.deduplicated {
            return Err(ProvisionError::invalid_input(
                "validate",
                format!("{}_requires_keychain_endpoint", product_type.as_str()),
            ));
        }

        let catalog_url = request.catalog_url.trim();
        let key = DedupKey::new(product_type, catalog_url);
        let existing = timed("lookup", self.store.find_by_key(&key))
            .await
            .map_err(|err| ProvisionError::storage("lookup", err))?;
        // An expired record is the sweeper's; it is never handed out again.
        let now = Utc::now();
        if let Some(existing) = existing.filter(|record| record.expires_at > now)
            && let Some(refreshed) = self.refresh(existing.id).await?
        {
            info!(
                target = "bridge.provision",
                record_id = refreshed.id,
                product_type = product_type.as_str(),
                "duplicate_submit_refreshed"
            );
            crate::metrics::provision_outcome(product_type.as_str(), "refreshed");
            return Ok(refreshed);
        }

        let sources = vec![request.image_ref.trim().to_string()];
        let mode = MockupMode::for_product(product_type);
        let cache = cache_key(request.id.as_deref(), Some(catalog_url));
        let raw = timed("mockup", self.mockups.build_mockup(&sources, mode, &cache))
            .await
            .map_err(|err| {
                warn!(
                    target = "bridge.provision",
                    product_type = product_type.as_str(),
                    error = %err,
                    "mockup_unavailable"
                );
                crate::metrics::provision_outcome(product_type.as_str(), "asset_failed");
                ProvisionError::asset_fetch("mockup", err)
            })?;
        let asset = self.transcode(raw).await;

        let handle = family.handle(&request.title, &request.artist);
        let product = album_product(family, request, &handle);
        let created = self.create_remote(&product).await?;

        let image = NewImage {
            source: ImageSource::from_bytes(&asset.bytes),
            filename: format!("mockup_{handle}.{}", asset.format.extension()),
            position: Some(1),
        };
        self.attach_tolerant(created.id, &image).await;

        let now = Utc::now();
        let record = NewProductRecord {
            external_product_id: created.id,
            variant_id: created.first_variant_id(),
            product_type,
            title: request.title.trim().to_string(),
            artist: request.artist.trim().to_string(),
            source_image_ref: self.mockups.describe(&sources, mode, &cache),
            catalog_url: Some(catalog_url.to_string()),
            storefront_url: self.storefront_url(&created.handle),
            expires_at: now + family.initial_ttl(),
        };

        match self.store.insert(record.clone()).await {
            Ok(stored) => {
                info!(
                    target = "bridge.provision",
                    record_id = stored.id,
                    product_id = stored.external_product_id,
                    product_type = product_type.as_str(),
                    "product_provisioned"
                );
                crate::metrics::provision_outcome(product_type.as_str(), "created");
                Ok(stored)
            }
            Err(StoreError::Conflict { existing }) => {
                self.resolve_conflict(&key, existing, &created, record).await
            }
            Err(err) => {
                error!(
                    target = "bridge.provision",
                    product_id = created.id,
                    error = %err,
                    "record_persist_failed"
                );
                self.discard_remote(created.id).await;
                Err(ProvisionError::storage("persist", err))
            }
        }
    }

    /// A concurrent submit claimed the key between lookup and insert. A
    /// live winner is reused and our remote product discarded; a winner
    /// that vanished meanwhile leaves the key to us, so the insert is retried.
    async fn resolve_conflict(
        &self,
        key: &DedupKey,
        existing: Option<u64>,
        created: &ExternalProduct,
        record: NewProductRecord,
    ) -> Result<ProductRecord, ProvisionError> {
        let product_type = key.product_type.as_str();
        let winner = match existing {
            Some(id) => Ok(Some(id)),
            None => self
                .store
                .find_by_key(key)
                .await
                .map(|found| found.map(|record| record.id)),
        };
        let refreshed = match winner {
            Ok(Some(id)) => self.refresh(id).await,
            Ok(None) => Ok(None),
            Err(err) => Err(ProvisionError::storage("persist", err)),
        };
        let refreshed = match refreshed {
            Ok(refreshed) => refreshed,
            Err(err) => {
                self.discard_remote(created.id).await;
                return Err(err);
            }
        };

        if let Some(refreshed) = refreshed {
            warn!(
                target = "bridge.provision",
                product_id = created.id,
                winner = refreshed.id,
                "dedup_race_lost"
            );
            self.discard_remote(created.id).await;
            crate::metrics::provision_outcome(product_type, "race_lost");
            return Ok(refreshed);
        }

        match self.store.insert(record).await {
            Ok(stored) => {
                info!(
                    target = "bridge.provision",
                    record_id = stored.id,
                    product_id = stored.external_product_id,
                    vanished = ?existing,
                    product_type,
                    "dedup_key_taken_over"
                );
                crate::metrics::provision_outcome(product_type, "created");
                Ok(stored)
            }
            Err(err) => {
                error!(
                    target = "bridge.provision",
                    product_id = created.id,
                    error = %err,
                    "record_persist_failed"
                );
                self.discard_remote(created.id).await;
                Err(ProvisionError::storage("persist", err))
            }
        }
    }

    async fn refresh(&self, id: u64) -> Result<Option<ProductRecord>, ProvisionError> {
        let expires_at = Utc::now() + Duration::minutes(REFRESH_TTL_MINUTES);
        self.store
            .set_expiry(id, expires_at)
            .await
            .map_err(|err| ProvisionError::storage("refresh", err))
    }

    /// Extends every live record for the catalog URL (optionally one family)
    /// to `now + keep TTL` of that record's family.
    pub async fn keep(&self, request: &KeepRequest) -> Result<Vec<ProductRecord>, ProvisionError> {
        request.validate()?;
        let catalog_url = request.catalog_url.trim();
        let candidates = self
            .store
            .find_by_catalog_url(catalog_url)
            .await
            .map_err(|err| ProvisionError::storage("keep", err))?;
        let now = Utc::now();
        let matching: Vec<ProductRecord> = candidates
            .into_iter()
            .filter(|record| record.expires_at > now)
            .filter(|record| {
                request
                    .product_type
                    .is_none_or(|wanted| record.product_type == wanted)
            })
            .collect();
        if matching.is_empty() {
            return Err(ProvisionError::not_found("keep", "no_record_for_catalog_url"));
        }

        let mut kept = Vec::with_capacity(matching.len());
        for record in matching {
            let expires_at = now + family(record.product_type).keep_ttl();
            let updated = self
                .store
                .set_expiry(record.id, expires_at)
                .await
                .map_err(|err| ProvisionError::storage("keep", err))?;
            if let Some(updated) = updated {
                kept.push(updated);
            }
        }
        if kept.is_empty() {
            return Err(ProvisionError::not_found("keep", "no_record_for_catalog_url"));
        }
        info!(
            target = "bridge.provision",
            count = kept.len(),
            "records_kept"
        );
        Ok(kept)
    }

    /// Custom keychains: never deduplicated, the composed mockup is optional.
    pub async fn submit_keychain(
        &self,
        request: &KeychainRequest,
        product_type: ProductType,
    ) -> Result<ProductRecord, ProvisionError> {
        request.validate()?;
        if !matches!(
            product_type,
            ProductType::Keychain | ProductType::CoupleKeychain
        ) {
            return Err(ProvisionError::invalid_input(
                "validate",
                format!("{}_is_not_a_keychain", product_type.as_str()),
            ));
        }
        let family = family(product_type);
        let album = &request.album;
        let catalog_url = album
            .catalog_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty());

        let mode = MockupMode::for_product(product_type);
        let cache = cache_key(None, catalog_url);
        let mockup = match timed(
            "mockup",
            self.mockups
                .build_mockup(&request.uploaded_images, mode, &cache),
        )
        .await
        {
            Ok(raw) => Some(self.transcode(raw).await),
            Err(err) => {
                warn!(
                    target = "bridge.provision",
                    product_type = product_type.as_str(),
                    error = %err,
                    "keychain_mockup_skipped"
                );
                None
            }
        };

        let handle = family.handle(&album.title, &album.artist);
        let product = NewProduct {
            title: family.title(&album.title),
            vendor: album.artist.trim().to_string(),
            product_type: family.store_type.to_string(),
            status: ProductStatus::Active,
            handle,
            body_html: families::keychain_body_html(album.artist.trim()),
            published_scope: family.published_scope(),
            tags: family.tags(),
            template_suffix: None,
            variants: vec![NewVariant::untracked(family.price, family.compare_at_price)],
            images: Vec::new(),
        };
        let created = self.create_remote(&product).await?;

        let mut position = 1;
        if let Some(asset) = &mockup {
            let image = NewImage {
                source: ImageSource::from_bytes(&asset.bytes),
                filename: format!("keychain_mockup.{}", asset.format.extension()),
                position: Some(position),
            };
            self.attach_tolerant(created.id, &image).await;
            position += 1;
        }
        for (index, upload) in request.uploaded_images.iter().enumerate() {
            let Some(source) = upload_source(upload) else {
                warn!(
                    target = "bridge.provision",
                    product_id = created.id,
                    index,
                    "user_image_too_short_skipped"
                );
                continue;
            };
            let image = NewImage {
                source,
                filename: format!("keychain_{index}.png"),
                position: Some(position + index as u32),
            };
            self.attach_tolerant(created.id, &image).await;
        }

        let now = Utc::now();
        let record = NewProductRecord {
            external_product_id: created.id,
            variant_id: created.first_variant_id(),
            product_type,
            title: album.title.trim().to_string(),
            artist: album.artist.trim().to_string(),
            source_image_ref: request
                .uploaded_images
                .iter()
                .map(|upload| upload.trim())
                .find(|upload| is_http_url(upload))
                .map(str::to_string),
            catalog_url: catalog_url.map(str::to_string),
            storefront_url: self.storefront_url(&created.handle),
            expires_at: now + family.initial_ttl(),
        };
        let stored = self.store.insert(record).await.map_err(|err| {
            error!(
                target = "bridge.provision",
                product_id = created.id,
                error = %err,
                "record_persist_failed"
            );
            ProvisionError::storage("persist", err)
        })?;

        info!(
            target = "bridge.provision",
            record_id = stored.id,
            product_id = stored.external_product_id,
            product_type = product_type.as_str(),
            customer = request.customer_id.as_deref().unwrap_or("guest"),
            mockup = mockup.is_some(),
            "keychain_provisioned"
        );
        crate::metrics::provision_outcome(product_type.as_str(), "created");
        Ok(stored)
    }

    /// Refill bundles are created with remote-src images and keep no record.
    pub async fn create_bundle(&self, request: &BundleRequest) -> Result<String, ProvisionError> {
        request.validate()?;
        let handle = format!("{}-bundle", families::slugify(&request.title));
        let images = request
            .images
            .iter()
            .enumerate()
            .map(|(index, image)| NewImage {
                source: ImageSource::remote(self.mockups.refill_image_url(image)),
                filename: format!("bundle_{index}.jpg"),
                position: None,
            })
            .collect();
        let product = NewProduct {
            title: format!("{} {}", request.title.trim(), bundle::TITLE_SUFFIX),
            vendor: bundle::VENDOR.to_string(),
            product_type: bundle::STORE_TYPE.to_string(),
            status: ProductStatus::Active,
            handle,
            body_html: families::bundle_body_html(&request.artists, &request.spotify_urls),
            published_scope: None,
            tags: None,
            template_suffix: Some(bundle::TEMPLATE_SUFFIX.to_string()),
            variants: vec![NewVariant::untracked(bundle::PRICE, bundle::COMPARE_AT_PRICE)],
            images,
        };
        let created = self.create_remote(&product).await?;
        info!(
            target = "bridge.provision",
            product_id = created.id,
            images = request.images.len(),
            "bundle_created"
        );
        crate::metrics::provision_outcome("bundle", "created");
        Ok(self.storefront_url(&created.handle))
    }

    async fn create_remote(&self, product: &NewProduct) -> Result<ExternalProduct, ProvisionError> {
        timed("create_product", self.gateway.create_product(product))
            .await
            .map_err(|err| {
                error!(
                    target = "bridge.provision",
                    handle = %product.handle,
                    error = %err,
                    "product_create_failed"
                );
                ProvisionError::remote("create_product", err)
            })
    }

    /// Attach failures after create are logged and never unwind the product.
    async fn attach_tolerant(&self, product_id: u64, image: &NewImage) {
        let attached = timed("attach_image", self.gateway.attach_image(product_id, image)).await;
        if let Err(err) = attached {
            warn!(
                target = "bridge.provision",
                product_id,
                filename = %image.filename,
                error = %err,
                "image_attach_failed"
            );
            crate::metrics::provision_outcome("image", "attach_failed");
        }
    }

    async fn discard_remote(&self, product_id: u64) {
        match self.gateway.delete_product(product_id).await {
            Ok(()) | Err(GatewayError::NotFound) => {}
            Err(err) => warn!(
                target = "bridge.provision",
                product_id,
                error = %err,
                "orphan_product_delete_failed"
            ),
        }
    }

    /// CPU-bound; falls back to the raw bytes if the blocking task dies.
    async fn transcode(&self, raw: Vec<u8>) -> Transcoded {
        let transcoder = self.transcoder;
        let started = Instant::now();
        let fallback = raw.clone();
        let result = tokio::task::spawn_blocking(move || transcoder.transcode(&raw)).await;
        crate::metrics::stage_elapsed("transcode", started.elapsed().as_millis());
        result.unwrap_or_else(|err| {
            warn!(target = "bridge.provision", error = %err, "transcode_task_failed");
            Transcoded {
                format: AssetFormat::detect(&fallback),
                bytes: fallback,
            }
        })
    }
}

fn album_product(family: &ProductFamily, request: &ProductRequest, handle: &str) -> NewProduct {
    NewProduct {
        title: family.title(&request.title),
        vendor: request.artist.trim().to_string(),
        product_type: family.store_type.to_string(),
        status: ProductStatus::Active,
        handle: handle.to_string(),
        body_html: families::album_body_html(request.artist.trim(), request.catalog_url.trim()),
        published_scope: family.published_scope(),
        tags: family.tags(),
        template_suffix: None,
        variants: vec![NewVariant::untracked(family.price, family.compare_at_price)],
        images: Vec::new(),
    }
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// URLs go remote-src; data URIs and bare base64 upload inline.
fn upload_source(upload: &str) -> Option<ImageSource> {
    let upload = upload.trim();
    if is_http_url(upload) {
        return Some(ImageSource::remote(upload));
    }
    let payload = match upload.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map(|(_, data)| data)?,
        None => upload,
    };
    let payload = payload.replace(' ', "+");
    (payload.len() > MIN_ATTACHMENT_CHARS).then(|| ImageSource::from_base64(payload))
}

async fn timed<T, E, Fut>(step: &'static str, fut: Fut) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
{
    let started = Instant::now();
    let outcome = fut.await;
    crate::metrics::stage_elapsed(step, started.elapsed().as_millis());
    outcome
}
