//! Behaviour every [`RecordStore`] backend must share. Each backend's test
//! module runs these against a fresh store.

use super::{ExternalId, NewProductRecord, RecordStore, StoreError};
use crate::models::ProductType;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

pub fn new_record(
    product_type: ProductType,
    catalog_url: &str,
    external: ExternalId,
    expires_at: DateTime<Utc>,
) -> NewProductRecord {
    NewProductRecord {
        external_product_id: external,
        variant_id: Some(external + 1),
        product_type,
        title: "Echoes".into(),
        artist: "Band X".into(),
        source_image_ref: Some("https://img/ex.png".into()),
        catalog_url: Some(catalog_url.into()),
        storefront_url: format!("https://shop.test/products/echoes-{external}"),
        expires_at,
    }
}

fn in_hours(hours: i64) -> DateTime<Utc> {
    Utc::now() + ChronoDuration::hours(hours)
}

pub async fn dedup_conflict_names_live_owner(store: &dyn RecordStore) {
    let url = "https://catalog/album/dedup";
    let first = store
        .insert(new_record(ProductType::Albumtag, url, 101, in_hours(1)))
        .await
        .expect("first insert");

    let err = store
        .insert(new_record(ProductType::Albumtag, url, 102, in_hours(1)))
        .await
        .expect_err("second live insert");
    assert!(matches!(err, StoreError::Conflict { existing: Some(id) } if id == first.id));

    // Same URL, other family: separate key.
    store
        .insert(new_record(ProductType::Airvinyl, url, 103, in_hours(1)))
        .await
        .expect("airvinyl insert");

    let key = first.dedup_key().expect("albumtag key");
    let owner = store.find_by_key(&key).await.unwrap().expect("owner");
    assert_eq!(owner.id, first.id);
    assert_eq!(owner.external_product_id, 101);
    assert_eq!(store.find_by_catalog_url(url).await.unwrap().len(), 2);
}

pub async fn keychains_never_claim_a_dedup_key(store: &dyn RecordStore) {
    let url = "https://catalog/album/keychain";
    for external in [201, 202] {
        let record = store
            .insert(new_record(ProductType::Keychain, url, external, in_hours(1)))
            .await
            .expect("keychain insert");
        assert!(record.dedup_key().is_none());
    }
    assert_eq!(store.find_by_catalog_url(url).await.unwrap().len(), 2);
}

pub async fn expired_owner_gives_up_dedup_key(store: &dyn RecordStore) {
    let url = "https://catalog/album/takeover";
    let stale = store
        .insert(new_record(ProductType::Albumtag, url, 301, in_hours(-1)))
        .await
        .unwrap();
    let fresh = store
        .insert(new_record(ProductType::Albumtag, url, 302, in_hours(1)))
        .await
        .expect("expired owner must not block the key");
    assert_ne!(stale.id, fresh.id);

    let key = fresh.dedup_key().unwrap();
    assert_eq!(store.find_by_key(&key).await.unwrap().unwrap().id, fresh.id);

    // Sweeping the old record leaves the new owner's key alone.
    assert!(store.delete(stale.id).await.unwrap());
    assert_eq!(store.find_by_key(&key).await.unwrap().unwrap().id, fresh.id);
}

pub async fn expired_scan_is_strict_ordered_and_bounded(store: &dyn RecordStore) {
    let now = Utc::now();
    let mut ids = Vec::new();
    for (offset, external) in [(-1, 401), (-3, 402), (-2, 403), (0, 404), (1, 405)] {
        let record = store
            .insert(new_record(
                ProductType::Keychain,
                &format!("https://catalog/album/scan-{external}"),
                external,
                now + ChronoDuration::hours(offset),
            ))
            .await
            .unwrap();
        ids.push(record.id);
    }

    let due: Vec<u64> = store
        .expired(now, 10)
        .await
        .unwrap()
        .iter()
        .map(|record| record.id)
        .collect();
    assert_eq!(due, vec![ids[1], ids[2], ids[0]]);

    let bounded = store.expired(now, 2).await.unwrap();
    assert_eq!(bounded.len(), 2);
    assert_eq!(bounded[0].id, ids[1]);
}

pub async fn delete_releases_key_and_indexes(store: &dyn RecordStore) {
    let url = "https://catalog/album/delete";
    let record = store
        .insert(new_record(ProductType::Albumtag, url, 501, in_hours(-1)))
        .await
        .unwrap();
    let key = record.dedup_key().unwrap();

    assert!(store.delete(record.id).await.unwrap());
    assert!(!store.delete(record.id).await.unwrap());

    assert!(store.find_by_key(&key).await.unwrap().is_none());
    assert!(store.find_by_catalog_url(url).await.unwrap().is_empty());
    assert!(store.expired(in_hours(1), 10).await.unwrap().is_empty());
    assert_eq!(
        store
            .extend_by_external_ids(&[501], in_hours(24))
            .await
            .unwrap(),
        0
    );
    store
        .insert(new_record(ProductType::Albumtag, url, 502, in_hours(1)))
        .await
        .expect("key is free after delete");
}

pub async fn extend_by_external_ids_overwrites_expiry(store: &dyn RecordStore) {
    let url = "https://catalog/album/extend";
    for external in [601, 602, 603] {
        store
            .insert(new_record(ProductType::Keychain, url, external, in_hours(-1)))
            .await
            .unwrap();
    }
    let until = in_hours(24 * 30);
    let touched = store
        .extend_by_external_ids(&[601, 603, 999], until)
        .await
        .unwrap();
    assert_eq!(touched, 2);

    for record in store.find_by_catalog_url(url).await.unwrap() {
        if record.external_product_id == 602 {
            assert!(record.expires_at < Utc::now());
        } else {
            assert_eq!(record.expires_at, until);
        }
    }
}

pub async fn claim_blocks_expiry_writes_until_released(store: &dyn RecordStore) {
    let url = "https://catalog/album/claim";
    let record = store
        .insert(new_record(ProductType::Albumtag, url, 701, in_hours(-1)))
        .await
        .unwrap();

    assert!(store.claim_expired(999_999, Utc::now()).await.unwrap().is_none());
    let claimed = store
        .claim_expired(record.id, Utc::now())
        .await
        .unwrap()
        .expect("expired record is claimable");
    assert_eq!(claimed.id, record.id);
    assert!(store.claim_expired(record.id, Utc::now()).await.unwrap().is_none());

    assert!(store.set_expiry(record.id, in_hours(1)).await.unwrap().is_none());
    assert_eq!(
        store.extend_by_external_ids(&[701], in_hours(1)).await.unwrap(),
        0
    );

    store.release_claim(record.id).await.unwrap();
    let refreshed = store
        .set_expiry(record.id, in_hours(1))
        .await
        .unwrap()
        .expect("released record accepts writes");
    assert!(refreshed.expires_at > Utc::now());

    // Live again, so the sweeper cannot take it.
    assert!(store.claim_expired(record.id, Utc::now()).await.unwrap().is_none());
}

pub async fn job_lock_release_requires_owner_token(store: &dyn RecordStore) {
    let stale = store
        .try_acquire_job_lock("sweep", Duration::from_millis(1))
        .await
        .unwrap()
        .expect("free lock");
    tokio::time::sleep(Duration::from_millis(25)).await;

    let current = store
        .try_acquire_job_lock("sweep", Duration::from_secs(60))
        .await
        .unwrap()
        .expect("lapsed lock is free again");
    assert_ne!(stale, current);

    assert!(!store.release_job_lock("sweep", &stale).await.unwrap());
    assert!(
        store
            .try_acquire_job_lock("sweep", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        store
            .try_acquire_job_lock("extend_orders", Duration::from_secs(60))
            .await
            .unwrap()
            .is_some()
    );

    assert!(store.release_job_lock("sweep", &current).await.unwrap());
    assert!(
        store
            .try_acquire_job_lock("sweep", Duration::from_secs(60))
            .await
            .unwrap()
            .is_some()
    );
}
