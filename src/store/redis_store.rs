//! Redis layout (all keys under a configurable prefix):
//!
//! - `{p}:records:seq` counter for local ids
//! - `{p}:record:{id}` record JSON
//! - `{p}:dedup:{type}:{catalog_url}` id owning the dedup key
//! - `{p}:catalog:{catalog_url}` set of ids
//! - `{p}:external:{external_id}` id
//! - `{p}:expiry` sorted set of ids scored by `expires_at` epoch millis
//! - `{p}:sweeping:{id}` sweeper claim, `SET NX PX`
//! - `{p}:lock:{job}` job lock holding the owner token, `SET NX PX`
//!
//! Every write that touches more than one key runs as a Lua script so the
//! indexes never disagree with the record.

use super::{
    DedupKey, ExternalId, LockToken, NewProductRecord, ProductRecord, RecordStore, StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Script, aio::MultiplexedConnection};
use std::{sync::LazyLock, time::Duration};
use tracing::warn;
use uuid::Uuid;

/// A crashed sweeper's claim lapses after this long.
const CLAIM_TTL: Duration = Duration::from_secs(10 * 60);

// KEYS: record, expiry, external, dedup or '', catalog or ''
// ARGV: id, json, score, now_ms, record key prefix
static INSERT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if KEYS[4] ~= '' then
            local owner = redis.call('GET', KEYS[4])
            if owner then
                local expires = redis.call('ZSCORE', KEYS[2], owner)
                if expires and tonumber(expires) > tonumber(ARGV[4])
                    and redis.call('EXISTS', ARGV[5] .. owner) == 1 then
                    return tonumber(owner)
                end
            end
            redis.call('SET', KEYS[4], ARGV[1])
        end
        redis.call('SET', KEYS[1], ARGV[2])
        redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
        redis.call('SET', KEYS[3], ARGV[1])
        if KEYS[5] ~= '' then
            redis.call('SADD', KEYS[5], ARGV[1])
        end
        return 0
        ",
    )
});

// KEYS: record, expiry, claim
// ARGV: id, json, score
static SET_EXPIRY: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('EXISTS', KEYS[1]) == 0 or redis.call('EXISTS', KEYS[3]) == 1 then
            return 0
        end
        redis.call('SET', KEYS[1], ARGV[2])
        redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
        return 1
        ",
    )
});

// KEYS: record, expiry, claim
// ARGV: id, now_ms, claim ttl ms
static CLAIM: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local raw = redis.call('GET', KEYS[1])
        if not raw then
            return false
        end
        local expires = redis.call('ZSCORE', KEYS[2], ARGV[1])
        if not expires or tonumber(expires) >= tonumber(ARGV[2]) then
            return false
        end
        if not redis.call('SET', KEYS[3], '1', 'NX', 'PX', ARGV[3]) then
            return false
        end
        return raw
        ",
    )
});

// KEYS: record, expiry, claim, external or '', dedup or '', catalog or ''
// ARGV: id
static DELETE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local existed = redis.call('DEL', KEYS[1])
        redis.call('ZREM', KEYS[2], ARGV[1])
        redis.call('DEL', KEYS[3])
        if existed == 0 then
            return 0
        end
        if KEYS[4] ~= '' and redis.call('GET', KEYS[4]) == ARGV[1] then
            redis.call('DEL', KEYS[4])
        end
        if KEYS[5] ~= '' and redis.call('GET', KEYS[5]) == ARGV[1] then
            redis.call('DEL', KEYS[5])
        end
        if KEYS[6] ~= '' then
            redis.call('SREM', KEYS[6], ARGV[1])
        end
        return 1
        ",
    )
});

static RELEASE_LOCK: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        end
        return 0
        ",
    )
});

#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    prefix: String,
}

impl RedisStore {
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(backend)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)?;
        Ok(Self {
            conn,
            prefix: prefix.trim_end_matches(':').to_string(),
        })
    }

    fn seq_key(&self) -> String {
        format!("{}:records:seq", self.prefix)
    }

    fn record_prefix(&self) -> String {
        format!("{}:record:", self.prefix)
    }

    fn record_key(&self, id: u64) -> String {
        format!("{}{id}", self.record_prefix())
    }

    fn dedup_key(&self, key: &DedupKey) -> String {
        format!(
            "{}:dedup:{}:{}",
            self.prefix,
            key.product_type.as_str(),
            key.catalog_url
        )
    }

    fn catalog_key(&self, catalog_url: &str) -> String {
        format!("{}:catalog:{catalog_url}", self.prefix)
    }

    fn external_key(&self, external_id: ExternalId) -> String {
        format!("{}:external:{external_id}", self.prefix)
    }

    fn expiry_key(&self) -> String {
        format!("{}:expiry", self.prefix)
    }

    fn claim_key(&self, id: u64) -> String {
        format!("{}:sweeping:{id}", self.prefix)
    }

    fn lock_key(&self, job: &str) -> String {
        format!("{}:lock:{job}", self.prefix)
    }

    async fn load(&self, id: u64) -> Result<Option<ProductRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.record_key(id)).await.map_err(backend)?;
        raw.map(|json| decode(&json)).transpose()
    }

    /// Like `load`, but an unreadable record is dropped from the expiry
    /// index and reported as absent so one bad entry cannot stall a scan.
    async fn load_or_skip(&self, id: u64) -> Result<Option<ProductRecord>, StoreError> {
        match self.load(id).await {
            Err(StoreError::Corrupt(reason)) => {
                warn!(target = "bridge.store", id, reason = %reason, "corrupt_record_skipped");
                let mut conn = self.conn.clone();
                let _: Result<(), _> = conn.zrem(self.expiry_key(), id).await;
                Ok(None)
            }
            other => other,
        }
    }
}

#[async_trait]
impl RecordStore for RedisStore {
    async fn find_by_key(&self, key: &DedupKey) -> Result<Option<ProductRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let id: Option<u64> = conn.get(self.dedup_key(key)).await.map_err(backend)?;
        match id {
            Some(id) => self.load_or_skip(id).await,
            None => Ok(None),
        }
    }

    async fn find_by_catalog_url(
        &self,
        catalog_url: &str,
    ) -> Result<Vec<ProductRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<u64> = conn
            .smembers(self.catalog_key(catalog_url))
            .await
            .map_err(backend)?;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.load_or_skip(id).await? {
                records.push(record);
            }
        }
        records.sort_by_key(|record| record.id);
        Ok(records)
    }

    async fn insert(&self, record: NewProductRecord) -> Result<ProductRecord, StoreError> {
        let mut conn = self.conn.clone();
        let id: u64 = conn.incr(self.seq_key(), 1u64).await.map_err(backend)?;

        let now = Utc::now();
        let dedup = record
            .dedup_key()
            .map(|key| self.dedup_key(&key))
            .unwrap_or_default();
        let stored = record.into_record(id, now);
        let catalog = stored
            .catalog_url
            .as_deref()
            .map(|url| self.catalog_key(url))
            .unwrap_or_default();

        let mut invocation = INSERT.prepare_invoke();
        invocation
            .key(self.record_key(id))
            .key(self.expiry_key())
            .key(self.external_key(stored.external_product_id))
            .key(dedup)
            .key(catalog)
            .arg(id)
            .arg(encode(&stored)?)
            .arg(score(stored.expires_at))
            .arg(score(now))
            .arg(self.record_prefix());
        let owner: u64 = invocation.invoke_async(&mut conn).await.map_err(backend)?;
        if owner != 0 {
            return Err(StoreError::Conflict {
                existing: Some(owner),
            });
        }
        Ok(stored)
    }

    async fn set_expiry(
        &self,
        id: u64,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<ProductRecord>, StoreError> {
        let Some(mut record) = self.load_or_skip(id).await? else {
            return Ok(None);
        };
        record.expires_at = expires_at;

        let mut conn = self.conn.clone();
        let mut invocation = SET_EXPIRY.prepare_invoke();
        invocation
            .key(self.record_key(id))
            .key(self.expiry_key())
            .key(self.claim_key(id))
            .arg(id)
            .arg(encode(&record)?)
            .arg(score(expires_at));
        let written: i64 = invocation.invoke_async(&mut conn).await.map_err(backend)?;
        Ok((written == 1).then_some(record))
    }

    async fn expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProductRecord>, StoreError> {
        let mut conn = self.conn.clone();
        // `(` makes the upper bound exclusive: only expires_at < now.
        let upper = format!("({}", score(now));
        let ids: Vec<u64> = conn
            .zrangebyscore_limit(self.expiry_key(), "-inf", upper, 0, limit as isize)
            .await
            .map_err(backend)?;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load_or_skip(id).await? {
                Some(record) => records.push(record),
                None => {
                    warn!(target = "bridge.store", id, "expiry_index_orphan_removed");
                    let _: Result<(), _> = conn.zrem(self.expiry_key(), id).await;
                }
            }
        }
        Ok(records)
    }

    async fn claim_expired(
        &self,
        id: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<ProductRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = CLAIM.prepare_invoke();
        invocation
            .key(self.record_key(id))
            .key(self.expiry_key())
            .key(self.claim_key(id))
            .arg(id)
            .arg(score(now))
            .arg(CLAIM_TTL.as_millis() as u64);
        let raw: Option<String> = invocation.invoke_async(&mut conn).await.map_err(backend)?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        match decode(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                self.release_claim(id).await?;
                Err(err)
            }
        }
    }

    async fn release_claim(&self, id: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.claim_key(id)).await.map_err(backend)?;
        Ok(())
    }

    async fn delete(&self, id: u64) -> Result<bool, StoreError> {
        // An unreadable record still goes; only its secondary keys stay behind.
        let record = match self.load(id).await {
            Ok(Some(record)) => Some(record),
            Ok(None) => return Ok(false),
            Err(StoreError::Corrupt(reason)) => {
                warn!(target = "bridge.store", id, reason = %reason, "corrupt_record_deleted");
                None
            }
            Err(err) => return Err(err),
        };
        let external = record
            .as_ref()
            .map(|record| self.external_key(record.external_product_id))
            .unwrap_or_default();
        let dedup = record
            .as_ref()
            .and_then(ProductRecord::dedup_key)
            .map(|key| self.dedup_key(&key))
            .unwrap_or_default();
        let catalog = record
            .as_ref()
            .and_then(|record| record.catalog_url.as_deref())
            .map(|url| self.catalog_key(url))
            .unwrap_or_default();

        let mut conn = self.conn.clone();
        let mut invocation = DELETE.prepare_invoke();
        invocation
            .key(self.record_key(id))
            .key(self.expiry_key())
            .key(self.claim_key(id))
            .key(external)
            .key(dedup)
            .key(catalog)
            .arg(id);
        let removed: i64 = invocation.invoke_async(&mut conn).await.map_err(backend)?;
        Ok(removed == 1)
    }

    async fn extend_by_external_ids(
        &self,
        external_ids: &[ExternalId],
        expires_at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let mut touched = 0;
        for external in external_ids {
            let id: Option<u64> = conn
                .get(self.external_key(*external))
                .await
                .map_err(backend)?;
            if let Some(id) = id
                && self.set_expiry(id, expires_at).await?.is_some()
            {
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
        let mut conn = self.conn.clone();
        let token = Uuid::new_v4().to_string();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(job))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(reply.map(|_| token))
    }

    async fn release_job_lock(&self, job: &str, token: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = RELEASE_LOCK.prepare_invoke();
        invocation.key(self.lock_key(job)).arg(token);
        let removed: i64 = invocation.invoke_async(&mut conn).await.map_err(backend)?;
        Ok(removed == 1)
    }
}

fn score(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn encode(record: &ProductRecord) -> Result<String, StoreError> {
    serde_json::to_string(record).map_err(|err| StoreError::Corrupt(err.to_string()))
}

fn decode(json: &str) -> Result<ProductRecord, StoreError> {
    serde_json::from_str(json).map_err(|err| StoreError::Corrupt(err.to_string()))
}

fn backend(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}
