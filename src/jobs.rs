//! Timer-driven batch jobs: the expiry sweeper and the order-driven retention
//! extender. Each run holds a store-level job lock so ticks never overlap.

use crate::config::JobsConfig;
use crate::provision::families::ORDER_HOLD_HOURS;
use crate::shopify::{GatewayError, OrderFilter, StoreGateway};
use crate::store::{RecordStore, StoreError};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::Serialize;
use std::{collections::BTreeSet, future::Future, sync::Arc, time::Duration as StdDuration};
use thiserror::Error;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub const SWEEP_JOB: &str = "sweep";
pub const EXTEND_JOB: &str = "extend_orders";

const SWEEP_LOCK_TTL: StdDuration = StdDuration::from_secs(10 * 60);
const EXTEND_LOCK_TTL: StdDuration = StdDuration::from_secs(30 * 60);

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Local records removed, including those whose product was already gone.
    pub deleted: usize,
    pub already_gone: usize,
    /// Refreshed between the scan and the claim; left alone.
    pub revived: usize,
    /// Left in place for the next tick.
    pub skipped: usize,
}

pub struct Sweeper {
    store: Arc<dyn RecordStore>,
    gateway: Arc<dyn StoreGateway>,
    batch: usize,
}

impl Sweeper {
    pub fn new(store: Arc<dyn RecordStore>, gateway: Arc<dyn StoreGateway>, batch: usize) -> Self {
        Self {
            store,
            gateway,
            batch: batch.max(1),
        }
    }

    /// Each record is claimed before its remote product is touched, so a
    /// concurrent refresh either lands first (and the record survives) or is
    /// refused. The local record only goes once the product is gone.
    pub async fn run_once(&self) -> Result<SweepReport, JobError> {
        let due = self.store.expired(Utc::now(), self.batch).await?;
        let mut report = SweepReport::default();

        for candidate in due {
            let record = match self.store.claim_expired(candidate.id, Utc::now()).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    debug!(target = "bridge.jobs", record_id = candidate.id, "sweep_record_revived");
                    report.revived += 1;
                    continue;
                }
                Err(err) => {
                    warn!(
                        target = "bridge.jobs",
                        record_id = candidate.id,
                        error = %err,
                        "sweep_claim_failed"
                    );
                    report.skipped += 1;
                    continue;
                }
            };

            let product_id = record.external_product_id;
            match self.gateway.delete_product(product_id).await {
                Ok(()) => {}
                Err(GatewayError::NotFound) => {
                    debug!(target = "bridge.jobs", product_id, "sweep_product_already_gone");
                    report.already_gone += 1;
                }
                Err(err) => {
                    warn!(
                        target = "bridge.jobs",
                        record_id = record.id,
                        product_id,
                        error = %err,
                        "sweep_remote_delete_failed"
                    );
                    if let Err(err) = self.store.release_claim(record.id).await {
                        warn!(
                            target = "bridge.jobs",
                            record_id = record.id,
                            error = %err,
                            "sweep_claim_release_failed"
                        );
                    }
                    report.skipped += 1;
                    continue;
                }
            }

            match self.store.delete(record.id).await {
                Ok(_) => report.deleted += 1,
                Err(err) => {
                    error!(
                        target = "bridge.jobs",
                        record_id = record.id,
                        error = %err,
                        "sweep_local_delete_failed"
                    );
                    report.skipped += 1;
                }
            }
        }

        crate::metrics::job_items(SWEEP_JOB, "deleted", report.deleted);
        crate::metrics::job_items(SWEEP_JOB, "revived", report.revived);
        crate::metrics::job_items(SWEEP_JOB, "skipped", report.skipped);
        info!(
            target = "bridge.jobs",
            deleted = report.deleted,
            already_gone = report.already_gone,
            revived = report.revived,
            skipped = report.skipped,
            "sweep_finished"
        );
        Ok(report)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExtendReport {
    pub orders: usize,
    pub products: usize,
    pub extended: usize,
}

pub struct OrderRetention {
    store: Arc<dyn RecordStore>,
    gateway: Arc<dyn StoreGateway>,
    window: Duration,
}

impl OrderRetention {
    pub fn new(
        store: Arc<dyn RecordStore>,
        gateway: Arc<dyn StoreGateway>,
        window_days: i64,
    ) -> Self {
        Self {
            store,
            gateway,
            window: Duration::days(window_days),
        }
    }

    /// Every record referenced by an unfulfilled order in the window gets
    /// `now + 48h`, whatever its current expiry.
    pub async fn run_once(&self) -> Result<ExtendReport, JobError> {
        let now = Utc::now();
        let filter = OrderFilter::unfulfilled_since(now - self.window);
        let orders = self.gateway.list_orders(&filter).await?;

        let ids: Vec<u64> = orders
            .iter()
            .flat_map(|order| order.product_ids())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let extended = if ids.is_empty() {
            0
        } else {
            self.store
                .extend_by_external_ids(&ids, now + Duration::hours(ORDER_HOLD_HOURS))
                .await?
        };

        let report = ExtendReport {
            orders: orders.len(),
            products: ids.len(),
            extended,
        };
        crate::metrics::job_items(EXTEND_JOB, "extended", extended);
        info!(
            target = "bridge.jobs",
            orders = report.orders,
            products = report.products,
            extended = report.extended,
            "order_retention_finished"
        );
        Ok(report)
    }
}

/// Runs `work` only when the job lock is free. `Ok(None)` means another
/// tick or process holds it.
pub async fn run_locked<T, Fut>(
    store: &dyn RecordStore,
    job: &'static str,
    ttl: StdDuration,
    work: Fut,
) -> Result<Option<T>, JobError>
where
    Fut: Future<Output = Result<T, JobError>>,
{
    let Some(token) = store.try_acquire_job_lock(job, ttl).await? else {
        debug!(target = "bridge.jobs", job, "job_lock_held_skip");
        return Ok(None);
    };
    let outcome = work.await;
    match store.release_job_lock(job, &token).await {
        Ok(true) => {}
        // Lapsed mid-run and possibly taken by someone else; theirs stays.
        Ok(false) => warn!(target = "bridge.jobs", job, "job_lock_expired_before_release"),
        Err(err) => warn!(target = "bridge.jobs", job, error = %err, "job_lock_release_failed"),
    }
    outcome.map(Some)
}

/// Next `hour:00` UTC strictly after `now`.
pub fn next_daily_run(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let at = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or_default();
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}

pub struct Scheduler {
    store: Arc<dyn RecordStore>,
    sweeper: Arc<Sweeper>,
    retention: Arc<OrderRetention>,
    config: JobsConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        gateway: Arc<dyn StoreGateway>,
        config: JobsConfig,
    ) -> Self {
        Self {
            sweeper: Arc::new(Sweeper::new(
                store.clone(),
                gateway.clone(),
                config.sweep_batch,
            )),
            retention: Arc::new(OrderRetention::new(
                store.clone(),
                gateway,
                config.order_window_days,
            )),
            store,
            config,
        }
    }

    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        info!(
            target = "bridge.jobs",
            sweep_every_secs = self.config.sweep_interval.as_secs(),
            extend_hour_utc = self.config.extend_hour_utc,
            "scheduler_started"
        );

        let sweep = {
            let store = self.store.clone();
            let sweeper = self.sweeper.clone();
            let period = self.config.sweep_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let run = sweeper.run_once();
                    if let Err(err) = run_locked(store.as_ref(), SWEEP_JOB, SWEEP_LOCK_TTL, run).await {
                        error!(target = "bridge.jobs", job = SWEEP_JOB, error = %err, "job_failed");
                    }
                }
            })
        };

        let extend = {
            let store = self.store.clone();
            let retention = self.retention.clone();
            let hour = self.config.extend_hour_utc;
            tokio::spawn(async move {
                loop {
                    let now = Utc::now();
                    let wait = (next_daily_run(now, hour) - now)
                        .to_std()
                        .unwrap_or(StdDuration::from_secs(60));
                    tokio::time::sleep(wait).await;
                    let run = retention.run_once();
                    if let Err(err) = run_locked(store.as_ref(), EXTEND_JOB, EXTEND_LOCK_TTL, run).await {
                        error!(target = "bridge.jobs", job = EXTEND_JOB, error = %err, "job_failed");
                    }
                }
            })
        };

        vec![sweep, extend]
    }
}

/// One-shot sweep for the CLI.
pub async fn sweep_now(
    store: Arc<dyn RecordStore>,
    gateway: Arc<dyn StoreGateway>,
    batch: usize,
) -> Result<Option<SweepReport>, JobError> {
    let sweeper = Sweeper::new(store.clone(), gateway, batch);
    run_locked(store.as_ref(), SWEEP_JOB, SWEEP_LOCK_TTL, sweeper.run_once()).await
}

/// One-shot order retention pass for the CLI.
pub async fn extend_now(
    store: Arc<dyn RecordStore>,
    gateway: Arc<dyn StoreGateway>,
    window_days: i64,
) -> Result<Option<ExtendReport>, JobError> {
    let retention = OrderRetention::new(store.clone(), gateway, window_days);
    run_locked(store.as_ref(), EXTEND_JOB, EXTEND_LOCK_TTL, retention.run_once()).await
}
