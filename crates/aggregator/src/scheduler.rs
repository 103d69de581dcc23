//! Cooperative job scheduler
//!
//! Computes each job's next instant from its cron expression, sleeps until
//! the earliest one, and executes it on a bounded worker pool. A job only
//! writes while holding its advisory leader lock in the catalog, making
//! each scheduled instant at-most-once; a crashed run is simply picked up
//! at the next instant because aggregate keys make replays overwrite.

use chrono::{Datelike, Days, Local, NaiveDate, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use haflow_batch_writer::EnrichmentCache;
use haflow_catalog::CatalogStore;
use haflow_common::TimeSeriesStore;
use haflow_config::{CatalogConfig, ScheduleConfig, TimeseriesConfig};
use haflow_domain::JobKind;

use crate::{daily, metrics, monthly, retention, weekly};

/// Advisory lock TTL; generously above any job's runtime
const LOCK_TTL_SECS: i64 = 3600;

/// Concurrent job executions
const WORKER_POOL: usize = 2;

pub struct AggregationScheduler {
    catalog: CatalogStore,
    store: Arc<dyn TimeSeriesStore>,
    schedules: ScheduleConfig,
    raw_bucket: String,
    daily_bucket: String,
    weekly_bucket: String,
    tombstone_grace_days: u32,
    enrichment: Arc<EnrichmentCache>,
    holder: String,
    workers: Arc<Semaphore>,
}

impl AggregationScheduler {
    pub fn new(
        catalog: CatalogStore,
        store: Arc<dyn TimeSeriesStore>,
        schedules: ScheduleConfig,
        timeseries: &TimeseriesConfig,
        catalog_config: &CatalogConfig,
        enrichment: Arc<EnrichmentCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            store,
            schedules,
            raw_bucket: timeseries.raw_bucket.clone(),
            daily_bucket: timeseries.daily_bucket.clone(),
            weekly_bucket: timeseries.weekly_bucket.clone(),
            tombstone_grace_days: catalog_config.tombstone_grace_days,
            enrichment,
            holder: Uuid::new_v4().to_string(),
            workers: Arc::new(Semaphore::new(WORKER_POOL)),
        })
    }

    /// Run until shutdown
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let jobs: Vec<(JobKind, Schedule)> = vec![
            (JobKind::Daily, Schedule::from_str(&self.schedules.daily)?),
            (JobKind::Weekly, Schedule::from_str(&self.schedules.weekly)?),
            (JobKind::Monthly, Schedule::from_str(&self.schedules.monthly)?),
        ];
        info!(
            daily = %self.schedules.daily,
            weekly = %self.schedules.weekly,
            monthly = %self.schedules.monthly,
            "aggregation scheduler started"
        );

        loop {
            let now = Local::now();
            let next = jobs
                .iter()
                .filter_map(|(kind, schedule)| {
                    schedule.after(&now).next().map(|when| (*kind, when))
                })
                .min_by_key(|(_, when)| *when);

            let Some((kind, when)) = next else {
                warn!("no upcoming job instants; scheduler idle");
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(Duration::from_secs(3600)) => continue,
                }
            };

            let wait = (when - now).to_std().unwrap_or(Duration::ZERO);
            debug!(job = kind.name(), at = %when, "next job scheduled");

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(wait) => {
                    let scheduler = Arc::clone(&self);
                    let scheduled_for = when.with_timezone(&Utc);
                    tokio::spawn(async move {
                        if let Err(e) = scheduler.trigger(kind, scheduled_for).await {
                            error!(job = kind.name(), error = %e, "job execution errored");
                        }
                    });
                }
            }
        }

        info!("aggregation scheduler stopped");
        Ok(())
    }

    /// Execute one job instant under the worker pool and leader lock.
    /// Returns the recorded outcome (`complete`, `failed` or `skipped`).
    pub async fn trigger(
        &self,
        kind: JobKind,
        scheduled_for: chrono::DateTime<Utc>,
    ) -> anyhow::Result<&'static str> {
        let _permit = self.workers.acquire().await?;

        // Holding the lock is a precondition to write
        if !self
            .catalog
            .try_acquire_job_lock(kind.name(), &self.holder, LOCK_TTL_SECS)
            .await?
        {
            debug!(job = kind.name(), "leader lock held elsewhere, skipping");
            metrics::JOB_RUNS
                .with_label_values(&[kind.name(), "skipped"])
                .inc();
            return Ok("skipped");
        }

        let run_id = self
            .catalog
            .record_job_scheduled(kind.name(), scheduled_for)
            .await?;
        self.catalog.mark_job_running(&run_id).await?;

        let outcome = match self.execute(kind, scheduled_for).await {
            Ok(None) => {
                self.catalog.mark_job_complete(&run_id).await?;
                "complete"
            }
            Ok(Some(reason)) => {
                self.catalog.mark_job_failed(&run_id, &reason).await?;
                "failed"
            }
            Err(e) => {
                self.catalog.mark_job_failed(&run_id, &e.to_string()).await?;
                "failed"
            }
        };

        self.catalog
            .release_job_lock(kind.name(), &self.holder)
            .await?;
        metrics::JOB_RUNS
            .with_label_values(&[kind.name(), outcome])
            .inc();
        Ok(outcome)
    }

    /// Run the job body; `Ok(Some(reason))` marks a soft failure
    async fn execute(
        &self,
        kind: JobKind,
        scheduled_for: chrono::DateTime<Utc>,
    ) -> anyhow::Result<Option<String>> {
        let run_date = scheduled_for.date_naive();

        match kind {
            JobKind::Daily => {
                // 03:00 runs compact the previous calendar day
                let date = previous_day(run_date);
                let outcome = daily::run(
                    self.store.as_ref(),
                    &self.catalog,
                    &self.raw_bucket,
                    &self.daily_bucket,
                    date,
                )
                .await?;

                // Catalog tombstone grace is enforced alongside the daily run
                retention::run(&self.catalog, self.tombstone_grace_days).await?;

                if outcome.failed_detectors.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(format!(
                        "detectors failed: {}",
                        outcome.failed_detectors.join(", ")
                    )))
                }
            }
            JobKind::Weekly => {
                let week_end = previous_day(run_date);
                weekly::run(
                    self.store.as_ref(),
                    &self.daily_bucket,
                    &self.weekly_bucket,
                    week_end,
                )
                .await?;
                Ok(None)
            }
            JobKind::Monthly => {
                let month_start = previous_month_start(run_date);
                let context = self.enrichment.snapshot();
                monthly::run(
                    self.store.as_ref(),
                    &self.weekly_bucket,
                    month_start,
                    &context,
                )
                .await?;
                Ok(None)
            }
        }
    }
}

fn previous_day(date: NaiveDate) -> NaiveDate {
    date.checked_sub_days(Days::new(1)).unwrap_or(date)
}

fn previous_month_start(date: NaiveDate) -> NaiveDate {
    let first_of_this = date.with_day(1).expect("day one exists");
    let last_of_previous = previous_day(first_of_this);
    last_of_previous.with_day(1).expect("day one exists")
}
