//! Catalog store
//!
//! SQLite-backed relational catalog. All writes are per-row transactions
//! (single upsert statements), so readers see at-most-one logical version
//! per key. Natural keys throughout: `device_id`, `entity_id`, `area_id`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;

use haflow_common::error::Result;
use haflow_domain::{
    Area, Capability, Device, DeliveryStatus, Entity, JobState, JobRun, WebhookDelivery,
    WebhookSubscription,
};

use crate::metrics;

/// Device fields as reported by the upstream registry
#[derive(Debug, Clone, Default)]
pub struct NewDevice {
    pub device_id: String,
    pub name: String,
    pub name_by_user: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub sw_version: Option<String>,
    pub area_id: Option<String>,
    pub integration: String,
    pub entry_type: Option<String>,
    pub health_score: Option<i64>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Entity fields as reported by the upstream registry
#[derive(Debug, Clone, Default)]
pub struct NewEntity {
    pub entity_id: String,
    pub device_id: Option<String>,
    pub domain: String,
    pub platform: String,
    pub unique_id: String,
    pub area_id: Option<String>,
    pub disabled: bool,
}

/// Area fields as reported by the upstream registry
#[derive(Debug, Clone, Default)]
pub struct NewArea {
    pub area_id: String,
    pub name: String,
    pub aliases: Vec<String>,
}

/// The catalog store handle (cheap to clone)
#[derive(Clone)]
pub struct CatalogStore {
    pool: SqlitePool,
}

impl CatalogStore {
    /// Open the catalog and run pending migrations
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = haflow_common::create_catalog_pool(database_url, max_connections).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("catalog ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------

    /// Upsert one device row. `updated_at` is always bumped; `created_at`
    /// and an existing tombstone flag are preserved except that a live
    /// upstream row clears the tombstone.
    pub async fn upsert_device(&self, device: &NewDevice) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO devices (
                device_id, name, name_by_user, manufacturer, model, sw_version,
                area_id, integration, entry_type, health_score, last_seen,
                disabled, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12, ?12)
            ON CONFLICT(device_id) DO UPDATE SET
                name = excluded.name,
                name_by_user = excluded.name_by_user,
                manufacturer = excluded.manufacturer,
                model = excluded.model,
                sw_version = excluded.sw_version,
                area_id = excluded.area_id,
                integration = excluded.integration,
                entry_type = excluded.entry_type,
                health_score = COALESCE(excluded.health_score, devices.health_score),
                last_seen = COALESCE(excluded.last_seen, devices.last_seen),
                disabled = 0,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&device.device_id)
        .bind(&device.name)
        .bind(&device.name_by_user)
        .bind(&device.manufacturer)
        .bind(&device.model)
        .bind(&device.sw_version)
        .bind(&device.area_id)
        .bind(&device.integration)
        .bind(&device.entry_type)
        .bind(device.health_score)
        .bind(device.last_seen)
        .bind(now)
        .execute(&self.pool)
        .await?;

        metrics::REGISTRY_UPSERTS.with_label_values(&["device"]).inc();
        Ok(())
    }

    pub async fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
        Ok(
            sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE device_id = ?1")
                .bind(device_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn list_devices(&self, include_disabled: bool) -> Result<Vec<Device>> {
        let sql = if include_disabled {
            "SELECT * FROM devices ORDER BY device_id"
        } else {
            "SELECT * FROM devices WHERE disabled = 0 ORDER BY device_id"
        };
        Ok(sqlx::query_as::<_, Device>(sql).fetch_all(&self.pool).await?)
    }

    /// Soft-delete: tombstone the row, keep it for the grace period
    pub async fn soft_delete_device(&self, device_id: &str) -> Result<()> {
        sqlx::query("UPDATE devices SET disabled = 1, updated_at = ?2 WHERE device_id = ?1")
            .bind(device_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist last-seen timestamps gathered by the ingestor's replica and
    /// refresh the derived 0-100 health score from recency.
    pub async fn record_device_activity(
        &self,
        seen: &[(String, DateTime<Utc>)],
    ) -> Result<()> {
        let now = Utc::now();
        for (device_id, last_seen) in seen {
            let age_hours = (now - *last_seen).num_hours().max(0);
            // Full marks within an hour, decaying to zero over a week
            let health_score = (100 - (age_hours * 100 / 168)).clamp(0, 100);

            sqlx::query(
                "UPDATE devices SET last_seen = ?2, health_score = ?3 WHERE device_id = ?1",
            )
            .bind(device_id)
            .bind(last_seen)
            .bind(health_score)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    /// Upsert one entity row. Entities referencing a device the catalog has
    /// not seen are accepted; the return value reports whether the device
    /// was known so callers can count the warning.
    pub async fn upsert_entity(&self, entity: &NewEntity) -> Result<bool> {
        let device_known = match &entity.device_id {
            None => true,
            Some(device_id) => {
                let row: Option<(i64,)> =
                    sqlx::query_as("SELECT 1 FROM devices WHERE device_id = ?1")
                        .bind(device_id)
                        .fetch_optional(&self.pool)
                        .await?;
                row.is_some()
            }
        };

        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO entities (
                entity_id, device_id, domain, platform, unique_id, area_id,
                disabled, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            ON CONFLICT(entity_id) DO UPDATE SET
                device_id = excluded.device_id,
                domain = excluded.domain,
                platform = excluded.platform,
                unique_id = excluded.unique_id,
                area_id = excluded.area_id,
                disabled = excluded.disabled,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&entity.entity_id)
        .bind(&entity.device_id)
        .bind(&entity.domain)
        .bind(&entity.platform)
        .bind(&entity.unique_id)
        .bind(&entity.area_id)
        .bind(entity.disabled)
        .bind(now)
        .execute(&self.pool)
        .await?;

        metrics::REGISTRY_UPSERTS.with_label_values(&["entity"]).inc();
        if !device_known {
            metrics::UNKNOWN_DEVICE_REFS
                .with_label_values(&["entity"])
                .inc();
        }
        Ok(device_known)
    }

    pub async fn get_entity(&self, entity_id: &str) -> Result<Option<Entity>> {
        Ok(
            sqlx::query_as::<_, Entity>("SELECT * FROM entities WHERE entity_id = ?1")
                .bind(entity_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn list_entities(&self, include_disabled: bool) -> Result<Vec<Entity>> {
        let sql = if include_disabled {
            "SELECT * FROM entities ORDER BY entity_id"
        } else {
            "SELECT * FROM entities WHERE disabled = 0 ORDER BY entity_id"
        };
        Ok(sqlx::query_as::<_, Entity>(sql).fetch_all(&self.pool).await?)
    }

    pub async fn list_entities_for_device(&self, device_id: &str) -> Result<Vec<Entity>> {
        Ok(sqlx::query_as::<_, Entity>(
            "SELECT * FROM entities WHERE device_id = ?1 AND disabled = 0",
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn soft_delete_entity(&self, entity_id: &str) -> Result<()> {
        sqlx::query("UPDATE entities SET disabled = 1, updated_at = ?2 WHERE entity_id = ?1")
            .bind(entity_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Join rows for the in-memory replica: entity -> (device, effective area)
    ///
    /// The effective area falls back to the owning device's area when the
    /// entity has none of its own.
    pub async fn entity_context_rows(
        &self,
    ) -> Result<Vec<(String, Option<String>, Option<String>)>> {
        let rows: Vec<(String, Option<String>, Option<String>)> = sqlx::query_as(
            r#"
            SELECT e.entity_id,
                   e.device_id,
                   COALESCE(e.area_id, d.area_id) AS area_id
            FROM entities e
            LEFT JOIN devices d ON d.device_id = e.device_id
            WHERE e.disabled = 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Areas
    // ------------------------------------------------------------------

    pub async fn upsert_area(&self, area: &NewArea) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO areas (area_id, name, aliases, disabled, created_at, updated_at)
            VALUES (?1, ?2, ?3, 0, ?4, ?4)
            ON CONFLICT(area_id) DO UPDATE SET
                name = excluded.name,
                aliases = excluded.aliases,
                disabled = 0,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&area.area_id)
        .bind(&area.name)
        .bind(Value::from(area.aliases.clone()))
        .bind(now)
        .execute(&self.pool)
        .await?;

        metrics::REGISTRY_UPSERTS.with_label_values(&["area"]).inc();
        Ok(())
    }

    pub async fn list_areas(&self, include_disabled: bool) -> Result<Vec<Area>> {
        let sql = if include_disabled {
            "SELECT * FROM areas ORDER BY area_id"
        } else {
            "SELECT * FROM areas WHERE disabled = 0 ORDER BY area_id"
        };
        Ok(sqlx::query_as::<_, Area>(sql).fetch_all(&self.pool).await?)
    }

    pub async fn soft_delete_area(&self, area_id: &str) -> Result<()> {
        sqlx::query("UPDATE areas SET disabled = 1, updated_at = ?2 WHERE area_id = ?1")
            .bind(area_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Capabilities
    // ------------------------------------------------------------------

    /// Replace a device's capability set in one transaction
    pub async fn replace_capabilities(
        &self,
        device_id: &str,
        capabilities: &[Capability],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM device_capabilities WHERE device_id = ?1")
            .bind(device_id)
            .execute(&mut *tx)
            .await?;

        for cap in capabilities {
            sqlx::query(
                r#"
                INSERT INTO device_capabilities (device_id, name, type, properties, exposed, source)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(device_id)
            .bind(&cap.name)
            .bind(&cap.capability_type)
            .bind(&cap.properties)
            .bind(cap.exposed)
            .bind(&cap.source)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn list_capabilities(&self, device_id: &str) -> Result<Vec<Capability>> {
        Ok(sqlx::query_as::<_, Capability>(
            "SELECT * FROM device_capabilities WHERE device_id = ?1 ORDER BY name",
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?)
    }

    // ------------------------------------------------------------------
    // Tombstone retention
    // ------------------------------------------------------------------

    /// Hard-delete tombstones whose last registry touch and last referring
    /// event are both older than the grace period. Returns rows removed.
    pub async fn purge_tombstones(&self, grace_days: u32) -> Result<u64> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(grace_days));
        let mut purged = 0u64;

        let result = sqlx::query(
            r#"
            DELETE FROM devices
            WHERE disabled = 1
              AND updated_at < ?1
              AND (last_seen IS NULL OR last_seen < ?1)
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        metrics::TOMBSTONES_PURGED
            .with_label_values(&["device"])
            .inc_by(result.rows_affected());
        purged += result.rows_affected();

        let result = sqlx::query("DELETE FROM entities WHERE disabled = 1 AND updated_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        metrics::TOMBSTONES_PURGED
            .with_label_values(&["entity"])
            .inc_by(result.rows_affected());
        purged += result.rows_affected();

        let result = sqlx::query("DELETE FROM areas WHERE disabled = 1 AND updated_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        metrics::TOMBSTONES_PURGED
            .with_label_values(&["area"])
            .inc_by(result.rows_affected());
        purged += result.rows_affected();

        if purged > 0 {
            debug!(purged, "tombstones purged");
        }
        Ok(purged)
    }

    // ------------------------------------------------------------------
    // Webhook subscriptions
    // ------------------------------------------------------------------

    pub async fn create_subscription(
        &self,
        name: &str,
        url: &str,
        secret: &str,
        conditions: &Value,
        enabled: bool,
    ) -> Result<WebhookSubscription> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO webhook_subscriptions (id, name, url, secret, conditions, enabled, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&id)
        .bind(name)
        .bind(url)
        .bind(secret)
        .bind(conditions)
        .bind(enabled)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(WebhookSubscription {
            id,
            name: name.to_string(),
            url: url.to_string(),
            secret: secret.to_string(),
            conditions: conditions.clone(),
            enabled,
            created_at: now,
        })
    }

    pub async fn list_subscriptions(&self, enabled_only: bool) -> Result<Vec<WebhookSubscription>> {
        let sql = if enabled_only {
            "SELECT * FROM webhook_subscriptions WHERE enabled = 1 ORDER BY created_at"
        } else {
            "SELECT * FROM webhook_subscriptions ORDER BY created_at"
        };
        Ok(sqlx::query_as::<_, WebhookSubscription>(sql)
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn get_subscription(&self, id: &str) -> Result<Option<WebhookSubscription>> {
        Ok(
            sqlx::query_as::<_, WebhookSubscription>(
                "SELECT * FROM webhook_subscriptions WHERE id = ?1",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?,
        )
    }

    pub async fn delete_subscription(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM webhook_subscriptions WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // Webhook deliveries
    // ------------------------------------------------------------------

    /// Insert a pending delivery row before the first attempt
    pub async fn insert_delivery(
        &self,
        subscription_id: &str,
        payload_hash: &str,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO webhook_deliveries
                (id, subscription_id, payload_hash, attempt, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, 0, 'pending', ?4, ?4)
            "#,
        )
        .bind(&id)
        .bind(subscription_id)
        .bind(payload_hash)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Persist one delivery state transition
    pub async fn update_delivery(
        &self,
        id: &str,
        status: DeliveryStatus,
        attempt: u32,
        next_attempt_at: Option<DateTime<Utc>>,
        last_error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = ?2, attempt = ?3, next_attempt_at = ?4, last_error = ?5, updated_at = ?6
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(i64::from(attempt))
        .bind(next_attempt_at)
        .bind(last_error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_delivery(&self, id: &str) -> Result<Option<WebhookDelivery>> {
        Ok(
            sqlx::query_as::<_, WebhookDelivery>("SELECT * FROM webhook_deliveries WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn list_deliveries(
        &self,
        subscription_id: &str,
        limit: u32,
    ) -> Result<Vec<WebhookDelivery>> {
        Ok(sqlx::query_as::<_, WebhookDelivery>(
            r#"
            SELECT * FROM webhook_deliveries
            WHERE subscription_id = ?1
            ORDER BY created_at DESC
            LIMIT ?2
            "#,
        )
        .bind(subscription_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?)
    }

    // ------------------------------------------------------------------
    // Advisory job locks + job runs
    // ------------------------------------------------------------------

    /// Try to take the advisory leader lock for a job name. Returns whether
    /// the lock was acquired. Expired locks are taken over.
    pub async fn try_acquire_job_lock(
        &self,
        job_name: &str,
        holder: &str,
        ttl_secs: i64,
    ) -> Result<bool> {
        let now = Utc::now();
        let expires = now + ChronoDuration::seconds(ttl_secs);

        let result = sqlx::query(
            r#"
            INSERT INTO job_locks (job_name, holder, acquired_at, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(job_name) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE job_locks.expires_at < ?3 OR job_locks.holder = excluded.holder
            "#,
        )
        .bind(job_name)
        .bind(holder)
        .bind(now)
        .bind(expires)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn release_job_lock(&self, job_name: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM job_locks WHERE job_name = ?1 AND holder = ?2")
            .bind(job_name)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a scheduled job run (idempotent per `(job_name, scheduled_for)`).
    /// Returns the run id.
    pub async fn record_job_scheduled(
        &self,
        job_name: &str,
        scheduled_for: DateTime<Utc>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO aggregate_jobs (id, job_name, scheduled_for, state)
            VALUES (?1, ?2, ?3, 'scheduled')
            ON CONFLICT(job_name, scheduled_for) DO UPDATE SET state = 'scheduled'
            "#,
        )
        .bind(&id)
        .bind(job_name)
        .bind(scheduled_for)
        .execute(&self.pool)
        .await?;

        let row: (String,) = sqlx::query_as(
            "SELECT id FROM aggregate_jobs WHERE job_name = ?1 AND scheduled_for = ?2",
        )
        .bind(job_name)
        .bind(scheduled_for)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    pub async fn mark_job_running(&self, run_id: &str) -> Result<()> {
        self.set_job_state(run_id, JobState::Running, None).await
    }

    pub async fn mark_job_complete(&self, run_id: &str) -> Result<()> {
        self.set_job_state(run_id, JobState::Complete, None).await
    }

    pub async fn mark_job_failed(&self, run_id: &str, reason: &str) -> Result<()> {
        self.set_job_state(run_id, JobState::Failed, Some(reason))
            .await
    }

    async fn set_job_state(
        &self,
        run_id: &str,
        state: JobState,
        reason: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now();
        match state {
            JobState::Running => {
                sqlx::query(
                    "UPDATE aggregate_jobs SET state = ?2, started_at = ?3 WHERE id = ?1",
                )
                .bind(run_id)
                .bind(state.as_str())
                .bind(now)
                .execute(&self.pool)
                .await?;
            }
            _ => {
                sqlx::query(
                    "UPDATE aggregate_jobs SET state = ?2, reason = ?3, finished_at = ?4 WHERE id = ?1",
                )
                .bind(run_id)
                .bind(state.as_str())
                .bind(reason)
                .bind(now)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    pub async fn get_job_run(&self, run_id: &str) -> Result<Option<JobRun>> {
        Ok(
            sqlx::query_as::<_, JobRun>("SELECT * FROM aggregate_jobs WHERE id = ?1")
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn get_job_run_for(
        &self,
        job_name: &str,
        scheduled_for: DateTime<Utc>,
    ) -> Result<Option<JobRun>> {
        Ok(sqlx::query_as::<_, JobRun>(
            "SELECT * FROM aggregate_jobs WHERE job_name = ?1 AND scheduled_for = ?2",
        )
        .bind(job_name)
        .bind(scheduled_for)
        .fetch_optional(&self.pool)
        .await?)
    }
}
