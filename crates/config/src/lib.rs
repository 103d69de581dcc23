//! Configuration management for Haflow
//!
//! Loads and validates process configuration from environment variables
//! (with `.env` support for local development). Endpoint entries that are
//! not configured are skipped, so a deployment with only a primary Home
//! Assistant instance needs exactly two variables.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

/// Full process configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub ha: HaConfig,
    pub breaker: BreakerConfig,
    pub pipeline: PipelineConfig,
    pub writer: WriterConfig,
    pub webhook: WebhookConfig,
    pub retention: RetentionConfig,
    pub schedule: ScheduleConfig,
    pub enrichment: EnrichmentConfig,
    pub catalog: CatalogConfig,
    pub timeseries: TimeseriesConfig,
    pub api: ApiConfig,
}

/// One Home Assistant endpoint: URL + long-lived bearer token
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub url: String,
    pub token: String,
}

/// Home Assistant session configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HaConfig {
    /// Prioritized session backends: primary, then cloud, then local fallback
    pub endpoints: Vec<EndpointConfig>,
    pub connect_timeout: Duration,
    pub read_idle_timeout: Duration,
    pub write_timeout: Duration,
    /// Interval between liveness pings
    pub ping_interval: Duration,
}

/// Per-endpoint circuit breaker tuning
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub success_threshold: u32,
}

/// Pipeline channel between ingestor and writer
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PipelineConfig {
    pub capacity: usize,
}

/// Batch writer tuning
#[derive(Debug, Clone, Deserialize)]
pub struct WriterConfig {
    /// Default batch size; override per measurement via `batch_sizes`
    pub batch_size: usize,
    pub batch_sizes: HashMap<String, usize>,
    pub flush_interval: Duration,
    pub max_retries: u32,
    pub high_water_bytes: usize,
    pub parallelism: usize,
    pub drain_timeout: Duration,
    pub spool_dir: String,
}

impl WriterConfig {
    pub fn batch_size_for(&self, measurement: &str) -> usize {
        self.batch_sizes
            .get(measurement)
            .copied()
            .unwrap_or(self.batch_size)
    }
}

/// Webhook dispatch tuning
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Backoff schedule between attempts, e.g. `[1s, 2s, 4s]`
    pub attempt_schedule: Vec<Duration>,
    pub request_timeout: Duration,
    pub mailbox_capacity: usize,
}

/// Bucket retention values (enforcement is the storage layer's)
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetentionConfig {
    pub raw_days: u32,
    pub daily_days: u32,
    pub weekly_weeks: u32,
}

/// Cron expressions for the compaction jobs
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    pub daily: String,
    pub weekly: String,
    pub monthly: String,
}

/// Per-source enrichment freshness TTLs
#[derive(Debug, Clone, Deserialize)]
pub struct EnrichmentConfig {
    pub ttls: HashMap<String, Duration>,
}

impl EnrichmentConfig {
    pub fn ttl_for(&self, source: &str) -> Duration {
        self.ttls
            .get(source)
            .copied()
            .unwrap_or(Duration::from_secs(300))
    }
}

/// Catalog store settings
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub tombstone_grace_days: u32,
}

/// Time-series store settings
#[derive(Debug, Clone, Deserialize)]
pub struct TimeseriesConfig {
    pub url: String,
    pub token: Option<String>,
    pub request_timeout: Duration,
    pub raw_bucket: String,
    pub daily_bucket: String,
    pub weekly_bucket: String,
}

/// Read-side HTTP API
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Config {
            ha: Self::load_ha()?,
            breaker: BreakerConfig {
                failure_threshold: env_u32("BREAKER_FAILURE_THRESHOLD", 5),
                reset_timeout: env_secs("BREAKER_RESET_TIMEOUT_SECS", 60),
                success_threshold: env_u32("BREAKER_SUCCESS_THRESHOLD", 3),
            },
            pipeline: PipelineConfig {
                capacity: env_usize("PIPELINE_CAPACITY", 10_000),
            },
            writer: WriterConfig {
                batch_size: env_usize("WRITER_BATCH_SIZE", 500),
                batch_sizes: parse_usize_map(&env_string("WRITER_BATCH_SIZES", ""))?,
                flush_interval: env_secs("WRITER_FLUSH_INTERVAL_SECS", 5),
                max_retries: env_u32("WRITER_MAX_RETRIES", 5),
                high_water_bytes: env_usize("WRITER_HIGH_WATER_BYTES", 64 * 1024 * 1024),
                parallelism: env_usize("WRITER_PARALLELISM", 1).clamp(1, 4),
                drain_timeout: env_secs("WRITER_DRAIN_TIMEOUT_SECS", 30),
                spool_dir: env_string("WRITER_SPOOL_DIR", "./spool"),
            },
            webhook: WebhookConfig {
                attempt_schedule: parse_schedule(&env_string("WEBHOOK_ATTEMPT_SCHEDULE", "1s,2s,4s"))?,
                request_timeout: env_secs("WEBHOOK_REQUEST_TIMEOUT_SECS", 10),
                mailbox_capacity: env_usize("WEBHOOK_MAILBOX_CAPACITY", 256),
            },
            retention: RetentionConfig {
                raw_days: env_u32("RETENTION_RAW_DAYS", 7),
                daily_days: env_u32("RETENTION_DAILY_DAYS", 90),
                weekly_weeks: env_u32("RETENTION_WEEKLY_WEEKS", 52),
            },
            schedule: ScheduleConfig {
                // Seconds-resolution cron: sec min hour dom month dow
                daily: env_string("SCHEDULE_DAILY", "0 0 3 * * *"),
                weekly: env_string("SCHEDULE_WEEKLY", "0 0 3 * * Sun"),
                monthly: env_string("SCHEDULE_MONTHLY", "0 0 3 1 * *"),
            },
            enrichment: EnrichmentConfig {
                ttls: parse_secs_map(&env_string("ENRICHMENT_TTLS", "weather=300"))?,
            },
            catalog: CatalogConfig {
                database_url: env_string("CATALOG_DATABASE_URL", "sqlite://haflow.db"),
                max_connections: env_u32("CATALOG_MAX_CONNECTIONS", 10),
                tombstone_grace_days: env_u32("CATALOG_TOMBSTONE_GRACE_DAYS", 90),
            },
            timeseries: TimeseriesConfig {
                url: env::var("TIMESERIES_URL").context("TIMESERIES_URL must be set")?,
                token: env::var("TIMESERIES_TOKEN").ok(),
                request_timeout: env_secs("TIMESERIES_REQUEST_TIMEOUT_SECS", 10),
                raw_bucket: env_string("TIMESERIES_RAW_BUCKET", "ha_raw"),
                daily_bucket: env_string("TIMESERIES_DAILY_BUCKET", "ha_daily"),
                weekly_bucket: env_string("TIMESERIES_WEEKLY_BUCKET", "ha_weekly"),
            },
            api: ApiConfig {
                host: env_string("API_HOST", "0.0.0.0"),
                port: env_u32("API_PORT", 8086) as u16,
            },
        })
    }

    /// Load prioritized Home Assistant endpoints, skipping unset slots
    fn load_ha() -> Result<HaConfig> {
        let mut endpoints = Vec::new();

        for (name, url_var, token_var) in [
            ("primary", "HA_PRIMARY_URL", "HA_PRIMARY_TOKEN"),
            ("cloud_fallback", "HA_CLOUD_URL", "HA_CLOUD_TOKEN"),
            ("local_fallback", "HA_LOCAL_URL", "HA_LOCAL_TOKEN"),
        ] {
            if let (Ok(url), Ok(token)) = (env::var(url_var), env::var(token_var)) {
                endpoints.push(EndpointConfig {
                    name: name.to_string(),
                    url,
                    token,
                });
            }
        }

        if endpoints.is_empty() {
            bail!(
                "no Home Assistant endpoints configured; set at least HA_PRIMARY_URL and HA_PRIMARY_TOKEN"
            );
        }

        Ok(HaConfig {
            endpoints,
            connect_timeout: env_secs("HA_CONNECT_TIMEOUT_SECS", 10),
            read_idle_timeout: env_secs("HA_READ_IDLE_TIMEOUT_SECS", 60),
            write_timeout: env_secs("HA_WRITE_TIMEOUT_SECS", 10),
            ping_interval: env_secs("HA_PING_INTERVAL_SECS", 30),
        })
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(
        env::var(key)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default),
    )
}

/// Parse a duration like `500ms`, `5s`, `2m`
fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        return Ok(Duration::from_millis(ms.trim().parse()?));
    }
    if let Some(mins) = s.strip_suffix('m') {
        return Ok(Duration::from_secs(mins.trim().parse::<u64>()? * 60));
    }
    if let Some(secs) = s.strip_suffix('s') {
        return Ok(Duration::from_secs(secs.trim().parse()?));
    }
    Ok(Duration::from_secs(s.parse()?))
}

/// Parse a comma-separated schedule like `1s,2s,4s`
fn parse_schedule(s: &str) -> Result<Vec<Duration>> {
    s.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(parse_duration)
        .collect()
}

/// Parse `key=secs` pairs like `weather=300,carbon=900` into TTLs
fn parse_secs_map(s: &str) -> Result<HashMap<String, Duration>> {
    let mut map = HashMap::new();
    for part in s.split(',').filter(|p| !p.trim().is_empty()) {
        let (key, value) = part
            .split_once('=')
            .with_context(|| format!("expected key=secs in '{part}'"))?;
        map.insert(
            key.trim().to_string(),
            Duration::from_secs(value.trim().parse()?),
        );
    }
    Ok(map)
}

/// Parse `measurement=size` pairs like `home_assistant_events=1000`
fn parse_usize_map(s: &str) -> Result<HashMap<String, usize>> {
    let mut map = HashMap::new();
    for part in s.split(',').filter(|p| !p.trim().is_empty()) {
        let (key, value) = part
            .split_once('=')
            .with_context(|| format!("expected key=value in '{part}'"))?;
        map.insert(key.trim().to_string(), value.trim().parse()?);
    }
    Ok(map)
}
