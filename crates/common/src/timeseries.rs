//! Time-series store client
//!
//! Every point carries `(measurement, tags, fields, time ns)`. Writes are
//! issued as batches with a batch-id header so operators can dedupe on
//! replay; the store itself is append-only and may contain duplicates across
//! retries. Consumers of the raw bucket must tolerate duplicates.
//!
//! Two implementations:
//! - [`HttpTimeSeriesStore`]: line-protocol writes over HTTP, JSON queries.
//! - [`MemoryTimeSeriesStore`]: in-process store for tests and the e2e suite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::backoff::is_retryable_status;
use crate::error::{Error, Result};

/// A field value on a time-series point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Boolean(bool),
    String(String),
}

impl FieldValue {
    /// Convert a JSON value to a field value, stringifying shapes the
    /// tag/field type rules don't allow (arrays, objects, null).
    pub fn from_json(value: &serde_json::Value) -> FieldValue {
        match value {
            serde_json::Value::Bool(b) => FieldValue::Boolean(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    FieldValue::Integer(i)
                } else {
                    FieldValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => FieldValue::String(s.clone()),
            other => FieldValue::String(other.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(f) => Some(*f),
            FieldValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }
}

/// One time-series point
///
/// Tags are indexed and bounded-cardinality; fields are opaque payload.
/// `time_ns` is UTC nanoseconds since the epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(rename = "time")]
    pub time_ns: i64,
}

impl Point {
    pub fn new(measurement: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            // Millisecond precision is the normalization contract
            time_ns: time.timestamp_millis() * 1_000_000,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Approximate in-memory footprint, used for the writer's byte budget
    pub fn estimated_bytes(&self) -> usize {
        let tags: usize = self.tags.iter().map(|(k, v)| k.len() + v.len() + 2).sum();
        let fields: usize = self
            .fields
            .iter()
            .map(|(k, v)| {
                k.len()
                    + match v {
                        FieldValue::String(s) => s.len() + 2,
                        _ => 16,
                    }
            })
            .sum();
        self.measurement.len() + tags + fields + 24
    }

    /// Encode to line protocol: `measurement,tag=v field=v <ns>`
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape_measurement(&self.measurement);

        for (key, value) in &self.tags {
            // Empty tag values are dropped from the line; the key stays bounded
            if value.is_empty() {
                continue;
            }
            let _ = write!(line, ",{}={}", escape_tag(key), escape_tag(value));
        }

        line.push(' ');
        let mut first = true;
        for (key, value) in &self.fields {
            if !first {
                line.push(',');
            }
            first = false;
            match value {
                FieldValue::Float(f) => {
                    let _ = write!(line, "{}={}", escape_tag(key), f);
                }
                FieldValue::Integer(i) => {
                    let _ = write!(line, "{}={}i", escape_tag(key), i);
                }
                FieldValue::Boolean(b) => {
                    let _ = write!(line, "{}={}", escape_tag(key), b);
                }
                FieldValue::String(s) => {
                    let _ = write!(line, "{}=\"{}\"", escape_tag(key), escape_field_string(s));
                }
            }
        }

        let _ = write!(line, " {}", self.time_ns);
        line
    }

    /// Stable 64-bit content hash, xor-combined into batch ids
    fn content_hash(&self) -> u64 {
        let digest = Sha256::digest(self.to_line_protocol().as_bytes());
        u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
    }
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_tag(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

fn escape_field_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Derive the batch id from `(measurement, time of first point, count, xor of
/// point hashes)`. Deterministic so replayed batches carry the same id.
pub fn batch_id(measurement: &str, points: &[Point]) -> String {
    let first_time = points.first().map(|p| p.time_ns).unwrap_or(0);
    let xor = points
        .iter()
        .fold(0u64, |acc, point| acc ^ point.content_hash());

    let mut hasher = Sha256::new();
    hasher.update(measurement.as_bytes());
    hasher.update(first_time.to_be_bytes());
    hasher.update((points.len() as u64).to_be_bytes());
    hasher.update(xor.to_be_bytes());

    hex::encode(&hasher.finalize()[..16])
}

/// Write failure classification
///
/// Retries are driven by this classification, not by exception type.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WriteError {
    /// Network failure, 5xx or 429: retry with backoff
    #[error("retriable write failure: {0}")]
    Retriable(String),

    /// 4xx (except 429) or schema violation: drop the batch
    #[error("rejected write: {0}")]
    Rejected(String),
}

/// Storage abstraction the writer and aggregator depend on
///
/// Single writer per bucket; readers are unconstrained. Bucket expiration is
/// the storage layer's responsibility.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Write one batch of points. The batch id travels as a header.
    async fn write_batch(
        &self,
        bucket: &str,
        batch_id: &str,
        points: &[Point],
    ) -> std::result::Result<(), WriteError>;

    /// Read all points of one measurement within `[start, end)`.
    async fn query_window(
        &self,
        bucket: &str,
        measurement: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Point>>;
}

/// Query request body for the HTTP store
#[derive(Debug, Serialize, Deserialize)]
struct QueryRequest<'a> {
    measurement: &'a str,
    start: DateTime<Utc>,
    stop: DateTime<Utc>,
}

/// HTTP time-series store speaking line protocol
///
/// - `POST {base}/api/v2/write?bucket=<bucket>&precision=ns` with newline
///   separated line protocol and an `X-Batch-Id` header.
/// - `POST {base}/api/v2/query?bucket=<bucket>` with a JSON window request,
///   answered with a JSON array of points.
pub struct HttpTimeSeriesStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpTimeSeriesStore {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.header("Authorization", format!("Token {token}")),
            None => req,
        }
    }
}

#[async_trait]
impl TimeSeriesStore for HttpTimeSeriesStore {
    async fn write_batch(
        &self,
        bucket: &str,
        batch_id: &str,
        points: &[Point],
    ) -> std::result::Result<(), WriteError> {
        let body = points
            .iter()
            .map(Point::to_line_protocol)
            .collect::<Vec<_>>()
            .join("\n");

        let url = format!(
            "{}/api/v2/write?bucket={}&precision=ns",
            self.base_url, bucket
        );

        let response = self
            .authorize(self.client.post(&url))
            .header("Content-Type", "text/plain; charset=utf-8")
            .header("X-Batch-Id", batch_id)
            .body(body)
            .send()
            .await
            .map_err(|e| WriteError::Retriable(e.to_string()))?;

        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            debug!(bucket, batch_id, points = points.len(), "batch written");
            return Ok(());
        }

        let detail = response.text().await.unwrap_or_default();
        let message = format!("status {status}: {}", detail.chars().take(256).collect::<String>());

        if is_retryable_status(Some(status)) {
            Err(WriteError::Retriable(message))
        } else {
            Err(WriteError::Rejected(message))
        }
    }

    async fn query_window(
        &self,
        bucket: &str,
        measurement: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Point>> {
        let url = format!("{}/api/v2/query?bucket={}", self.base_url, bucket);

        let response = self
            .authorize(self.client.post(&url))
            .json(&QueryRequest {
                measurement,
                start,
                stop: end,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Timeseries(format!(
                "query failed with status {}",
                response.status()
            )));
        }

        Ok(response.json::<Vec<Point>>().await?)
    }
}

/// In-memory store used by tests and the e2e suite
///
/// Carries the usual time-series semantics: a point with the same
/// `(measurement, tag set, timestamp)` as an existing one overwrites its
/// fields, which is what makes aggregate replay idempotent. Supports
/// injected write failures so retry and spool paths can be exercised.
#[derive(Default)]
pub struct MemoryTimeSeriesStore {
    buckets: Mutex<BTreeMap<String, Vec<(String, Point)>>>,
    /// 0 = healthy; otherwise every write fails with this HTTP-like status
    fail_status: AtomicU16,
}

impl MemoryTimeSeriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject a write failure mode (e.g. 500 for retriable, 400 for rejected).
    /// Pass `None` to restore healthy writes.
    pub fn set_failure(&self, status: Option<u16>) {
        self.fail_status.store(status.unwrap_or(0), Ordering::SeqCst);
    }

    /// All points in a bucket, in write order
    pub fn points(&self, bucket: &str) -> Vec<Point> {
        self.buckets
            .lock()
            .expect("store lock")
            .get(bucket)
            .map(|rows| rows.iter().map(|(_, p)| p.clone()).collect())
            .unwrap_or_default()
    }

    /// Distinct batch ids seen for a bucket
    pub fn batch_ids(&self, bucket: &str) -> Vec<String> {
        let guard = self.buckets.lock().expect("store lock");
        let mut ids: Vec<String> = guard
            .get(bucket)
            .map(|rows| rows.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default();
        ids.dedup();
        ids
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryTimeSeriesStore {
    async fn write_batch(
        &self,
        bucket: &str,
        batch_id: &str,
        points: &[Point],
    ) -> std::result::Result<(), WriteError> {
        let status = self.fail_status.load(Ordering::SeqCst);
        if status != 0 {
            let message = format!("injected status {status}");
            return if is_retryable_status(Some(status)) {
                Err(WriteError::Retriable(message))
            } else {
                Err(WriteError::Rejected(message))
            };
        }

        let mut guard = self.buckets.lock().expect("store lock");
        let rows = guard.entry(bucket.to_string()).or_default();
        for point in points {
            let existing = rows.iter_mut().find(|(_, p)| {
                p.measurement == point.measurement
                    && p.tags == point.tags
                    && p.time_ns == point.time_ns
            });
            match existing {
                Some((id, p)) => {
                    *id = batch_id.to_string();
                    p.fields = point.fields.clone();
                }
                None => rows.push((batch_id.to_string(), point.clone())),
            }
        }
        Ok(())
    }

    async fn query_window(
        &self,
        bucket: &str,
        measurement: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Point>> {
        let start_ns = start.timestamp_millis() * 1_000_000;
        let end_ns = end.timestamp_millis() * 1_000_000;

        Ok(self
            .points(bucket)
            .into_iter()
            .filter(|p| {
                p.measurement == measurement && p.time_ns >= start_ns && p.time_ns < end_ns
            })
            .collect())
    }
}
