//! The writer task
//!
//! One instance per target bucket. Consumes normalized events, accumulates
//! per-measurement batches, and flushes on size or timer. Write failures
//! are classified: retriable failures go through a FIFO retry queue with
//! jittered exponential backoff (5s doubling to 30s); non-retriable
//! rejections drop the batch with a fingerprint log.
//!
//! While any batch is waiting on retry, newly flushed batches enter the
//! queue behind it, so batch write order equals pipeline order within the
//! bucket. Bytes held by batches and the retry queue count against the
//! high-water budget; past it the writer raises the backpressure flag the
//! ingestor checks on enqueue.

use futures_util::StreamExt;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use haflow_common::{batch_id, Point, TimeSeriesStore, WriteError};
use haflow_config::WriterConfig;
use haflow_domain::Event;

use crate::enrich::EnrichmentCache;
use crate::metrics;
use crate::normalize;
use crate::route::{self, CardinalityTracker};
use crate::spool::{Spool, SpooledBatch};

/// Retry backoff envelope: 5s doubling to 30s, full jitter
const RETRY_BASE: Duration = Duration::from_secs(5);
const RETRY_MAX: Duration = Duration::from_secs(30);

struct PendingBatch {
    measurement: String,
    batch_id: String,
    points: Vec<Point>,
    bytes: usize,
    /// Retries consumed so far
    attempt: u32,
    next_attempt: tokio::time::Instant,
    from_spool: bool,
}

struct WriterState {
    batches: BTreeMap<String, Vec<Point>>,
    batch_bytes: BTreeMap<String, usize>,
    retry_queue: VecDeque<PendingBatch>,
    tracker: CardinalityTracker,
    in_flight_bytes: usize,
    /// Spool entries not yet confirmed written this run
    unresolved_spool: Vec<SpooledBatch>,
    /// Batches parked this run after exhausting retries
    parked: Vec<SpooledBatch>,
}

impl WriterState {
    fn new() -> Self {
        Self {
            batches: BTreeMap::new(),
            batch_bytes: BTreeMap::new(),
            retry_queue: VecDeque::new(),
            tracker: CardinalityTracker::default(),
            in_flight_bytes: 0,
            unresolved_spool: Vec::new(),
            parked: Vec::new(),
        }
    }
}

/// Batch writer for one bucket
pub struct BatchWriter {
    config: WriterConfig,
    bucket: String,
    store: Arc<dyn TimeSeriesStore>,
    backpressure: Arc<AtomicBool>,
    enrichment: Arc<EnrichmentCache>,
    spool: Spool,
}

impl BatchWriter {
    pub fn new(
        config: WriterConfig,
        bucket: impl Into<String>,
        store: Arc<dyn TimeSeriesStore>,
        backpressure: Arc<AtomicBool>,
        enrichment: Arc<EnrichmentCache>,
    ) -> haflow_common::Result<Self> {
        let bucket = bucket.into();
        let spool = Spool::open(&config.spool_dir, &bucket)?;
        Ok(Self {
            config,
            bucket,
            store,
            backpressure,
            enrichment,
            spool,
        })
    }

    /// Run until shutdown or the pipeline closes. Returns an error only on
    /// fatal conditions (spool corruption).
    pub async fn run(
        self,
        rx: mpsc::Receiver<Event>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let mut state = WriterState::new();

        // Replay batches spooled by a previous run
        for spooled in self.spool.load_all()? {
            let bytes: usize = spooled.points.iter().map(Point::estimated_bytes).sum();
            state.in_flight_bytes += bytes;
            state.retry_queue.push_back(PendingBatch {
                measurement: spooled.measurement.clone(),
                batch_id: spooled.batch_id.clone(),
                points: spooled.points.clone(),
                bytes,
                attempt: 0,
                next_attempt: tokio::time::Instant::now(),
                from_spool: true,
            });
            state.unresolved_spool.push(spooled);
        }
        self.update_pressure(&state);

        // Normalize+enrich may run up to `parallelism` events concurrently;
        // `buffered` preserves order
        let enrichment = Arc::clone(&self.enrichment);
        let mut events = ReceiverStream::new(rx)
            .map(move |event| {
                let enrichment = Arc::clone(&enrichment);
                async move {
                    let mut event = normalize::normalize(event);
                    enrichment.apply(&mut event);
                    event
                }
            })
            .buffered(self.config.parallelism.max(1));

        let mut flush_timer = tokio::time::interval(self.config.flush_interval);
        flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        flush_timer.tick().await; // the immediate first tick

        info!(bucket = %self.bucket, "batch writer started");

        loop {
            let next_retry = state.retry_queue.front().map(|p| p.next_attempt);

            tokio::select! {
                _ = shutdown.recv() => {
                    self.drain(&mut state).await?;
                    info!(bucket = %self.bucket, "batch writer stopped");
                    return Ok(());
                }
                maybe = events.next() => {
                    match maybe {
                        Some(event) => {
                            self.accept(&mut state, event).await?;
                        }
                        None => {
                            self.drain(&mut state).await?;
                            info!(bucket = %self.bucket, "pipeline closed, batch writer stopped");
                            return Ok(());
                        }
                    }
                }
                _ = flush_timer.tick() => {
                    let measurements: Vec<String> = state.batches.keys().cloned().collect();
                    for measurement in measurements {
                        self.flush_measurement(&mut state, &measurement).await?;
                    }
                }
                _ = sleep_until_opt(next_retry), if next_retry.is_some() => {
                    self.process_due_retries(&mut state).await?;
                }
            }
        }
    }

    /// Route one event into its batch; flush if the batch reached size
    async fn accept(&self, state: &mut WriterState, event: Event) -> anyhow::Result<()> {
        let point = route::to_point(&event, &mut state.tracker);
        let bytes = point.estimated_bytes();
        let measurement = point.measurement.clone();

        state.batches.entry(measurement.clone()).or_default().push(point);
        *state.batch_bytes.entry(measurement.clone()).or_default() += bytes;
        state.in_flight_bytes += bytes;
        self.update_pressure(state);

        let size = state
            .batches
            .get(&measurement)
            .map(Vec::len)
            .unwrap_or_default();
        if size >= self.config.batch_size_for(&measurement) {
            self.flush_measurement(state, &measurement).await?;
        }
        Ok(())
    }

    /// Flush one measurement's accumulated batch
    async fn flush_measurement(
        &self,
        state: &mut WriterState,
        measurement: &str,
    ) -> anyhow::Result<()> {
        let points = match state.batches.remove(measurement) {
            Some(points) if !points.is_empty() => points,
            _ => return Ok(()),
        };
        let bytes = state.batch_bytes.remove(measurement).unwrap_or_default();

        let pending = PendingBatch {
            measurement: measurement.to_string(),
            batch_id: batch_id(measurement, &points),
            points,
            bytes,
            attempt: 0,
            next_attempt: tokio::time::Instant::now(),
            from_spool: false,
        };

        // While retries are outstanding, new batches queue behind them so
        // per-bucket ordering holds
        state.retry_queue.push_back(pending);
        if state.retry_queue.len() == 1 {
            self.process_due_retries(state).await?;
        }
        Ok(())
    }

    /// Attempt the retry queue strictly from the front
    async fn process_due_retries(&self, state: &mut WriterState) -> anyhow::Result<()> {
        while let Some(front) = state.retry_queue.front() {
            if front.next_attempt > tokio::time::Instant::now() {
                break;
            }

            let outcome = self
                .store
                .write_batch(&self.bucket, &front.batch_id, &front.points)
                .await;

            match outcome {
                Ok(()) => {
                    let batch = state.retry_queue.pop_front().expect("front exists");
                    metrics::POINTS_WRITTEN
                        .with_label_values(&[batch.measurement.as_str()])
                        .inc_by(batch.points.len() as u64);
                    state.in_flight_bytes = state.in_flight_bytes.saturating_sub(batch.bytes);
                    self.resolve_spooled(state, &batch)?;
                    self.update_pressure(state);
                }
                Err(WriteError::Rejected(message)) => {
                    let batch = state.retry_queue.pop_front().expect("front exists");
                    metrics::WRITE_DROPPED
                        .with_label_values(&[batch.measurement.as_str()])
                        .inc();
                    let fingerprint = batch
                        .points
                        .first()
                        .map(Point::to_line_protocol)
                        .unwrap_or_default();
                    error!(
                        bucket = %self.bucket,
                        batch_id = %batch.batch_id,
                        first_point = %fingerprint.chars().take(160).collect::<String>(),
                        %message,
                        "batch rejected, dropping"
                    );
                    state.in_flight_bytes = state.in_flight_bytes.saturating_sub(batch.bytes);
                    self.resolve_spooled(state, &batch)?;
                    self.update_pressure(state);
                }
                Err(WriteError::Retriable(message)) => {
                    let max_retries = self.config.max_retries;
                    let front = state.retry_queue.front_mut().expect("front exists");
                    front.attempt += 1;
                    metrics::WRITE_RETRIES
                        .with_label_values(&[front.measurement.as_str()])
                        .inc();

                    if front.attempt >= max_retries {
                        warn!(
                            bucket = %self.bucket,
                            batch_id = %front.batch_id,
                            attempts = front.attempt,
                            %message,
                            "retry budget exhausted, spooling batch"
                        );
                        let batch = state.retry_queue.pop_front().expect("front exists");
                        self.park(state, batch)?;
                        self.update_pressure(state);
                    } else {
                        let delay = haflow_common::full_jitter_backoff(
                            front.attempt - 1,
                            RETRY_BASE,
                            RETRY_MAX,
                        );
                        debug!(
                            bucket = %self.bucket,
                            batch_id = %front.batch_id,
                            attempt = front.attempt,
                            delay_ms = delay.as_millis() as u64,
                            %message,
                            "write failed, retrying"
                        );
                        front.next_attempt = tokio::time::Instant::now() + delay;
                        // The queue waits behind its head to preserve order
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// A replayed spool entry resolved (written or rejected): shrink the file
    fn resolve_spooled(&self, state: &mut WriterState, batch: &PendingBatch) -> anyhow::Result<()> {
        if !batch.from_spool {
            return Ok(());
        }
        state
            .unresolved_spool
            .retain(|entry| entry.batch_id != batch.batch_id);
        self.rewrite_spool(state)?;
        Ok(())
    }

    /// Park a batch in the spool after its retry budget ran out
    fn park(&self, state: &mut WriterState, batch: PendingBatch) -> anyhow::Result<()> {
        state.in_flight_bytes = state.in_flight_bytes.saturating_sub(batch.bytes);
        metrics::BATCHES_SPOOLED
            .with_label_values(&[batch.measurement.as_str()])
            .inc();

        if batch.from_spool {
            // Already on disk; nothing to add
            return Ok(());
        }
        state.parked.push(SpooledBatch {
            measurement: batch.measurement,
            batch_id: batch.batch_id,
            points: batch.points,
        });
        self.rewrite_spool(state)?;
        Ok(())
    }

    fn rewrite_spool(&self, state: &WriterState) -> anyhow::Result<()> {
        let mut outstanding: Vec<SpooledBatch> = state.unresolved_spool.clone();
        outstanding.extend(state.parked.iter().cloned());
        self.spool.rewrite(&outstanding)?;
        Ok(())
    }

    fn update_pressure(&self, state: &WriterState) {
        metrics::IN_FLIGHT_BYTES.set(state.in_flight_bytes as i64);
        let over = state.in_flight_bytes >= self.config.high_water_bytes;
        if self.backpressure.swap(over, Ordering::Relaxed) != over {
            if over {
                warn!(
                    bucket = %self.bucket,
                    in_flight = state.in_flight_bytes,
                    "high-water reached, signalling backpressure"
                );
            } else {
                info!(bucket = %self.bucket, "backpressure released");
            }
        }
    }

    /// Drain on shutdown: flush everything, keep attempting the queue until
    /// the grace period ends, spool whatever is still failing
    async fn drain(&self, state: &mut WriterState) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;

        let measurements: Vec<String> = state.batches.keys().cloned().collect();
        for measurement in measurements {
            let points = match state.batches.remove(&measurement) {
                Some(points) if !points.is_empty() => points,
                _ => continue,
            };
            let bytes = state.batch_bytes.remove(&measurement).unwrap_or_default();
            state.retry_queue.push_back(PendingBatch {
                batch_id: batch_id(&measurement, &points),
                measurement,
                points,
                bytes,
                attempt: 0,
                next_attempt: tokio::time::Instant::now(),
                from_spool: false,
            });
        }

        while !state.retry_queue.is_empty() {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            let wake = state
                .retry_queue
                .front()
                .map(|p| p.next_attempt)
                .unwrap_or(now);
            if wake > deadline {
                break;
            }
            tokio::time::sleep_until(wake).await;
            self.process_due_retries(state).await?;
        }

        // Grace period over: park the stragglers
        while let Some(batch) = state.retry_queue.pop_front() {
            warn!(
                bucket = %self.bucket,
                batch_id = %batch.batch_id,
                "drain timeout, spooling batch"
            );
            self.park(state, batch)?;
        }
        self.update_pressure(state);
        Ok(())
    }
}

async fn sleep_until_opt(at: Option<tokio::time::Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use haflow_common::MemoryTimeSeriesStore;
    use haflow_domain::{EventContext, Origin, StateSnapshot};
    use serde_json::json;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn config(spool_dir: &str) -> WriterConfig {
        WriterConfig {
            batch_size: 2,
            batch_sizes: HashMap::new(),
            flush_interval: Duration::from_secs(5),
            max_retries: 3,
            high_water_bytes: 64 * 1024 * 1024,
            parallelism: 2,
            drain_timeout: Duration::from_secs(30),
            spool_dir: spool_dir.to_string(),
        }
    }

    fn event(n: u32) -> Event {
        Event {
            event_id: Uuid::new_v4(),
            event_type: "state_changed".into(),
            entity_id: format!("light.lamp_{n}"),
            domain: "light".into(),
            time_fired: Utc::now(),
            ingest_time: Utc::now(),
            origin: Origin::Local,
            context: EventContext::default(),
            new_state: Some(StateSnapshot {
                state: "on".into(),
                attributes: json!({}),
                last_changed: None,
                last_updated: None,
            }),
            old_state: None,
            device_id: None,
            area_id: None,
            duration_in_state: None,
            enrichment: Default::default(),
        }
    }

    struct Harness {
        tx: mpsc::Sender<Event>,
        shutdown: broadcast::Sender<()>,
        task: tokio::task::JoinHandle<anyhow::Result<()>>,
        store: Arc<MemoryTimeSeriesStore>,
        backpressure: Arc<AtomicBool>,
        _dir: tempfile::TempDir,
    }

    fn start(mut config_fn: impl FnMut(&mut WriterConfig)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path().to_str().unwrap());
        config_fn(&mut cfg);

        let store = Arc::new(MemoryTimeSeriesStore::new());
        let backpressure = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(1000);
        let (shutdown, shutdown_rx) = broadcast::channel(1);

        let writer = BatchWriter::new(
            cfg,
            "raw",
            Arc::clone(&store) as Arc<dyn TimeSeriesStore>,
            Arc::clone(&backpressure),
            EnrichmentCache::new(),
        )
        .unwrap();

        let task = tokio::spawn(writer.run(rx, shutdown_rx));
        Harness {
            tx,
            shutdown,
            task,
            store,
            backpressure,
            _dir: dir,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_batch_size() {
        let h = start(|_| {});

        h.tx.send(event(1)).await.unwrap();
        h.tx.send(event(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let points = h.store.points("raw");
        assert_eq!(points.len(), 2);
        // Pipeline order preserved
        assert_eq!(points[0].tags["entity_id"], "light.lamp_1");
        assert_eq!(points[1].tags["entity_id"], "light.lamp_2");

        let _ = h.shutdown.send(());
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_timer() {
        let h = start(|c| c.batch_size = 100);

        h.tx.send(event(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.store.points("raw").is_empty());

        // Timer expiry flushes the partial batch
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(h.store.points("raw").len(), 1);

        let _ = h.shutdown.send(());
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retriable_failure_retries_in_order() {
        let h = start(|_| {});
        h.store.set_failure(Some(500));

        h.tx.send(event(1)).await.unwrap();
        h.tx.send(event(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.store.points("raw").is_empty());

        // Two more events form a second batch behind the retrying one
        h.tx.send(event(3)).await.unwrap();
        h.tx.send(event(4)).await.unwrap();

        h.store.set_failure(None);
        // Allow the backoff (<= 30s envelope) to elapse
        tokio::time::sleep(Duration::from_secs(35)).await;

        let points = h.store.points("raw");
        assert_eq!(points.len(), 4);
        let ids: Vec<&str> = points
            .iter()
            .map(|p| p.tags["entity_id"].as_str())
            .collect();
        assert_eq!(
            ids,
            vec!["light.lamp_1", "light.lamp_2", "light.lamp_3", "light.lamp_4"]
        );

        let _ = h.shutdown.send(());
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_batch_dropped() {
        let h = start(|_| {});
        h.store.set_failure(Some(400));

        h.tx.send(event(1)).await.unwrap();
        h.tx.send(event(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.store.set_failure(None);
        h.tx.send(event(3)).await.unwrap();
        h.tx.send(event(4)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The rejected batch is gone; later batches flow
        let ids: Vec<String> = h
            .store
            .points("raw")
            .iter()
            .map(|p| p.tags["entity_id"].clone())
            .collect();
        assert_eq!(ids, vec!["light.lamp_3", "light.lamp_4"]);

        let _ = h.shutdown.send(());
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_spools_then_replays() {
        let dir = tempfile::tempdir().unwrap();
        let spool_dir = dir.path().to_str().unwrap().to_string();

        let store = Arc::new(MemoryTimeSeriesStore::new());
        store.set_failure(Some(500));
        let (tx, rx) = mpsc::channel(100);
        let (shutdown, shutdown_rx) = broadcast::channel(1);

        let mut cfg = config(&spool_dir);
        cfg.drain_timeout = Duration::from_secs(1);
        let writer = BatchWriter::new(
            cfg.clone(),
            "raw",
            Arc::clone(&store) as Arc<dyn TimeSeriesStore>,
            Arc::new(AtomicBool::new(false)),
            EnrichmentCache::new(),
        )
        .unwrap();
        let task = tokio::spawn(writer.run(rx, shutdown_rx));

        tx.send(event(1)).await.unwrap();
        tx.send(event(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let _ = shutdown.send(());
        task.await.unwrap().unwrap();

        // At-least-once: the failed batch is in the spool, not lost
        let spool = Spool::open(&spool_dir, "raw").unwrap();
        assert_eq!(spool.load_all().unwrap().len(), 1);

        // A fresh writer replays the spool once the store recovers
        store.set_failure(None);
        let (_tx2, rx2) = mpsc::channel::<Event>(10);
        let (shutdown2, shutdown_rx2) = broadcast::channel(1);
        let writer = BatchWriter::new(
            cfg,
            "raw",
            Arc::clone(&store) as Arc<dyn TimeSeriesStore>,
            Arc::new(AtomicBool::new(false)),
            EnrichmentCache::new(),
        )
        .unwrap();
        let task = tokio::spawn(writer.run(rx2, shutdown_rx2));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(store.points("raw").len(), 2);
        let spool = Spool::open(&spool_dir, "raw").unwrap();
        assert!(spool.load_all().unwrap().is_empty());

        let _ = shutdown2.send(());
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_water_raises_backpressure() {
        let h = start(|c| {
            c.high_water_bytes = 1; // any batch exceeds it
            c.batch_size = 100;
        });
        h.store.set_failure(Some(500));

        h.tx.send(event(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.backpressure.load(Ordering::Relaxed));

        let _ = h.shutdown.send(());
        h.task.await.unwrap().unwrap();
    }
}
