//! End-to-end pipeline scenarios
//!
//! Drives the real connection, discovery, ingestion and writer components
//! against a mock Home Assistant server and an in-memory time-series
//! store. Covers the happy-path state change (raw point contents, catalog
//! joins, nanosecond timestamps) and drop-tail behavior with a halted
//! writer.

mod mock_ha;

use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use haflow_batch_writer::{BatchWriter, EnrichmentCache};
use haflow_catalog::{CatalogReplica, CatalogStore, RegistryDiscoverer};
use haflow_common::{FieldValue, MemoryTimeSeriesStore, TimeSeriesStore};
use haflow_config::{BreakerConfig, EndpointConfig, HaConfig, WriterConfig};
use haflow_connection::ConnectionManager;
use haflow_domain::{Event, EventContext, Origin};
use haflow_event_ingestor::{EnqueueOutcome, EventIngestor, EventPipeline};

use mock_ha::{small_home, MockHomeAssistant};

fn ha_config(url: &str) -> HaConfig {
    HaConfig {
        endpoints: vec![EndpointConfig {
            name: "primary".into(),
            url: url.to_string(),
            token: "token-1".into(),
        }],
        connect_timeout: Duration::from_secs(5),
        read_idle_timeout: Duration::from_secs(30),
        write_timeout: Duration::from_secs(5),
        ping_interval: Duration::from_secs(60),
    }
}

fn breaker_config() -> BreakerConfig {
    BreakerConfig {
        failure_threshold: 5,
        reset_timeout: Duration::from_secs(60),
        success_threshold: 3,
    }
}

fn writer_config(spool_dir: &str, batch_size: usize) -> WriterConfig {
    WriterConfig {
        batch_size,
        batch_sizes: HashMap::new(),
        flush_interval: Duration::from_millis(200),
        max_retries: 5,
        high_water_bytes: 64 * 1024 * 1024,
        parallelism: 1,
        drain_timeout: Duration::from_secs(5),
        spool_dir: spool_dir.to_string(),
    }
}

fn synthetic_event(n: usize) -> Event {
    Event {
        event_id: Uuid::new_v4(),
        event_type: "state_changed".into(),
        entity_id: format!("light.lamp_{n:03}"),
        domain: "light".into(),
        time_fired: Utc::now(),
        ingest_time: Utc::now(),
        origin: Origin::Local,
        context: EventContext::default(),
        new_state: None,
        old_state: None,
        device_id: None,
        area_id: None,
        duration_in_state: None,
        enrichment: Default::default(),
    }
}

/// S1: a state_changed frame flows to one fully tagged raw point
#[tokio::test]
async fn test_state_change_happy_path() {
    let mock = MockHomeAssistant::start("token-1", small_home()).await;
    let manager = ConnectionManager::new(ha_config(&mock.url()), breaker_config());
    let session = manager.acquire().await.expect("acquire");

    let catalog = CatalogStore::connect("sqlite::memory:", 2).await.unwrap();
    let replica = CatalogReplica::new();
    let discoverer = RegistryDiscoverer::new(catalog.clone(), Arc::clone(&replica));
    let summary = discoverer.run_sweep(&session).await.expect("sweep");
    assert_eq!(summary.devices, 1);
    assert_eq!(summary.entities, 1);

    let (pipeline, pipeline_rx) = EventPipeline::new(100);
    let ingestor = Arc::new(EventIngestor::new(pipeline.clone(), replica));
    {
        let ingestor = Arc::clone(&ingestor);
        let session = session.clone();
        tokio::spawn(async move {
            let _ = ingestor.run(&session).await;
        });
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryTimeSeriesStore::new());
    let writer = BatchWriter::new(
        writer_config(dir.path().to_str().unwrap(), 1),
        "ha_raw",
        Arc::clone(&store) as Arc<dyn TimeSeriesStore>,
        pipeline.backpressure_flag(),
        EnrichmentCache::new(),
    )
    .unwrap();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let writer_task = tokio::spawn(writer.run(pipeline_rx, shutdown_rx));

    mock.push_event(json!({
        "event_type": "state_changed",
        "data": {
            "entity_id": "light.living_room",
            "old_state": {
                "state": "off",
                "last_changed": "2025-01-20T10:00:00Z",
                "last_updated": "2025-01-20T10:00:00Z",
                "attributes": {}
            },
            "new_state": {
                "state": "on",
                "last_changed": "2025-01-20T10:05:30Z",
                "last_updated": "2025-01-20T10:05:30Z",
                "attributes": {"brightness": 200}
            }
        },
        "time_fired": "2025-01-20T10:05:30Z",
        "origin": "LOCAL",
        "context": {"id": "abc", "parent_id": null, "user_id": null}
    }));

    tokio::time::sleep(Duration::from_millis(500)).await;

    let points = store.points("ha_raw");
    assert_eq!(points.len(), 1, "expected exactly one raw point");
    let point = &points[0];

    assert_eq!(point.measurement, "home_assistant_events");
    assert_eq!(point.tags["entity_id"], "light.living_room");
    assert_eq!(point.tags["domain"], "light");
    assert_eq!(point.tags["event_type"], "state_changed");
    assert_eq!(point.tags["device_id"], "dev-1");
    assert_eq!(point.tags["area_id"], "living_room");
    assert_eq!(point.fields["state"], FieldValue::String("on".into()));
    assert_eq!(point.fields["duration_in_state"], FieldValue::Integer(330));
    assert_eq!(point.time_ns, 1_737_367_530_000_000_000);

    let _ = shutdown_tx.send(());
    let _ = writer_task.await;
    session.close();
}

/// S3: with the writer halted, the 101st enqueue is dropped at the tail;
/// on recovery all 100 buffered events are written in order
#[tokio::test]
async fn test_drop_tail_and_recovery_order() {
    let (pipeline, pipeline_rx) = EventPipeline::new(100);

    let dropped_before = haflow_event_ingestor::metrics::PIPELINE_DROPPED.get();

    let mut outcomes = Vec::new();
    for n in 0..101 {
        outcomes.push(pipeline.enqueue(synthetic_event(n)));
    }

    // Only the newest enqueue was dropped
    assert_eq!(
        haflow_event_ingestor::metrics::PIPELINE_DROPPED.get() - dropped_before,
        1
    );
    assert!(outcomes[..100]
        .iter()
        .all(|o| *o == EnqueueOutcome::Accepted));
    assert_eq!(outcomes[100], EnqueueOutcome::Dropped);

    // Writer recovery: everything buffered drains in order
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryTimeSeriesStore::new());
    let writer = BatchWriter::new(
        writer_config(dir.path().to_str().unwrap(), 100),
        "ha_raw",
        Arc::clone(&store) as Arc<dyn TimeSeriesStore>,
        pipeline.backpressure_flag(),
        EnrichmentCache::new(),
    )
    .unwrap();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let writer_task = tokio::spawn(writer.run(pipeline_rx, shutdown_rx));

    tokio::time::sleep(Duration::from_millis(500)).await;

    let points = store.points("ha_raw");
    assert_eq!(points.len(), 100);
    let expected: Vec<String> = (0..100).map(|n| format!("light.lamp_{n:03}")).collect();
    let actual: Vec<String> = points
        .iter()
        .map(|p| p.tags["entity_id"].clone())
        .collect();
    assert_eq!(actual, expected);

    let _ = shutdown_tx.send(());
    let _ = writer_task.await;
}
