//! Daily compaction job
//!
//! Scans one calendar day of the raw bucket, back-fills missing
//! device/area joins from the current catalog, runs every detector, and
//! writes each detector's rows independently. Detector keys are
//! `(detector, natural-key, date)`, so replaying a day overwrites partial
//! output instead of duplicating it.

use chrono::{Days, NaiveDate};
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

use haflow_batch_writer::RAW_MEASUREMENT;
use haflow_catalog::CatalogStore;
use haflow_common::{batch_id, FieldValue, Point, TimeSeriesStore};

use crate::detectors::{
    anomaly, co_occurrence, date_midnight, duration, room_based, sequence, time_based,
};
use crate::metrics;

/// Days of history feeding the anomaly baseline
const BASELINE_DAYS: u64 = 7;

#[derive(Debug, Default)]
pub struct DailyOutcome {
    pub events_scanned: usize,
    pub rows_written: usize,
    pub failed_detectors: Vec<String>,
}

pub async fn run(
    store: &dyn TimeSeriesStore,
    catalog: &CatalogStore,
    raw_bucket: &str,
    daily_bucket: &str,
    date: NaiveDate,
) -> anyhow::Result<DailyOutcome> {
    let start = date_midnight(date);
    let end = date_midnight(date.checked_add_days(Days::new(1)).expect("next day exists"));

    let mut events = store
        .query_window(raw_bucket, RAW_MEASUREMENT, start, end)
        .await?;
    backfill_catalog_joins(&mut events, catalog).await?;

    let baseline = anomaly_baseline(store, daily_bucket, date).await;

    let mut outcome = DailyOutcome {
        events_scanned: events.len(),
        ..Default::default()
    };

    let detector_rows: Vec<(&str, Vec<Point>)> = vec![
        (time_based::MEASUREMENT, time_based::detect(date, &events)),
        (
            co_occurrence::MEASUREMENT,
            co_occurrence::detect(date, &events),
        ),
        (sequence::MEASUREMENT, sequence::detect(date, &events)),
        (room_based::MEASUREMENT, room_based::detect(date, &events)),
        (duration::MEASUREMENT, duration::detect(date, &events)),
        (
            anomaly::MEASUREMENT,
            anomaly::detect(date, &events, &baseline),
        ),
    ];

    // Each detector writes independently; one failure never blocks the rest
    for (detector, rows) in detector_rows {
        if rows.is_empty() {
            continue;
        }
        let id = batch_id(detector, &rows);
        match store.write_batch(daily_bucket, &id, &rows).await {
            Ok(()) => {
                metrics::DETECTOR_ROWS
                    .with_label_values(&[detector])
                    .inc_by(rows.len() as u64);
                outcome.rows_written += rows.len();
            }
            Err(e) => {
                metrics::DETECTOR_FAILURES
                    .with_label_values(&[detector])
                    .inc();
                warn!(detector, error = %e, "detector write failed");
                outcome.failed_detectors.push(detector.to_string());
            }
        }
    }

    info!(
        %date,
        events = outcome.events_scanned,
        rows = outcome.rows_written,
        failed = outcome.failed_detectors.len(),
        "daily aggregation finished"
    );
    Ok(outcome)
}

/// Fill empty `device_id`/`area_id` tags from the current catalog
async fn backfill_catalog_joins(
    events: &mut [Point],
    catalog: &CatalogStore,
) -> anyhow::Result<()> {
    let joins: HashMap<String, (Option<String>, Option<String>)> = catalog
        .entity_context_rows()
        .await?
        .into_iter()
        .map(|(entity_id, device_id, area_id)| (entity_id, (device_id, area_id)))
        .collect();

    for event in events.iter_mut() {
        let Some(entity_id) = event.tags.get("entity_id").cloned() else {
            continue;
        };
        let Some((device_id, area_id)) = joins.get(&entity_id) else {
            continue;
        };
        if event.tags.get("device_id").map(String::as_str).unwrap_or("") == "" {
            if let Some(device_id) = device_id {
                event.tags.insert("device_id".into(), device_id.clone());
            }
        }
        if event.tags.get("area_id").map(String::as_str).unwrap_or("") == "" {
            if let Some(area_id) = area_id {
                event.tags.insert("area_id".into(), area_id.clone());
            }
        }
    }
    Ok(())
}

/// Trailing mean daily event count per entity from earlier daily rows.
/// Missing history (first run, detector failure) yields an empty baseline.
async fn anomaly_baseline(
    store: &dyn TimeSeriesStore,
    daily_bucket: &str,
    date: NaiveDate,
) -> BTreeMap<String, f64> {
    let Some(window_start) = date.checked_sub_days(Days::new(BASELINE_DAYS)) else {
        return BTreeMap::new();
    };

    let history = match store
        .query_window(
            daily_bucket,
            time_based::MEASUREMENT,
            date_midnight(window_start),
            date_midnight(date),
        )
        .await
    {
        Ok(history) => history,
        Err(e) => {
            warn!(error = %e, "baseline query failed, anomaly runs without history");
            return BTreeMap::new();
        }
    };

    let mut sums: BTreeMap<String, (f64, u32)> = BTreeMap::new();
    for row in history {
        let Some(entity_id) = row.tags.get("entity_id") else {
            continue;
        };
        let count = row
            .fields
            .get("event_count")
            .and_then(FieldValue::as_f64)
            .unwrap_or(0.0);
        let entry = sums.entry(entity_id.clone()).or_insert((0.0, 0));
        entry.0 += count;
        entry.1 += 1;
    }

    sums.into_iter()
        .map(|(entity, (sum, days))| (entity, sum / f64::from(days.max(1))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::testutil::{date, raw_event};
    use haflow_catalog::NewDevice;
    use haflow_common::MemoryTimeSeriesStore;
    use std::sync::Arc;

    async fn catalog() -> CatalogStore {
        CatalogStore::connect("sqlite::memory:", 2).await.unwrap()
    }

    #[tokio::test]
    async fn test_daily_run_writes_detector_rows() {
        let store = Arc::new(MemoryTimeSeriesStore::new());
        let catalog = catalog().await;
        let d = date();

        let events = vec![
            raw_event(d, 7, 0, "light.kitchen", "kitchen", Some(300)),
            raw_event(d, 7, 2, "motion.kitchen", "kitchen", None),
        ];
        store.write_batch("raw", "b1", &events).await.unwrap();

        let outcome = run(store.as_ref(), &catalog, "raw", "daily", d)
            .await
            .unwrap();
        assert_eq!(outcome.events_scanned, 2);
        assert!(outcome.failed_detectors.is_empty());
        assert!(outcome.rows_written > 0);

        let time_rows = store
            .query_window(
                "daily",
                time_based::MEASUREMENT,
                date_midnight(d),
                date_midnight(d.succ_opt().unwrap()),
            )
            .await
            .unwrap();
        assert_eq!(time_rows.len(), 2);
    }

    #[tokio::test]
    async fn test_daily_run_idempotent() {
        let store = Arc::new(MemoryTimeSeriesStore::new());
        let catalog = catalog().await;
        let d = date();

        let events = vec![
            raw_event(d, 7, 0, "light.kitchen", "kitchen", Some(60)),
            raw_event(d, 8, 0, "light.kitchen", "kitchen", Some(120)),
        ];
        store.write_batch("raw", "b1", &events).await.unwrap();

        run(store.as_ref(), &catalog, "raw", "daily", d).await.unwrap();
        let first = store.points("daily");
        run(store.as_ref(), &catalog, "raw", "daily", d).await.unwrap();
        let second = store.points("daily");

        // Same contents, no duplicate (date, natural-key) rows
        assert_eq!(first, second);
        let time_rows: Vec<_> = second
            .iter()
            .filter(|p| p.measurement == time_based::MEASUREMENT)
            .collect();
        assert_eq!(time_rows.len(), 1);
    }

    #[tokio::test]
    async fn test_daily_backfills_device_from_catalog() {
        let store = Arc::new(MemoryTimeSeriesStore::new());
        let catalog = catalog().await;
        let d = date();

        catalog
            .upsert_device(&NewDevice {
                device_id: "dev-9".into(),
                name: "Kitchen light".into(),
                integration: "hue".into(),
                area_id: Some("kitchen".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        catalog
            .upsert_entity(&haflow_catalog::NewEntity {
                entity_id: "light.kitchen".into(),
                device_id: Some("dev-9".into()),
                domain: "light".into(),
                platform: "hue".into(),
                unique_id: "u9".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        // Raw event arrived before the catalog knew the entity
        let mut event = raw_event(d, 7, 0, "light.kitchen", "", None);
        event.tags.insert("device_id".into(), "".into());
        store.write_batch("raw", "b1", &[event]).await.unwrap();

        run(store.as_ref(), &catalog, "raw", "daily", d).await.unwrap();

        let rooms = store
            .query_window(
                "daily",
                room_based::MEASUREMENT,
                date_midnight(d),
                date_midnight(d.succ_opt().unwrap()),
            )
            .await
            .unwrap();
        // The back-filled area made it into the room rollup
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].tags["area_id"], "kitchen");
    }
}
