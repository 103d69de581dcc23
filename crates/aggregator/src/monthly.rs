//! Monthly compaction job
//!
//! Reads the weekly aggregates falling inside a calendar month plus the
//! current external-source context, and produces monthly rows keyed on
//! `(measurement, period-tag, category-tag)`.

use chrono::{Datelike, Days, NaiveDate};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

use haflow_common::{batch_id, FieldValue, Point, TimeSeriesStore};

use crate::detectors::date_midnight;
use crate::metrics;
use crate::weekly::{DAY_TYPE_MEASUREMENT, SESSION_MEASUREMENT};

pub const CONTEXTUAL_MEASUREMENT: &str = "contextual_monthly";
pub const SEASONAL_MEASUREMENT: &str = "seasonal_monthly";

/// Period tag, e.g. `2025-01`
pub fn period_tag(month_start: NaiveDate) -> String {
    format!("{}-{:02}", month_start.year(), month_start.month())
}

fn month_end(month_start: NaiveDate) -> NaiveDate {
    let next = if month_start.month() == 12 {
        NaiveDate::from_ymd_opt(month_start.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(month_start.year(), month_start.month() + 1, 1)
    };
    next.expect("first of next month exists")
}

#[derive(Debug, Default)]
pub struct MonthlyOutcome {
    pub weekly_rows_read: usize,
    pub rows_written: usize,
}

/// `month_start` is the first day of the month being compacted;
/// `context` is the current enrichment snapshot (external sources)
pub async fn run(
    store: &dyn TimeSeriesStore,
    weekly_bucket: &str,
    month_start: NaiveDate,
    context: &serde_json::Map<String, serde_json::Value>,
) -> anyhow::Result<MonthlyOutcome> {
    let period = period_tag(month_start);
    let window_end = month_end(month_start);
    // Weekly rows are stamped on their window's last day; pad by a week so
    // the month's final (possibly overlapping) week is included
    let query_end = window_end.checked_add_days(Days::new(7)).expect("date");
    let row_time = date_midnight(window_end.pred_opt().expect("last day of month"));

    let sessions = store
        .query_window(
            weekly_bucket,
            SESSION_MEASUREMENT,
            date_midnight(month_start),
            date_midnight(query_end),
        )
        .await?;
    let day_types = store
        .query_window(
            weekly_bucket,
            DAY_TYPE_MEASUREMENT,
            date_midnight(month_start),
            date_midnight(query_end),
        )
        .await?;

    // Contextual: roll weekly entity activity up to domains
    struct DomainMonth {
        event_count: i64,
        entities: BTreeSet<String>,
        weeks: BTreeSet<String>,
    }
    let mut per_domain: BTreeMap<String, DomainMonth> = BTreeMap::new();
    for row in &sessions {
        let Some(entity_id) = row.tags.get("category") else {
            continue;
        };
        let domain = entity_id.split('.').next().unwrap_or("unknown").to_string();
        let count = row
            .fields
            .get("event_count")
            .and_then(FieldValue::as_f64)
            .unwrap_or(0.0) as i64;

        let entry = per_domain.entry(domain).or_insert_with(|| DomainMonth {
            event_count: 0,
            entities: BTreeSet::new(),
            weeks: BTreeSet::new(),
        });
        entry.event_count += count;
        entry.entities.insert(entity_id.clone());
        if let Some(week) = row.tags.get("period") {
            entry.weeks.insert(week.clone());
        }
    }

    let context_json = serde_json::Value::Object(context.clone()).to_string();
    let contextual_rows: Vec<Point> = per_domain
        .into_iter()
        .map(|(domain, month)| {
            Point::new(CONTEXTUAL_MEASUREMENT, row_time)
                .tag("period", period.clone())
                .tag("category", domain)
                .field("event_count", FieldValue::Integer(month.event_count))
                .field(
                    "active_entities",
                    FieldValue::Integer(month.entities.len() as i64),
                )
                .field(
                    "weeks_active",
                    FieldValue::Integer(month.weeks.len() as i64),
                )
                .field("context", FieldValue::String(context_json.clone()))
        })
        .collect();

    // Seasonal: weekday/weekend balance across the month
    let mut per_day_type: BTreeMap<String, i64> = BTreeMap::new();
    for row in &day_types {
        let Some(category) = row.tags.get("category") else {
            continue;
        };
        let Some(day_type) = category.rsplit('|').next() else {
            continue;
        };
        let count = row
            .fields
            .get("event_count")
            .and_then(FieldValue::as_f64)
            .unwrap_or(0.0) as i64;
        *per_day_type.entry(day_type.to_string()).or_default() += count;
    }
    let seasonal_rows: Vec<Point> = per_day_type
        .into_iter()
        .map(|(day_type, count)| {
            Point::new(SEASONAL_MEASUREMENT, row_time)
                .tag("period", period.clone())
                .tag("category", day_type)
                .field("event_count", FieldValue::Integer(count))
        })
        .collect();

    let mut outcome = MonthlyOutcome {
        weekly_rows_read: sessions.len() + day_types.len(),
        rows_written: 0,
    };

    for (measurement, rows) in [
        (CONTEXTUAL_MEASUREMENT, contextual_rows),
        (SEASONAL_MEASUREMENT, seasonal_rows),
    ] {
        if rows.is_empty() {
            continue;
        }
        let id = batch_id(measurement, &rows);
        store.write_batch(weekly_bucket, &id, &rows).await?;
        metrics::DETECTOR_ROWS
            .with_label_values(&[measurement])
            .inc_by(rows.len() as u64);
        outcome.rows_written += rows.len();
    }

    info!(
        period,
        read = outcome.weekly_rows_read,
        written = outcome.rows_written,
        "monthly aggregation finished"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use haflow_common::MemoryTimeSeriesStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_monthly_rollup() {
        let store = MemoryTimeSeriesStore::new();
        let month_start = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();

        let week1_end = NaiveDate::from_ymd_opt(2025, 1, 12).unwrap();
        let week2_end = NaiveDate::from_ymd_opt(2025, 1, 19).unwrap();
        let rows = vec![
            Point::new(SESSION_MEASUREMENT, date_midnight(week1_end))
                .tag("period", "2025-W02")
                .tag("category", "light.kitchen")
                .field("event_count", FieldValue::Integer(100))
                .field("active_days", FieldValue::Integer(6)),
            Point::new(SESSION_MEASUREMENT, date_midnight(week2_end))
                .tag("period", "2025-W03")
                .tag("category", "light.hall")
                .field("event_count", FieldValue::Integer(40))
                .field("active_days", FieldValue::Integer(5)),
            Point::new(DAY_TYPE_MEASUREMENT, date_midnight(week1_end))
                .tag("period", "2025-W02")
                .tag("category", "light.kitchen|weekend")
                .field("event_count", FieldValue::Integer(30)),
        ];
        store.write_batch("weekly", "b", &rows).await.unwrap();

        let mut context = serde_json::Map::new();
        context.insert("weather".into(), json!({"season": "winter"}));

        let outcome = run(&store, "weekly", month_start, &context).await.unwrap();
        assert_eq!(outcome.weekly_rows_read, 3);

        let contextual = store
            .query_window(
                "weekly",
                CONTEXTUAL_MEASUREMENT,
                date_midnight(month_start),
                date_midnight(month_end(month_start)),
            )
            .await
            .unwrap();
        assert_eq!(contextual.len(), 1);
        assert_eq!(contextual[0].tags["period"], "2025-01");
        assert_eq!(contextual[0].tags["category"], "light");
        assert_eq!(contextual[0].fields["event_count"], FieldValue::Integer(140));
        assert_eq!(
            contextual[0].fields["active_entities"],
            FieldValue::Integer(2)
        );
        assert!(contextual[0].fields["context"]
            .as_str()
            .unwrap()
            .contains("winter"));

        let seasonal = store
            .query_window(
                "weekly",
                SEASONAL_MEASUREMENT,
                date_midnight(month_start),
                date_midnight(month_end(month_start)),
            )
            .await
            .unwrap();
        assert_eq!(seasonal.len(), 1);
        assert_eq!(seasonal[0].tags["category"], "weekend");
        assert_eq!(seasonal[0].fields["event_count"], FieldValue::Integer(30));
    }
}
