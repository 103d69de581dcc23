//! Weekly compaction job
//!
//! Reads the last seven daily aggregates and produces weekly rows keyed on
//! `(measurement, period-tag, category-tag)`.

use chrono::{Datelike, Days, NaiveDate};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

use haflow_common::{batch_id, FieldValue, Point, TimeSeriesStore};

use crate::detectors::{date_midnight, time_based};
use crate::metrics;

pub const SESSION_MEASUREMENT: &str = "session_weekly";
pub const DAY_TYPE_MEASUREMENT: &str = "day_type_weekly";

/// ISO week period tag, e.g. `2025-W04`
pub fn period_tag(date: NaiveDate) -> String {
    let week = date.iso_week();
    format!("{}-W{:02}", week.year(), week.week())
}

#[derive(Debug, Default)]
pub struct WeeklyOutcome {
    pub daily_rows_read: usize,
    pub rows_written: usize,
}

/// `week_end` is the last (inclusive) day of the seven-day window
pub async fn run(
    store: &dyn TimeSeriesStore,
    daily_bucket: &str,
    weekly_bucket: &str,
    week_end: NaiveDate,
) -> anyhow::Result<WeeklyOutcome> {
    let window_start = week_end
        .checked_sub_days(Days::new(6))
        .expect("window start exists");
    let period = period_tag(week_end);
    let row_time = date_midnight(week_end);

    let daily_rows = store
        .query_window(
            daily_bucket,
            time_based::MEASUREMENT,
            date_midnight(window_start),
            date_midnight(week_end.checked_add_days(Days::new(1)).expect("next day")),
        )
        .await?;

    struct EntityWeek {
        event_count: i64,
        active_days: BTreeSet<String>,
        weekday_count: i64,
        weekend_count: i64,
    }

    let mut per_entity: BTreeMap<String, EntityWeek> = BTreeMap::new();
    for row in &daily_rows {
        let Some(entity_id) = row.tags.get("entity_id") else {
            continue;
        };
        let Some(date_tag) = row.tags.get("date") else {
            continue;
        };
        let count = row
            .fields
            .get("event_count")
            .and_then(FieldValue::as_f64)
            .unwrap_or(0.0) as i64;

        let weekend = date_tag
            .parse::<NaiveDate>()
            .map(|d| matches!(d.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun))
            .unwrap_or(false);

        let entry = per_entity
            .entry(entity_id.clone())
            .or_insert_with(|| EntityWeek {
                event_count: 0,
                active_days: BTreeSet::new(),
                weekday_count: 0,
                weekend_count: 0,
            });
        entry.event_count += count;
        entry.active_days.insert(date_tag.clone());
        if weekend {
            entry.weekend_count += count;
        } else {
            entry.weekday_count += count;
        }
    }

    let mut session_rows = Vec::new();
    let mut day_type_rows = Vec::new();
    for (entity_id, week) in per_entity {
        session_rows.push(
            Point::new(SESSION_MEASUREMENT, row_time)
                .tag("period", period.clone())
                .tag("category", entity_id.clone())
                .field("event_count", FieldValue::Integer(week.event_count))
                .field(
                    "active_days",
                    FieldValue::Integer(week.active_days.len() as i64),
                ),
        );
        for (day_type, count) in [
            ("weekday", week.weekday_count),
            ("weekend", week.weekend_count),
        ] {
            if count == 0 {
                continue;
            }
            day_type_rows.push(
                Point::new(DAY_TYPE_MEASUREMENT, row_time)
                    .tag("period", period.clone())
                    .tag("category", format!("{entity_id}|{day_type}"))
                    .field("event_count", FieldValue::Integer(count)),
            );
        }
    }

    let mut outcome = WeeklyOutcome {
        daily_rows_read: daily_rows.len(),
        rows_written: 0,
    };

    for (measurement, rows) in [
        (SESSION_MEASUREMENT, session_rows),
        (DAY_TYPE_MEASUREMENT, day_type_rows),
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
        read = outcome.daily_rows_read,
        written = outcome.rows_written,
        "weekly aggregation finished"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use haflow_common::MemoryTimeSeriesStore;

    fn daily_row(date: NaiveDate, entity: &str, count: i64) -> Point {
        Point::new(time_based::MEASUREMENT, date_midnight(date))
            .tag("date", date.to_string())
            .tag("entity_id", entity)
            .field("event_count", FieldValue::Integer(count))
    }

    #[tokio::test]
    async fn test_weekly_rollup() {
        let store = MemoryTimeSeriesStore::new();
        // Monday 2025-01-20 back through Sunday 2025-01-26
        let week_end = NaiveDate::from_ymd_opt(2025, 1, 26).unwrap();

        let rows = vec![
            daily_row(NaiveDate::from_ymd_opt(2025, 1, 20).unwrap(), "light.a", 10), // Mon
            daily_row(NaiveDate::from_ymd_opt(2025, 1, 21).unwrap(), "light.a", 20), // Tue
            daily_row(NaiveDate::from_ymd_opt(2025, 1, 25).unwrap(), "light.a", 5),  // Sat
        ];
        store.write_batch("daily", "b", &rows).await.unwrap();

        let outcome = run(&store, "daily", "weekly", week_end).await.unwrap();
        assert_eq!(outcome.daily_rows_read, 3);

        let sessions = store
            .query_window(
                "weekly",
                SESSION_MEASUREMENT,
                date_midnight(week_end),
                date_midnight(week_end.succ_opt().unwrap()),
            )
            .await
            .unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].tags["period"], "2025-W04");
        assert_eq!(sessions[0].tags["category"], "light.a");
        assert_eq!(sessions[0].fields["event_count"], FieldValue::Integer(35));
        assert_eq!(sessions[0].fields["active_days"], FieldValue::Integer(3));

        let day_types = store
            .query_window(
                "weekly",
                DAY_TYPE_MEASUREMENT,
                date_midnight(week_end),
                date_midnight(week_end.succ_opt().unwrap()),
            )
            .await
            .unwrap();
        let weekday = day_types
            .iter()
            .find(|r| r.tags["category"] == "light.a|weekday")
            .unwrap();
        assert_eq!(weekday.fields["event_count"], FieldValue::Integer(30));
        let weekend = day_types
            .iter()
            .find(|r| r.tags["category"] == "light.a|weekend")
            .unwrap();
        assert_eq!(weekend.fields["event_count"], FieldValue::Integer(5));
    }

    #[test]
    fn test_period_tag() {
        assert_eq!(
            period_tag(NaiveDate::from_ymd_opt(2025, 1, 26).unwrap()),
            "2025-W04"
        );
    }
}
