//! Duration detector
//!
//! Rolls up `duration_in_state` samples per entity per day.

use chrono::NaiveDate;
use std::collections::BTreeMap;

use haflow_common::{FieldValue, Point};

use super::{aggregate_row, tag};

pub const MEASUREMENT: &str = "duration_daily";

pub fn detect(date: NaiveDate, events: &[Point]) -> Vec<Point> {
    struct DurationStats {
        total: i64,
        max: i64,
        samples: i64,
    }

    let mut per_entity: BTreeMap<&str, DurationStats> = BTreeMap::new();

    for event in events {
        let entity_id = tag(event, "entity_id");
        if entity_id.is_empty() {
            continue;
        }
        let Some(duration) = event
            .fields
            .get("duration_in_state")
            .and_then(FieldValue::as_f64)
        else {
            continue;
        };
        let duration = duration as i64;

        let stats = per_entity.entry(entity_id).or_insert(DurationStats {
            total: 0,
            max: 0,
            samples: 0,
        });
        stats.total += duration;
        stats.max = stats.max.max(duration);
        stats.samples += 1;
    }

    per_entity
        .into_iter()
        .map(|(entity_id, stats)| {
            aggregate_row(MEASUREMENT, date)
                .tag("entity_id", entity_id)
                .field("total_duration_s", FieldValue::Integer(stats.total))
                .field(
                    "avg_duration_s",
                    FieldValue::Float(stats.total as f64 / stats.samples as f64),
                )
                .field("max_duration_s", FieldValue::Integer(stats.max))
                .field("sample_count", FieldValue::Integer(stats.samples))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{date, raw_event};
    use super::*;

    #[test]
    fn test_duration_rollup() {
        let d = date();
        let events = vec![
            raw_event(d, 7, 0, "light.kitchen", "kitchen", Some(300)),
            raw_event(d, 8, 0, "light.kitchen", "kitchen", Some(900)),
            raw_event(d, 9, 0, "light.kitchen", "kitchen", None), // no sample
        ];

        let rows = detect(d, &events);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields["total_duration_s"], FieldValue::Integer(1200));
        assert_eq!(rows[0].fields["avg_duration_s"], FieldValue::Float(600.0));
        assert_eq!(rows[0].fields["max_duration_s"], FieldValue::Integer(900));
        assert_eq!(rows[0].fields["sample_count"], FieldValue::Integer(2));
    }

    #[test]
    fn test_no_samples_no_rows() {
        let d = date();
        let events = vec![raw_event(d, 7, 0, "light.kitchen", "kitchen", None)];
        assert!(detect(d, &events).is_empty());
    }
}
