//! Time-of-day detector
//!
//! One row per entity per day: total event count, the peak hour and its
//! count, and how many distinct hours saw activity.

use chrono::NaiveDate;
use std::collections::BTreeMap;

use haflow_common::{FieldValue, Point};

use super::{aggregate_row, hour_of, tag};

pub const MEASUREMENT: &str = "time_based_daily";

pub fn detect(date: NaiveDate, events: &[Point]) -> Vec<Point> {
    let mut per_entity: BTreeMap<&str, [i64; 24]> = BTreeMap::new();

    for event in events {
        let entity_id = tag(event, "entity_id");
        if entity_id.is_empty() {
            continue;
        }
        per_entity.entry(entity_id).or_insert([0; 24])[hour_of(event) as usize] += 1;
    }

    per_entity
        .into_iter()
        .map(|(entity_id, hours)| {
            let event_count: i64 = hours.iter().sum();
            let (peak_hour, peak_count) = hours
                .iter()
                .enumerate()
                .max_by_key(|(_, count)| **count)
                .map(|(hour, count)| (hour as i64, *count))
                .unwrap_or((0, 0));
            let active_hours = hours.iter().filter(|c| **c > 0).count() as i64;

            aggregate_row(MEASUREMENT, date)
                .tag("entity_id", entity_id)
                .field("event_count", FieldValue::Integer(event_count))
                .field("peak_hour", FieldValue::Integer(peak_hour))
                .field("peak_hour_count", FieldValue::Integer(peak_count))
                .field("active_hours", FieldValue::Integer(active_hours))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{date, raw_event};
    use super::*;

    #[test]
    fn test_peak_hour_and_counts() {
        let d = date();
        let events = vec![
            raw_event(d, 7, 0, "light.kitchen", "kitchen", None),
            raw_event(d, 7, 15, "light.kitchen", "kitchen", None),
            raw_event(d, 19, 0, "light.kitchen", "kitchen", None),
            raw_event(d, 8, 0, "switch.fan", "bedroom", None),
        ];

        let rows = detect(d, &events);
        assert_eq!(rows.len(), 2);

        let kitchen = &rows[0];
        assert_eq!(kitchen.tags["entity_id"], "light.kitchen");
        assert_eq!(kitchen.tags["date"], "2025-01-20");
        assert_eq!(kitchen.fields["event_count"], FieldValue::Integer(3));
        assert_eq!(kitchen.fields["peak_hour"], FieldValue::Integer(7));
        assert_eq!(kitchen.fields["peak_hour_count"], FieldValue::Integer(2));
        assert_eq!(kitchen.fields["active_hours"], FieldValue::Integer(2));
    }

    #[test]
    fn test_one_row_per_entity() {
        let d = date();
        let events = vec![
            raw_event(d, 1, 0, "light.a", "", None),
            raw_event(d, 2, 0, "light.a", "", None),
        ];

        let rows = detect(d, &events);
        assert_eq!(rows.len(), 1);
    }
}
