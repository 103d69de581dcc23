//! Room-based detector
//!
//! One row per area per day: activity volume, distinct active entities,
//! and the busiest hour.

use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};

use haflow_common::{FieldValue, Point};

use super::{aggregate_row, hour_of, tag};

pub const MEASUREMENT: &str = "room_based_daily";

pub fn detect(date: NaiveDate, events: &[Point]) -> Vec<Point> {
    struct AreaStats<'a> {
        hours: [i64; 24],
        entities: BTreeSet<&'a str>,
    }

    let mut per_area: BTreeMap<&str, AreaStats> = BTreeMap::new();

    for event in events {
        let area_id = tag(event, "area_id");
        if area_id.is_empty() {
            continue;
        }
        let stats = per_area.entry(area_id).or_insert_with(|| AreaStats {
            hours: [0; 24],
            entities: BTreeSet::new(),
        });
        stats.hours[hour_of(event) as usize] += 1;
        stats.entities.insert(tag(event, "entity_id"));
    }

    per_area
        .into_iter()
        .map(|(area_id, stats)| {
            let event_count: i64 = stats.hours.iter().sum();
            let busiest_hour = stats
                .hours
                .iter()
                .enumerate()
                .max_by_key(|(_, count)| **count)
                .map(|(hour, _)| hour as i64)
                .unwrap_or(0);

            aggregate_row(MEASUREMENT, date)
                .tag("area_id", area_id)
                .field("event_count", FieldValue::Integer(event_count))
                .field(
                    "active_entities",
                    FieldValue::Integer(stats.entities.len() as i64),
                )
                .field("busiest_hour", FieldValue::Integer(busiest_hour))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{date, raw_event};
    use super::*;

    #[test]
    fn test_area_rollup() {
        let d = date();
        let events = vec![
            raw_event(d, 7, 0, "light.kitchen", "kitchen", None),
            raw_event(d, 7, 5, "switch.kettle", "kitchen", None),
            raw_event(d, 9, 0, "light.kitchen", "kitchen", None),
            raw_event(d, 9, 0, "light.bedroom", "bedroom", None),
            raw_event(d, 9, 1, "sensor.orphan", "", None), // no area, skipped
        ];

        let rows = detect(d, &events);
        assert_eq!(rows.len(), 2);

        let kitchen = rows.iter().find(|r| r.tags["area_id"] == "kitchen").unwrap();
        assert_eq!(kitchen.fields["event_count"], FieldValue::Integer(3));
        assert_eq!(kitchen.fields["active_entities"], FieldValue::Integer(2));
        assert_eq!(kitchen.fields["busiest_hour"], FieldValue::Integer(7));
    }
}
