//! Anomaly detector
//!
//! Compares each entity's daily event count against its trailing mean from
//! previous daily aggregates. Entities without history pass with a neutral
//! ratio.

use chrono::NaiveDate;
use std::collections::BTreeMap;

use haflow_common::{FieldValue, Point};

use super::{aggregate_row, tag};

pub const MEASUREMENT: &str = "anomaly_daily";

/// Activity beyond this multiple (or below its inverse) of the trailing
/// mean is flagged
const DEVIATION_THRESHOLD: f64 = 3.0;

/// `baseline`: entity -> trailing mean daily event count
pub fn detect(
    date: NaiveDate,
    events: &[Point],
    baseline: &BTreeMap<String, f64>,
) -> Vec<Point> {
    let mut counts: BTreeMap<&str, i64> = BTreeMap::new();
    for event in events {
        let entity_id = tag(event, "entity_id");
        if entity_id.is_empty() {
            continue;
        }
        *counts.entry(entity_id).or_default() += 1;
    }

    counts
        .into_iter()
        .map(|(entity_id, count)| {
            let mean = baseline.get(entity_id).copied().unwrap_or(0.0);
            let ratio = if mean > 0.0 { count as f64 / mean } else { 1.0 };
            let anomalous =
                mean > 0.0 && (ratio >= DEVIATION_THRESHOLD || ratio <= 1.0 / DEVIATION_THRESHOLD);

            aggregate_row(MEASUREMENT, date)
                .tag("entity_id", entity_id)
                .field("event_count", FieldValue::Integer(count))
                .field("baseline_mean", FieldValue::Float(mean))
                .field("deviation_ratio", FieldValue::Float(ratio))
                .field("is_anomalous", FieldValue::Boolean(anomalous))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{date, raw_event};
    use super::*;

    #[test]
    fn test_flags_deviation_from_baseline() {
        let d = date();
        let mut events = Vec::new();
        for minute in 0..30 {
            events.push(raw_event(d, 3, minute, "motion.hall", "hall", None));
        }
        events.push(raw_event(d, 8, 0, "light.kitchen", "kitchen", None));

        let baseline = BTreeMap::from([
            ("motion.hall".to_string(), 5.0),  // 30 today vs 5 -> anomalous
            ("light.kitchen".to_string(), 1.0), // 1 vs 1 -> normal
        ]);

        let rows = detect(d, &events, &baseline);
        let hall = rows.iter().find(|r| r.tags["entity_id"] == "motion.hall").unwrap();
        assert_eq!(hall.fields["is_anomalous"], FieldValue::Boolean(true));
        assert_eq!(hall.fields["deviation_ratio"], FieldValue::Float(6.0));

        let kitchen = rows
            .iter()
            .find(|r| r.tags["entity_id"] == "light.kitchen")
            .unwrap();
        assert_eq!(kitchen.fields["is_anomalous"], FieldValue::Boolean(false));
    }

    #[test]
    fn test_no_history_is_neutral() {
        let d = date();
        let events = vec![raw_event(d, 8, 0, "light.new", "kitchen", None)];
        let rows = detect(d, &events, &BTreeMap::new());

        assert_eq!(rows[0].fields["is_anomalous"], FieldValue::Boolean(false));
        assert_eq!(rows[0].fields["deviation_ratio"], FieldValue::Float(1.0));
    }
}
