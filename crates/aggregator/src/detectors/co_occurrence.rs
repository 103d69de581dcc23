//! Co-occurrence detector
//!
//! Finds pairs of distinct entities in the same area firing within a
//! five-minute window. One row per unordered pair per day.

use chrono::NaiveDate;
use std::collections::BTreeMap;

use haflow_common::{FieldValue, Point};

use super::{aggregate_row, tag};

pub const MEASUREMENT: &str = "co_occurrence_daily";

const WINDOW_NS: i64 = 300 * 1_000_000_000;

pub fn detect(date: NaiveDate, events: &[Point]) -> Vec<Point> {
    let mut sorted: Vec<&Point> = events
        .iter()
        .filter(|e| !tag(e, "entity_id").is_empty() && !tag(e, "area_id").is_empty())
        .collect();
    sorted.sort_by_key(|e| e.time_ns);

    // (pair_key, area) -> (count, total_gap_seconds)
    let mut pairs: BTreeMap<(String, String), (i64, i64)> = BTreeMap::new();

    for (i, a) in sorted.iter().enumerate() {
        for b in sorted[i + 1..].iter() {
            let gap_ns = b.time_ns - a.time_ns;
            if gap_ns > WINDOW_NS {
                break;
            }
            let (ea, eb) = (tag(a, "entity_id"), tag(b, "entity_id"));
            if ea == eb || tag(a, "area_id") != tag(b, "area_id") {
                continue;
            }
            let pair_key = if ea < eb {
                format!("{ea}|{eb}")
            } else {
                format!("{eb}|{ea}")
            };
            let entry = pairs
                .entry((pair_key, tag(a, "area_id").to_string()))
                .or_insert((0, 0));
            entry.0 += 1;
            entry.1 += gap_ns / 1_000_000_000;
        }
    }

    pairs
        .into_iter()
        .map(|((pair, area_id), (count, total_gap))| {
            aggregate_row(MEASUREMENT, date)
                .tag("pair", pair)
                .tag("area_id", area_id)
                .field("pair_count", FieldValue::Integer(count))
                .field(
                    "avg_gap_seconds",
                    FieldValue::Float(total_gap as f64 / count as f64),
                )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{date, raw_event};
    use super::*;

    #[test]
    fn test_same_area_within_window() {
        let d = date();
        let events = vec![
            raw_event(d, 7, 0, "motion.hall", "hall", None),
            raw_event(d, 7, 2, "light.hall", "hall", None),    // 120s gap
            raw_event(d, 7, 30, "light.hall", "hall", None),   // outside window
            raw_event(d, 7, 1, "light.kitchen", "kitchen", None), // other area
        ];

        let rows = detect(d, &events);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tags["pair"], "light.hall|motion.hall");
        assert_eq!(rows[0].tags["area_id"], "hall");
        assert_eq!(rows[0].fields["pair_count"], FieldValue::Integer(1));
        assert_eq!(rows[0].fields["avg_gap_seconds"], FieldValue::Float(120.0));
    }

    #[test]
    fn test_pair_key_is_unordered() {
        let d = date();
        // B before A this time; the pair key is the same
        let events = vec![
            raw_event(d, 9, 0, "light.hall", "hall", None),
            raw_event(d, 9, 1, "motion.hall", "hall", None),
        ];

        let rows = detect(d, &events);
        assert_eq!(rows[0].tags["pair"], "light.hall|motion.hall");
    }
}
