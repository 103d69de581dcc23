//! Sequence detector
//!
//! Ordered entity pairs: A fired, then B within two minutes. One row per
//! ordered pair per day.

use chrono::NaiveDate;
use std::collections::BTreeMap;

use haflow_common::{FieldValue, Point};

use super::{aggregate_row, tag};

pub const MEASUREMENT: &str = "sequence_daily";

const WINDOW_NS: i64 = 120 * 1_000_000_000;

pub fn detect(date: NaiveDate, events: &[Point]) -> Vec<Point> {
    let mut sorted: Vec<&Point> = events
        .iter()
        .filter(|e| !tag(e, "entity_id").is_empty())
        .collect();
    sorted.sort_by_key(|e| e.time_ns);

    // "a>b" -> (count, total_gap_seconds)
    let mut sequences: BTreeMap<String, (i64, i64)> = BTreeMap::new();

    for (i, first) in sorted.iter().enumerate() {
        for follower in sorted[i + 1..].iter() {
            let gap_ns = follower.time_ns - first.time_ns;
            if gap_ns > WINDOW_NS {
                break;
            }
            let (a, b) = (tag(first, "entity_id"), tag(follower, "entity_id"));
            if a == b {
                continue;
            }
            let entry = sequences.entry(format!("{a}>{b}")).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += gap_ns / 1_000_000_000;
        }
    }

    sequences
        .into_iter()
        .map(|(sequence, (count, total_gap))| {
            aggregate_row(MEASUREMENT, date)
                .tag("sequence", sequence)
                .field("occurrence_count", FieldValue::Integer(count))
                .field(
                    "avg_gap_seconds",
                    FieldValue::Float(total_gap as f64 / count as f64),
                )
        })
        .collect()
}
