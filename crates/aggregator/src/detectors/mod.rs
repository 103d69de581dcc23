//! Detectors
//!
//! Each detector is a pure function: a window of raw points in, zero or
//! more aggregate rows out. Rows carry a `date` tag plus the detector's
//! natural key, timestamped at the window's midnight, so replays overwrite
//! rather than duplicate.

pub mod anomaly;
pub mod co_occurrence;
pub mod duration;
pub mod room_based;
pub mod sequence;
pub mod time_based;

use chrono::{NaiveDate, TimeZone, Utc};
use haflow_common::Point;

/// Tag value helper; absent tags read as ""
pub(crate) fn tag<'a>(point: &'a Point, key: &str) -> &'a str {
    point.tags.get(key).map(String::as_str).unwrap_or("")
}

/// The window midnight, used as every aggregate row's timestamp
pub(crate) fn date_midnight(date: NaiveDate) -> chrono::DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight exists"))
}

/// Hour-of-day (UTC) of a raw point
pub(crate) fn hour_of(point: &Point) -> u32 {
    let seconds = point.time_ns / 1_000_000_000;
    ((seconds % 86_400 + 86_400) % 86_400 / 3_600) as u32
}

/// Base aggregate row: measurement + date tag + midnight timestamp
pub(crate) fn aggregate_row(measurement: &str, date: NaiveDate) -> Point {
    Point::new(measurement, date_midnight(date)).tag("date", date.to_string())
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use haflow_common::FieldValue;

    /// Raw event point at `HH:MM` on the given date
    pub fn raw_event(
        date: NaiveDate,
        hour: u32,
        minute: u32,
        entity_id: &str,
        area_id: &str,
        duration: Option<i64>,
    ) -> Point {
        let time = Utc.from_utc_datetime(
            &date
                .and_hms_opt(hour, minute, 0)
                .expect("valid wall clock"),
        );
        let mut point = Point::new("home_assistant_events", time)
            .tag("entity_id", entity_id)
            .tag("domain", entity_id.split('.').next().unwrap_or(""))
            .tag("event_type", "state_changed")
            .tag("area_id", area_id)
            .field("state", FieldValue::String("on".into()));
        if let Some(duration) = duration {
            point = point.field("duration_in_state", FieldValue::Integer(duration));
        }
        point
    }

    pub fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 20).expect("valid date")
    }
}
