//! Routing stage
//!
//! Maps each normalized event to one point in the raw measurement.
//!
//! Tags (indexed, bounded cardinality): `entity_id`, `device_id`,
//! `event_type`, `domain`, `area_id`. Fields: `state`,
//! `attr_friendly_name`, `attributes` (JSON string), `duration_in_state`,
//! plus one `enrichment_<source>` JSON field per attached snapshot.
//! Unknown keys from the heterogeneous attribute map are never lifted into
//! tags.

use std::collections::{HashMap, HashSet};

use haflow_common::{FieldValue, Point};
use haflow_domain::Event;

use crate::metrics;

/// The raw event measurement
pub const RAW_MEASUREMENT: &str = "home_assistant_events";

/// Maximum distinct values per tag before collapsing to OVERFLOW
pub const TAG_CARDINALITY_LIMIT: usize = 10_000;

const OVERFLOW: &str = "OVERFLOW";

/// Tracks distinct values per tag key and collapses past the bound
pub struct CardinalityTracker {
    limit: usize,
    seen: HashMap<&'static str, HashSet<String>>,
}

impl CardinalityTracker {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            seen: HashMap::new(),
        }
    }

    /// Admit a tag value, or collapse it to `OVERFLOW` once the tag has
    /// reached its cardinality bound
    pub fn admit(&mut self, tag: &'static str, value: String) -> String {
        if value.is_empty() {
            return value;
        }

        let values = self.seen.entry(tag).or_default();
        if values.contains(&value) {
            return value;
        }
        if values.len() >= self.limit {
            metrics::TAG_OVERFLOW.with_label_values(&[tag]).inc();
            return OVERFLOW.to_string();
        }
        values.insert(value.clone());
        value
    }
}

impl Default for CardinalityTracker {
    fn default() -> Self {
        Self::new(TAG_CARDINALITY_LIMIT)
    }
}

/// Route one event to its raw-measurement point
pub fn to_point(event: &Event, tracker: &mut CardinalityTracker) -> Point {
    let mut point = Point::new(RAW_MEASUREMENT, event.time_fired)
        .tag("entity_id", tracker.admit("entity_id", event.entity_id.clone()))
        .tag("domain", tracker.admit("domain", event.domain.clone()))
        .tag(
            "event_type",
            tracker.admit("event_type", event.event_type.clone()),
        )
        .tag(
            "device_id",
            tracker.admit("device_id", event.device_id.clone().unwrap_or_default()),
        )
        .tag(
            "area_id",
            tracker.admit("area_id", event.area_id.clone().unwrap_or_default()),
        );

    if let Some(state) = event.state() {
        point = point.field("state", FieldValue::String(state.to_string()));
    }

    if let Some(snapshot) = &event.new_state {
        if let Some(name) = snapshot.friendly_name() {
            point = point.field("attr_friendly_name", FieldValue::String(name.to_string()));
        }
        point = point.field(
            "attributes",
            FieldValue::String(snapshot.attributes.to_string()),
        );
    }

    if let Some(duration) = event.duration_in_state {
        point = point.field("duration_in_state", FieldValue::Integer(duration));
    }

    for (source, snapshot) in &event.enrichment {
        point = point.field(
            format!("enrichment_{source}"),
            FieldValue::String(snapshot.to_string()),
        );
    }

    point
}
