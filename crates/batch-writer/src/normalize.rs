//! Normalization stage
//!
//! Coerces the canonical event into write shape: UTC timestamps at
//! millisecond precision, lowercase entity id, duration clamped
//! non-negative. Pure and O(1); the writer may run several normalizations
//! concurrently (order is preserved by the buffered stage).

use chrono::{DateTime, TimeZone, Utc};

use haflow_domain::Event;

/// Truncate to millisecond precision
fn to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts.timestamp_millis())
        .single()
        .unwrap_or(ts)
}

/// Normalize one event in place
pub fn normalize(mut event: Event) -> Event {
    if event.entity_id.chars().any(|c| c.is_ascii_uppercase()) {
        event.entity_id = event.entity_id.to_ascii_lowercase();
        event.domain = Event::domain_of(&event.entity_id).to_string();
    }

    event.time_fired = to_millis(event.time_fired);
    event.ingest_time = to_millis(event.ingest_time);

    if let Some(duration) = event.duration_in_state {
        event.duration_in_state = Some(duration.max(0));
    }

    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use haflow_domain::{EventContext, Origin};
    use uuid::Uuid;

    fn event() -> Event {
        Event {
            event_id: Uuid::new_v4(),
            event_type: "state_changed".into(),
            entity_id: "Light.Kitchen".into(),
            domain: "Light".into(),
            time_fired: Utc.timestamp_nanos(1_737_367_530_123_456_789),
            ingest_time: Utc::now(),
            origin: Origin::Local,
            context: EventContext::default(),
            new_state: None,
            old_state: None,
            device_id: None,
            area_id: None,
            duration_in_state: Some(-5),
            enrichment: Default::default(),
        }
    }

    #[test]
    fn test_normalize() {
        let normalized = normalize(event());

        assert_eq!(normalized.entity_id, "light.kitchen");
        assert_eq!(normalized.domain, "light");
        // Millisecond precision: sub-ms digits are gone
        assert_eq!(
            normalized.time_fired.timestamp_nanos_opt().unwrap() % 1_000_000,
            0
        );
        assert_eq!(normalized.duration_in_state, Some(0));
    }
}
