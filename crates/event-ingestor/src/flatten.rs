//! Frame validation and flattening
//!
//! Turns a raw `state_changed` event object into the canonical event.
//! Frames failing validation are counted and dropped with a structured
//! warning; they are never retried.

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use haflow_domain::{Event, EventContext, Origin, StateSnapshot};

/// Validation failures; the label feeds the invalid-events counter
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlattenError {
    #[error("frame has no entity_id")]
    MissingEntityId,

    #[error("entity_id is not <domain>.<object_id>")]
    InvalidEntityId,

    #[error("state_changed frame has no new_state object")]
    MissingNewState,

    #[error("time_fired missing or unparseable")]
    InvalidTimeFired,
}

impl FlattenError {
    pub fn label(&self) -> &'static str {
        match self {
            FlattenError::MissingEntityId => "missing_entity_id",
            FlattenError::InvalidEntityId => "invalid_entity_id",
            FlattenError::MissingNewState => "missing_new_state",
            FlattenError::InvalidTimeFired => "invalid_time_fired",
        }
    }
}

/// `^[a-z_]+\.[a-z0-9_]+$`
fn valid_entity_id(entity_id: &str) -> bool {
    let Some((domain, object_id)) = entity_id.split_once('.') else {
        return false;
    };
    !domain.is_empty()
        && !object_id.is_empty()
        && domain.chars().all(|c| c.is_ascii_lowercase() || c == '_')
        && object_id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn parse_snapshot(value: &Value) -> Option<StateSnapshot> {
    if !value.is_object() {
        return None;
    }
    Some(StateSnapshot {
        state: value.get("state").and_then(Value::as_str)?.to_string(),
        attributes: value
            .get("attributes")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default())),
        last_changed: parse_instant(value.get("last_changed")),
        last_updated: parse_instant(value.get("last_updated")),
    })
}

fn parse_instant(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Flatten one raw event object (the `event` field of an upstream frame)
/// into the canonical record.
///
/// `new_state` is required for `state_changed`; other event types pass with
/// whatever state objects they carry.
pub fn flatten_event(raw: &Value, ingest_time: DateTime<Utc>) -> Result<Event, FlattenError> {
    let event_type = raw
        .get("event_type")
        .and_then(Value::as_str)
        .unwrap_or("state_changed")
        .to_string();
    let data = raw.get("data").cloned().unwrap_or(Value::Null);

    let entity_id = data
        .get("entity_id")
        .and_then(Value::as_str)
        .ok_or(FlattenError::MissingEntityId)?
        .to_ascii_lowercase();
    if !valid_entity_id(&entity_id) {
        return Err(FlattenError::InvalidEntityId);
    }

    let new_state = data.get("new_state").and_then(parse_snapshot);
    if event_type == "state_changed" && new_state.is_none() {
        return Err(FlattenError::MissingNewState);
    }
    let old_state = data.get("old_state").and_then(parse_snapshot);

    let time_fired =
        parse_instant(raw.get("time_fired")).ok_or(FlattenError::InvalidTimeFired)?;

    let origin = match raw.get("origin").and_then(Value::as_str) {
        Some("REMOTE") => Origin::Remote,
        _ => Origin::Local,
    };

    let context: EventContext = raw
        .get("context")
        .cloned()
        .and_then(|c| serde_json::from_value(c).ok())
        .unwrap_or_default();

    // Seconds in the previous state, clamped to >= 0
    let duration_in_state = match (&old_state, &new_state) {
        (Some(old), Some(new)) => match (old.last_changed, new.last_changed) {
            (Some(from), Some(to)) => Some((to - from).num_seconds().max(0)),
            _ => None,
        },
        _ => None,
    };

    let domain = Event::domain_of(&entity_id).to_string();

    Ok(Event {
        event_id: Uuid::new_v4(),
        event_type,
        entity_id,
        domain,
        time_fired,
        ingest_time,
        origin,
        context,
        new_state,
        old_state,
        device_id: None,
        area_id: None,
        duration_in_state,
        enrichment: Default::default(),
    })
}
