//! The canonical flattened event
//!
//! Produced by the ingestor from raw Home Assistant frames, consumed by the
//! batch writer and the webhook dispatcher. `entity_id` lives at the top
//! level only; it is not duplicated inside the state snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Where Home Assistant says the event originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Origin {
    Local,
    Remote,
}

impl Default for Origin {
    fn default() -> Self {
        Origin::Local
    }
}

/// Home Assistant event context (causality chain)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventContext {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// One entity state snapshot
///
/// `attributes` stays an opaque JSON value; unknown keys are never lifted
/// into tags. Known numeric attributes are read through
/// [`StateSnapshot::numeric_attribute`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub state: String,
    #[serde(default)]
    pub attributes: Value,
    #[serde(default)]
    pub last_changed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl StateSnapshot {
    /// Typed accessor for a numeric attribute. Absence or ill-typing is
    /// `None` (not-applicable), never an error.
    pub fn numeric_attribute(&self, name: &str) -> Option<f64> {
        self.attributes.get(name).and_then(Value::as_f64)
    }

    /// The `friendly_name` attribute, when present and a string
    pub fn friendly_name(&self) -> Option<&str> {
        self.attributes.get("friendly_name").and_then(Value::as_str)
    }
}

/// Canonical flattened event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique id assigned at flatten time (carried into webhook payloads)
    pub event_id: Uuid,
    pub event_type: String,
    pub entity_id: String,
    /// Derived from the `entity_id` prefix
    pub domain: String,
    /// When Home Assistant fired the event
    pub time_fired: DateTime<Utc>,
    /// When the ingestor received it
    pub ingest_time: DateTime<Utc>,
    pub origin: Origin,
    pub context: EventContext,
    /// Required for `state_changed`
    pub new_state: Option<StateSnapshot>,
    pub old_state: Option<StateSnapshot>,
    /// Joined from the catalog when known at flatten time
    pub device_id: Option<String>,
    pub area_id: Option<String>,
    /// Seconds between old and new `last_changed`, clamped to >= 0
    pub duration_in_state: Option<i64>,
    /// External-source tags (e.g. weather snapshot), possibly empty
    #[serde(default)]
    pub enrichment: serde_json::Map<String, Value>,
}

impl Event {
    /// Extract the domain prefix of an entity id (`light.kitchen` -> `light`)
    pub fn domain_of(entity_id: &str) -> &str {
        entity_id.split('.').next().unwrap_or(entity_id)
    }

    /// Typed accessor over the new state's attributes
    pub fn numeric_attribute(&self, name: &str) -> Option<f64> {
        self.new_state
            .as_ref()
            .and_then(|s| s.numeric_attribute(name))
    }

    /// The new state's state string, when present
    pub fn state(&self) -> Option<&str> {
        self.new_state.as_ref().map(|s| s.state.as_str())
    }

    /// Webhook payload for this event under one subscription
    pub fn to_webhook_payload(&self, subscription_id: &str) -> Value {
        serde_json::json!({
            "subscription_id": subscription_id,
            "event_id": self.event_id,
            "fired_at": self.time_fired,
            "entity_id": self.entity_id,
            "new_state": self.new_state,
            "old_state": self.old_state,
            "correlation_id": self.context.id,
        })
    }
}
