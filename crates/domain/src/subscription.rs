//! Webhook subscriptions and their condition predicates
//!
//! Conditions are a simple disjunctive normal form over `entity_id`,
//! `domain`, `new_state.state` and numeric attribute thresholds. Predicates
//! are pure, O(1) per event, and side-effect free.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::event::Event;

/// Comparison operators for numeric attribute conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CmpOp {
    fn apply(&self, left: f64, right: f64) -> bool {
        match self {
            CmpOp::Eq => (left - right).abs() < f64::EPSILON,
            CmpOp::Gt => left > right,
            CmpOp::Gte => left >= right,
            CmpOp::Lt => left < right,
            CmpOp::Lte => left <= right,
        }
    }
}

/// One atomic condition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    EntityId { equals: String },
    Domain { equals: String },
    State { equals: String },
    NumericAttribute { attribute: String, op: CmpOp, value: f64 },
}

impl Condition {
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Condition::EntityId { equals } => event.entity_id == *equals,
            Condition::Domain { equals } => event.domain == *equals,
            Condition::State { equals } => event.state() == Some(equals.as_str()),
            Condition::NumericAttribute {
                attribute,
                op,
                value,
            } => match event.numeric_attribute(attribute) {
                // Absent or ill-typed attribute is not-applicable
                None => false,
                Some(actual) => op.apply(actual, *value),
            },
        }
    }
}

/// A conjunction of conditions (all must hold)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionGroup {
    pub all: Vec<Condition>,
}

/// DNF condition set: a disjunction of groups. An empty set matches every
/// event (subscribe-to-all).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConditionSet {
    #[serde(default)]
    pub any: Vec<ConditionGroup>,
}

impl ConditionSet {
    pub fn matches(&self, event: &Event) -> bool {
        if self.any.is_empty() {
            return true;
        }
        self.any
            .iter()
            .any(|group| group.all.iter().all(|c| c.matches(event)))
    }
}

/// A configured webhook subscription
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookSubscription {
    pub id: String,
    pub name: String,
    pub url: String,
    /// HMAC secret; never serialized into API responses
    #[serde(skip_serializing)]
    pub secret: String,
    /// JSON-encoded [`ConditionSet`]
    pub conditions: serde_json::Value,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl WebhookSubscription {
    pub fn condition_set(&self) -> ConditionSet {
        serde_json::from_value(self.conditions.clone()).unwrap_or_default()
    }
}

/// API request to create a subscription
#[derive(Debug, Validate, Deserialize)]
pub struct CreateSubscriptionRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: String,

    #[validate(url)]
    pub url: String,

    #[validate(length(min = 16, max = 255))]
    pub secret: String,

    #[serde(default)]
    pub conditions: ConditionSet,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}
