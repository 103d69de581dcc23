//! Catalog rows: devices, entities, areas, capabilities
//!
//! Rows are exclusively owned and mutated by the registry discoverer; every
//! other component reads through the catalog store API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A registered device, unique by `device_id`
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub device_id: String,
    pub name: String,
    pub name_by_user: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub sw_version: Option<String>,
    pub area_id: Option<String>,
    pub integration: String,
    pub entry_type: Option<String>,
    /// 0-100, derived from last_seen recency
    pub health_score: Option<i64>,
    pub last_seen: Option<DateTime<Utc>>,
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A registered entity, unique by `entity_id`;
/// `(device_id, unique_id)` unique when both present
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Entity {
    pub entity_id: String,
    /// May reference a device the catalog has not seen yet; accepted and
    /// counted, never a referential integrity error
    pub device_id: Option<String>,
    pub domain: String,
    pub platform: String,
    pub unique_id: String,
    pub area_id: Option<String>,
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An area (room), unique by `area_id`
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Area {
    pub area_id: String,
    pub name: String,
    /// JSON array of alias strings
    pub aliases: Value,
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Capability type reported by an integration's expose schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityType {
    Numeric,
    Enum,
    Binary,
    Composite,
}

impl CapabilityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityType::Numeric => "numeric",
            CapabilityType::Enum => "enum",
            CapabilityType::Binary => "binary",
            CapabilityType::Composite => "composite",
        }
    }

    pub fn parse(s: &str) -> Option<CapabilityType> {
        match s {
            "numeric" => Some(CapabilityType::Numeric),
            "enum" => Some(CapabilityType::Enum),
            "binary" => Some(CapabilityType::Binary),
            "composite" => Some(CapabilityType::Composite),
            _ => None,
        }
    }
}

/// One device capability, unique by `(device_id, name)`
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Capability {
    pub device_id: String,
    pub name: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub capability_type: String,
    /// `{min,max,unit}` for numeric; `{values[]}` for enum;
    /// `{features[]}` for composite
    pub properties: Value,
    pub exposed: bool,
    /// `schema` when parsed from an expose schema, `inferred` otherwise
    pub source: String,
}

/// Registry update actions carried by `*_registry_updated` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryAction {
    Create,
    Update,
    Remove,
}
