//! Capability parsing
//!
//! Devices whose integration reports a typed expose schema get one
//! capability row per expose entry, with its native type and a JSON
//! properties blob. Devices without a schema receive capabilities inferred
//! from the domains of their associated entities.

use serde_json::{json, Value};

use haflow_domain::{Capability, CapabilityType};

/// Parse a device's expose schema into capability rows
///
/// Expose entries look like:
/// `{"type": "numeric", "name": "brightness", "value_min": 0, "value_max": 254, "unit": "lqi"}`
/// `{"type": "enum", "name": "effect", "values": ["blink", "breathe"]}`
/// `{"type": "composite", "name": "color", "features": [...]}`
///
/// Entries with an unknown type or no name are skipped.
pub fn from_expose_schema(device_id: &str, exposes: &[Value]) -> Vec<Capability> {
    let mut capabilities = Vec::new();

    for expose in exposes {
        let Some(name) = expose.get("name").and_then(Value::as_str) else {
            continue;
        };
        let Some(kind) = expose
            .get("type")
            .and_then(Value::as_str)
            .and_then(CapabilityType::parse)
        else {
            continue;
        };

        let properties = match kind {
            CapabilityType::Numeric => json!({
                "min": expose.get("value_min").cloned().unwrap_or(Value::Null),
                "max": expose.get("value_max").cloned().unwrap_or(Value::Null),
                "unit": expose.get("unit").cloned().unwrap_or(Value::Null),
            }),
            CapabilityType::Enum => json!({
                "values": expose.get("values").cloned().unwrap_or_else(|| json!([])),
            }),
            CapabilityType::Composite => json!({
                "features": feature_names(expose),
            }),
            CapabilityType::Binary => json!({}),
        };

        capabilities.push(Capability {
            device_id: device_id.to_string(),
            name: name.to_string(),
            capability_type: kind.as_str().to_string(),
            properties,
            exposed: true,
            source: "schema".to_string(),
        });
    }

    capabilities
}

fn feature_names(expose: &Value) -> Value {
    let names: Vec<Value> = expose
        .get("features")
        .and_then(Value::as_array)
        .map(|features| {
            features
                .iter()
                .filter_map(|f| f.get("name").cloned())
                .collect()
        })
        .unwrap_or_default();
    Value::Array(names)
}

/// Infer capabilities for a schema-less device from its entity domains
pub fn infer_from_domains<'a>(
    device_id: &str,
    domains: impl IntoIterator<Item = &'a str>,
) -> Vec<Capability> {
    let mut capabilities: Vec<Capability> = Vec::new();

    for domain in domains {
        let inferred = match domain {
            "light" => Some((
                "brightness",
                CapabilityType::Numeric,
                json!({"min": 0, "max": 255, "unit": null}),
            )),
            "climate" => Some((
                "temperature",
                CapabilityType::Numeric,
                json!({"min": 7, "max": 35, "unit": "°C"}),
            )),
            "sensor" => Some((
                "value",
                CapabilityType::Numeric,
                json!({"min": null, "max": null, "unit": null}),
            )),
            "cover" => Some((
                "position",
                CapabilityType::Numeric,
                json!({"min": 0, "max": 100, "unit": "%"}),
            )),
            "switch" | "binary_sensor" | "lock" => {
                Some(("state", CapabilityType::Binary, json!({})))
            }
            "media_player" => Some((
                "playback",
                CapabilityType::Composite,
                json!({"features": ["play", "pause", "stop", "volume"]}),
            )),
            _ => None,
        };

        if let Some((name, kind, properties)) = inferred {
            if capabilities.iter().any(|c| c.name == name) {
                continue;
            }
            capabilities.push(Capability {
                device_id: device_id.to_string(),
                name: name.to_string(),
                capability_type: kind.as_str().to_string(),
                properties,
                exposed: true,
                source: "inferred".to_string(),
            });
        }
    }

    capabilities
}
