//! Registry reconciliation
//!
//! On every transition to a live session:
//!
//! 1. Issue the three registry-list commands sequentially (devices,
//!    entities, areas), matching responses by request id.
//! 2. Upsert all returned rows with `updated_at = now`. Entities whose
//!    referenced device is unknown are accepted and counted.
//! 3. Subscribe to the three `*_registry_updated` event streams and apply
//!    each `create`/`update`/`remove` transactionally.
//! 4. On `remove`, rows are soft-deleted; hard deletes happen only in the
//!    retention pass after the grace period.
//!
//! After the initial sweep the catalog is eventually consistent with Home
//! Assistant within one reconnect cycle.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use haflow_connection::frames::command_frame;
use haflow_connection::SessionHandle;
use haflow_domain::RegistryAction;

use crate::capabilities;
use crate::metrics;
use crate::replica::{CatalogReplica, EntityContext};
use crate::store::{CatalogStore, NewArea, NewDevice, NewEntity};

const DEVICE_LIST: &str = "config/device_registry/list";
const ENTITY_LIST: &str = "config/entity_registry/list";
const AREA_LIST: &str = "config/area_registry/list";

const DEVICE_UPDATED: &str = "device_registry_updated";
const ENTITY_UPDATED: &str = "entity_registry_updated";
const AREA_UPDATED: &str = "area_registry_updated";

/// Counts from one reconciliation sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    pub devices: usize,
    pub entities: usize,
    pub areas: usize,
    /// Entities accepted with an unknown device reference
    pub orphaned_entities: usize,
    /// Local rows absent upstream, soft-deleted by this sweep
    pub tombstoned: usize,
}

/// The registry discoverer; sole writer of the catalog
pub struct RegistryDiscoverer {
    store: CatalogStore,
    replica: Arc<CatalogReplica>,
}

impl RegistryDiscoverer {
    pub fn new(store: CatalogStore, replica: Arc<CatalogReplica>) -> Self {
        Self { store, replica }
    }

    /// Run the initial reconciliation sweep over a fresh session
    pub async fn run_sweep(&self, session: &SessionHandle) -> anyhow::Result<SweepSummary> {
        let mut summary = SweepSummary::default();

        let devices = self.list(session, DEVICE_LIST).await?;
        let mut expose_schemas: Vec<(String, Vec<Value>)> = Vec::new();
        for raw in &devices {
            if let Some(device) = parse_device(raw) {
                self.store.upsert_device(&device).await?;
                summary.devices += 1;

                if let Some(exposes) = raw.get("exposes").and_then(Value::as_array) {
                    expose_schemas.push((device.device_id.clone(), exposes.clone()));
                }
            }
        }

        let entities = self.list(session, ENTITY_LIST).await?;
        for raw in &entities {
            if let Some(entity) = parse_entity(raw) {
                let device_known = self.store.upsert_entity(&entity).await?;
                summary.entities += 1;
                if !device_known {
                    summary.orphaned_entities += 1;
                    warn!(
                        entity_id = %entity.entity_id,
                        device_id = entity.device_id.as_deref().unwrap_or(""),
                        "entity references unknown device"
                    );
                }
            }
        }

        let areas = self.list(session, AREA_LIST).await?;
        for raw in &areas {
            if let Some(area) = parse_area(raw) {
                self.store.upsert_area(&area).await?;
                summary.areas += 1;
            }
        }

        // Capability pass: schema where the integration reports one,
        // domain inference otherwise
        let with_schema: std::collections::HashSet<&str> = expose_schemas
            .iter()
            .map(|(id, _)| id.as_str())
            .collect();

        for (device_id, exposes) in &expose_schemas {
            let caps = capabilities::from_expose_schema(device_id, exposes);
            self.store.replace_capabilities(device_id, &caps).await?;
        }

        for raw in &devices {
            let Some(device_id) = raw.get("id").and_then(Value::as_str) else {
                continue;
            };
            if with_schema.contains(device_id) {
                continue;
            }
            let entities = self.store.list_entities_for_device(device_id).await?;
            let domains: Vec<&str> = entities.iter().map(|e| e.domain.as_str()).collect();
            let caps = capabilities::infer_from_domains(device_id, domains);
            if !caps.is_empty() {
                self.store.replace_capabilities(device_id, &caps).await?;
            }
        }

        // Rows we hold that upstream no longer lists are tombstoned; hard
        // deletion waits for the retention grace period
        summary.tombstoned = self.tombstone_missing(&devices, &entities, &areas).await?;

        // Persist activity gathered by the ingestor since the last sweep
        let seen = self.replica.take_last_seen();
        if !seen.is_empty() {
            self.store.record_device_activity(&seen).await?;
        }

        let loaded = self.replica.reload(&self.store).await?;
        metrics::SWEEPS.with_label_values(&["ok"]).inc();
        info!(
            devices = summary.devices,
            entities = summary.entities,
            areas = summary.areas,
            orphaned = summary.orphaned_entities,
            replica = loaded,
            "registry sweep complete"
        );

        Ok(summary)
    }

    /// Subscribe to the registry update streams and apply changes until the
    /// session dies. Intended to run as its own task per session.
    pub async fn handle_updates(&self, session: SessionHandle) -> anyhow::Result<()> {
        let mut device_rx = session.subscribe_events(DEVICE_UPDATED).await?;
        let mut entity_rx = session.subscribe_events(ENTITY_UPDATED).await?;
        let mut area_rx = session.subscribe_events(AREA_UPDATED).await?;

        loop {
            tokio::select! {
                _ = session.closed() => break,
                maybe = device_rx.recv() => {
                    let Some(event) = maybe else { break };
                    if let Err(e) = self.apply_device_update(&session, &event).await {
                        warn!(error = %e, "device registry update failed");
                    }
                }
                maybe = entity_rx.recv() => {
                    let Some(event) = maybe else { break };
                    if let Err(e) = self.apply_entity_update(&session, &event).await {
                        warn!(error = %e, "entity registry update failed");
                    }
                }
                maybe = area_rx.recv() => {
                    let Some(event) = maybe else { break };
                    if let Err(e) = self.apply_area_update(&session, &event).await {
                        warn!(error = %e, "area registry update failed");
                    }
                }
            }
        }

        debug!("registry update handler stopped");
        Ok(())
    }

    /// Soft-delete local active rows the upstream lists no longer contain
    async fn tombstone_missing(
        &self,
        devices: &[Value],
        entities: &[Value],
        areas: &[Value],
    ) -> anyhow::Result<usize> {
        use std::collections::HashSet;

        let upstream_devices: HashSet<&str> = devices
            .iter()
            .filter_map(|d| d.get("id").and_then(Value::as_str))
            .collect();
        let upstream_entities: HashSet<&str> = entities
            .iter()
            .filter_map(|e| e.get("entity_id").and_then(Value::as_str))
            .collect();
        let upstream_areas: HashSet<&str> = areas
            .iter()
            .filter_map(|a| a.get("area_id").and_then(Value::as_str))
            .collect();

        let mut tombstoned = 0usize;

        for device in self.store.list_devices(false).await? {
            if !upstream_devices.contains(device.device_id.as_str()) {
                self.store.soft_delete_device(&device.device_id).await?;
                tombstoned += 1;
            }
        }
        for entity in self.store.list_entities(false).await? {
            if !upstream_entities.contains(entity.entity_id.as_str()) {
                self.store.soft_delete_entity(&entity.entity_id).await?;
                self.replica.remove(&entity.entity_id);
                tombstoned += 1;
            }
        }
        for area in self.store.list_areas(false).await? {
            if !upstream_areas.contains(area.area_id.as_str()) {
                self.store.soft_delete_area(&area.area_id).await?;
                tombstoned += 1;
            }
        }

        Ok(tombstoned)
    }

    async fn list(&self, session: &SessionHandle, command: &str) -> anyhow::Result<Vec<Value>> {
        let result = session
            .send_command(command_frame(0, command))
            .await
            .map_err(|e| anyhow::anyhow!("{command} failed: {e}"))?;
        Ok(result.as_array().cloned().unwrap_or_default())
    }

    async fn apply_device_update(
        &self,
        session: &SessionHandle,
        event: &Value,
    ) -> anyhow::Result<()> {
        let Some(action) = parse_action(event) else {
            return Ok(());
        };
        metrics::REGISTRY_UPDATES
            .with_label_values(&["device", action_label(action)])
            .inc();

        match action {
            RegistryAction::Remove => {
                if let Some(id) = event_id(event, "device_id") {
                    self.store.soft_delete_device(&id).await?;
                }
            }
            RegistryAction::Create | RegistryAction::Update => {
                // Some integrations inline the row; otherwise re-list
                if let Some(device) = event
                    .get("data")
                    .and_then(|d| d.get("device"))
                    .and_then(parse_device_opt)
                {
                    self.store.upsert_device(&device).await?;
                } else {
                    let devices = self.list(session, DEVICE_LIST).await?;
                    for raw in &devices {
                        if let Some(device) = parse_device(raw) {
                            self.store.upsert_device(&device).await?;
                        }
                    }
                }
                self.replica.reload(&self.store).await?;
            }
        }
        Ok(())
    }

    async fn apply_entity_update(
        &self,
        session: &SessionHandle,
        event: &Value,
    ) -> anyhow::Result<()> {
        let Some(action) = parse_action(event) else {
            return Ok(());
        };
        metrics::REGISTRY_UPDATES
            .with_label_values(&["entity", action_label(action)])
            .inc();

        match action {
            RegistryAction::Remove => {
                if let Some(id) = event_id(event, "entity_id") {
                    self.store.soft_delete_entity(&id).await?;
                    self.replica.remove(&id);
                }
            }
            RegistryAction::Create | RegistryAction::Update => {
                if let Some(entity) = event
                    .get("data")
                    .and_then(|d| d.get("entity"))
                    .and_then(parse_entity_opt)
                {
                    let device_known = self.store.upsert_entity(&entity).await?;
                    if !device_known {
                        warn!(entity_id = %entity.entity_id, "entity references unknown device");
                    }
                    // Targeted replica refresh with effective area fallback
                    let area_id = match (&entity.area_id, &entity.device_id) {
                        (Some(area), _) => Some(area.clone()),
                        (None, Some(device_id)) => self
                            .store
                            .get_device(device_id)
                            .await?
                            .and_then(|d| d.area_id),
                        (None, None) => None,
                    };
                    self.replica.insert(
                        &entity.entity_id,
                        EntityContext {
                            device_id: entity.device_id.clone(),
                            area_id,
                        },
                    );
                } else {
                    let entities = self.list(session, ENTITY_LIST).await?;
                    for raw in &entities {
                        if let Some(entity) = parse_entity(raw) {
                            self.store.upsert_entity(&entity).await?;
                        }
                    }
                    self.replica.reload(&self.store).await?;
                }
            }
        }
        Ok(())
    }

    async fn apply_area_update(
        &self,
        session: &SessionHandle,
        event: &Value,
    ) -> anyhow::Result<()> {
        let Some(action) = parse_action(event) else {
            return Ok(());
        };
        metrics::REGISTRY_UPDATES
            .with_label_values(&["area", action_label(action)])
            .inc();

        match action {
            RegistryAction::Remove => {
                if let Some(id) = event_id(event, "area_id") {
                    self.store.soft_delete_area(&id).await?;
                }
            }
            RegistryAction::Create | RegistryAction::Update => {
                if let Some(area) = event
                    .get("data")
                    .and_then(|d| d.get("area"))
                    .and_then(parse_area_opt)
                {
                    self.store.upsert_area(&area).await?;
                } else {
                    let areas = self.list(session, AREA_LIST).await?;
                    for raw in &areas {
                        if let Some(area) = parse_area(raw) {
                            self.store.upsert_area(&area).await?;
                        }
                    }
                }
                self.replica.reload(&self.store).await?;
            }
        }
        Ok(())
    }
}

fn parse_action(event: &Value) -> Option<RegistryAction> {
    event
        .get("data")
        .and_then(|d| d.get("action"))
        .cloned()
        .and_then(|a| serde_json::from_value(a).ok())
}

fn action_label(action: RegistryAction) -> &'static str {
    match action {
        RegistryAction::Create => "create",
        RegistryAction::Update => "update",
        RegistryAction::Remove => "remove",
    }
}

fn event_id(event: &Value, key: &str) -> Option<String> {
    event
        .get("data")
        .and_then(|d| d.get(key))
        .and_then(Value::as_str)
        .map(String::from)
}

fn optional_str(raw: &Value, key: &str) -> Option<String> {
    raw.get(key).and_then(Value::as_str).map(String::from)
}

/// Parse one device registry row; rows without an id are skipped
pub fn parse_device(raw: &Value) -> Option<NewDevice> {
    let device_id = raw.get("id").and_then(Value::as_str)?.to_string();

    let name = optional_str(raw, "name")
        .or_else(|| optional_str(raw, "name_by_user"))
        .or_else(|| optional_str(raw, "model"))
        .unwrap_or_else(|| device_id.clone());

    // Integration name: explicit field when present, else the domain half
    // of the first identifier pair
    let integration = optional_str(raw, "integration")
        .or_else(|| {
            raw.get("identifiers")
                .and_then(Value::as_array)
                .and_then(|ids| ids.first())
                .and_then(Value::as_array)
                .and_then(|pair| pair.first())
                .and_then(Value::as_str)
                .map(String::from)
        })
        .unwrap_or_else(|| "unknown".to_string());

    Some(NewDevice {
        device_id,
        name,
        name_by_user: optional_str(raw, "name_by_user"),
        manufacturer: optional_str(raw, "manufacturer"),
        model: optional_str(raw, "model"),
        sw_version: optional_str(raw, "sw_version"),
        area_id: optional_str(raw, "area_id"),
        integration,
        entry_type: optional_str(raw, "entry_type"),
        health_score: None,
        last_seen: None,
    })
}

fn parse_device_opt(raw: &Value) -> Option<NewDevice> {
    parse_device(raw)
}

/// Parse one entity registry row
pub fn parse_entity(raw: &Value) -> Option<NewEntity> {
    let entity_id = raw.get("entity_id").and_then(Value::as_str)?.to_string();
    let domain = entity_id.split('.').next().unwrap_or("").to_string();

    Some(NewEntity {
        device_id: optional_str(raw, "device_id"),
        domain,
        platform: optional_str(raw, "platform").unwrap_or_else(|| "unknown".to_string()),
        unique_id: optional_str(raw, "unique_id").unwrap_or_else(|| entity_id.clone()),
        area_id: optional_str(raw, "area_id"),
        disabled: raw
            .get("disabled_by")
            .map(|v| !v.is_null())
            .unwrap_or(false),
        entity_id,
    })
}

fn parse_entity_opt(raw: &Value) -> Option<NewEntity> {
    parse_entity(raw)
}

/// Parse one area registry row
pub fn parse_area(raw: &Value) -> Option<NewArea> {
    let area_id = raw.get("area_id").and_then(Value::as_str)?.to_string();

    Some(NewArea {
        name: optional_str(raw, "name").unwrap_or_else(|| area_id.clone()),
        aliases: raw
            .get("aliases")
            .and_then(Value::as_array)
            .map(|aliases| {
                aliases
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
        area_id,
    })
}

fn parse_area_opt(raw: &Value) -> Option<NewArea> {
    parse_area(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_device_row() {
        let raw = json!({
            "id": "dev-1",
            "name": "Hue Bulb",
            "manufacturer": "Signify",
            "model": "LCT015",
            "sw_version": "1.93.11",
            "area_id": "living_room",
            "identifiers": [["hue", "00:17:88:01"]],
        });

        let device = parse_device(&raw).unwrap();
        assert_eq!(device.device_id, "dev-1");
        assert_eq!(device.name, "Hue Bulb");
        assert_eq!(device.integration, "hue");
        assert_eq!(device.area_id.as_deref(), Some("living_room"));
    }

    #[test]
    fn test_parse_device_name_fallbacks() {
        let raw = json!({"id": "dev-2", "name": null, "model": "TRV-2"});
        let device = parse_device(&raw).unwrap();
        assert_eq!(device.name, "TRV-2");
        assert_eq!(device.integration, "unknown");

        assert!(parse_device(&json!({"name": "no id"})).is_none());
    }

    #[test]
    fn test_parse_entity_row() {
        let raw = json!({
            "entity_id": "light.living_room",
            "device_id": "dev-1",
            "platform": "hue",
            "unique_id": "uid-1",
            "disabled_by": null,
        });

        let entity = parse_entity(&raw).unwrap();
        assert_eq!(entity.domain, "light");
        assert!(!entity.disabled);

        let disabled = parse_entity(&json!({
            "entity_id": "light.attic",
            "platform": "hue",
            "unique_id": "uid-2",
            "disabled_by": "user",
        }))
        .unwrap();
        assert!(disabled.disabled);
    }

    #[test]
    fn test_parse_area_row() {
        let raw = json!({"area_id": "kitchen", "name": "Kitchen", "aliases": ["cooking"]});
        let area = parse_area(&raw).unwrap();
        assert_eq!(area.area_id, "kitchen");
        assert_eq!(area.aliases, vec!["cooking".to_string()]);
    }

    #[test]
    fn test_parse_action() {
        let event = json!({"event_type": "device_registry_updated",
                           "data": {"action": "remove", "device_id": "dev-1"}});
        assert_eq!(parse_action(&event), Some(RegistryAction::Remove));
        assert_eq!(event_id(&event, "device_id").as_deref(), Some("dev-1"));

        let unknown = json!({"data": {"action": "repainted"}});
        assert_eq!(parse_action(&unknown), None);
    }
}
