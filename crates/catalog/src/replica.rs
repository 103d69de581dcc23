//! In-memory catalog read replica
//!
//! The ingestor joins `device_id`/`area_id` onto every event on the hot
//! path; those lookups must never touch the database. The discoverer keeps
//! this replica in step with the catalog, and the ingestor feeds device
//! last-seen timestamps back through it (the discoverer persists them, so
//! the catalog keeps a single writer).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use crate::store::CatalogStore;
use haflow_common::error::Result;

/// Hot-path join data for one entity
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityContext {
    pub device_id: Option<String>,
    pub area_id: Option<String>,
}

/// Lock-free replica of the entity -> (device, area) mapping
#[derive(Default)]
pub struct CatalogReplica {
    entities: DashMap<String, EntityContext>,
    /// device_id -> most recent event time, flushed by the discoverer
    last_seen: DashMap<String, DateTime<Utc>>,
}

impl CatalogReplica {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Non-blocking lookup; a miss returns `None` and the event proceeds
    /// with null joins (back-filled later during aggregation)
    pub fn lookup(&self, entity_id: &str) -> Option<EntityContext> {
        self.entities.get(entity_id).map(|e| e.clone())
    }

    pub fn insert(&self, entity_id: &str, context: EntityContext) {
        self.entities.insert(entity_id.to_string(), context);
    }

    pub fn remove(&self, entity_id: &str) {
        self.entities.remove(entity_id);
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Reload the whole mapping from the catalog (after a sweep)
    pub async fn reload(&self, store: &CatalogStore) -> Result<usize> {
        let rows = store.entity_context_rows().await?;
        self.entities.clear();
        let count = rows.len();
        for (entity_id, device_id, area_id) in rows {
            self.entities
                .insert(entity_id, EntityContext { device_id, area_id });
        }
        Ok(count)
    }

    /// Record that an event was seen for an entity's device
    pub fn note_event(&self, entity_id: &str, when: DateTime<Utc>) {
        if let Some(context) = self.entities.get(entity_id) {
            if let Some(device_id) = &context.device_id {
                self.last_seen.insert(device_id.clone(), when);
            }
        }
    }

    /// Drain accumulated last-seen timestamps (taken by the discoverer at
    /// sweep time and persisted)
    pub fn take_last_seen(&self) -> Vec<(String, DateTime<Utc>)> {
        let snapshot: Vec<(String, DateTime<Utc>)> = self
            .last_seen
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        self.last_seen.clear();
        snapshot
    }
}
