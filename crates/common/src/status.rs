//! Component status registry
//!
//! Every subsystem recovers locally from its own transient errors; a
//! component that cannot recover transitions to a self-reported Degraded or
//! Failed status here instead of tearing down siblings. The read-side API
//! serves this registry.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;

/// Per-component health, as surfaced by the read-side API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentHealth {
    Healthy,
    Degraded,
    Failed,
}

/// One component's self-reported state
#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub health: ComponentHealth,
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Process-wide registry of component statuses
///
/// Cheap to clone; hand one to each component at startup.
#[derive(Clone, Default)]
pub struct StatusRegistry {
    components: Arc<DashMap<&'static str, ComponentStatus>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_healthy(&self, component: &'static str) {
        self.set(component, ComponentHealth::Healthy, None);
    }

    pub fn set_degraded(&self, component: &'static str, message: impl Into<String>) {
        self.set(component, ComponentHealth::Degraded, Some(message.into()));
    }

    pub fn set_failed(&self, component: &'static str, message: impl Into<String>) {
        self.set(component, ComponentHealth::Failed, Some(message.into()));
    }

    fn set(&self, component: &'static str, health: ComponentHealth, message: Option<String>) {
        self.components.insert(
            component,
            ComponentStatus {
                health,
                message,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn get(&self, component: &str) -> Option<ComponentStatus> {
        self.components.get(component).map(|s| s.clone())
    }

    /// Snapshot of all components, sorted by name
    pub fn snapshot(&self) -> Vec<(String, ComponentStatus)> {
        let mut all: Vec<_> = self
            .components
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Worst health across all components (for the readiness probe)
    pub fn overall(&self) -> ComponentHealth {
        let mut overall = ComponentHealth::Healthy;
        for entry in self.components.iter() {
            match entry.value().health {
                ComponentHealth::Failed => return ComponentHealth::Failed,
                ComponentHealth::Degraded => overall = ComponentHealth::Degraded,
                ComponentHealth::Healthy => {}
            }
        }
        overall
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        let registry = StatusRegistry::new();

        registry.set_healthy("connection");
        registry.set_degraded("batch-writer", "retry queue backed up");

        assert_eq!(
            registry.get("connection").unwrap().health,
            ComponentHealth::Healthy
        );
        assert_eq!(registry.overall(), ComponentHealth::Degraded);

        registry.set_failed("batch-writer", "spool corrupt");
        assert_eq!(registry.overall(), ComponentHealth::Failed);

        registry.set_healthy("batch-writer");
        assert_eq!(registry.overall(), ComponentHealth::Healthy);
    }

    #[test]
    fn test_snapshot_sorted() {
        let registry = StatusRegistry::new();
        registry.set_healthy("webhooks");
        registry.set_healthy("aggregator");

        let names: Vec<_> = registry.snapshot().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["aggregator", "webhooks"]);
    }
}
