//! Enrichment stage
//!
//! External sources (weather, carbon, pricing, ...) implement
//! [`EnrichmentProvider`]; one background task per provider refreshes its
//! snapshot and the writer attaches whichever snapshots are still within
//! their TTL. Missing or stale enrichment is never a failure; the event
//! proceeds with the tag absent.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use haflow_domain::Event;

/// One external context source
#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    /// Source name; becomes the key in the event's enrichment map
    fn name(&self) -> &str;

    /// Fetch the current snapshot (a JSON object of tag values)
    async fn fetch(&self) -> anyhow::Result<Value>;
}

struct CachedSnapshot {
    value: Value,
    fetched_at: Instant,
    ttl: Duration,
}

/// TTL'd cache of provider snapshots
#[derive(Default)]
pub struct EnrichmentCache {
    snapshots: DashMap<String, CachedSnapshot>,
}

impl EnrichmentCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store a fresh snapshot for a source
    pub fn put(&self, source: &str, value: Value, ttl: Duration) {
        self.snapshots.insert(
            source.to_string(),
            CachedSnapshot {
                value,
                fetched_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Attach every fresh snapshot to the event's enrichment map
    pub fn apply(&self, event: &mut Event) {
        for entry in self.snapshots.iter() {
            if entry.fetched_at.elapsed() <= entry.ttl {
                event
                    .enrichment
                    .insert(entry.key().clone(), entry.value.clone());
            }
        }
    }

    /// All fresh snapshots as one map (used as monthly-aggregate context)
    pub fn snapshot(&self) -> serde_json::Map<String, Value> {
        self.snapshots
            .iter()
            .filter(|entry| entry.fetched_at.elapsed() <= entry.ttl)
            .map(|entry| (entry.key().clone(), entry.value.clone()))
            .collect()
    }

    /// Spawn one refresh task per provider. Each provider is polled at half
    /// its TTL so snapshots are fresh when the writer reads them; fetch
    /// failures leave the previous snapshot to age out.
    pub fn spawn_refreshers(
        self: &Arc<Self>,
        providers: Vec<Arc<dyn EnrichmentProvider>>,
        ttl_for: impl Fn(&str) -> Duration,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        providers
            .into_iter()
            .map(|provider| {
                let cache = Arc::clone(self);
                let ttl = ttl_for(provider.name());
                let cancel = cancel.clone();

                tokio::spawn(async move {
                    let period = (ttl / 2).max(Duration::from_secs(1));
                    let mut interval = tokio::time::interval(period);
                    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = interval.tick() => {
                                match provider.fetch().await {
                                    Ok(value) => {
                                        debug!(source = provider.name(), "enrichment refreshed");
                                        cache.put(provider.name(), value, ttl);
                                    }
                                    Err(e) => {
                                        warn!(
                                            source = provider.name(),
                                            error = %e,
                                            "enrichment fetch failed"
                                        );
                                    }
                                }
                            }
                        }
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use haflow_domain::{EventContext, Origin};
    use serde_json::json;
    use uuid::Uuid;

    fn event() -> Event {
        Event {
            event_id: Uuid::new_v4(),
            event_type: "state_changed".into(),
            entity_id: "light.kitchen".into(),
            domain: "light".into(),
            time_fired: Utc::now(),
            ingest_time: Utc::now(),
            origin: Origin::Local,
            context: EventContext::default(),
            new_state: None,
            old_state: None,
            device_id: None,
            area_id: None,
            duration_in_state: None,
            enrichment: Default::default(),
        }
    }

    #[test]
    fn test_fresh_snapshot_applied() {
        let cache = EnrichmentCache::new();
        cache.put(
            "weather",
            json!({"condition": "rain", "temperature": 4.5}),
            Duration::from_secs(300),
        );

        let mut e = event();
        cache.apply(&mut e);
        assert_eq!(e.enrichment["weather"]["condition"], "rain");
    }

    #[test]
    fn test_stale_snapshot_absent() {
        let cache = EnrichmentCache::new();
        cache.put("weather", json!({"condition": "rain"}), Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));

        let mut e = event();
        cache.apply(&mut e);
        // Stale source: tag absent, not an error
        assert!(e.enrichment.is_empty());
    }

    #[tokio::test]
    async fn test_refresher_populates_cache() {
        struct FixedProvider;

        #[async_trait]
        impl EnrichmentProvider for FixedProvider {
            fn name(&self) -> &str {
                "weather"
            }
            async fn fetch(&self) -> anyhow::Result<Value> {
                Ok(json!({"condition": "sunny"}))
            }
        }

        let cache = EnrichmentCache::new();
        let cancel = CancellationToken::new();
        let handles = cache.spawn_refreshers(
            vec![Arc::new(FixedProvider)],
            |_| Duration::from_secs(60),
            cancel.clone(),
        );

        // The first tick fires immediately
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut e = event();
        cache.apply(&mut e);
        assert_eq!(e.enrichment["weather"]["condition"], "sunny");

        cancel.cancel();
        for handle in handles {
            let _ = handle.await;
        }
    }
}
