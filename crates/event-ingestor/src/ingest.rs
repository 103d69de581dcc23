//! Per-session ingestion loop
//!
//! Runs after the registry sweep completes on a fresh session. Subscribes
//! to `state_changed`, then for each frame: flatten, join catalog context
//! from the replica (a miss never blocks; nulls are back-filled during
//! aggregation), and enqueue in reception order.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

use haflow_catalog::CatalogReplica;
use haflow_connection::SessionHandle;

use crate::flatten::flatten_event;
use crate::metrics;
use crate::pipeline::EventPipeline;

pub struct EventIngestor {
    pipeline: EventPipeline,
    replica: Arc<CatalogReplica>,
}

impl EventIngestor {
    pub fn new(pipeline: EventPipeline, replica: Arc<CatalogReplica>) -> Self {
        Self { pipeline, replica }
    }

    /// Consume one session's event stream until the session dies.
    ///
    /// Ordering: events from this session are enqueued in reception order.
    /// Nothing persists across sessions; after a reconnect the stream simply
    /// restarts.
    pub async fn run(&self, session: &SessionHandle) -> anyhow::Result<()> {
        let mut events = session.subscribe_events("state_changed").await?;
        debug!(endpoint = session.endpoint(), "event subscription active");

        loop {
            tokio::select! {
                _ = session.closed() => break,
                maybe = events.recv() => {
                    let Some(raw) = maybe else { break };
                    self.handle_frame(&raw);
                }
            }
        }

        debug!(endpoint = session.endpoint(), "ingestion loop stopped");
        Ok(())
    }

    fn handle_frame(&self, raw: &serde_json::Value) {
        let mut event = match flatten_event(raw, Utc::now()) {
            Ok(event) => event,
            Err(e) => {
                metrics::EVENTS_INVALID.with_label_values(&[e.label()]).inc();
                warn!(reason = e.label(), "dropping invalid frame");
                return;
            }
        };

        if let Some(context) = self.replica.lookup(&event.entity_id) {
            event.device_id = context.device_id;
            event.area_id = context.area_id;
        }
        self.replica.note_event(&event.entity_id, event.time_fired);

        // Drop/backpressure accounting happens inside the pipeline
        let _ = self.pipeline.enqueue(event);
    }
}
