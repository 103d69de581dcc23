//! Session supervisor
//!
//! Owns the connection lifecycle: acquire a session, run the registry
//! sweep, then hold the registry-update handler and the ingestion loop
//! until the session dies, and start over. `ErrNoBackend` is transient;
//! the supervisor retries with full-jitter backoff (100ms doubling to 30s)
//! and reports Degraded after ten minutes without a session, without
//! tearing down any sibling component.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{info, warn};

use haflow_catalog::RegistryDiscoverer;
use haflow_common::{full_jitter_backoff, StatusRegistry};
use haflow_connection::manager::{ACQUIRE_RETRY_BASE, ACQUIRE_RETRY_MAX};
use haflow_connection::{AcquireError, ConnectionManager};
use haflow_event_ingestor::EventIngestor;

/// Without a session for this long, the connection component self-reports
/// Degraded
const DEGRADED_AFTER: Duration = Duration::from_secs(600);

pub async fn run(
    manager: Arc<ConnectionManager>,
    discoverer: Arc<RegistryDiscoverer>,
    ingestor: Arc<EventIngestor>,
    status: StatusRegistry,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let mut attempt: u32 = 0;
    let mut down_since: Option<Instant> = None;
    let mut had_session = false;

    loop {
        let session = tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            acquired = manager.acquire() => acquired,
        };

        match session {
            Ok(session) => {
                attempt = 0;
                down_since = None;
                if had_session {
                    haflow_connection::metrics::RECONNECTS
                        .with_label_values(&[session.endpoint()])
                        .inc();
                }
                had_session = true;
                status.set_healthy("connection");

                // The sweep must finish before events are subscribed, so
                // hot-path joins see a populated replica
                if let Err(e) = discoverer.run_sweep(&session).await {
                    warn!(error = %e, "registry sweep failed, discarding session");
                    status.set_degraded("catalog", format!("sweep failed: {e}"));
                    session.close();
                    continue;
                }
                status.set_healthy("catalog");

                let updates = {
                    let discoverer = Arc::clone(&discoverer);
                    let session = session.clone();
                    tokio::spawn(async move { discoverer.handle_updates(session).await })
                };

                tokio::select! {
                    _ = shutdown.recv() => {
                        session.close();
                        let _ = updates.await;
                        return Ok(());
                    }
                    result = ingestor.run(&session) => {
                        if let Err(e) = result {
                            warn!(error = %e, "ingestion loop ended with error");
                        }
                    }
                }

                info!(endpoint = session.endpoint(), "session lost, re-acquiring");
                session.close();
                let _ = updates.await;
            }
            Err(AcquireError::NoBackend) => {
                attempt = attempt.saturating_add(1);
                let since = *down_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= DEGRADED_AFTER {
                    status.set_degraded(
                        "connection",
                        format!("no backend acquirable for {}s", since.elapsed().as_secs()),
                    );
                }

                let delay = full_jitter_backoff(attempt, ACQUIRE_RETRY_BASE, ACQUIRE_RETRY_MAX);
                tokio::select! {
                    _ = shutdown.recv() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
