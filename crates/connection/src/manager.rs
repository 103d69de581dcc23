//! Connection manager
//!
//! Walks the prioritized endpoint set on every acquire, skipping endpoints
//! whose breaker is Open with an unelapsed reset timeout. The manager itself
//! never blocks higher layers: if no endpoint is usable it returns
//! [`AcquireError::NoBackend`] immediately and the caller retries after a
//! jittered delay.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use haflow_config::{BreakerConfig, HaConfig};

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::metrics;
use crate::session::{self, ConnectError, SessionHandle};

/// Jittered retry envelope for callers that got `NoBackend`
pub const ACQUIRE_RETRY_BASE: Duration = Duration::from_millis(100);
pub const ACQUIRE_RETRY_MAX: Duration = Duration::from_secs(30);

/// Outcome reported back to a breaker (connects, keepalives, session I/O)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Success,
    Failure,
}

#[derive(Debug, Error)]
pub enum AcquireError {
    /// Transient: every endpoint is open or failed this walk
    #[error("no Home Assistant backend available")]
    NoBackend,
}

/// Supervisor-owned manager of the endpoint set
pub struct ConnectionManager {
    ha: HaConfig,
    breakers: Mutex<Vec<CircuitBreaker>>,
    report_tx: mpsc::UnboundedSender<(usize, ReportOutcome)>,
}

impl ConnectionManager {
    /// Build the manager and start its report pump.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(ha: HaConfig, breaker: BreakerConfig) -> std::sync::Arc<Self> {
        let breakers = ha
            .endpoints
            .iter()
            .map(|_| {
                CircuitBreaker::new(
                    breaker.failure_threshold,
                    breaker.success_threshold,
                    breaker.reset_timeout,
                )
            })
            .collect();

        let (report_tx, mut report_rx) = mpsc::unbounded_channel();

        let manager = std::sync::Arc::new(Self {
            ha,
            breakers: Mutex::new(breakers),
            report_tx,
        });

        // Keepalive outcomes from live sessions flow back into the breakers
        let weak = std::sync::Arc::downgrade(&manager);
        tokio::spawn(async move {
            while let Some((index, outcome)) = report_rx.recv().await {
                match weak.upgrade() {
                    Some(manager) => manager.apply_report(index, outcome),
                    None => break,
                }
            }
        });

        manager
    }

    /// Endpoint names in priority order
    pub fn endpoint_names(&self) -> Vec<String> {
        self.ha.endpoints.iter().map(|e| e.name.clone()).collect()
    }

    /// Breaker state for the read-side API
    pub fn breaker_states(&self) -> Vec<(String, BreakerState, u32)> {
        let breakers = self.breakers.lock().expect("breaker lock");
        self.ha
            .endpoints
            .iter()
            .zip(breakers.iter())
            .map(|(e, b)| (e.name.clone(), b.state(), b.consecutive_failures()))
            .collect()
    }

    /// Report an outcome for an endpoint by name. Sessions report
    /// internally by index; this is the surface external callers use.
    pub fn report(&self, endpoint: &str, outcome: ReportOutcome) {
        if let Some(index) = self.ha.endpoints.iter().position(|e| e.name == endpoint) {
            self.apply_report(index, outcome);
        }
    }

    fn apply_report(&self, index: usize, outcome: ReportOutcome) {
        let mut breakers = self.breakers.lock().expect("breaker lock");
        let Some(breaker) = breakers.get_mut(index) else {
            return;
        };
        match outcome {
            ReportOutcome::Success => breaker.record_success(),
            ReportOutcome::Failure => breaker.record_failure(Instant::now()),
        }
        metrics::set_breaker_state(&self.ha.endpoints[index].name, breaker.state());
    }

    /// Acquire a live authenticated session
    ///
    /// Walks endpoints in priority order. Auth failures open the endpoint's
    /// breaker permanently with cause `auth_failed` and the walk continues
    /// to the next endpoint.
    pub async fn acquire(&self) -> Result<SessionHandle, AcquireError> {
        for (index, endpoint) in self.ha.endpoints.iter().enumerate() {
            let allowed = {
                let mut breakers = self.breakers.lock().expect("breaker lock");
                let allowed = breakers[index].should_attempt(Instant::now());
                metrics::set_breaker_state(&endpoint.name, breakers[index].state());
                allowed
            };
            if !allowed {
                continue;
            }

            match session::connect(endpoint, &self.ha, self.report_tx.clone(), index).await {
                Ok(handle) => {
                    info!(endpoint = %endpoint.name, "session acquired");
                    metrics::CONNECTS
                        .with_label_values(&[endpoint.name.as_str(), "ok"])
                        .inc();
                    // A half-open breaker stays half-open until keepalives
                    // confirm the endpoint; the connect only clears failures
                    {
                        let mut breakers = self.breakers.lock().expect("breaker lock");
                        breakers[index].record_connect();
                        metrics::set_breaker_state(&endpoint.name, breakers[index].state());
                    }
                    return Ok(handle);
                }
                Err(ConnectError::AuthFailed { .. }) => {
                    warn!(endpoint = %endpoint.name, "auth failed, endpoint disabled until config change");
                    metrics::CONNECTS
                        .with_label_values(&[endpoint.name.as_str(), "auth_failed"])
                        .inc();
                    let mut breakers = self.breakers.lock().expect("breaker lock");
                    breakers[index].force_open(Instant::now(), "auth_failed", true);
                    metrics::set_breaker_state(&endpoint.name, breakers[index].state());
                }
                Err(e) => {
                    warn!(endpoint = %endpoint.name, error = %e, "connect failed");
                    metrics::CONNECTS
                        .with_label_values(&[endpoint.name.as_str(), "error"])
                        .inc();
                    self.apply_report(index, ReportOutcome::Failure);
                }
            }
        }

        Err(AcquireError::NoBackend)
    }
}
