//! Webhook delivery
//!
//! Builds the payload, signs it with the subscription secret, and POSTs it
//! with one attempt per schedule slot plus the initial try. Delivery rows
//! are written before the first attempt and updated on every transition:
//! `pending -> pending(attempt=n) -> {delivered | giving_up}`.

use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use haflow_catalog::CatalogStore;
use haflow_common::sign_hmac;
use haflow_domain::{DeliveryStatus, Event, WebhookSubscription};

use crate::metrics;

/// Sends one subscription's deliveries, sequentially
pub struct DeliverySender {
    client: reqwest::Client,
    store: CatalogStore,
    /// Waits between attempts; attempts = schedule length + 1
    schedule: Vec<Duration>,
}

impl DeliverySender {
    pub fn new(
        store: CatalogStore,
        schedule: Vec<Duration>,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            store,
            schedule,
        })
    }

    /// Deliver one event to one subscription, retrying per the schedule.
    /// Returns the terminal status of the delivery row.
    pub async fn deliver(
        &self,
        subscription: &WebhookSubscription,
        event: &Event,
    ) -> anyhow::Result<DeliveryStatus> {
        let payload = event.to_webhook_payload(&subscription.id);
        let body = serde_json::to_vec(&payload)?;
        let payload_hash = hex::encode(Sha256::digest(&body));

        // The pending row lands before the first attempt: a crash during
        // dispatch never loses it
        let delivery_id = self
            .store
            .insert_delivery(&subscription.id, &payload_hash)
            .await?;

        let signature = sign_hmac(&body, &subscription.secret);
        let max_attempts = self.schedule.len() as u32 + 1;

        for attempt in 1..=max_attempts {
            metrics::ATTEMPTS
                .with_label_values(&[subscription.id.as_str()])
                .inc();

            let error = match self
                .post(subscription, &body, &signature, &delivery_id, attempt)
                .await
            {
                Ok(()) => {
                    self.store
                        .update_delivery(&delivery_id, DeliveryStatus::Delivered, attempt, None, None)
                        .await?;
                    metrics::DELIVERED
                        .with_label_values(&[subscription.id.as_str()])
                        .inc();
                    info!(
                        subscription = %subscription.id,
                        delivery = %delivery_id,
                        attempt,
                        "webhook delivered"
                    );
                    return Ok(DeliveryStatus::Delivered);
                }
                Err(error) => error,
            };

            if attempt < max_attempts {
                let wait = self.schedule[(attempt - 1) as usize];
                self.store
                    .update_delivery(
                        &delivery_id,
                        DeliveryStatus::Pending,
                        attempt,
                        Some(chrono::Utc::now() + chrono::Duration::from_std(wait)?),
                        Some(&error),
                    )
                    .await?;
                debug!(
                    subscription = %subscription.id,
                    delivery = %delivery_id,
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    %error,
                    "delivery failed, retrying"
                );
                tokio::time::sleep(wait).await;
            } else {
                self.store
                    .update_delivery(
                        &delivery_id,
                        DeliveryStatus::GivingUp,
                        attempt,
                        None,
                        Some(&error),
                    )
                    .await?;
                metrics::GIVING_UP
                    .with_label_values(&[subscription.id.as_str()])
                    .inc();
                warn!(
                    subscription = %subscription.id,
                    delivery = %delivery_id,
                    attempts = attempt,
                    %error,
                    "delivery abandoned"
                );
                return Ok(DeliveryStatus::GivingUp);
            }
        }

        unreachable!("loop returns on success or final attempt");
    }

    /// One HTTP POST. Success is any 2xx within the request timeout.
    async fn post(
        &self,
        subscription: &WebhookSubscription,
        body: &[u8],
        signature: &str,
        delivery_id: &str,
        attempt: u32,
    ) -> Result<(), String> {
        let started = Instant::now();

        let response = self
            .client
            .post(&subscription.url)
            .header("Content-Type", "application/json")
            .header("X-Signature", format!("sha256={signature}"))
            .header("X-Timestamp", chrono::Utc::now().timestamp().to_string())
            .header("X-Delivery-Id", delivery_id)
            .header("X-Attempt", attempt.to_string())
            .body(body.to_vec())
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => {
                debug!(
                    subscription = %subscription.id,
                    status = response.status().as_u16(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "webhook attempt failed"
                );
                Err(format!("status {}", response.status().as_u16()))
            }
            Err(e) => Err(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use haflow_common::verify_hmac;
    use haflow_domain::{EventContext, Origin, StateSnapshot};
    use serde_json::json;
    use uuid::Uuid;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event() -> Event {
        Event {
            event_id: Uuid::new_v4(),
            event_type: "state_changed".into(),
            entity_id: "light.living_room".into(),
            domain: "light".into(),
            time_fired: Utc::now(),
            ingest_time: Utc::now(),
            origin: Origin::Local,
            context: EventContext {
                id: "ctx-1".into(),
                parent_id: None,
                user_id: None,
            },
            new_state: Some(StateSnapshot {
                state: "on".into(),
                attributes: json!({}),
                last_changed: None,
                last_updated: None,
            }),
            old_state: None,
            device_id: None,
            area_id: None,
            duration_in_state: Some(330),
            enrichment: Default::default(),
        }
    }

    async fn store_with_subscription(url: &str) -> (CatalogStore, WebhookSubscription) {
        let store = CatalogStore::connect("sqlite::memory:", 2).await.unwrap();
        let sub = store
            .create_subscription(
                "lights",
                url,
                "super-secret-signing-key",
                &json!({"any": []}),
                true,
            )
            .await
            .unwrap();
        (store, sub)
    }

    #[tokio::test]
    async fn test_delivery_signed_and_persisted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header_exists("X-Signature"))
            .and(header_exists("X-Timestamp"))
            .and(header_exists("X-Delivery-Id"))
            .and(header_exists("X-Attempt"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (store, sub) = store_with_subscription(&format!("{}/hook", server.uri())).await;
        let sender = DeliverySender::new(
            store.clone(),
            vec![Duration::from_millis(10)],
            Duration::from_secs(5),
        )
        .unwrap();

        let status = sender.deliver(&sub, &event()).await.unwrap();
        assert_eq!(status, DeliveryStatus::Delivered);

        // Signature verifies over the exact payload bytes
        let requests = server.received_requests().await.unwrap();
        let request = &requests[0];
        let header = request.headers.get("X-Signature").unwrap().to_str().unwrap();
        let hex = header.strip_prefix("sha256=").unwrap();
        assert!(verify_hmac(&request.body, hex, &sub.secret));

        // Payload shape
        let payload: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(payload["subscription_id"], sub.id.as_str());
        assert_eq!(payload["entity_id"], "light.living_room");
        assert_eq!(payload["correlation_id"], "ctx-1");

        // Row reached its terminal state
        let rows = store.list_deliveries(&sub.id, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "delivered");
        assert_eq!(rows[0].attempt, 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            // Initial attempt + one per schedule slot, then nothing
            .expect(4)
            .mount(&server)
            .await;

        let (store, sub) = store_with_subscription(&server.uri()).await;
        let sender = DeliverySender::new(
            store.clone(),
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(30),
            ],
            Duration::from_secs(5),
        )
        .unwrap();

        let status = sender.deliver(&sub, &event()).await.unwrap();
        assert_eq!(status, DeliveryStatus::GivingUp);

        let rows = store.list_deliveries(&sub.id, 10).await.unwrap();
        assert_eq!(rows[0].status, "giving_up");
        assert_eq!(rows[0].attempt, 4);
        assert_eq!(rows[0].last_error.as_deref(), Some("status 500"));
    }

    #[tokio::test]
    async fn test_network_error_retries_then_succeeds() {
        // First sender target refuses connections; then point at a live mock
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let (store, sub) = store_with_subscription(&server.uri()).await;
        let sender = DeliverySender::new(
            store.clone(),
            vec![Duration::from_millis(10), Duration::from_millis(10)],
            Duration::from_secs(5),
        )
        .unwrap();

        let status = sender.deliver(&sub, &event()).await.unwrap();
        assert_eq!(status, DeliveryStatus::Delivered);

        let rows = store.list_deliveries(&sub.id, 10).await.unwrap();
        assert_eq!(rows[0].status, "delivered");
        assert_eq!(rows[0].attempt, 2);
    }
}
