//! Dispatcher task
//!
//! Consumes the broadcast tee, evaluates each enabled subscription's
//! condition predicate (pure, O(1) per event), and hands matches to that
//! subscription's mailbox. One consumer task per subscription drains its
//! mailbox in order, so per-subscription delivery order equals pipeline
//! order and a stalled endpoint only blocks itself.
//!
//! The subscription set is reloaded from the catalog periodically, so API
//! edits take effect without a restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use haflow_catalog::CatalogStore;
use haflow_config::WebhookConfig;
use haflow_domain::{ConditionSet, Event, WebhookSubscription};

use crate::delivery::DeliverySender;
use crate::mailbox::Mailbox;
use crate::metrics;

const RELOAD_INTERVAL: Duration = Duration::from_secs(30);

struct Worker {
    subscription: WebhookSubscription,
    conditions: ConditionSet,
    mailbox: Arc<Mailbox<Event>>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Signal the worker to stop after its current delivery attempt.
    /// The returned handle is detached; the task exits on its own.
    fn stop(self) -> JoinHandle<()> {
        self.cancel.cancel();
        self.handle
    }
}

pub struct WebhookDispatcher {
    store: CatalogStore,
    config: WebhookConfig,
    sender: Arc<DeliverySender>,
}

impl WebhookDispatcher {
    pub fn new(store: CatalogStore, config: WebhookConfig) -> anyhow::Result<Self> {
        let sender = Arc::new(DeliverySender::new(
            store.clone(),
            config.attempt_schedule.clone(),
            config.request_timeout,
        )?);
        Ok(Self {
            store,
            config,
            sender,
        })
    }

    /// Run until shutdown. `tee` is the pipeline's broadcast subscription.
    pub async fn run(
        self,
        mut tee: broadcast::Receiver<Event>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let mut workers: HashMap<String, Worker> = HashMap::new();
        self.reload(&mut workers).await;

        let mut reload_timer = tokio::time::interval(RELOAD_INTERVAL);
        reload_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        reload_timer.tick().await;

        info!(subscriptions = workers.len(), "webhook dispatcher started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = reload_timer.tick() => self.reload(&mut workers).await,
                received = tee.recv() => {
                    match received {
                        Ok(event) => self.fan_out(&workers, event),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            metrics::TEE_LAGGED.inc_by(missed);
                            warn!(missed, "dispatcher lagged the event tee");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        for (_, worker) in workers.drain() {
            let _ = worker.stop();
        }
        info!("webhook dispatcher stopped");
        Ok(())
    }

    /// Evaluate predicates and enqueue matches
    fn fan_out(&self, workers: &HashMap<String, Worker>, event: Event) {
        for worker in workers.values() {
            if worker.conditions.matches(&event) {
                if worker.mailbox.push(event.clone()) {
                    metrics::MAILBOX_DROPPED
                        .with_label_values(&[worker.subscription.id.as_str()])
                        .inc();
                }
            }
        }
    }

    /// Reconcile workers with the enabled subscriptions in the catalog
    async fn reload(&self, workers: &mut HashMap<String, Worker>) {
        let subscriptions = match self.store.list_subscriptions(true).await {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                warn!(error = %e, "subscription reload failed, keeping current set");
                return;
            }
        };

        let wanted: HashMap<String, WebhookSubscription> = subscriptions
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();

        // Stop workers for removed or changed subscriptions
        let stale: Vec<String> = workers
            .iter()
            .filter(|(id, worker)| {
                wanted.get(*id).map(|s| {
                    s.url != worker.subscription.url
                        || s.conditions != worker.subscription.conditions
                        || s.secret != worker.subscription.secret
                }) != Some(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            if let Some(worker) = workers.remove(&id) {
                debug!(subscription = %id, "stopping webhook worker");
                let _ = worker.stop();
            }
        }

        // Spawn workers for new subscriptions
        for (id, subscription) in wanted {
            if workers.contains_key(&id) {
                continue;
            }
            let worker = self.spawn_worker(subscription);
            workers.insert(id, worker);
        }
    }

    fn spawn_worker(&self, subscription: WebhookSubscription) -> Worker {
        let mailbox = Arc::new(Mailbox::new(self.config.mailbox_capacity));
        let cancel = CancellationToken::new();
        let conditions = subscription.condition_set();

        let handle = {
            let mailbox = Arc::clone(&mailbox);
            let cancel = cancel.clone();
            let sender = Arc::clone(&self.sender);
            let subscription = subscription.clone();

            tokio::spawn(async move {
                debug!(subscription = %subscription.id, "webhook worker started");
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = mailbox.pop() => {
                            if let Err(e) = sender.deliver(&subscription, &event).await {
                                warn!(
                                    subscription = %subscription.id,
                                    error = %e,
                                    "delivery errored"
                                );
                            }
                        }
                    }
                }
                debug!(subscription = %subscription.id, "webhook worker stopped");
            })
        };

        Worker {
            subscription,
            conditions,
            mailbox,
            cancel,
            handle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use haflow_domain::{EventContext, Origin, StateSnapshot};
    use serde_json::json;
    use uuid::Uuid;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config() -> WebhookConfig {
        WebhookConfig {
            attempt_schedule: vec![Duration::from_millis(10)],
            request_timeout: Duration::from_secs(5),
            mailbox_capacity: 16,
        }
    }

    fn event(entity_id: &str, n: u32) -> Event {
        Event {
            event_id: Uuid::new_v4(),
            event_type: "state_changed".into(),
            entity_id: entity_id.into(),
            domain: Event::domain_of(entity_id).to_string(),
            time_fired: Utc::now(),
            ingest_time: Utc::now(),
            origin: Origin::Local,
            context: EventContext {
                id: format!("ctx-{n}"),
                parent_id: None,
                user_id: None,
            },
            new_state: Some(StateSnapshot {
                state: "on".into(),
                attributes: json!({"seq": n}),
                last_changed: None,
                last_updated: None,
            }),
            old_state: None,
            device_id: None,
            area_id: None,
            duration_in_state: None,
            enrichment: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_fan_out_respects_conditions_and_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = CatalogStore::connect("sqlite::memory:", 2).await.unwrap();
        store
            .create_subscription(
                "lights-only",
                &server.uri(),
                "super-secret-signing-key",
                &json!({"any": [{"all": [{"kind": "domain", "equals": "light"}]}]}),
                true,
            )
            .await
            .unwrap();

        let (event_tx, event_rx) = broadcast::channel(64);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let dispatcher = WebhookDispatcher::new(store, config()).unwrap();
        let task = tokio::spawn(dispatcher.run(event_rx, shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;

        event_tx.send(event("light.one", 1)).unwrap();
        event_tx.send(event("switch.fan", 2)).unwrap(); // filtered out
        event_tx.send(event("light.two", 3)).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let requests = server.received_requests().await.unwrap();
        let entities: Vec<String> = requests
            .iter()
            .map(|r| {
                let payload: serde_json::Value = serde_json::from_slice(&r.body).unwrap();
                payload["entity_id"].as_str().unwrap().to_string()
            })
            .collect();
        // Per-subscription delivery order equals pipeline order
        assert_eq!(entities, vec!["light.one", "light.two"]);

        let _ = shutdown_tx.send(());
        task.await.unwrap().unwrap();
    }
}
