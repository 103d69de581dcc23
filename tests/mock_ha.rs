//! Mock Home Assistant server for end-to-end tests
//!
//! Speaks the WebSocket protocol the connection crate expects: auth
//! handshake, registry list commands, `subscribe_events`, and ping/pong.
//! Tests mutate the registry between sessions and push event frames into
//! live subscriptions.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::protocol::Message;

#[derive(Debug, Clone, Default)]
pub struct RegistryFixture {
    pub devices: Vec<Value>,
    pub entities: Vec<Value>,
    pub areas: Vec<Value>,
}

pub struct MockHomeAssistant {
    addr: SocketAddr,
    token: String,
    registry: Arc<Mutex<RegistryFixture>>,
    events: broadcast::Sender<Value>,
}

impl MockHomeAssistant {
    pub async fn start(token: &str, registry: RegistryFixture) -> Arc<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (events, _) = broadcast::channel(256);

        let server = Arc::new(Self {
            addr,
            token: token.to_string(),
            registry: Arc::new(Mutex::new(registry)),
            events,
        });

        let accept = Arc::clone(&server);
        tokio::spawn(async move {
            loop {
                let Ok((tcp, _)) = listener.accept().await else {
                    return;
                };
                let session = Arc::clone(&accept);
                tokio::spawn(async move { session.serve(tcp).await });
            }
        });

        server
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn set_registry(&self, registry: RegistryFixture) {
        *self.registry.lock().expect("registry lock") = registry;
    }

    /// Push one event object to every live `state_changed` subscription
    pub fn push_event(&self, event: Value) {
        let _ = self.events.send(event);
    }

    async fn serve(self: Arc<Self>, tcp: tokio::net::TcpStream) {
        let Ok(ws) = tokio_tungstenite::accept_async(tcp).await else {
            return;
        };
        let (mut sink, mut stream) = ws.split();

        if sink
            .send(Message::Text(
                json!({"type": "auth_required", "ha_version": "2025.1"}).to_string(),
            ))
            .await
            .is_err()
        {
            return;
        }

        let Some(Ok(Message::Text(auth))) = stream.next().await else {
            return;
        };
        let auth: Value = serde_json::from_str(&auth).unwrap_or(Value::Null);
        if auth["access_token"] != Value::String(self.token.clone()) {
            let _ = sink
                .send(Message::Text(
                    json!({"type": "auth_invalid", "message": "invalid token"}).to_string(),
                ))
                .await;
            return;
        }
        if sink
            .send(Message::Text(json!({"type": "auth_ok"}).to_string()))
            .await
            .is_err()
        {
            return;
        }

        let mut event_rx = self.events.subscribe();
        let mut state_changed_sub: Option<u64> = None;

        loop {
            tokio::select! {
                pushed = event_rx.recv() => {
                    let (Ok(event), Some(id)) = (pushed, state_changed_sub) else {
                        continue;
                    };
                    let frame = json!({"id": id, "type": "event", "event": event});
                    if sink.send(Message::Text(frame.to_string())).await.is_err() {
                        return;
                    }
                }
                inbound = stream.next() => {
                    let Some(Ok(message)) = inbound else { return };
                    let Message::Text(text) = message else { continue };
                    let frame: Value = match serde_json::from_str(&text) {
                        Ok(frame) => frame,
                        Err(_) => continue,
                    };
                    let id = frame["id"].as_u64().unwrap_or(0);

                    let reply = match frame["type"].as_str().unwrap_or("") {
                        "ping" => json!({"id": id, "type": "pong"}),
                        "subscribe_events" => {
                            if frame["event_type"] == "state_changed" {
                                state_changed_sub = Some(id);
                            }
                            json!({"id": id, "type": "result", "success": true, "result": null})
                        }
                        "config/device_registry/list" => {
                            let devices = self.registry.lock().expect("lock").devices.clone();
                            json!({"id": id, "type": "result", "success": true, "result": devices})
                        }
                        "config/entity_registry/list" => {
                            let entities = self.registry.lock().expect("lock").entities.clone();
                            json!({"id": id, "type": "result", "success": true, "result": entities})
                        }
                        "config/area_registry/list" => {
                            let areas = self.registry.lock().expect("lock").areas.clone();
                            json!({"id": id, "type": "result", "success": true, "result": areas})
                        }
                        _ => json!({"id": id, "type": "result", "success": true, "result": null}),
                    };

                    if sink.send(Message::Text(reply.to_string())).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Registry fixture with one device, one light entity and one area
pub fn small_home() -> RegistryFixture {
    RegistryFixture {
        devices: vec![json!({
            "id": "dev-1",
            "name": "Hue Bulb",
            "manufacturer": "Signify",
            "model": "LCT015",
            "area_id": "living_room",
            "identifiers": [["hue", "00:17:88:01"]],
        })],
        entities: vec![json!({
            "entity_id": "light.living_room",
            "device_id": "dev-1",
            "platform": "hue",
            "unique_id": "uid-1",
            "disabled_by": null,
        })],
        areas: vec![json!({
            "area_id": "living_room",
            "name": "Living Room",
            "aliases": [],
        })],
    }
}
