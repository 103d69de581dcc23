//! Authenticated Home Assistant WebSocket session
//!
//! A session is owned by the connection manager's supervisor. Higher layers
//! interact through [`SessionHandle`], which serializes outgoing frames
//! through one writer task and fans inbound frames out by request id
//! (commands, pongs) or subscription id (event streams).
//!
//! The reader task only decodes frames and hands them off; no CPU work
//! happens on the socket. Any I/O error, read-idle timeout or missed pong is
//! fatal to the whole session: the cancellation token fires, every pending
//! command fails with `Closed`, and the caller must re-acquire.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use haflow_config::{EndpointConfig, HaConfig};

use crate::frames::{self, ServerFrame};
use crate::manager::ReportOutcome;
use crate::metrics;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Capacity of each event subscription channel. The pipeline is the real
/// bounded buffer; this only smooths reader/consumer jitter.
const SUBSCRIPTION_CAPACITY: usize = 1024;

/// Connect-time failures
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect to {endpoint} timed out")]
    Timeout { endpoint: String },

    /// Permanent for the endpoint; not retried without a config change
    #[error("authentication failed for {endpoint}")]
    AuthFailed { endpoint: String },

    #[error("websocket error on {endpoint}: {message}")]
    WebSocket { endpoint: String, message: String },

    #[error("protocol error on {endpoint}: {message}")]
    Protocol { endpoint: String, message: String },
}

/// Failures on a live session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,

    #[error("command timed out")]
    Timeout,

    #[error("command rejected: {0}")]
    CommandFailed(String),
}

struct SessionInner {
    endpoint: String,
    out_tx: mpsc::Sender<Message>,
    pending: dashmap::DashMap<u64, oneshot::Sender<Result<Value, SessionError>>>,
    subscriptions: dashmap::DashMap<u64, mpsc::Sender<Value>>,
    next_id: AtomicU64,
    command_timeout: Duration,
    cancel: CancellationToken,
}

/// Cloneable handle to a live session
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("endpoint", &self.inner.endpoint)
            .finish()
    }
}

impl SessionHandle {
    /// Name of the endpoint this session was acquired from
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn is_alive(&self) -> bool {
        !self.inner.cancel.is_cancelled()
    }

    /// Resolves when the session dies (I/O error, idle timeout, close)
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await;
    }

    /// Tear the session down
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    fn allocate_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn send_frame(&self, frame: Value) -> Result<(), SessionError> {
        if self.inner.cancel.is_cancelled() {
            return Err(SessionError::Closed);
        }
        self.inner
            .out_tx
            .send(Message::Text(frame.to_string()))
            .await
            .map_err(|_| SessionError::Closed)
    }

    async fn await_result(
        &self,
        id: u64,
        deadline: Duration,
        rx: oneshot::Receiver<Result<Value, SessionError>>,
    ) -> Result<Value, SessionError> {
        match timeout(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_) => {
                self.inner.pending.remove(&id);
                Err(SessionError::Timeout)
            }
        }
    }

    /// Send one command frame (an `id` is injected) and await its result
    pub async fn send_command(&self, mut frame: Value) -> Result<Value, SessionError> {
        let id = self.allocate_id();
        frame
            .as_object_mut()
            .expect("command frames are JSON objects")
            .insert("id".into(), id.into());

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);

        if let Err(e) = self.send_frame(frame).await {
            self.inner.pending.remove(&id);
            return Err(e);
        }

        self.await_result(id, self.inner.command_timeout, rx).await
    }

    /// Subscribe to an upstream event type; events arrive on the returned
    /// channel in reception order until the session dies
    pub async fn subscribe_events(
        &self,
        event_type: &str,
    ) -> Result<mpsc::Receiver<Value>, SessionError> {
        let id = self.allocate_id();

        // The event stream reuses the subscription command id, and events can
        // arrive immediately after the result frame: register first.
        let (event_tx, event_rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.inner.subscriptions.insert(id, event_tx);

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);

        let frame = {
            let mut f = frames::subscribe_events_frame(0, event_type);
            f.as_object_mut()
                .expect("subscribe frame is an object")
                .insert("id".into(), id.into());
            f
        };

        if let Err(e) = self.send_frame(frame).await {
            self.inner.pending.remove(&id);
            self.inner.subscriptions.remove(&id);
            return Err(e);
        }

        match self.await_result(id, self.inner.command_timeout, rx).await {
            Ok(_) => Ok(event_rx),
            Err(e) => {
                self.inner.subscriptions.remove(&id);
                Err(e)
            }
        }
    }
}

/// Read one frame during the handshake, before tasks are spawned
async fn handshake_frame(
    stream: &mut futures_util::stream::SplitStream<WsStream>,
    deadline: Duration,
    endpoint: &str,
) -> Result<ServerFrame, ConnectError> {
    loop {
        let message = timeout(deadline, stream.next())
            .await
            .map_err(|_| ConnectError::Timeout {
                endpoint: endpoint.to_string(),
            })?
            .ok_or_else(|| ConnectError::WebSocket {
                endpoint: endpoint.to_string(),
                message: "connection closed during handshake".into(),
            })?
            .map_err(|e| ConnectError::WebSocket {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            })?;

        if let Message::Text(text) = message {
            return serde_json::from_str(&text).map_err(|e| ConnectError::Protocol {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            });
        }
        // Binary/ping/pong frames during the handshake are ignored
    }
}

/// Connect and authenticate against one endpoint, then spawn the session's
/// writer, reader and keepalive tasks.
pub(crate) async fn connect(
    endpoint: &EndpointConfig,
    ha: &HaConfig,
    reporter: mpsc::UnboundedSender<(usize, ReportOutcome)>,
    endpoint_index: usize,
) -> Result<SessionHandle, ConnectError> {
    debug!(endpoint = %endpoint.name, url = %endpoint.url, "connecting");

    let (ws, _) = timeout(ha.connect_timeout, connect_async(&endpoint.url))
        .await
        .map_err(|_| ConnectError::Timeout {
            endpoint: endpoint.name.clone(),
        })?
        .map_err(|e| ConnectError::WebSocket {
            endpoint: endpoint.name.clone(),
            message: e.to_string(),
        })?;

    let (mut sink, mut stream) = ws.split();

    // Auth handshake: auth_required -> auth -> auth_ok | auth_invalid
    loop {
        match handshake_frame(&mut stream, ha.connect_timeout, &endpoint.name).await? {
            ServerFrame::AuthRequired { .. } => {
                let frame = frames::auth_frame(&endpoint.token);
                timeout(ha.write_timeout, sink.send(Message::Text(frame.to_string())))
                    .await
                    .map_err(|_| ConnectError::Timeout {
                        endpoint: endpoint.name.clone(),
                    })?
                    .map_err(|e| ConnectError::WebSocket {
                        endpoint: endpoint.name.clone(),
                        message: e.to_string(),
                    })?;
            }
            ServerFrame::AuthOk { ha_version } => {
                debug!(
                    endpoint = %endpoint.name,
                    version = ha_version.as_deref().unwrap_or("unknown"),
                    "authenticated"
                );
                break;
            }
            ServerFrame::AuthInvalid { message } => {
                warn!(
                    endpoint = %endpoint.name,
                    message = message.as_deref().unwrap_or(""),
                    "authentication rejected"
                );
                return Err(ConnectError::AuthFailed {
                    endpoint: endpoint.name.clone(),
                });
            }
            _ => {} // anything else pre-auth is ignored
        }
    }

    let cancel = CancellationToken::new();
    let (out_tx, out_rx) = mpsc::channel::<Message>(256);

    let inner = Arc::new(SessionInner {
        endpoint: endpoint.name.clone(),
        out_tx,
        pending: dashmap::DashMap::new(),
        subscriptions: dashmap::DashMap::new(),
        next_id: AtomicU64::new(1),
        command_timeout: ha.read_idle_timeout,
        cancel: cancel.clone(),
    });

    let handle = SessionHandle {
        inner: Arc::clone(&inner),
    };

    tokio::spawn(writer_task(sink, out_rx, ha.write_timeout, cancel.clone()));
    tokio::spawn(reader_task(stream, Arc::clone(&inner), ha.read_idle_timeout));
    tokio::spawn(keepalive_task(
        handle.clone(),
        ha.ping_interval,
        ha.read_idle_timeout,
        reporter,
        endpoint_index,
    ));

    Ok(handle)
}

async fn writer_task(
    mut sink: futures_util::stream::SplitSink<WsStream, Message>,
    mut out_rx: mpsc::Receiver<Message>,
    write_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = out_rx.recv() => {
                let Some(message) = maybe else { break };
                match timeout(write_timeout, sink.send(message)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(error = %e, "session write failed");
                        cancel.cancel();
                        break;
                    }
                    Err(_) => {
                        warn!("session write timed out");
                        cancel.cancel();
                        break;
                    }
                }
            }
        }
    }
    let _ = sink.close().await;
}

async fn reader_task(
    mut stream: futures_util::stream::SplitStream<WsStream>,
    inner: Arc<SessionInner>,
    read_idle_timeout: Duration,
) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            next = timeout(read_idle_timeout, stream.next()) => {
                match next {
                    Err(_) => {
                        warn!(endpoint = %inner.endpoint, "read idle timeout, dropping session");
                        break;
                    }
                    Ok(None) => {
                        warn!(endpoint = %inner.endpoint, "session closed by peer");
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        warn!(endpoint = %inner.endpoint, error = %e, "session read error");
                        break;
                    }
                    Ok(Some(Ok(Message::Text(text)))) => route_frame(&inner, &text),
                    Ok(Some(Ok(Message::Close(_)))) => break,
                    Ok(Some(Ok(_))) => {} // ws-level ping/pong/binary
                }
            }
        }
    }

    // Session is dead: fail pending commands, close event streams
    inner.cancel.cancel();
    let pending_ids: Vec<u64> = inner.pending.iter().map(|e| *e.key()).collect();
    for id in pending_ids {
        if let Some((_, tx)) = inner.pending.remove(&id) {
            let _ = tx.send(Err(SessionError::Closed));
        }
    }
    inner.subscriptions.clear();
}

/// Decode and hand off one inbound frame. No CPU work beyond the decode.
fn route_frame(inner: &Arc<SessionInner>, text: &str) {
    let frame: ServerFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(endpoint = %inner.endpoint, error = %e, "unparseable frame ignored");
            return;
        }
    };

    match frame {
        ServerFrame::Result {
            id,
            success,
            result,
            error,
        } => {
            if let Some((_, tx)) = inner.pending.remove(&id) {
                let outcome = if success {
                    Ok(result.unwrap_or(Value::Null))
                } else {
                    let message = error
                        .as_ref()
                        .and_then(|e| e.get("message"))
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string();
                    Err(SessionError::CommandFailed(message))
                };
                let _ = tx.send(outcome);
            }
        }
        ServerFrame::Pong { id } => {
            if let Some((_, tx)) = inner.pending.remove(&id) {
                let _ = tx.send(Ok(Value::Null));
            }
        }
        ServerFrame::Event { id, event } => {
            if let Some(sub) = inner.subscriptions.get(&id) {
                if sub.try_send(event).is_err() {
                    metrics::SESSION_FRAMES_DROPPED
                        .with_label_values(&[inner.endpoint.as_str()])
                        .inc();
                }
            }
        }
        ServerFrame::Ping { id } => {
            let _ = inner
                .out_tx
                .try_send(Message::Text(frames::pong_frame(id).to_string()));
        }
        _ => {}
    }
}

async fn keepalive_task(
    handle: SessionHandle,
    ping_interval: Duration,
    pong_deadline: Duration,
    reporter: mpsc::UnboundedSender<(usize, ReportOutcome)>,
    endpoint_index: usize,
) {
    let mut interval = tokio::time::interval(ping_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            _ = handle.closed() => break,
            _ = interval.tick() => {
                let id = handle.allocate_id();
                let (tx, rx) = oneshot::channel();
                handle.inner.pending.insert(id, tx);

                let sent = handle.send_frame(frames::ping_frame(id)).await;
                let alive = match sent {
                    Ok(()) => handle.await_result(id, pong_deadline, rx).await.is_ok(),
                    Err(_) => false,
                };

                if alive {
                    let _ = reporter.send((endpoint_index, ReportOutcome::Success));
                } else if handle.is_alive() {
                    warn!(endpoint = handle.endpoint(), "missed pong, dropping session");
                    metrics::KEEPALIVE_FAILURES
                        .with_label_values(&[handle.endpoint()])
                        .inc();
                    let _ = reporter.send((endpoint_index, ReportOutcome::Failure));
                    handle.close();
                    break;
                } else {
                    // Session was closed under us; not an endpoint failure
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio::net::TcpListener;

    fn test_ha_config() -> HaConfig {
        HaConfig {
            endpoints: vec![],
            connect_timeout: Duration::from_secs(5),
            read_idle_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(60),
        }
    }

    /// Minimal Home Assistant mock: auth handshake, then answers pings,
    /// subscriptions and one registry list command, and pushes one event.
    async fn mock_server(listener: TcpListener) {
        let (tcp, _) = listener.accept().await.expect("accept");
        let mut ws = tokio_tungstenite::accept_async(tcp).await.expect("ws accept");

        ws.send(Message::Text(
            json!({"type": "auth_required", "ha_version": "2025.1"}).to_string(),
        ))
        .await
        .expect("send auth_required");

        // Expect the auth frame
        let auth = ws.next().await.expect("auth frame").expect("auth ok");
        let auth: Value = serde_json::from_str(auth.to_text().unwrap()).unwrap();
        assert_eq!(auth["type"], "auth");
        assert_eq!(auth["access_token"], "token-123");

        ws.send(Message::Text(json!({"type": "auth_ok"}).to_string()))
            .await
            .expect("send auth_ok");

        while let Some(Ok(Message::Text(text))) = ws.next().await {
            let frame: Value = serde_json::from_str(&text).unwrap();
            let id = frame["id"].as_u64().unwrap_or(0);
            match frame["type"].as_str().unwrap_or("") {
                "ping" => {
                    ws.send(Message::Text(
                        json!({"id": id, "type": "pong"}).to_string(),
                    ))
                    .await
                    .unwrap();
                }
                "subscribe_events" => {
                    ws.send(Message::Text(
                        json!({"id": id, "type": "result", "success": true, "result": null})
                            .to_string(),
                    ))
                    .await
                    .unwrap();
                    ws.send(Message::Text(
                        json!({"id": id, "type": "event", "event": {"event_type": "state_changed"}})
                            .to_string(),
                    ))
                    .await
                    .unwrap();
                }
                "config/device_registry/list" => {
                    ws.send(Message::Text(
                        json!({"id": id, "type": "result", "success": true,
                               "result": [{"id": "d1", "name": "Lamp"}]})
                        .to_string(),
                    ))
                    .await
                    .unwrap();
                }
                _ => {}
            }
        }
    }

    async fn connect_to_mock() -> (SessionHandle, mpsc::UnboundedReceiver<(usize, ReportOutcome)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(mock_server(listener));

        let endpoint = EndpointConfig {
            name: "primary".into(),
            url: format!("ws://{addr}"),
            token: "token-123".into(),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = connect(&endpoint, &test_ha_config(), tx, 0)
            .await
            .expect("connect");
        (handle, rx)
    }

    #[tokio::test]
    async fn test_connect_command_and_events() {
        let (handle, _reports) = connect_to_mock().await;
        assert!(handle.is_alive());

        // Request/response by id
        let result = handle
            .send_command(json!({"type": "config/device_registry/list"}))
            .await
            .expect("list command");
        assert_eq!(result[0]["id"], "d1");

        // Subscription streams events
        let mut events = handle
            .subscribe_events("state_changed")
            .await
            .expect("subscribe");
        let event = events.recv().await.expect("event");
        assert_eq!(event["event_type"], "state_changed");

        handle.close();
        handle.closed().await;
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_auth_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::Text(json!({"type": "auth_required"}).to_string()))
                .await
                .unwrap();
            let _ = ws.next().await;
            ws.send(Message::Text(
                json!({"type": "auth_invalid", "message": "bad token"}).to_string(),
            ))
            .await
            .unwrap();
        });

        let endpoint = EndpointConfig {
            name: "primary".into(),
            url: format!("ws://{addr}"),
            token: "wrong".into(),
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        match connect(&endpoint, &test_ha_config(), tx, 0).await {
            Err(ConnectError::AuthFailed { endpoint }) => assert_eq!(endpoint, "primary"),
            other => panic!("expected AuthFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::Text(json!({"type": "auth_required"}).to_string()))
                .await
                .unwrap();
            let _ = ws.next().await;
            ws.send(Message::Text(json!({"type": "auth_ok"}).to_string()))
                .await
                .unwrap();
            // Read one command, then hang up without answering
            let _ = ws.next().await;
            let _ = ws.close(None).await;
        });

        let endpoint = EndpointConfig {
            name: "primary".into(),
            url: format!("ws://{addr}"),
            token: "token-123".into(),
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = connect(&endpoint, &test_ha_config(), tx, 0).await.unwrap();

        let result = handle
            .send_command(json!({"type": "config/area_registry/list"}))
            .await;
        assert!(matches!(
            result,
            Err(SessionError::Closed) | Err(SessionError::Timeout)
        ));

        handle.closed().await;
    }
}
