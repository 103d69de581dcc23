//! Read-side HTTP API
//!
//! Serves the catalog, webhook subscription management, per-component
//! status with counters, and the Prometheus metrics endpoint. The API is a
//! pure reader of the event path; the only writes it performs are to the
//! webhook subscription tables.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Json, Router};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info};
use validator::Validate;

use haflow_catalog::CatalogStore;
use haflow_common::{ComponentHealth, StatusRegistry};
use haflow_connection::{BreakerState, ConnectionManager};
use haflow_domain::CreateSubscriptionRequest;

#[derive(Clone)]
pub struct ApiState {
    pub catalog: CatalogStore,
    pub status: StatusRegistry,
    pub manager: Arc<ConnectionManager>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/{device_id}", get(get_device))
        .route("/api/entities", get(list_entities))
        .route("/api/areas", get(list_areas))
        .route(
            "/api/subscriptions",
            get(list_subscriptions).post(create_subscription),
        )
        .route("/api/subscriptions/{id}", delete(delete_subscription))
        .route("/api/subscriptions/{id}/deliveries", get(list_deliveries))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process exits
pub async fn serve(state: ApiState, host: &str, port: u16) -> anyhow::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "read-side API listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Stable error shape: `{"error": "<kind>", "message": ...}`
fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    error!(error = %e, "api request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal", "message": e.to_string()})),
    )
}

fn not_found(kind: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "not_found", "message": format!("{kind} not found")})),
    )
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "haflow",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn ready(State(state): State<ApiState>) -> (StatusCode, Json<Value>) {
    let overall = state.status.overall();
    let code = match overall {
        ComponentHealth::Healthy | ComponentHealth::Degraded => StatusCode::OK,
        ComponentHealth::Failed => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(json!({"ready": code == StatusCode::OK, "overall": overall})))
}

async fn metrics() -> Result<String, (StatusCode, Json<Value>)> {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&metric_families, &mut buffer)
        .map_err(internal_error)?;
    String::from_utf8(buffer).map_err(internal_error)
}

/// Per-component status plus the operational counters operators watch:
/// drops, backpressure, breaker state, last error message
async fn status(State(state): State<ApiState>) -> Json<Value> {
    let components: Value = state
        .status
        .snapshot()
        .into_iter()
        .map(|(name, status)| (name, serde_json::to_value(status).unwrap_or(Value::Null)))
        .collect::<serde_json::Map<String, Value>>()
        .into();

    let breakers: Vec<Value> = state
        .manager
        .breaker_states()
        .into_iter()
        .map(|(endpoint, breaker, failures)| {
            json!({
                "endpoint": endpoint,
                "state": match breaker {
                    BreakerState::Closed => "closed",
                    BreakerState::Open => "open",
                    BreakerState::HalfOpen => "half_open",
                },
                "consecutive_failures": failures,
            })
        })
        .collect();

    Json(json!({
        "components": components,
        "breakers": breakers,
        "counters": {
            "events_enqueued": haflow_event_ingestor::metrics::EVENTS_ENQUEUED.get(),
            "pipeline_dropped": haflow_event_ingestor::metrics::PIPELINE_DROPPED.get(),
            "pipeline_backpressured": haflow_event_ingestor::metrics::PIPELINE_BACKPRESSURED.get(),
            "writer_in_flight_bytes": haflow_batch_writer::metrics::IN_FLIGHT_BYTES.get(),
        },
    }))
}

async fn list_devices(
    State(state): State<ApiState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let devices = state
        .catalog
        .list_devices(false)
        .await
        .map_err(internal_error)?;
    Ok(Json(json!({"devices": devices})))
}

async fn get_device(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let device = state
        .catalog
        .get_device(&device_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("device"))?;
    let capabilities = state
        .catalog
        .list_capabilities(&device_id)
        .await
        .map_err(internal_error)?;
    Ok(Json(json!({"device": device, "capabilities": capabilities})))
}

async fn list_entities(
    State(state): State<ApiState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let entities = state
        .catalog
        .list_entities(false)
        .await
        .map_err(internal_error)?;
    Ok(Json(json!({"entities": entities})))
}

async fn list_areas(
    State(state): State<ApiState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let areas = state.catalog.list_areas(false).await.map_err(internal_error)?;
    Ok(Json(json!({"areas": areas})))
}

async fn list_subscriptions(
    State(state): State<ApiState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let subscriptions = state
        .catalog
        .list_subscriptions(false)
        .await
        .map_err(internal_error)?;
    Ok(Json(json!({"subscriptions": subscriptions})))
}

async fn create_subscription(
    State(state): State<ApiState>,
    Json(request): Json<CreateSubscriptionRequest>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    if let Err(e) = request.validate() {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"error": "validation", "message": e.to_string()})),
        ));
    }

    let conditions = serde_json::to_value(&request.conditions).map_err(internal_error)?;
    let subscription = state
        .catalog
        .create_subscription(
            &request.name,
            &request.url,
            &request.secret,
            &conditions,
            request.enabled,
        )
        .await
        .map_err(internal_error)?;

    Ok((
        StatusCode::CREATED,
        Json(json!({"subscription": subscription})),
    ))
}

async fn delete_subscription(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    let deleted = state
        .catalog
        .delete_subscription(&id)
        .await
        .map_err(internal_error)?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("subscription"))
    }
}

#[derive(Debug, Deserialize)]
struct DeliveriesQuery {
    #[serde(default = "default_limit")]
    limit: u32,
}

fn default_limit() -> u32 {
    50
}

async fn list_deliveries(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<DeliveriesQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let deliveries = state
        .catalog
        .list_deliveries(&id, query.limit.min(500))
        .await
        .map_err(internal_error)?;
    Ok(Json(json!({"deliveries": deliveries})))
}
