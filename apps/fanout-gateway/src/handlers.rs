use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use channel_fanout::{ConnectionCounts, PublishOutcome};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::metrics;
use crate::state::GatewayState;

pub async fn health_check(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "instance_id": state.instance_id(),
        "uptime_secs": state.uptime_secs(),
        "fanout": state.manager().supports_fanout(),
    }))
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub instance_id: String,
    pub local_connections: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<ConnectionCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_error: Option<String>,
    pub active_channels: Vec<String>,
}

pub async fn stats(State(state): State<GatewayState>) -> Json<StatsResponse> {
    let (registry, registry_error) = match state.registry().connection_counts().await {
        Ok(counts) => (Some(counts), None),
        Err(err) => {
            warn!(error = %err, "failed to read connection counts");
            (None, Some(err.to_string()))
        }
    };
    let active_channels = state
        .manager()
        .active_channels()
        .into_iter()
        .filter(|key| key.instance_id == state.instance_id())
        .map(|key| key.channel)
        .collect();

    Json(StatsResponse {
        instance_id: state.instance_id().to_string(),
        local_connections: state.local().len(),
        registry,
        registry_error,
        active_channels,
    })
}

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub message: serde_json::Value,
    #[serde(default)]
    pub source_connection_id: Option<String>,
}

pub async fn publish_to_channel(
    State(state): State<GatewayState>,
    Path(channel): Path<String>,
    Json(body): Json<PublishRequest>,
) -> (StatusCode, Json<PublishOutcome>) {
    let outcome = state
        .manager()
        .publish_to_channel(&channel, body.message, body.source_connection_id)
        .await;
    metrics::record_publish(outcome.is_success());
    let status = if outcome.is_success() {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    (status, Json(outcome))
}

pub async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}
