pub mod cli;
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod state;
pub mod telemetry;
pub mod websocket;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::GatewayState;

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/stats", get(handlers::stats))
        .route("/metrics", get(handlers::metrics_handler))
        .route(
            "/channels/:channel/publish",
            post(handlers::publish_to_channel),
        )
        .route("/ws", get(websocket::websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
