//! HTTP route definitions

use axum::{
    extract::State,
    http::{header, HeaderValue, Method},
    response::Json,
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::app::AppState;
use crate::game::snapshot::MonitorDocument;
use crate::util::time::uptime_secs;

/// Build the monitor router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/data.json", get(data_handler))
        .route("/health", get(health_handler))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config.monitor_origin))
        .with_state(state)
}

/// Read-only CORS; `*` allows any origin, otherwise a comma-separated list
fn cors_layer(origins: &str) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    if origins.trim() == "*" {
        return cors.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .split(',')
        .filter_map(|s| s.trim().parse::<HeaderValue>().ok())
        .collect();
    cors.allow_origin(allowed)
}

// ============================================================================
// Monitor snapshot
// ============================================================================

async fn data_handler(State(state): State<AppState>) -> Json<MonitorDocument> {
    Json(state.snapshots().latest().monitor())
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    tick: u64,
    paused: bool,
    connections: usize,
    joined: usize,
    snapshot_subscribers: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let snapshot = state.snapshots().latest();

    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        tick: snapshot.global.tick,
        paused: snapshot.global.paused,
        connections: state.connections.len(),
        joined: state.connections.joined(),
        snapshot_subscribers: state.snapshots().subscriber_count(),
    })
}
