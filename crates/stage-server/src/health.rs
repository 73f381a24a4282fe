//! `GET /health`, `GET /ready`, `GET /metrics` (spec §6).

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use stage_core::model::SessionState;
use stage_core::observability::MetricsRegistry;
use stage_runtime::StageRuntime;

pub struct AppState {
    pub metrics: MetricsRegistry,
    pub runtime: Arc<StageRuntime>,
    pub session_id: String,
    pub component: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.runtime.get_status(&state.session_id).await {
        Ok(status) => Json(json!({
            "component": state.component,
            "session_id": state.session_id,
            "state": format!("{:?}", status.state),
            "current_sequence": status.current_sequence,
            "target_sequence": status.target_sequence,
            "events_processed": status.events_processed,
            "events_skipped": status.events_skipped,
            "ledgers_processed": status.ledgers_processed,
            "last_error": status.last_error,
        }))
        .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

/// Reports 503 while the session is still resuming its cursor (`Starting`)
/// or has failed outright (`Error`), 200 otherwise, so a load balancer
/// doesn't route to a stage that isn't actually consuming yet.
async fn ready(State(state): State<Arc<AppState>>) -> StatusCode {
    match state.runtime.get_status(&state.session_id).await {
        Ok(status) if !matches!(status.state, SessionState::Starting | SessionState::Error) => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics.render()
}
