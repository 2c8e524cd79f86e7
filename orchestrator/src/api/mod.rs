//! HTTP API routes for the run orchestrator
//!
//! REST endpoints start and inspect runs; SSE and WebSocket endpoints tail a
//! run's event log or an organization's mission stream.

use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

pub mod error;
pub mod observability;
pub mod runs;
pub mod stream;
pub mod websocket_mission;
pub mod websocket_runs;

use crate::app_state::AppState;

pub use error::{ApiError, ApiErrorCode};

#[derive(Clone)]
pub struct ApiState {
    pub app_state: Arc<AppState>,
}

/// Configure all API routes
pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/health", get(health_check))
        // Runs
        .route("/crews/{crew_id}/runs", post(runs::start_run))
        .route("/runs/{run_id}", get(runs::get_run))
        .route("/runs/{run_id}/cancel", post(runs::cancel_run))
        // Run event streams
        .route("/events/runs/{run_id}", get(stream::run_events_sse))
        .route("/ws/runs/{run_id}", get(websocket_runs::run_events_websocket))
        // Mission stream
        .route("/ws/mission", get(websocket_mission::mission_websocket))
        // Observability
        .route("/quota/{org_id}/{metric}", get(observability::get_quota))
        .route("/metrics/runs", get(observability::get_run_metrics))
}

async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "orchestrator",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
