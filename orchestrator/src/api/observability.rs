//! Read-only counters: quota usage and run metrics.

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

use crate::api::ApiState;
use crate::observability::RunMetricsSnapshot;

/// `GET /quota/{org_id}/{metric}`
pub async fn get_quota(
    State(state): State<ApiState>,
    Path((org_id, metric)): Path<(String, String)>,
) -> Json<Value> {
    let count = state.app_state.quotas.get(&org_id, &metric);
    Json(json!({
        "org_id": org_id,
        "metric": metric,
        "count": count,
    }))
}

/// `GET /metrics/runs`
pub async fn get_run_metrics(State(state): State<ApiState>) -> Json<RunMetricsSnapshot> {
    Json(state.app_state.metrics.snapshot())
}
