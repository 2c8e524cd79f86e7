//! Run endpoints: start, inspect, cancel.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use shared_types::{RunStatus, RunView, StartRunRequest};
use uuid::Uuid;

use crate::api::error::{ApiError, ApiErrorCode};
use crate::api::ApiState;
use crate::limits::{RUNS_METRIC, RUN_START_ROUTE};
use crate::run::Run;

/// `POST /crews/{crew_id}/runs`
///
/// Admission (rate limit per crew, then quota) happens before the run row
/// exists, so a rejected request leaves no trace. A dispatch failure leaves
/// the run queued and is reported as retryable.
pub async fn start_run(
    State(state): State<ApiState>,
    Path(crew_id): Path<Uuid>,
    Json(request): Json<StartRunRequest>,
) -> Result<(StatusCode, Json<RunView>), ApiError> {
    let app = &state.app_state;

    if request.prompt.trim().is_empty() {
        return Err(ApiError::new(
            ApiErrorCode::InvalidRequest,
            "prompt must not be empty",
        ));
    }

    let crew = app.store.get_crew(crew_id).await?.ok_or_else(|| {
        ApiError::new(ApiErrorCode::CrewNotFound, format!("crew {crew_id} not found"))
    })?;

    let policy = app.admission;
    app.rate_limiter.check(
        &crew_id.to_string(),
        RUN_START_ROUTE,
        policy.run_start_rate_per_minute,
        policy.run_start_burst,
    )?;
    if let Some(org_id) = crew.org_id.as_deref() {
        app.quotas
            .add(org_id, RUNS_METRIC, 1, policy.run_quota_per_day)?;
    }

    let run = Run::new_queued(crew_id, request.prompt.clone());
    app.store.create_run(&run).await?;

    // Tracked before the hand-off so a cancel can reach the run in the queue.
    app.cancellations.token(run.id);
    let inputs = request.inputs.unwrap_or_default();
    match app
        .dispatcher
        .enqueue(run.id, crew_id, request.prompt, inputs)
    {
        Ok(job_id) => {
            tracing::info!(
                run_id = %run.id,
                crew_id = %crew_id,
                job_id = %job_id,
                "Run accepted"
            );
            Ok((StatusCode::ACCEPTED, Json(run.view())))
        }
        Err(e) => {
            tracing::warn!(run_id = %run.id, error = %e, "Run dispatch failed; run stays queued");
            if app.cancellations.release(run.id) {
                app.driver.cancel_undispatched(run.id).await?;
            }
            Err(ApiError::new(
                ApiErrorCode::DispatchUnavailable,
                format!("run {} queued but not dispatched: {e}", run.id),
            ))
        }
    }
}

/// `GET /runs/{run_id}`
pub async fn get_run(
    State(state): State<ApiState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunView>, ApiError> {
    let run = state
        .app_state
        .store
        .get_run(run_id)
        .await?
        .ok_or_else(|| run_not_found(run_id))?;
    Ok(Json(run.view()))
}

/// `POST /runs/{run_id}/cancel`
///
/// A run held by a dispatcher or worker is flagged and answered with
/// `cancelling`. A queued run nobody holds is cancelled on the spot.
pub async fn cancel_run(
    State(state): State<ApiState>,
    Path(run_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let app = &state.app_state;
    let run = app
        .store
        .get_run(run_id)
        .await?
        .ok_or_else(|| run_not_found(run_id))?;
    if run.is_terminal() {
        return Err(ApiError::new(
            ApiErrorCode::RunTerminal,
            format!("run {run_id} is already {}", run.status),
        ));
    }

    if app.cancellations.cancel(run_id) {
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "run_id": run_id, "status": "cancelling" })),
        ));
    }

    match app.driver.cancel_undispatched(run_id).await? {
        Some(RunStatus::Cancelled) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "run_id": run_id, "status": "cancelled" })),
        )),
        Some(status) => Err(ApiError::new(
            ApiErrorCode::RunTerminal,
            format!("run {run_id} is {status} and cannot be cancelled"),
        )),
        None => Err(run_not_found(run_id)),
    }
}

fn run_not_found(run_id: Uuid) -> ApiError {
    ApiError::new(ApiErrorCode::RunNotFound, format!("run {run_id} not found"))
}
