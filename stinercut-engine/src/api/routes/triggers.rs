//! Trigger intake.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | POST | `/api/triggers` | Start a pipeline for a trigger (idempotent per `trigger_id`) |

use axum::{Json, Router, extract::State, http::StatusCode, routing::post};

use crate::api::error::ApiResult;
use crate::api::models::{TriggerRequest, TriggerResponse};
use crate::api::server::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", post(submit_trigger))
}

/// Start a pipeline.
///
/// Returns `201 Created` for a new execution and `200 OK` when the trigger
/// was a redelivery of one that is still active.
async fn submit_trigger(
    State(state): State<AppState>,
    Json(request): Json<TriggerRequest>,
) -> ApiResult<(StatusCode, Json<TriggerResponse>)> {
    let outcome = state
        .orchestrator
        .start(&request.trigger_id, &request.pipeline_type, request.params)
        .await?;

    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(TriggerResponse {
            execution_id: outcome.execution_id,
            created: outcome.created,
        }),
    ))
}
