//! Execution status and control routes.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/api/executions` | List executions, newest first |
//! | GET | `/api/executions/{id}` | Execution with its steps and merged data |
//! | GET | `/api/executions/{id}/logs` | Step transition log |
//! | POST | `/api/executions/{id}/retry` | Resume a failed execution |
//! | POST | `/api/executions/{id}/cancel` | Cancel an execution |

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{
    CancelResponse, ExecutionListParams, ExecutionResponse, ExecutionSummary, MAX_PAGE_LIMIT,
    PaginatedResponse, RetryResponse, StepLogResponse,
};
use crate::api::server::AppState;
use crate::database::models::ExecutionStatus;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_executions))
        .route("/{id}", get(get_execution))
        .route("/{id}/logs", get(list_step_logs))
        .route("/{id}/retry", post(retry_execution))
        .route("/{id}/cancel", post(cancel_execution))
}

async fn list_executions(
    State(state): State<AppState>,
    Query(params): Query<ExecutionListParams>,
) -> ApiResult<Json<PaginatedResponse<ExecutionSummary>>> {
    let status = match params.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(
            ExecutionStatus::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("Unknown status '{}'", raw)))?,
        ),
        None => None,
    };
    let limit = params.limit.clamp(1, MAX_PAGE_LIMIT);

    let (executions, total) = state
        .orchestrator
        .list_executions(status, limit, params.offset)
        .await?;

    let items = executions.iter().map(ExecutionSummary::from).collect();
    Ok(Json(PaginatedResponse::new(items, total, limit, params.offset)))
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ExecutionResponse>> {
    let detail = state.orchestrator.get_execution(&id).await?;
    Ok(Json(ExecutionResponse::from(&detail)))
}

async fn list_step_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<StepLogResponse>>> {
    let logs = state.orchestrator.step_logs(&id).await?;
    Ok(Json(logs.iter().map(StepLogResponse::from).collect()))
}

/// Only failed executions can be retried; anything else is `409 NOT_FAILED`.
async fn retry_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RetryResponse>> {
    let reset_steps = state.orchestrator.retry(&id).await?;
    Ok(Json(RetryResponse {
        execution_id: id,
        reset_steps,
    }))
}

async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    state.orchestrator.cancel(&id).await?;
    Ok(Json(CancelResponse {
        execution_id: id,
        status: ExecutionStatus::Cancelled.to_string(),
    }))
}
