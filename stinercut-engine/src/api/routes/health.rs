//! Health check routes.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};

use crate::api::error::ApiResult;
use crate::api::models::HealthResponse;
use crate::api::server::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/live", get(liveness_check))
}

/// Overall health, including the depth of the work queue.
async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let queue_depth = state.orchestrator.scheduler().queue().len().await;
    let (status, queue_depth) = match queue_depth {
        Ok(depth) => ("healthy", Some(depth)),
        Err(e) => {
            tracing::warn!(error = %e, "Health check could not read the work queue");
            ("degraded", None)
        }
    };

    Ok(Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        queue_depth,
    }))
}

/// Ready once the store answers.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.orchestrator.scheduler().queue().len().await {
        Ok(_) => (StatusCode::OK, "ready"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "not ready"),
    }
}

async fn liveness_check(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.start_time.elapsed().as_secs();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "alive",
            "uptime_secs": uptime
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::routes::create_router;
    use crate::api::routes::testing::{body_json, empty_request, test_state};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_reports_queue_depth() {
        let (_dir, state, _queue) = test_state().await;
        let app = create_router(state);

        let response = app.oneshot(empty_request("GET", "/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["queue_depth"], 0);
    }

    #[tokio::test]
    async fn test_ready_and_live() {
        let (_dir, state, _queue) = test_state().await;
        let app = create_router(state);

        let response = app
            .clone()
            .oneshot(empty_request("GET", "/health/ready"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(empty_request("GET", "/health/live")).await.unwrap();
        assert_eq!(body_json(response).await["status"], "alive");
    }
}
