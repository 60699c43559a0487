//! Runtime logging configuration.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/api/logging` | Current log filter directive |
//! | PUT | `/api/logging` | Replace the log filter without a restart |

use axum::{Json, Router, extract::State, routing::get};
use std::sync::Arc;

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{LoggingConfigResponse, UpdateLogFilterRequest};
use crate::api::server::AppState;
use crate::logging::LoggingConfig;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(get_logging_config).put(update_logging_config))
}

fn logging_config(state: &AppState) -> ApiResult<&Arc<LoggingConfig>> {
    state
        .logging_config
        .as_ref()
        .ok_or_else(|| ApiError::internal("Logging configuration not available"))
}

fn response(config: &LoggingConfig) -> LoggingConfigResponse {
    LoggingConfigResponse {
        filter: config.get_filter(),
        log_dir: config.log_dir().display().to_string(),
    }
}

async fn get_logging_config(
    State(state): State<AppState>,
) -> ApiResult<Json<LoggingConfigResponse>> {
    let config = logging_config(&state)?;
    Ok(Json(response(config)))
}

/// Swap the filter, e.g. `{"filter": "stinercut_engine=trace,sqlx=warn"}`.
///
/// Not persisted: `RUST_LOG` applies again on the next start.
async fn update_logging_config(
    State(state): State<AppState>,
    Json(request): Json<UpdateLogFilterRequest>,
) -> ApiResult<Json<LoggingConfigResponse>> {
    let config = logging_config(&state)?;
    config
        .set_filter(&request.filter)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(response(config)))
}
