//! API request and response models (DTOs).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::database::models::{
    ExecutionStepStats, PipelineExecutionDbModel, PipelineStepDbModel, StepLogDbModel,
};
use crate::database::time::ms_to_datetime;
use crate::pipeline::ExecutionDetail;

/// Maximum page size accepted by list endpoints.
pub const MAX_PAGE_LIMIT: u32 = 100;

// ============================================================================
// Pagination
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    /// Total number of matching items
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

impl<T> PaginatedResponse<T> {
    pub fn new(items: Vec<T>, total: u64, limit: u32, offset: u32) -> Self {
        Self {
            items,
            total,
            limit,
            offset,
        }
    }
}

// ============================================================================
// Triggers
// ============================================================================

/// Inbound trigger, e.g. an SD card was inserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRequest {
    /// Idempotency key supplied by the producer
    pub trigger_id: String,
    pub pipeline_type: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub execution_id: String,
    /// False when an active execution for the trigger already existed
    pub created: bool,
}

// ============================================================================
// Executions
// ============================================================================

/// Query parameters for `GET /api/executions`.
///
/// ```text
/// GET /api/executions?status=failed&limit=50&offset=100
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionListParams {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    20
}

/// Execution row as shown in lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub id: String,
    pub trigger_id: String,
    pub pipeline_type: String,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&PipelineExecutionDbModel> for ExecutionSummary {
    fn from(execution: &PipelineExecutionDbModel) -> Self {
        Self {
            id: execution.id.clone(),
            trigger_id: execution.trigger_id.clone(),
            pipeline_type: execution.pipeline_type.clone(),
            status: execution.status.to_lowercase(),
            error_message: execution.error_message.clone(),
            created_at: ms_to_datetime(execution.created_at),
            updated_at: ms_to_datetime(execution.updated_at),
            completed_at: execution.completed_at.map(ms_to_datetime),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResponse {
    pub step_key: String,
    pub step_name: String,
    pub status: String,
    pub attempt: i64,
    pub depends_on: Vec<String>,
    pub worker_id: Option<String>,
    pub error_message: Option<String>,
    pub spawned_by: Option<String>,
}

impl From<&PipelineStepDbModel> for StepResponse {
    fn from(step: &PipelineStepDbModel) -> Self {
        Self {
            step_key: step.step_key.clone(),
            step_name: step.step_name.clone(),
            status: step.status.to_lowercase(),
            attempt: step.attempt,
            depends_on: step.get_depends_on(),
            worker_id: step.worker_id.clone(),
            error_message: step.error_message.clone(),
            spawned_by: step.spawned_by.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStatsResponse {
    pub total: u64,
    pub pending: u64,
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub percent_complete: f64,
}

impl From<&ExecutionStepStats> for StepStatsResponse {
    fn from(stats: &ExecutionStepStats) -> Self {
        Self {
            total: stats.total(),
            pending: stats.pending,
            queued: stats.queued,
            running: stats.running,
            completed: stats.completed,
            failed: stats.failed,
            percent_complete: stats.percent_complete(),
        }
    }
}

/// Full execution detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResponse {
    #[serde(flatten)]
    pub execution: ExecutionSummary,
    pub steps: Vec<StepResponse>,
    pub stats: StepStatsResponse,
    pub execution_data: Map<String, Value>,
}

impl From<&ExecutionDetail> for ExecutionResponse {
    fn from(detail: &ExecutionDetail) -> Self {
        Self {
            execution: ExecutionSummary::from(&detail.execution),
            steps: detail.steps.iter().map(StepResponse::from).collect(),
            stats: StepStatsResponse::from(&detail.stats),
            execution_data: detail.execution.get_execution_data(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepLogResponse {
    pub step_key: String,
    pub event: String,
    pub worker_id: Option<String>,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&StepLogDbModel> for StepLogResponse {
    fn from(log: &StepLogDbModel) -> Self {
        Self {
            step_key: log.step_key.clone(),
            event: log.event.clone(),
            worker_id: log.worker_id.clone(),
            detail: log.detail.clone(),
            created_at: ms_to_datetime(log.created_at),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryResponse {
    pub execution_id: String,
    /// Keys of the failed steps that were reset to pending
    pub reset_steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub execution_id: String,
    pub status: String,
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub queue_depth: Option<u64>,
}

// ============================================================================
// Logging
// ============================================================================

/// Request to update the log filter.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateLogFilterRequest {
    pub filter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfigResponse {
    pub filter: String,
    pub log_dir: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trigger_request_params_default() {
        let request: TriggerRequest =
            serde_json::from_value(json!({"trigger_id": "t", "pipeline_type": "demo"})).unwrap();
        assert!(request.params.is_empty());
    }

    #[test]
    fn test_list_params_defaults() {
        let params: ExecutionListParams = serde_json::from_value(json!({})).unwrap();
        assert_eq!(params.limit, 20);
        assert_eq!(params.offset, 0);
        assert!(params.status.is_none());
    }

    #[test]
    fn test_step_response_lowercases_status() {
        let step = PipelineStepDbModel::new(
            "e",
            "finish",
            "finish",
            &["scan".to_string()],
            &Value::Null,
            None,
        );
        let response = StepResponse::from(&step);
        assert_eq!(response.status, "pending");
        assert_eq!(response.depends_on, vec!["scan"]);
    }
}
