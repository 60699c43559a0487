//! Pipeline execution database model.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;

use crate::utils::json::{self, JsonContext};

/// Lifecycle status of a pipeline execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// No further scheduling happens in a terminal execution.
    ///
    /// `Failed` is terminal for scheduling purposes but can be resumed with
    /// an explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the execution still owns its trigger id.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_str().to_ascii_lowercase())
    }
}

/// One run of a pipeline, from trigger to terminal state.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PipelineExecutionDbModel {
    pub id: String,
    /// Correlates the run with the originating trigger message.
    pub trigger_id: String,
    /// Template that seeded the initial steps.
    pub pipeline_type: String,
    pub status: String,
    /// Trigger params as received (JSON object).
    pub params: String,
    /// Shared key/value blackboard (JSON object).
    pub execution_data: String,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

impl PipelineExecutionDbModel {
    /// Create a running execution whose data is seeded with the trigger params.
    pub fn new(
        trigger_id: impl Into<String>,
        pipeline_type: impl Into<String>,
        params: &Map<String, Value>,
    ) -> Self {
        let now = crate::database::time::now_ms();
        let id = uuid::Uuid::new_v4().to_string();
        let params_json = json::to_string_or_fallback(
            params,
            "{}",
            JsonContext::ExecutionField {
                execution_id: &id,
                field: "params",
            },
            "Failed to serialize trigger params; storing empty object",
        );

        Self {
            id,
            trigger_id: trigger_id.into(),
            pipeline_type: pipeline_type.into(),
            status: ExecutionStatus::Running.as_str().to_string(),
            execution_data: params_json.clone(),
            params: params_json,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn get_status(&self) -> Option<ExecutionStatus> {
        ExecutionStatus::parse(&self.status)
    }

    pub fn is_running(&self) -> bool {
        self.get_status() == Some(ExecutionStatus::Running)
    }

    pub fn get_execution_data(&self) -> Map<String, Value> {
        json::parse_or_default(
            &self.execution_data,
            JsonContext::ExecutionField {
                execution_id: &self.id,
                field: "execution_data",
            },
            "Invalid execution_data JSON; treating as empty",
        )
    }

    pub fn get_params(&self) -> Map<String, Value> {
        json::parse_or_default(
            &self.params,
            JsonContext::ExecutionField {
                execution_id: &self.id,
                field: "params",
            },
            "Invalid params JSON; treating as empty",
        )
    }

    /// Shallow-merge `output` into the execution data; later keys win.
    pub fn merge_execution_data(&mut self, output: &Map<String, Value>) {
        let mut data = self.get_execution_data();
        merge_shallow(&mut data, output);
        self.execution_data = json::to_string_or_fallback(
            &data,
            "{}",
            JsonContext::ExecutionField {
                execution_id: &self.id,
                field: "execution_data",
            },
            "Failed to serialize execution_data; storing empty object",
        );
        self.updated_at = crate::database::time::now_ms();
    }
}

/// Shallow key overwrite of `source` into `target`.
pub fn merge_shallow(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (key, value) in source {
        target.insert(key.clone(), value.clone());
    }
}
