//! Append-only audit log of step lifecycle transitions.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Kind of transition recorded in the step log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepLogEvent {
    Queued,
    Started,
    Completed,
    Failed,
    /// Orphaned running step reclaimed after its lease expired.
    Requeued,
    /// Failed step reset to pending by a retry.
    Reset,
}

impl StepLogEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Requeued => "requeued",
            Self::Reset => "reset",
        }
    }
}

/// One row of `pipeline_step_log`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StepLogDbModel {
    pub id: i64,
    pub execution_id: String,
    pub step_id: String,
    pub step_key: String,
    pub event: String,
    pub worker_id: Option<String>,
    /// Error detail for failures, free text otherwise.
    pub detail: Option<String>,
    pub created_at: i64,
}
