//! Pipeline step database model.
//!
//! Steps are the single source of truth for an execution's graph: there is no
//! cached topology, readiness is always derived from the persisted rows.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;

use crate::utils::json::{self, JsonContext};

/// Lifecycle status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Waiting for dependencies (or for the next evaluate).
    Pending,
    /// Pushed to the work queue, not yet claimed.
    Queued,
    /// Claimed by a worker.
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "QUEUED" => Some(Self::Queued),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_str().to_ascii_lowercase())
    }
}

/// Build the execution-unique key of a step.
///
/// Parameterised steps (one per file, …) get `step_name:parameter`.
pub fn make_step_key(step_name: &str, parameter: Option<&str>) -> String {
    match parameter {
        Some(p) if !p.is_empty() => format!("{}:{}", step_name, p),
        _ => step_name.to_string(),
    }
}

/// A unit of work inside an execution.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PipelineStepDbModel {
    pub id: String,
    pub execution_id: String,
    /// Registry name of the step definition.
    pub step_name: String,
    /// Unique within the execution.
    pub step_key: String,
    pub status: String,
    /// JSON array of step keys that must be completed first.
    pub depends_on: String,
    /// JSON value fixed at creation.
    pub params: String,
    /// Snapshot of execution data taken when the step was queued.
    pub input_data: Option<String>,
    /// JSON object produced by the step.
    pub output_data: Option<String>,
    pub error_message: Option<String>,
    pub worker_id: Option<String>,
    pub attempt: i64,
    /// Heartbeat lease of a running step (epoch ms).
    pub lease_expires_at: Option<i64>,
    /// Key of the step that spawned this one.
    pub spawned_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub queued_at: Option<i64>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

impl PipelineStepDbModel {
    /// Create a pending step record.
    pub fn new(
        execution_id: &str,
        step_name: &str,
        step_key: &str,
        depends_on: &[String],
        params: &Value,
        spawned_by: Option<&str>,
    ) -> Self {
        let now = crate::database::time::now_ms();
        let id = uuid::Uuid::new_v4().to_string();
        let ctx = |field| JsonContext::StepField {
            step_id: &id,
            execution_id,
            step_key,
            field,
        };

        let depends_on = json::to_string_or_fallback(
            depends_on,
            "[]",
            ctx("depends_on"),
            "Failed to serialize depends_on; storing empty list",
        );
        let params = json::to_string_or_fallback(
            params,
            "{}",
            ctx("params"),
            "Failed to serialize params; storing empty object",
        );

        Self {
            id: id.clone(),
            execution_id: execution_id.to_string(),
            step_name: step_name.to_string(),
            step_key: step_key.to_string(),
            status: StepStatus::Pending.as_str().to_string(),
            depends_on,
            params,
            input_data: None,
            output_data: None,
            error_message: None,
            worker_id: None,
            attempt: 0,
            lease_expires_at: None,
            spawned_by: spawned_by.map(str::to_string),
            created_at: now,
            updated_at: now,
            queued_at: None,
            started_at: None,
            finished_at: None,
        }
    }

    fn ctx(&self, field: &'static str) -> JsonContext<'_> {
        JsonContext::StepField {
            step_id: &self.id,
            execution_id: &self.execution_id,
            step_key: &self.step_key,
            field,
        }
    }

    pub fn get_status(&self) -> Option<StepStatus> {
        StepStatus::parse(&self.status)
    }

    pub fn get_depends_on(&self) -> Vec<String> {
        json::parse_or_default(
            &self.depends_on,
            self.ctx("depends_on"),
            "Invalid depends_on JSON; treating as empty",
        )
    }

    pub fn get_params(&self) -> Value {
        json::parse_optional(
            Some(self.params.as_str()),
            self.ctx("params"),
            "Invalid params JSON",
        )
        .unwrap_or(Value::Null)
    }

    pub fn get_input_data(&self) -> Map<String, Value> {
        json::parse_optional(
            self.input_data.as_deref(),
            self.ctx("input_data"),
            "Invalid input_data JSON; treating as empty",
        )
        .unwrap_or_default()
    }

    pub fn get_output_data(&self) -> Map<String, Value> {
        json::parse_optional(
            self.output_data.as_deref(),
            self.ctx("output_data"),
            "Invalid output_data JSON; treating as empty",
        )
        .unwrap_or_default()
    }

    /// Whether the step has no dependencies at all.
    pub fn is_root(&self) -> bool {
        self.get_depends_on().is_empty()
    }
}

/// Step counts by status for one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStepStats {
    pub pending: u64,
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

impl ExecutionStepStats {
    pub fn from_steps<'a>(steps: impl IntoIterator<Item = &'a PipelineStepDbModel>) -> Self {
        let mut stats = Self::default();
        for step in steps {
            match step.get_status() {
                Some(StepStatus::Pending) => stats.pending += 1,
                Some(StepStatus::Queued) => stats.queued += 1,
                Some(StepStatus::Running) => stats.running += 1,
                Some(StepStatus::Completed) => stats.completed += 1,
                Some(StepStatus::Failed) => stats.failed += 1,
                None => {}
            }
        }
        stats
    }

    pub fn total(&self) -> u64 {
        self.pending + self.queued + self.running + self.completed + self.failed
    }

    pub fn non_terminal(&self) -> u64 {
        self.pending + self.queued + self.running
    }

    /// Steps currently in the work queue or being executed.
    pub fn in_flight(&self) -> u64 {
        self.queued + self.running
    }

    /// Completed share of all known steps, 0-100.
    ///
    /// The total grows as steps are spawned, so this is an estimate.
    pub fn percent_complete(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 100.0;
        }
        (self.completed as f64 / total as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_key_parameterised() {
        assert_eq!(make_step_key("probe_file", Some("GX010001.MP4")), "probe_file:GX010001.MP4");
        assert_eq!(make_step_key("scan", None), "scan");
        assert_eq!(make_step_key("scan", Some("")), "scan");
    }

    #[test]
    fn test_new_step_is_pending() {
        let step = PipelineStepDbModel::new(
            "exec-1",
            "finish",
            "finish",
            &["scan".to_string()],
            &json!({"verbose": true}),
            None,
        );

        assert_eq!(step.get_status(), Some(StepStatus::Pending));
        assert_eq!(step.get_depends_on(), vec!["scan"]);
        assert_eq!(step.get_params()["verbose"], true);
        assert_eq!(step.attempt, 0);
        assert!(!step.is_root());
        assert!(step.get_output_data().is_empty());
    }

    #[test]
    fn test_stats_percent() {
        let mut a = PipelineStepDbModel::new("e", "a", "a", &[], &Value::Null, None);
        a.status = StepStatus::Completed.as_str().to_string();
        let b = PipelineStepDbModel::new("e", "b", "b", &[], &Value::Null, None);
        let mut c = PipelineStepDbModel::new("e", "c", "c", &[], &Value::Null, None);
        c.status = StepStatus::Running.as_str().to_string();
        let mut d = PipelineStepDbModel::new("e", "d", "d", &[], &Value::Null, None);
        d.status = StepStatus::Completed.as_str().to_string();

        let stats = ExecutionStepStats::from_steps([&a, &b, &c, &d]);
        assert_eq!(stats.total(), 4);
        assert_eq!(stats.non_terminal(), 2);
        assert_eq!(stats.in_flight(), 1);
        assert_eq!(stats.percent_complete(), 50.0);
    }

    #[test]
    fn test_empty_stats_are_complete() {
        assert_eq!(ExecutionStepStats::default().percent_complete(), 100.0);
    }
}
