//! Orchestrator: turns triggers into executions and exposes retry/cancel.

use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::database::models::{
    ExecutionStatus, ExecutionStepStats, PipelineExecutionDbModel, PipelineStepDbModel,
    StepLogDbModel,
};
use crate::pipeline::progress::PipelineEvent;
use crate::pipeline::registry::StepRegistry;
use crate::pipeline::scheduler::Scheduler;
use crate::{Error, Result};

/// Result of [`Orchestrator::start`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartOutcome {
    pub execution_id: String,
    /// False when the trigger was a redelivery of an active run.
    pub created: bool,
}

/// An execution together with its steps.
#[derive(Debug, Clone)]
pub struct ExecutionDetail {
    pub execution: PipelineExecutionDbModel,
    pub steps: Vec<PipelineStepDbModel>,
    pub stats: ExecutionStepStats,
}

pub struct Orchestrator {
    registry: Arc<StepRegistry>,
    scheduler: Arc<Scheduler>,
}

impl Orchestrator {
    pub fn new(registry: Arc<StepRegistry>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            registry,
            scheduler,
        }
    }

    pub fn registry(&self) -> &Arc<StepRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Start a pipeline for a trigger.
    ///
    /// Redelivered triggers with a `pending`/`running` execution get that
    /// execution back instead of a new one.
    pub async fn start(
        &self,
        trigger_id: &str,
        pipeline_type: &str,
        params: Map<String, Value>,
    ) -> Result<StartOutcome> {
        if trigger_id.trim().is_empty() {
            return Err(Error::validation("trigger_id must not be empty"));
        }
        let template_steps = self.registry.resolve_template(pipeline_type)?;

        let repository = self.scheduler.repository();
        let execution = {
            let _guard = self
                .scheduler
                .locks()
                .lock(&format!("trigger:{}", trigger_id))
                .await;

            if let Some(existing) = repository.find_active_by_trigger(trigger_id).await? {
                info!(
                    trigger_id = %trigger_id,
                    execution_id = %existing.id,
                    "Duplicate trigger; returning the active execution"
                );
                return Ok(StartOutcome {
                    execution_id: existing.id,
                    created: false,
                });
            }

            let execution = PipelineExecutionDbModel::new(trigger_id, pipeline_type, &params);
            let steps: Vec<PipelineStepDbModel> = template_steps
                .iter()
                .map(|s| {
                    PipelineStepDbModel::new(
                        &execution.id,
                        &s.step_name,
                        &s.step_key,
                        &s.depends_on,
                        &s.params,
                        None,
                    )
                })
                .collect();

            if !repository
                .create_execution_with_steps(&execution, &steps)
                .await?
            {
                // Another process won the race for this trigger.
                let existing = repository
                    .find_active_by_trigger(trigger_id)
                    .await?
                    .ok_or_else(|| {
                        Error::Other(format!(
                            "Trigger {} was claimed concurrently but no active execution exists",
                            trigger_id
                        ))
                    })?;
                info!(
                    trigger_id = %trigger_id,
                    execution_id = %existing.id,
                    "Duplicate trigger; returning the active execution"
                );
                return Ok(StartOutcome {
                    execution_id: existing.id,
                    created: false,
                });
            }
            execution
        };

        info!(
            execution_id = %execution.id,
            trigger_id = %trigger_id,
            pipeline_type = %pipeline_type,
            steps = template_steps.len(),
            "Started pipeline execution"
        );
        self.scheduler.notifier().emit(PipelineEvent::Started {
            execution_id: execution.id.clone(),
            trigger_id: trigger_id.to_string(),
            pipeline_type: pipeline_type.to_string(),
        });

        self.scheduler.evaluate(&execution.id).await?;

        Ok(StartOutcome {
            execution_id: execution.id,
            created: true,
        })
    }

    /// Resume a failed execution.
    ///
    /// Resets every failed step, not only the one that failed the execution,
    /// plus any queued step whose work item was dropped. Completed steps and
    /// their data are kept. Returns the keys of the reset steps.
    pub async fn retry(&self, execution_id: &str) -> Result<Vec<String>> {
        let _guard = self.scheduler.locks().lock(execution_id).await;

        let reset = self
            .scheduler
            .repository()
            .reset_for_retry(execution_id)
            .await?;
        let reset_keys: Vec<String> = reset.into_iter().map(|s| s.step_key).collect();

        info!(
            execution_id = %execution_id,
            reset_steps = ?reset_keys,
            "Retrying pipeline execution"
        );
        self.scheduler.notifier().emit(PipelineEvent::Retried {
            execution_id: execution_id.to_string(),
            reset_steps: reset_keys.clone(),
        });

        self.scheduler.evaluate_locked(execution_id).await?;
        Ok(reset_keys)
    }

    /// Cancel an execution. Steps already running finish but their output
    /// is discarded; queued steps are never claimed.
    pub async fn cancel(&self, execution_id: &str) -> Result<()> {
        let _guard = self.scheduler.locks().lock(execution_id).await;

        let previous = self
            .scheduler
            .repository()
            .cancel_execution(execution_id)
            .await?;

        if previous == ExecutionStatus::Failed {
            warn!(execution_id = %execution_id, "Cancelled a failed execution");
        } else {
            info!(execution_id = %execution_id, "Cancelled pipeline execution");
        }
        self.scheduler.notifier().emit(PipelineEvent::Cancelled {
            execution_id: execution_id.to_string(),
        });
        Ok(())
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<ExecutionDetail> {
        let repository = self.scheduler.repository();
        let execution = repository.get_execution(execution_id).await?;
        let steps = repository.get_steps(execution_id).await?;
        let stats = ExecutionStepStats::from_steps(&steps);
        Ok(ExecutionDetail {
            execution,
            steps,
            stats,
        })
    }

    /// Page of executions (newest first) and the total matching count.
    pub async fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<PipelineExecutionDbModel>, u64)> {
        let repository = self.scheduler.repository();
        let executions = repository.list_executions(status, limit, offset).await?;
        let total = repository.count_executions(status).await?;
        Ok((executions, total))
    }

    pub async fn step_logs(&self, execution_id: &str) -> Result<Vec<StepLogDbModel>> {
        let repository = self.scheduler.repository();
        // Surface NotFound for unknown executions rather than an empty list.
        repository.get_execution(execution_id).await?;
        repository.list_step_logs(execution_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::StepStatus;
    use crate::database::repositories::SqlxExecutionRepository;
    use crate::database::testing::temp_pool;
    use crate::pipeline::progress::ProgressNotifier;
    use crate::pipeline::work_queue::{MemoryWorkQueue, WorkQueue};
    use serde_json::json;
    use tempfile::TempDir;

    async fn orchestrator() -> (TempDir, Orchestrator, Arc<MemoryWorkQueue>) {
        let (dir, pool) = temp_pool().await;
        let queue = Arc::new(MemoryWorkQueue::new());
        let scheduler = Arc::new(Scheduler::new(
            Arc::new(SqlxExecutionRepository::new(pool)),
            queue.clone(),
            ProgressNotifier::new(),
        ));
        let registry = Arc::new(StepRegistry::with_builtins());
        (dir, Orchestrator::new(registry, scheduler), queue)
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_start_seeds_template_and_queues_roots() {
        let (_dir, orchestrator, queue) = orchestrator().await;
        let mut events = orchestrator.scheduler().notifier().subscribe();

        let outcome = orchestrator
            .start("sd-card-1", "demo", params(json!({"files": 5})))
            .await
            .unwrap();
        assert!(outcome.created);

        let detail = orchestrator.get_execution(&outcome.execution_id).await.unwrap();
        let statuses: Vec<_> = detail
            .steps
            .iter()
            .map(|s| (s.step_key.as_str(), s.get_status()))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("scan", Some(StepStatus::Queued)),
                ("finish", Some(StepStatus::Pending)),
            ]
        );
        assert_eq!(detail.execution.get_execution_data()["files"], 5);
        assert_eq!(queue.len().await.unwrap(), 1);
        assert_eq!(events.recv().await.unwrap().name(), "pipeline.started");
    }

    #[tokio::test]
    async fn test_duplicate_trigger_returns_existing() {
        let (_dir, orchestrator, queue) = orchestrator().await;

        let first = orchestrator.start("t-1", "demo", Map::new()).await.unwrap();
        let second = orchestrator.start("t-1", "demo", Map::new()).await.unwrap();

        assert_eq!(first.execution_id, second.execution_id);
        assert!(!second.created);
        assert_eq!(queue.len().await.unwrap(), 1);

        let (_, total) = orchestrator.list_executions(None, 10, 0).await.unwrap();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_unknown_pipeline_type_rejected() {
        let (_dir, orchestrator, _) = orchestrator().await;
        let err = orchestrator
            .start("t", "no_such_pipeline", Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_retry_requires_failed() {
        let (_dir, orchestrator, _) = orchestrator().await;
        let outcome = orchestrator.start("t", "demo", Map::new()).await.unwrap();

        let err = orchestrator.retry(&outcome.execution_id).await.unwrap_err();
        assert!(matches!(
            err,
            Error::RetryInvalidState { ref status, .. } if status == "running"
        ));
    }

    #[tokio::test]
    async fn test_cancel_frees_trigger_and_stops_scheduling() {
        let (_dir, orchestrator, _) = orchestrator().await;
        let outcome = orchestrator.start("t", "demo", Map::new()).await.unwrap();

        orchestrator.cancel(&outcome.execution_id).await.unwrap();
        let detail = orchestrator.get_execution(&outcome.execution_id).await.unwrap();
        assert_eq!(
            detail.execution.get_status(),
            Some(ExecutionStatus::Cancelled)
        );
        assert!(
            orchestrator
                .scheduler()
                .evaluate(&outcome.execution_id)
                .await
                .unwrap()
                .queued
                .is_empty()
        );

        // Cancelling twice is rejected.
        assert!(matches!(
            orchestrator.cancel(&outcome.execution_id).await,
            Err(Error::InvalidStateTransition { .. })
        ));

        // A new run for the same trigger is allowed.
        let next = orchestrator.start("t", "demo", Map::new()).await.unwrap();
        assert!(next.created);
        assert_ne!(next.execution_id, outcome.execution_id);
    }
}
