//! Scheduler: dependency resolution, output merging and completion detection.
//!
//! The step table is the only graph there is. Every call re-derives
//! eligibility from persisted status, so `evaluate` can be called any number
//! of times without pushing duplicate work. All entry points run under the
//! per-execution lock; the `*_locked` variants assume the caller holds it.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::database::models::{ExecutionStatus, PipelineStepDbModel, StepStatus};
use crate::database::repositories::{CompletionOutcome, ExecutionRepository, FailureOutcome};
use crate::pipeline::locks::ExecutionLocks;
use crate::pipeline::progress::{PipelineEvent, ProgressNotifier};
use crate::pipeline::registry::StepOutput;
use crate::pipeline::work_queue::{WorkItem, WorkQueue};

/// What one `evaluate` pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluateOutcome {
    /// Keys of the steps queued by this pass, in creation order.
    pub queued: Vec<String>,
    /// Whether this pass completed the execution.
    pub completed: bool,
}

/// Dependency-resolution engine shared by the orchestrator, workers and sweeper.
pub struct Scheduler {
    repository: Arc<dyn ExecutionRepository>,
    queue: Arc<dyn WorkQueue>,
    notifier: ProgressNotifier,
    locks: ExecutionLocks,
}

impl Scheduler {
    pub fn new(
        repository: Arc<dyn ExecutionRepository>,
        queue: Arc<dyn WorkQueue>,
        notifier: ProgressNotifier,
    ) -> Self {
        Self {
            repository,
            queue,
            notifier,
            locks: ExecutionLocks::new(),
        }
    }

    pub fn repository(&self) -> &Arc<dyn ExecutionRepository> {
        &self.repository
    }

    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    pub fn notifier(&self) -> &ProgressNotifier {
        &self.notifier
    }

    pub(crate) fn locks(&self) -> &ExecutionLocks {
        &self.locks
    }

    /// Queue every pending step whose dependencies are all completed.
    pub async fn evaluate(&self, execution_id: &str) -> Result<EvaluateOutcome> {
        let _guard = self.locks.lock(execution_id).await;
        self.evaluate_locked(execution_id).await
    }

    pub(crate) async fn evaluate_locked(&self, execution_id: &str) -> Result<EvaluateOutcome> {
        let execution = self.repository.get_execution(execution_id).await?;
        if !execution.is_running() {
            debug!(
                execution_id = %execution_id,
                status = %execution.status,
                "Skipping evaluation of non-running execution"
            );
            return Ok(EvaluateOutcome::default());
        }

        let steps = self.repository.get_steps(execution_id).await?;
        let status_by_key: HashMap<&str, Option<StepStatus>> = steps
            .iter()
            .map(|s| (s.step_key.as_str(), s.get_status()))
            .collect();

        // One snapshot per pass: merges are serialized by the same lock.
        let snapshot = execution.get_execution_data();
        let mut outcome = EvaluateOutcome::default();
        let mut non_terminal = 0usize;

        for step in &steps {
            let status = step.get_status();
            if !status.is_some_and(|s| s.is_terminal()) {
                non_terminal += 1;
            }
            if status != Some(StepStatus::Pending) {
                continue;
            }

            // Unknown keys are unsatisfied: they may still be spawned.
            let ready = step.get_depends_on().iter().all(|dep| {
                matches!(
                    status_by_key.get(dep.as_str()),
                    Some(Some(StepStatus::Completed))
                )
            });
            if !ready {
                continue;
            }

            if !self.repository.mark_step_queued(&step.id, &snapshot).await? {
                debug!(
                    execution_id = %execution_id,
                    step_key = %step.step_key,
                    "Step already left pending; not queuing"
                );
                continue;
            }

            if let Err(e) = self
                .queue
                .push(WorkItem::new(execution_id, &step.id))
                .await
            {
                error!(
                    execution_id = %execution_id,
                    step_key = %step.step_key,
                    error = %e,
                    "Failed to push queued step to the work queue"
                );
                return Err(e);
            }

            debug!(execution_id = %execution_id, step_key = %step.step_key, "Queued step");
            outcome.queued.push(step.step_key.clone());
        }

        if non_terminal == 0 && self.repository.mark_execution_completed(execution_id).await? {
            info!(
                execution_id = %execution_id,
                steps = steps.len(),
                "Pipeline execution completed"
            );
            self.notifier.emit(PipelineEvent::Completed {
                execution_id: execution_id.to_string(),
            });
            outcome.completed = true;
        }

        Ok(outcome)
    }

    /// Record a successful step and schedule whatever it unblocked.
    pub async fn on_step_completed(
        &self,
        step: &PipelineStepDbModel,
        worker_id: &str,
        output: &StepOutput,
    ) -> Result<CompletionOutcome> {
        let _guard = self.locks.lock(&step.execution_id).await;

        let outcome = self
            .repository
            .complete_step(&step.id, worker_id, output)
            .await?;

        match outcome {
            CompletionOutcome::Stale => {
                warn!(
                    execution_id = %step.execution_id,
                    step_key = %step.step_key,
                    worker_id = %worker_id,
                    "Discarding completion from a worker that no longer holds the step"
                );
            }
            CompletionOutcome::Recorded {
                execution_status,
                merged,
            } => {
                debug!(
                    execution_id = %step.execution_id,
                    step_key = %step.step_key,
                    execution_status = %execution_status,
                    merged,
                    "Step completed"
                );

                if merged {
                    let stats = self.repository.get_step_stats(&step.execution_id).await?;
                    self.notifier.emit(PipelineEvent::StepCompleted {
                        execution_id: step.execution_id.clone(),
                        step_key: step.step_key.clone(),
                        percent_complete: stats.percent_complete(),
                    });
                }

                if execution_status == ExecutionStatus::Running {
                    self.evaluate_locked(&step.execution_id).await?;
                } else if !merged {
                    info!(
                        execution_id = %step.execution_id,
                        step_key = %step.step_key,
                        "Execution was cancelled; step output not merged"
                    );
                }
            }
        }

        Ok(outcome)
    }

    /// Record a failed step. The first failure fails the execution; nothing
    /// further is scheduled.
    pub async fn on_step_failed(
        &self,
        step: &PipelineStepDbModel,
        worker_id: &str,
        error_message: &str,
    ) -> Result<FailureOutcome> {
        let _guard = self.locks.lock(&step.execution_id).await;

        let outcome = self
            .repository
            .fail_step(&step.id, worker_id, error_message)
            .await?;

        match outcome {
            FailureOutcome::Stale => {
                warn!(
                    execution_id = %step.execution_id,
                    step_key = %step.step_key,
                    worker_id = %worker_id,
                    "Discarding failure from a worker that no longer holds the step"
                );
            }
            FailureOutcome::Recorded {
                failed_execution: true,
            } => {
                error!(
                    execution_id = %step.execution_id,
                    step_key = %step.step_key,
                    error = %error_message,
                    "Pipeline execution failed"
                );
                self.notifier.emit(PipelineEvent::Failed {
                    execution_id: step.execution_id.clone(),
                    step_key: step.step_key.clone(),
                    error: error_message.to_string(),
                });
            }
            FailureOutcome::Recorded {
                failed_execution: false,
            } => {
                info!(
                    execution_id = %step.execution_id,
                    step_key = %step.step_key,
                    error = %error_message,
                    "Step failed after the execution had already stopped"
                );
            }
        }

        Ok(outcome)
    }

    /// Persist a spawned step and evaluate immediately.
    ///
    /// Spawning an existing key returns the stored step unchanged.
    pub async fn on_step_spawned(&self, step: PipelineStepDbModel) -> Result<PipelineStepDbModel> {
        let _guard = self.locks.lock(&step.execution_id).await;

        let (stored, created) = self.repository.insert_step_if_absent(&step).await?;
        if created {
            debug!(
                execution_id = %stored.execution_id,
                step_key = %stored.step_key,
                spawned_by = ?stored.spawned_by,
                "Spawned step"
            );
        } else {
            debug!(
                execution_id = %stored.execution_id,
                step_key = %stored.step_key,
                "Spawned step already exists; keeping the stored one"
            );
        }

        self.evaluate_locked(&stored.execution_id).await?;
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::PipelineExecutionDbModel;
    use crate::database::repositories::SqlxExecutionRepository;
    use crate::database::testing::temp_pool;
    use crate::database::time::now_ms;
    use crate::pipeline::work_queue::MemoryWorkQueue;
    use serde_json::{Map, Value, json};
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        scheduler: Arc<Scheduler>,
        queue: Arc<MemoryWorkQueue>,
    }

    async fn harness() -> Harness {
        let (dir, pool) = temp_pool().await;
        let queue = Arc::new(MemoryWorkQueue::new());
        let scheduler = Arc::new(Scheduler::new(
            Arc::new(SqlxExecutionRepository::new(pool)),
            queue.clone(),
            ProgressNotifier::new(),
        ));
        Harness {
            _dir: dir,
            scheduler,
            queue,
        }
    }

    /// `deps` is a comma-separated list of step keys.
    fn step(exec: &PipelineExecutionDbModel, key: &str, deps: &str) -> PipelineStepDbModel {
        let deps: Vec<String> = deps
            .split(',')
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .collect();
        PipelineStepDbModel::new(&exec.id, key, key, &deps, &Value::Null, None)
    }

    async fn create(h: &Harness, steps: &[(&str, &str)]) -> PipelineExecutionDbModel {
        let exec = PipelineExecutionDbModel::new(uuid::Uuid::new_v4().to_string(), "test", &Map::new());
        let models: Vec<_> = steps.iter().map(|(k, d)| step(&exec, k, d)).collect();
        h.scheduler
            .repository()
            .create_execution_with_steps(&exec, &models)
            .await
            .unwrap();
        exec
    }

    /// Pop the next item, claim it and complete it with `output`.
    async fn run_next(h: &Harness, worker: &str, output: Value) -> String {
        let item = h.queue.try_pop().await.unwrap().expect("queued item");
        let repo = h.scheduler.repository();
        let step = repo
            .claim_step(&item.step_id, worker, now_ms() + 60_000)
            .await
            .unwrap()
            .unwrap();
        let output = output.as_object().cloned().unwrap_or_default();
        h.scheduler
            .on_step_completed(&step, worker, &output)
            .await
            .unwrap();
        step.step_key
    }

    fn queued_keys(h: &Harness, steps: &[PipelineStepDbModel]) -> Vec<String> {
        h.queue
            .snapshot()
            .iter()
            .filter_map(|item| steps.iter().find(|s| s.id == item.step_id))
            .map(|s| s.step_key.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_root_step_queued_in_one_evaluate() {
        let h = harness().await;
        let exec = create(&h, &[("a", ""), ("b", "a")]).await;

        let outcome = h.scheduler.evaluate(&exec.id).await.unwrap();
        assert_eq!(outcome.queued, vec!["a"]);
        assert!(!outcome.completed);

        // Re-evaluating the same state pushes nothing new.
        let again = h.scheduler.evaluate(&exec.id).await.unwrap();
        assert!(again.queued.is_empty());
        assert_eq!(h.queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_evaluate_never_double_pushes() {
        let h = harness().await;
        let exec = create(&h, &[("a", ""), ("b", ""), ("c", "a")]).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let scheduler = h.scheduler.clone();
            let id = exec.id.clone();
            handles.push(tokio::spawn(async move { scheduler.evaluate(&id).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let steps = h.scheduler.repository().get_steps(&exec.id).await.unwrap();
        let mut keys = queued_keys(&h, &steps);
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_missing_dependency_is_unsatisfied() {
        let h = harness().await;
        let exec = create(&h, &[("a", "never_spawned")]).await;

        let outcome = h.scheduler.evaluate(&exec.id).await.unwrap();
        assert!(outcome.queued.is_empty());
        assert!(!outcome.completed);

        let stored = h.scheduler.repository().get_execution(&exec.id).await.unwrap();
        assert_eq!(stored.get_status(), Some(ExecutionStatus::Running));
    }

    #[tokio::test]
    async fn test_merge_then_complete() {
        let h = harness().await;
        let exec = create(&h, &[("scan", ""), ("finish", "scan")]).await;
        let mut events = h.scheduler.notifier().subscribe();

        h.scheduler.evaluate(&exec.id).await.unwrap();
        assert_eq!(run_next(&h, "w1", json!({"files": 3})).await, "scan");

        let repo = h.scheduler.repository();
        let finish = repo
            .get_steps(&exec.id)
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.step_key == "finish")
            .unwrap();
        assert_eq!(finish.get_status(), Some(StepStatus::Queued));
        assert_eq!(finish.get_input_data()["files"], 3);

        run_next(&h, "w1", json!({"finished": true})).await;
        let stored = repo.get_execution(&exec.id).await.unwrap();
        assert_eq!(stored.get_status(), Some(ExecutionStatus::Completed));
        assert_eq!(stored.get_execution_data()["files"], 3);

        let first = events.recv().await.unwrap();
        assert_eq!(
            first,
            PipelineEvent::StepCompleted {
                execution_id: exec.id.clone(),
                step_key: "scan".to_string(),
                percent_complete: 50.0,
            }
        );
        assert_eq!(events.recv().await.unwrap().name(), "pipeline.step_completed");
        assert_eq!(events.recv().await.unwrap().name(), "pipeline.completed");
    }

    #[tokio::test]
    async fn test_empty_execution_completes_on_evaluate() {
        let h = harness().await;
        let exec = create(&h, &[]).await;
        let outcome = h.scheduler.evaluate(&exec.id).await.unwrap();
        assert!(outcome.completed);
    }

    #[tokio::test]
    async fn test_failure_stops_scheduling() {
        let h = harness().await;
        let exec = create(&h, &[("a", ""), ("b", "a")]).await;
        h.scheduler.evaluate(&exec.id).await.unwrap();

        let item = h.queue.try_pop().await.unwrap().unwrap();
        let repo = h.scheduler.repository();
        let a = repo
            .claim_step(&item.step_id, "w1", now_ms() + 60_000)
            .await
            .unwrap()
            .unwrap();
        h.scheduler.on_step_failed(&a, "w1", "disk full").await.unwrap();

        assert!(h.scheduler.evaluate(&exec.id).await.unwrap().queued.is_empty());
        let stored = repo.get_execution(&exec.id).await.unwrap();
        assert_eq!(stored.get_status(), Some(ExecutionStatus::Failed));
        assert_eq!(stored.error_message.as_deref(), Some("disk full"));
    }

    #[tokio::test]
    async fn test_spawned_root_step_is_queued_immediately() {
        let h = harness().await;
        let exec = create(&h, &[("parent", "")]).await;
        h.scheduler.evaluate(&exec.id).await.unwrap();
        let parent_item = h.queue.try_pop().await.unwrap().unwrap();
        h.scheduler
            .repository()
            .claim_step(&parent_item.step_id, "w1", now_ms() + 60_000)
            .await
            .unwrap()
            .unwrap();

        let child = PipelineStepDbModel::new(
            &exec.id,
            "child",
            "child:1",
            &[],
            &json!({}),
            Some("parent"),
        );
        let stored = h.scheduler.on_step_spawned(child.clone()).await.unwrap();
        assert_eq!(stored.id, child.id);
        assert_eq!(h.queue.snapshot(), vec![WorkItem::new(&exec.id, &child.id)]);

        // Re-spawning the same key is a no-op.
        let again = PipelineStepDbModel::new(&exec.id, "child", "child:1", &[], &json!({}), None);
        let stored = h.scheduler.on_step_spawned(again).await.unwrap();
        assert_eq!(stored.id, child.id);
        assert_eq!(h.queue.len().await.unwrap(), 1);
    }
}
