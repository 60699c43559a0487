//! Execution store: pipeline executions, their steps and the step log.
//!
//! Every status change is a compare-and-swap `UPDATE … WHERE status = ?`, so a
//! caller that lost a race observes "no row changed" instead of clobbering the
//! winner. Read-modify-write sequences run inside `BEGIN IMMEDIATE`.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::SqliteConnection;

use crate::database::models::{
    ExecutionStatus, ExecutionStepStats, PipelineExecutionDbModel, PipelineStepDbModel,
    StepLogDbModel, StepLogEvent, StepStatus, merge_shallow,
};
use crate::database::retry::retry_on_busy;
use crate::database::time::now_ms;
use crate::database::{DbPool, begin_immediate};
use crate::{Error, Result};

/// Result of reporting a step completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The step is no longer `running` under the reporting worker.
    Stale,
    /// Output stored on the step.
    Recorded {
        /// Execution status observed inside the same transaction.
        execution_status: ExecutionStatus,
        /// Whether the output was merged into `execution_data`.
        merged: bool,
    },
}

/// Result of reporting a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Stale,
    Recorded {
        /// True when this failure moved the execution to `failed`.
        failed_execution: bool,
    },
}

/// A running execution with no work in flight.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StaleExecution {
    pub id: String,
    pub updated_at: i64,
    pub pending_steps: i64,
}

/// Execution store for pipeline executions.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    // ========================================================================
    // Executions
    // ========================================================================

    /// Insert an execution and its template steps in one transaction.
    ///
    /// Returns `Ok(false)` when another active execution already owns the
    /// trigger id (nothing is written in that case).
    async fn create_execution_with_steps(
        &self,
        execution: &PipelineExecutionDbModel,
        steps: &[PipelineStepDbModel],
    ) -> Result<bool>;

    async fn get_execution(&self, id: &str) -> Result<PipelineExecutionDbModel>;

    /// The `pending`/`running` execution owning `trigger_id`, if any.
    async fn find_active_by_trigger(
        &self,
        trigger_id: &str,
    ) -> Result<Option<PipelineExecutionDbModel>>;

    async fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<PipelineExecutionDbModel>>;

    async fn count_executions(&self, status: Option<ExecutionStatus>) -> Result<u64>;

    /// Move a running execution with no non-terminal steps to `completed`.
    ///
    /// Returns whether the transition happened.
    async fn mark_execution_completed(&self, id: &str) -> Result<bool>;

    /// Reset a failed execution for resumption.
    ///
    /// Every failed step goes back to `pending` with worker, error, output and
    /// lease cleared. Queued steps, whose items workers dropped once the
    /// execution failed, go back to `pending` too. The execution returns to
    /// `running`. Returns the reset steps, failed ones first.
    async fn reset_for_retry(&self, id: &str) -> Result<Vec<PipelineStepDbModel>>;

    /// Cancel a non-terminal (or failed) execution. Returns the previous status.
    async fn cancel_execution(&self, id: &str) -> Result<ExecutionStatus>;

    /// Running executions untouched since `before_ms` with nothing queued or running.
    async fn stale_executions(&self, before_ms: i64) -> Result<Vec<StaleExecution>>;

    // ========================================================================
    // Steps
    // ========================================================================

    async fn get_step(&self, id: &str) -> Result<PipelineStepDbModel>;

    /// All steps of an execution in creation order.
    async fn get_steps(&self, execution_id: &str) -> Result<Vec<PipelineStepDbModel>>;

    async fn get_step_stats(&self, execution_id: &str) -> Result<ExecutionStepStats>;

    /// Insert a step unless its key already exists in the execution.
    ///
    /// Returns the stored step and whether it was newly created.
    async fn insert_step_if_absent(
        &self,
        step: &PipelineStepDbModel,
    ) -> Result<(PipelineStepDbModel, bool)>;

    /// CAS `pending → queued`, storing the input snapshot and a `queued` log.
    async fn mark_step_queued(&self, step_id: &str, input_data: &Map<String, Value>)
    -> Result<bool>;

    /// CAS `queued → running` for `worker_id`, bumping `attempt` and taking a lease.
    ///
    /// Returns `None` for stale pops.
    async fn claim_step(
        &self,
        step_id: &str,
        worker_id: &str,
        lease_expires_at: i64,
    ) -> Result<Option<PipelineStepDbModel>>;

    /// Extend the lease of a step still held by `worker_id`.
    async fn renew_lease(&self, step_id: &str, worker_id: &str, lease_expires_at: i64)
    -> Result<bool>;

    /// CAS `running → completed` and merge the output into the execution.
    async fn complete_step(
        &self,
        step_id: &str,
        worker_id: &str,
        output: &Map<String, Value>,
    ) -> Result<CompletionOutcome>;

    /// CAS `running → failed`; fails the execution if it is still running.
    async fn fail_step(&self, step_id: &str, worker_id: &str, error: &str)
    -> Result<FailureOutcome>;

    /// Running steps of running executions whose lease expired before `now_ms`.
    async fn expired_leases(&self, now_ms: i64) -> Result<Vec<PipelineStepDbModel>>;

    /// Return an orphaned running step to `pending`.
    ///
    /// Only succeeds while the step is still held by `worker_id` with an
    /// expired lease.
    async fn requeue_step(&self, step_id: &str, worker_id: &str) -> Result<bool>;

    /// Queued steps of running executions that were queued before `queued_before_ms`.
    async fn orphaned_queued_steps(&self, queued_before_ms: i64)
    -> Result<Vec<PipelineStepDbModel>>;

    /// CAS a step that has sat in `queued` since before `queued_before_ms`
    /// back to `pending`, so the next evaluation pushes a fresh work item.
    async fn requeue_queued_step(&self, step_id: &str, queued_before_ms: i64) -> Result<bool>;

    // ========================================================================
    // Step log
    // ========================================================================

    async fn list_step_logs(&self, execution_id: &str) -> Result<Vec<StepLogDbModel>>;
}

/// SQLx implementation of [`ExecutionRepository`].
pub struct SqlxExecutionRepository {
    pool: DbPool,
}

impl SqlxExecutionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

async fn insert_step_log(
    conn: &mut SqliteConnection,
    step: &PipelineStepDbModel,
    event: StepLogEvent,
    worker_id: Option<&str>,
    detail: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO pipeline_step_log (execution_id, step_id, step_key, event, worker_id, detail, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&step.execution_id)
    .bind(&step.id)
    .bind(&step.step_key)
    .bind(event.as_str())
    .bind(worker_id)
    .bind(detail)
    .bind(now_ms())
    .execute(conn)
    .await?;
    Ok(())
}

async fn insert_step(conn: &mut SqliteConnection, step: &PipelineStepDbModel) -> Result<u64> {
    let result = sqlx::query(
        r#"
        INSERT INTO pipeline_step (
            id, execution_id, step_name, step_key, status, depends_on, params,
            input_data, output_data, error_message, worker_id, attempt,
            lease_expires_at, spawned_by, created_at, updated_at,
            queued_at, started_at, finished_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(execution_id, step_key) DO NOTHING
        "#,
    )
    .bind(&step.id)
    .bind(&step.execution_id)
    .bind(&step.step_name)
    .bind(&step.step_key)
    .bind(&step.status)
    .bind(&step.depends_on)
    .bind(&step.params)
    .bind(&step.input_data)
    .bind(&step.output_data)
    .bind(&step.error_message)
    .bind(&step.worker_id)
    .bind(step.attempt)
    .bind(step.lease_expires_at)
    .bind(&step.spawned_by)
    .bind(step.created_at)
    .bind(step.updated_at)
    .bind(step.queued_at)
    .bind(step.started_at)
    .bind(step.finished_at)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

async fn fetch_execution(conn: &mut SqliteConnection, id: &str) -> Result<PipelineExecutionDbModel> {
    sqlx::query_as::<_, PipelineExecutionDbModel>("SELECT * FROM pipeline_execution WHERE id = ?")
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| Error::not_found("Pipeline execution", id))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}

fn parse_execution_status(execution: &PipelineExecutionDbModel) -> Result<ExecutionStatus> {
    execution.get_status().ok_or_else(|| {
        Error::Other(format!(
            "Execution {} has unknown status '{}'",
            execution.id, execution.status
        ))
    })
}

#[async_trait]
impl ExecutionRepository for SqlxExecutionRepository {
    // ========================================================================
    // Executions
    // ========================================================================

    async fn create_execution_with_steps(
        &self,
        execution: &PipelineExecutionDbModel,
        steps: &[PipelineStepDbModel],
    ) -> Result<bool> {
        retry_on_busy("create_execution_with_steps", || async {
            let mut tx = begin_immediate(&self.pool).await?;

            let inserted = sqlx::query(
                r#"
                INSERT INTO pipeline_execution (
                    id, trigger_id, pipeline_type, status, params, execution_data,
                    error_message, created_at, updated_at, completed_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&execution.id)
            .bind(&execution.trigger_id)
            .bind(&execution.pipeline_type)
            .bind(&execution.status)
            .bind(&execution.params)
            .bind(&execution.execution_data)
            .bind(&execution.error_message)
            .bind(execution.created_at)
            .bind(execution.updated_at)
            .bind(execution.completed_at)
            .execute(&mut *tx)
            .await;

            match inserted {
                Ok(_) => {}
                Err(err) if is_unique_violation(&err) => {
                    tx.rollback().await?;
                    return Ok(false);
                }
                Err(err) => return Err(err.into()),
            }

            for step in steps {
                insert_step(&mut tx, step).await?;
            }

            tx.commit().await?;
            Ok(true)
        })
        .await
    }

    async fn get_execution(&self, id: &str) -> Result<PipelineExecutionDbModel> {
        sqlx::query_as::<_, PipelineExecutionDbModel>(
            "SELECT * FROM pipeline_execution WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("Pipeline execution", id))
    }

    async fn find_active_by_trigger(
        &self,
        trigger_id: &str,
    ) -> Result<Option<PipelineExecutionDbModel>> {
        let execution = sqlx::query_as::<_, PipelineExecutionDbModel>(
            r#"
            SELECT * FROM pipeline_execution
            WHERE trigger_id = ? AND status IN ('PENDING', 'RUNNING')
            LIMIT 1
            "#,
        )
        .bind(trigger_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(execution)
    }

    async fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<PipelineExecutionDbModel>> {
        let executions = match status {
            Some(status) => {
                sqlx::query_as::<_, PipelineExecutionDbModel>(
                    r#"
                    SELECT * FROM pipeline_execution
                    WHERE status = ?
                    ORDER BY created_at DESC
                    LIMIT ? OFFSET ?
                    "#,
                )
                .bind(status.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, PipelineExecutionDbModel>(
                    "SELECT * FROM pipeline_execution ORDER BY created_at DESC LIMIT ? OFFSET ?",
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(executions)
    }

    async fn count_executions(&self, status: Option<ExecutionStatus>) -> Result<u64> {
        let count: i64 = match status {
            Some(status) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM pipeline_execution WHERE status = ?")
                    .bind(status.as_str())
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM pipeline_execution")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count as u64)
    }

    async fn mark_execution_completed(&self, id: &str) -> Result<bool> {
        retry_on_busy("mark_execution_completed", || async {
            let now = now_ms();
            let result = sqlx::query(
                r#"
                UPDATE pipeline_execution
                SET status = 'COMPLETED', updated_at = ?, completed_at = ?
                WHERE id = ?
                  AND status = 'RUNNING'
                  AND NOT EXISTS (
                      SELECT 1 FROM pipeline_step
                      WHERE execution_id = ?
                        AND status IN ('PENDING', 'QUEUED', 'RUNNING', 'FAILED')
                  )
                "#,
            )
            .bind(now)
            .bind(now)
            .bind(id)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn reset_for_retry(&self, id: &str) -> Result<Vec<PipelineStepDbModel>> {
        retry_on_busy("reset_for_retry", || async {
            let mut tx = begin_immediate(&self.pool).await?;

            let execution = fetch_execution(&mut tx, id).await?;
            let status = parse_execution_status(&execution)?;
            if status != ExecutionStatus::Failed {
                tx.rollback().await?;
                return Err(Error::RetryInvalidState {
                    execution_id: id.to_string(),
                    status: status.to_string(),
                });
            }

            let other_active: Option<String> = sqlx::query_scalar(
                r#"
                SELECT id FROM pipeline_execution
                WHERE trigger_id = ? AND status IN ('PENDING', 'RUNNING') AND id != ?
                LIMIT 1
                "#,
            )
            .bind(&execution.trigger_id)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(other) = other_active {
                tx.rollback().await?;
                return Err(Error::validation(format!(
                    "Trigger {} already has active execution {}",
                    execution.trigger_id, other
                )));
            }

            let now = now_ms();
            let reset = sqlx::query_as::<_, PipelineStepDbModel>(
                r#"
                UPDATE pipeline_step
                SET status = 'PENDING', worker_id = NULL, error_message = NULL,
                    output_data = NULL, input_data = NULL, lease_expires_at = NULL,
                    queued_at = NULL, started_at = NULL, finished_at = NULL,
                    updated_at = ?
                WHERE execution_id = ? AND status = 'FAILED'
                RETURNING *
                "#,
            )
            .bind(now)
            .bind(id)
            .fetch_all(&mut *tx)
            .await?;

            for step in &reset {
                insert_step_log(&mut tx, step, StepLogEvent::Reset, None, Some("retry")).await?;
            }

            // Workers drop the items of a failed execution, so its queued
            // steps have nothing left in the queue.
            let orphaned = sqlx::query_as::<_, PipelineStepDbModel>(
                r#"
                UPDATE pipeline_step
                SET status = 'PENDING', input_data = NULL, queued_at = NULL, updated_at = ?
                WHERE execution_id = ? AND status = 'QUEUED'
                RETURNING *
                "#,
            )
            .bind(now)
            .bind(id)
            .fetch_all(&mut *tx)
            .await?;

            for step in &orphaned {
                insert_step_log(
                    &mut tx,
                    step,
                    StepLogEvent::Reset,
                    None,
                    Some("retry: work item dropped"),
                )
                .await?;
            }

            sqlx::query(
                r#"
                UPDATE pipeline_execution
                SET status = 'RUNNING', error_message = NULL, completed_at = NULL, updated_at = ?
                WHERE id = ? AND status = 'FAILED'
                "#,
            )
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(reset.into_iter().chain(orphaned).collect())
        })
        .await
    }

    async fn cancel_execution(&self, id: &str) -> Result<ExecutionStatus> {
        retry_on_busy("cancel_execution", || async {
            let mut tx = begin_immediate(&self.pool).await?;

            let execution = fetch_execution(&mut tx, id).await?;
            let status = parse_execution_status(&execution)?;
            if matches!(status, ExecutionStatus::Completed | ExecutionStatus::Cancelled) {
                tx.rollback().await?;
                return Err(Error::invalid_transition(
                    status.to_string(),
                    ExecutionStatus::Cancelled.to_string(),
                ));
            }

            let now = now_ms();
            sqlx::query(
                r#"
                UPDATE pipeline_execution
                SET status = 'CANCELLED', updated_at = ?, completed_at = ?
                WHERE id = ?
                "#,
            )
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(status)
        })
        .await
    }

    async fn stale_executions(&self, before_ms: i64) -> Result<Vec<StaleExecution>> {
        let stale = sqlx::query_as::<_, StaleExecution>(
            r#"
            SELECT e.id, e.updated_at,
                   (SELECT COUNT(*) FROM pipeline_step p
                    WHERE p.execution_id = e.id AND p.status = 'PENDING') AS pending_steps
            FROM pipeline_execution e
            WHERE e.status = 'RUNNING'
              AND e.updated_at < ?
              AND NOT EXISTS (
                  SELECT 1 FROM pipeline_step s
                  WHERE s.execution_id = e.id AND s.status IN ('QUEUED', 'RUNNING')
              )
            ORDER BY e.updated_at
            "#,
        )
        .bind(before_ms)
        .fetch_all(&self.pool)
        .await?;
        Ok(stale)
    }

    // ========================================================================
    // Steps
    // ========================================================================

    async fn get_step(&self, id: &str) -> Result<PipelineStepDbModel> {
        sqlx::query_as::<_, PipelineStepDbModel>("SELECT * FROM pipeline_step WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Pipeline step", id))
    }

    async fn get_steps(&self, execution_id: &str) -> Result<Vec<PipelineStepDbModel>> {
        let steps = sqlx::query_as::<_, PipelineStepDbModel>(
            "SELECT * FROM pipeline_step WHERE execution_id = ? ORDER BY created_at, rowid",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(steps)
    }

    async fn get_step_stats(&self, execution_id: &str) -> Result<ExecutionStepStats> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM pipeline_step WHERE execution_id = ? GROUP BY status",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = ExecutionStepStats::default();
        for (status, count) in rows {
            let count = count as u64;
            match StepStatus::parse(&status) {
                Some(StepStatus::Pending) => stats.pending = count,
                Some(StepStatus::Queued) => stats.queued = count,
                Some(StepStatus::Running) => stats.running = count,
                Some(StepStatus::Completed) => stats.completed = count,
                Some(StepStatus::Failed) => stats.failed = count,
                None => {}
            }
        }
        Ok(stats)
    }

    async fn insert_step_if_absent(
        &self,
        step: &PipelineStepDbModel,
    ) -> Result<(PipelineStepDbModel, bool)> {
        retry_on_busy("insert_step_if_absent", || async {
            let mut conn = self.pool.acquire().await?;
            let created = insert_step(&mut conn, step).await? == 1;

            let stored = sqlx::query_as::<_, PipelineStepDbModel>(
                "SELECT * FROM pipeline_step WHERE execution_id = ? AND step_key = ?",
            )
            .bind(&step.execution_id)
            .bind(&step.step_key)
            .fetch_one(&mut *conn)
            .await?;

            Ok((stored, created))
        })
        .await
    }

    async fn mark_step_queued(
        &self,
        step_id: &str,
        input_data: &Map<String, Value>,
    ) -> Result<bool> {
        let input_json = serde_json::to_string(input_data)?;
        retry_on_busy("mark_step_queued", || async {
            let mut tx = begin_immediate(&self.pool).await?;
            let now = now_ms();

            let queued = sqlx::query_as::<_, PipelineStepDbModel>(
                r#"
                UPDATE pipeline_step
                SET status = 'QUEUED', input_data = ?, queued_at = ?, updated_at = ?
                WHERE id = ? AND status = 'PENDING'
                RETURNING *
                "#,
            )
            .bind(&input_json)
            .bind(now)
            .bind(now)
            .bind(step_id)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(step) = queued else {
                tx.rollback().await?;
                return Ok(false);
            };

            insert_step_log(&mut tx, &step, StepLogEvent::Queued, None, None).await?;
            tx.commit().await?;
            Ok(true)
        })
        .await
    }

    async fn claim_step(
        &self,
        step_id: &str,
        worker_id: &str,
        lease_expires_at: i64,
    ) -> Result<Option<PipelineStepDbModel>> {
        retry_on_busy("claim_step", || async {
            let mut tx = begin_immediate(&self.pool).await?;
            let now = now_ms();

            let claimed = sqlx::query_as::<_, PipelineStepDbModel>(
                r#"
                UPDATE pipeline_step
                SET status = 'RUNNING', worker_id = ?, attempt = attempt + 1,
                    lease_expires_at = ?, started_at = ?, updated_at = ?
                WHERE id = ? AND status = 'QUEUED'
                RETURNING *
                "#,
            )
            .bind(worker_id)
            .bind(lease_expires_at)
            .bind(now)
            .bind(now)
            .bind(step_id)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(step) = claimed else {
                tx.rollback().await?;
                return Ok(None);
            };

            let detail = format!("attempt {}", step.attempt);
            insert_step_log(
                &mut tx,
                &step,
                StepLogEvent::Started,
                Some(worker_id),
                Some(&detail),
            )
            .await?;
            tx.commit().await?;
            Ok(Some(step))
        })
        .await
    }

    async fn renew_lease(
        &self,
        step_id: &str,
        worker_id: &str,
        lease_expires_at: i64,
    ) -> Result<bool> {
        retry_on_busy("renew_lease", || async {
            let result = sqlx::query(
                r#"
                UPDATE pipeline_step
                SET lease_expires_at = ?, updated_at = ?
                WHERE id = ? AND status = 'RUNNING' AND worker_id = ?
                "#,
            )
            .bind(lease_expires_at)
            .bind(now_ms())
            .bind(step_id)
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn complete_step(
        &self,
        step_id: &str,
        worker_id: &str,
        output: &Map<String, Value>,
    ) -> Result<CompletionOutcome> {
        let output_json = serde_json::to_string(output)?;
        retry_on_busy("complete_step", || async {
            let mut tx = begin_immediate(&self.pool).await?;
            let now = now_ms();

            let completed = sqlx::query_as::<_, PipelineStepDbModel>(
                r#"
                UPDATE pipeline_step
                SET status = 'COMPLETED', output_data = ?, lease_expires_at = NULL,
                    finished_at = ?, updated_at = ?
                WHERE id = ? AND status = 'RUNNING' AND worker_id = ?
                RETURNING *
                "#,
            )
            .bind(&output_json)
            .bind(now)
            .bind(now)
            .bind(step_id)
            .bind(worker_id)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(step) = completed else {
                tx.rollback().await?;
                return Ok(CompletionOutcome::Stale);
            };

            let mut execution = fetch_execution(&mut tx, &step.execution_id).await?;
            let execution_status = parse_execution_status(&execution)?;

            // Work finished after a sibling failed is kept so a retry can use it.
            let merged = matches!(
                execution_status,
                ExecutionStatus::Running | ExecutionStatus::Failed
            );
            if merged {
                let mut data = execution.get_execution_data();
                merge_shallow(&mut data, output);
                execution.execution_data = serde_json::to_string(&data)?;

                sqlx::query(
                    "UPDATE pipeline_execution SET execution_data = ?, updated_at = ? WHERE id = ?",
                )
                .bind(&execution.execution_data)
                .bind(now)
                .bind(&execution.id)
                .execute(&mut *tx)
                .await?;
            }

            insert_step_log(&mut tx, &step, StepLogEvent::Completed, Some(worker_id), None)
                .await?;
            tx.commit().await?;

            Ok(CompletionOutcome::Recorded {
                execution_status,
                merged,
            })
        })
        .await
    }

    async fn fail_step(
        &self,
        step_id: &str,
        worker_id: &str,
        error: &str,
    ) -> Result<FailureOutcome> {
        retry_on_busy("fail_step", || async {
            let mut tx = begin_immediate(&self.pool).await?;
            let now = now_ms();

            let failed = sqlx::query_as::<_, PipelineStepDbModel>(
                r#"
                UPDATE pipeline_step
                SET status = 'FAILED', error_message = ?, lease_expires_at = NULL,
                    finished_at = ?, updated_at = ?
                WHERE id = ? AND status = 'RUNNING' AND worker_id = ?
                RETURNING *
                "#,
            )
            .bind(error)
            .bind(now)
            .bind(now)
            .bind(step_id)
            .bind(worker_id)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(step) = failed else {
                tx.rollback().await?;
                return Ok(FailureOutcome::Stale);
            };

            // First failure wins; later ones leave the execution error untouched.
            let result = sqlx::query(
                r#"
                UPDATE pipeline_execution
                SET status = 'FAILED', error_message = ?, updated_at = ?
                WHERE id = ? AND status = 'RUNNING'
                "#,
            )
            .bind(error)
            .bind(now)
            .bind(&step.execution_id)
            .execute(&mut *tx)
            .await?;

            insert_step_log(
                &mut tx,
                &step,
                StepLogEvent::Failed,
                Some(worker_id),
                Some(error),
            )
            .await?;
            tx.commit().await?;

            Ok(FailureOutcome::Recorded {
                failed_execution: result.rows_affected() == 1,
            })
        })
        .await
    }

    async fn expired_leases(&self, now_ms: i64) -> Result<Vec<PipelineStepDbModel>> {
        let steps = sqlx::query_as::<_, PipelineStepDbModel>(
            r#"
            SELECT s.* FROM pipeline_step s
            JOIN pipeline_execution e ON e.id = s.execution_id
            WHERE s.status = 'RUNNING'
              AND s.lease_expires_at IS NOT NULL
              AND s.lease_expires_at < ?
              AND e.status = 'RUNNING'
            ORDER BY s.lease_expires_at
            "#,
        )
        .bind(now_ms)
        .fetch_all(&self.pool)
        .await?;
        Ok(steps)
    }

    async fn requeue_step(&self, step_id: &str, worker_id: &str) -> Result<bool> {
        retry_on_busy("requeue_step", || async {
            let mut tx = begin_immediate(&self.pool).await?;
            let now = now_ms();

            let requeued = sqlx::query_as::<_, PipelineStepDbModel>(
                r#"
                UPDATE pipeline_step
                SET status = 'PENDING', worker_id = NULL, lease_expires_at = NULL,
                    input_data = NULL, queued_at = NULL, started_at = NULL, updated_at = ?
                WHERE id = ? AND status = 'RUNNING' AND worker_id = ? AND lease_expires_at < ?
                RETURNING *
                "#,
            )
            .bind(now)
            .bind(step_id)
            .bind(worker_id)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(step) = requeued else {
                tx.rollback().await?;
                return Ok(false);
            };

            insert_step_log(
                &mut tx,
                &step,
                StepLogEvent::Requeued,
                Some(worker_id),
                Some("lease expired"),
            )
            .await?;
            tx.commit().await?;
            Ok(true)
        })
        .await
    }

    async fn orphaned_queued_steps(
        &self,
        queued_before_ms: i64,
    ) -> Result<Vec<PipelineStepDbModel>> {
        let steps = sqlx::query_as::<_, PipelineStepDbModel>(
            r#"
            SELECT s.* FROM pipeline_step s
            JOIN pipeline_execution e ON e.id = s.execution_id
            WHERE s.status = 'QUEUED'
              AND s.queued_at IS NOT NULL
              AND s.queued_at < ?
              AND e.status = 'RUNNING'
            ORDER BY s.queued_at
            "#,
        )
        .bind(queued_before_ms)
        .fetch_all(&self.pool)
        .await?;
        Ok(steps)
    }

    async fn requeue_queued_step(&self, step_id: &str, queued_before_ms: i64) -> Result<bool> {
        retry_on_busy("requeue_queued_step", || async {
            let mut tx = begin_immediate(&self.pool).await?;
            let now = now_ms();

            let requeued = sqlx::query_as::<_, PipelineStepDbModel>(
                r#"
                UPDATE pipeline_step
                SET status = 'PENDING', input_data = NULL, queued_at = NULL, updated_at = ?
                WHERE id = ? AND status = 'QUEUED' AND queued_at < ?
                RETURNING *
                "#,
            )
            .bind(now)
            .bind(step_id)
            .bind(queued_before_ms)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(step) = requeued else {
                tx.rollback().await?;
                return Ok(false);
            };

            insert_step_log(
                &mut tx,
                &step,
                StepLogEvent::Requeued,
                None,
                Some("work item lost"),
            )
            .await?;
            tx.commit().await?;
            Ok(true)
        })
        .await
    }

    // ========================================================================
    // Step log
    // ========================================================================

    async fn list_step_logs(&self, execution_id: &str) -> Result<Vec<StepLogDbModel>> {
        let logs = sqlx::query_as::<_, StepLogDbModel>(
            "SELECT * FROM pipeline_step_log WHERE execution_id = ? ORDER BY id",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(logs)
    }
}
