//! Workers: pop ready steps, run their handlers, report back.

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::database::models::PipelineStepDbModel;
use crate::database::time::ms_from_now;
use crate::pipeline::registry::{Spawner, StepContext, StepDescriptor, StepRegistry};
use crate::pipeline::scheduler::Scheduler;
use crate::pipeline::work_queue::{WorkItem, WorkQueue};

/// Configuration for a worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers (the parallelism ceiling).
    pub workers: usize,
    /// Lease taken on a claimed step.
    pub lease_secs: u64,
    /// How often a running step's lease is renewed.
    pub heartbeat_secs: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            lease_secs: 120,
            heartbeat_secs: 30,
        }
    }
}

impl WorkerPoolConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

/// What happened to a popped work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Stale pop, or the execution is no longer running.
    Discarded,
    Completed,
    Failed,
}

/// [`Spawner`] bound to one running step.
struct StepSpawner {
    scheduler: Arc<Scheduler>,
    registry: Arc<StepRegistry>,
    execution_id: String,
    parent_key: String,
}

#[async_trait]
impl Spawner for StepSpawner {
    async fn spawn(&self, descriptor: StepDescriptor) -> Result<String> {
        let resolved = self.registry.resolve(&descriptor)?;
        let step = PipelineStepDbModel::new(
            &self.execution_id,
            &resolved.step_name,
            &resolved.step_key,
            &resolved.depends_on,
            &resolved.params,
            Some(&self.parent_key),
        );
        let stored = self.scheduler.on_step_spawned(step).await?;
        Ok(stored.step_key)
    }
}

/// A single worker. Runs at most one step at a time.
pub struct Worker {
    id: String,
    scheduler: Arc<Scheduler>,
    registry: Arc<StepRegistry>,
    lease: Duration,
    heartbeat: Duration,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        scheduler: Arc<Scheduler>,
        registry: Arc<StepRegistry>,
        config: &WorkerPoolConfig,
    ) -> Self {
        Self {
            id: id.into(),
            scheduler,
            registry,
            lease: config.lease(),
            heartbeat: config.heartbeat(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Pop and process items until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        debug!(worker_id = %self.id, "Worker started");
        let queue = self.scheduler.queue().clone();

        loop {
            let item = match queue.blocking_pop(&cancel).await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Error popping work item");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(queue.poll_interval()) => continue,
                    }
                }
            };

            if let Err(e) = self.process(item.clone()).await {
                error!(
                    worker_id = %self.id,
                    execution_id = %item.execution_id,
                    step_id = %item.step_id,
                    error = %e,
                    "Error processing work item"
                );
            }
        }

        debug!(worker_id = %self.id, "Worker shutting down");
    }

    /// Claim, run and report one work item.
    pub async fn process(&self, item: WorkItem) -> Result<ItemOutcome> {
        let repository = self.scheduler.repository();

        let execution = match repository.get_execution(&item.execution_id).await {
            Ok(execution) => execution,
            Err(crate::Error::NotFound { .. }) => {
                warn!(execution_id = %item.execution_id, "Work item for unknown execution");
                return Ok(ItemOutcome::Discarded);
            }
            Err(e) => return Err(e),
        };
        if !execution.is_running() {
            debug!(
                execution_id = %item.execution_id,
                status = %execution.status,
                "Dropping work item of non-running execution"
            );
            return Ok(ItemOutcome::Discarded);
        }

        let Some(step) = repository
            .claim_step(&item.step_id, &self.id, ms_from_now(self.lease))
            .await?
        else {
            debug!(step_id = %item.step_id, "Stale work item discarded");
            return Ok(ItemOutcome::Discarded);
        };

        info!(
            worker_id = %self.id,
            execution_id = %step.execution_id,
            step_key = %step.step_key,
            attempt = step.attempt,
            "Running step"
        );

        let Some(definition) = self.registry.step(&step.step_name) else {
            let message = format!("No handler registered for step '{}'", step.step_name);
            self.scheduler
                .on_step_failed(&step, &self.id, &message)
                .await?;
            return Ok(ItemOutcome::Failed);
        };

        let spawner = Arc::new(StepSpawner {
            scheduler: self.scheduler.clone(),
            registry: self.registry.clone(),
            execution_id: step.execution_id.clone(),
            parent_key: step.step_key.clone(),
        });
        let ctx = StepContext::new(
            &step.execution_id,
            &step.step_key,
            &step.step_name,
            step.get_params(),
            step.get_input_data(),
            step.attempt,
            spawner,
        );

        let heartbeat = self.start_heartbeat(&step);
        let started = std::time::Instant::now();
        let result = AssertUnwindSafe(definition.handler.run(&ctx))
            .catch_unwind()
            .await;
        heartbeat.cancel();

        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(Ok(output)) => {
                debug!(
                    execution_id = %step.execution_id,
                    step_key = %step.step_key,
                    duration_ms,
                    "Step body returned"
                );
                self.scheduler
                    .on_step_completed(&step, &self.id, &output)
                    .await?;
                Ok(ItemOutcome::Completed)
            }
            Ok(Err(e)) => {
                // Stored verbatim; the wrapped error only shapes the log line.
                let message = format!("{:#}", e);
                let err = crate::Error::StepExecution {
                    step_key: step.step_key.clone(),
                    message: message.clone(),
                };
                warn!(
                    execution_id = %step.execution_id,
                    duration_ms,
                    error = %err,
                    "Step failed"
                );
                self.scheduler
                    .on_step_failed(&step, &self.id, &message)
                    .await?;
                Ok(ItemOutcome::Failed)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    execution_id = %step.execution_id,
                    step_key = %step.step_key,
                    error = %message,
                    "Step panicked"
                );
                self.scheduler
                    .on_step_failed(&step, &self.id, &message)
                    .await?;
                Ok(ItemOutcome::Failed)
            }
        }
    }

    /// Renew the step lease until the returned token is cancelled.
    fn start_heartbeat(&self, step: &PipelineStepDbModel) -> CancellationToken {
        let token = CancellationToken::new();
        let stop = token.clone();
        let repository = self.scheduler.repository().clone();
        let step_id = step.id.clone();
        let step_key = step.step_key.clone();
        let worker_id = self.id.clone();
        let lease = self.lease;
        let every = self.heartbeat;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match repository
                    .renew_lease(&step_id, &worker_id, ms_from_now(lease))
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(
                            step_key = %step_key,
                            worker_id = %worker_id,
                            "Lost the lease on a running step"
                        );
                        break;
                    }
                    Err(e) => {
                        warn!(step_key = %step_key, error = %e, "Failed to renew step lease");
                    }
                }
            }
        });

        token
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Step panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Step panicked: {}", s)
    } else {
        "Step panicked".to_string()
    }
}

/// A pool of workers sharing one queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Spawn the configured number of workers.
    pub fn start(&self, scheduler: Arc<Scheduler>, registry: Arc<StepRegistry>) {
        let instance = uuid::Uuid::new_v4().simple().to_string();
        let instance = &instance[..8];

        info!("Starting worker pool with {} workers", self.config.workers);

        let mut tasks = self.tasks.lock();
        if let Some(ref mut join_set) = *tasks {
            for i in 0..self.config.workers {
                let worker = Worker::new(
                    format!("worker-{}-{}", instance, i),
                    scheduler.clone(),
                    registry.clone(),
                    &self.config,
                );
                let cancellation_token = self.cancellation_token.clone();
                join_set.spawn(async move { worker.run(cancellation_token).await });
            }
        }
    }

    /// Stop the pool and wait for in-flight steps to finish.
    pub async fn stop(&self) {
        info!("Stopping worker pool");
        self.cancellation_token.cancel();

        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!("Worker pool stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.lease(), Duration::from_secs(120));
        assert_eq!(config.heartbeat(), Duration::from_secs(30));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "Step panicked: boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "Step panicked");
    }

    #[tokio::test]
    async fn test_pool_stop() {
        let pool = WorkerPool::new(WorkerPoolConfig::default());
        assert!(pool.is_running());
        pool.stop().await;
        assert!(!pool.is_running());
    }
}
