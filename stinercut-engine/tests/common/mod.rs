#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use stinercut_engine::database::models::{ExecutionStatus, PipelineStepDbModel};
use stinercut_engine::database::repositories::{ExecutionRepository, SqlxExecutionRepository};
use stinercut_engine::database::{self, DbPool};
use stinercut_engine::pipeline::{
    ItemOutcome, MemoryWorkQueue, Orchestrator, ProgressNotifier, Scheduler, StepRegistry, Worker,
    WorkerPoolConfig, WorkQueue,
};

pub async fn temp_pool() -> (TempDir, DbPool) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("engine.db");
    let url = format!(
        "sqlite:{}?mode=rwc",
        path.to_string_lossy().replace('\\', "/")
    );
    let pool = database::connect(&url).await.unwrap();
    (dir, pool)
}

/// Engine wired to an in-memory queue; steps are run by [`Engine::drain`].
pub struct Engine {
    pub dir: TempDir,
    pub pool: DbPool,
    pub queue: Arc<MemoryWorkQueue>,
    pub scheduler: Arc<Scheduler>,
    pub registry: Arc<StepRegistry>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Engine {
    pub async fn new(registry: StepRegistry) -> Self {
        let (dir, pool) = temp_pool().await;
        let queue = Arc::new(MemoryWorkQueue::new());
        let scheduler = Arc::new(Scheduler::new(
            Arc::new(SqlxExecutionRepository::new(pool.clone())),
            queue.clone(),
            ProgressNotifier::new(),
        ));
        let registry = Arc::new(registry);
        let orchestrator = Arc::new(Orchestrator::new(registry.clone(), scheduler.clone()));
        Self {
            dir,
            pool,
            queue,
            scheduler,
            registry,
            orchestrator,
        }
    }

    pub fn repository(&self) -> &Arc<dyn ExecutionRepository> {
        self.scheduler.repository()
    }

    pub fn worker(&self, id: &str) -> Worker {
        Worker::new(
            id,
            self.scheduler.clone(),
            self.registry.clone(),
            &WorkerPoolConfig::default(),
        )
    }

    /// Process queued items one at a time until the queue is empty.
    pub async fn drain(&self) -> Vec<ItemOutcome> {
        let worker = self.worker("test-worker");
        let mut outcomes = Vec::new();
        while let Some(item) = self.queue.try_pop().await.unwrap() {
            outcomes.push(worker.process(item).await.unwrap());
        }
        outcomes
    }

    pub async fn status(&self, execution_id: &str) -> ExecutionStatus {
        self.repository()
            .get_execution(execution_id)
            .await
            .unwrap()
            .get_status()
            .unwrap()
    }

    pub async fn step(&self, execution_id: &str, step_key: &str) -> PipelineStepDbModel {
        self.repository()
            .get_steps(execution_id)
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.step_key == step_key)
            .unwrap_or_else(|| panic!("no step {step_key}"))
    }

    /// Keys of the queued work items, in queue order.
    pub async fn queued_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for item in self.queue.snapshot() {
            let step = self.repository().get_step(&item.step_id).await.unwrap();
            keys.push(step.step_key);
        }
        keys
    }
}

/// Poll until the execution reaches `status` or `timeout` elapses.
pub async fn wait_for_status(
    repository: &Arc<dyn ExecutionRepository>,
    execution_id: &str,
    status: ExecutionStatus,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let current = repository
            .get_execution(execution_id)
            .await
            .unwrap()
            .get_status();
        if current == Some(status) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
