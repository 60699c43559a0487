//! Work queue of ready-to-run steps.
//!
//! Delivery is at-least-once: a worker must claim the step with a
//! `queued → running` compare-and-swap before doing anything, so a duplicate
//! or outdated item is harmless.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Result;
use crate::database::DbPool;
use crate::database::retry::retry_on_busy;
use crate::database::time::now_ms;

/// Default fallback poll interval for waiting consumers.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A step that is ready to run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItem {
    pub execution_id: String,
    pub step_id: String,
}

impl WorkItem {
    pub fn new(execution_id: impl Into<String>, step_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            step_id: step_id.into(),
        }
    }
}

/// FIFO transport between the scheduler and the workers.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn push(&self, item: WorkItem) -> Result<()>;

    /// Take the oldest item without waiting.
    async fn try_pop(&self) -> Result<Option<WorkItem>>;

    /// Number of items waiting.
    async fn len(&self) -> Result<u64>;

    /// Woken on every local push.
    fn notifier(&self) -> Arc<Notify>;

    /// How often waiting consumers re-check when no wakeup arrives
    /// (pushes from other processes are only seen this way).
    fn poll_interval(&self) -> Duration;

    /// Wait for the next item. Returns `None` once `cancel` fires.
    async fn blocking_pop(&self, cancel: &CancellationToken) -> Result<Option<WorkItem>> {
        let notify = self.notifier();
        let poll_interval = self.poll_interval();
        loop {
            // Register interest before checking so a push in between is not lost.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(item) = self.try_pop().await? {
                return Ok(Some(item));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = &mut notified => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}

/// Durable queue in the `work_queue` table.
///
/// Every process opening the same database file consumes the same queue.
pub struct SqliteWorkQueue {
    pool: DbPool,
    notify: Arc<Notify>,
    poll_interval: Duration,
}

impl SqliteWorkQueue {
    pub fn new(pool: DbPool) -> Self {
        Self::with_poll_interval(pool, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(pool: DbPool, poll_interval: Duration) -> Self {
        Self {
            pool,
            notify: Arc::new(Notify::new()),
            poll_interval,
        }
    }
}

#[async_trait]
impl WorkQueue for SqliteWorkQueue {
    async fn push(&self, item: WorkItem) -> Result<()> {
        retry_on_busy("work_queue_push", || async {
            sqlx::query(
                "INSERT INTO work_queue (execution_id, step_id, enqueued_at) VALUES (?, ?, ?)",
            )
            .bind(&item.execution_id)
            .bind(&item.step_id)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await?;

        debug!(execution_id = %item.execution_id, step_id = %item.step_id, "Pushed work item");
        self.notify.notify_one();
        Ok(())
    }

    async fn try_pop(&self) -> Result<Option<WorkItem>> {
        retry_on_busy("work_queue_pop", || async {
            // Single statement: the delete is the claim, so two consumers
            // never receive the same row.
            let row: Option<(String, String)> = sqlx::query_as(
                r#"
                DELETE FROM work_queue
                WHERE id = (SELECT id FROM work_queue ORDER BY id LIMIT 1)
                RETURNING execution_id, step_id
                "#,
            )
            .fetch_optional(&self.pool)
            .await?;

            Ok(row.map(|(execution_id, step_id)| WorkItem {
                execution_id,
                step_id,
            }))
        })
        .await
    }

    async fn len(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM work_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

/// In-process queue for single-process deployments and tests.
pub struct MemoryWorkQueue {
    items: Mutex<VecDeque<WorkItem>>,
    notify: Arc<Notify>,
    poll_interval: Duration,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Arc::new(Notify::new()),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Snapshot of the queued items, oldest first.
    pub fn snapshot(&self) -> Vec<WorkItem> {
        self.items.lock().iter().cloned().collect()
    }
}

impl Default for MemoryWorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn push(&self, item: WorkItem) -> Result<()> {
        self.items.lock().push_back(item);
        self.notify.notify_one();
        Ok(())
    }

    async fn try_pop(&self) -> Result<Option<WorkItem>> {
        Ok(self.items.lock().pop_front())
    }

    async fn len(&self) -> Result<u64> {
        Ok(self.items.lock().len() as u64)
    }

    fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::testing::temp_pool;

    #[tokio::test]
    async fn test_memory_queue_fifo() {
        let queue = MemoryWorkQueue::new();
        queue.push(WorkItem::new("e", "a")).await.unwrap();
        queue.push(WorkItem::new("e", "b")).await.unwrap();

        assert_eq!(queue.len().await.unwrap(), 2);
        assert_eq!(queue.try_pop().await.unwrap().unwrap().step_id, "a");
        assert_eq!(queue.try_pop().await.unwrap().unwrap().step_id, "b");
        assert!(queue.try_pop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_queue_fifo_and_shared() {
        let (_dir, pool) = temp_pool().await;
        let producer = SqliteWorkQueue::new(pool.clone());
        let consumer = SqliteWorkQueue::new(pool);

        producer.push(WorkItem::new("e", "first")).await.unwrap();
        producer.push(WorkItem::new("e", "second")).await.unwrap();

        assert_eq!(consumer.len().await.unwrap(), 2);
        assert_eq!(consumer.try_pop().await.unwrap().unwrap().step_id, "first");
        assert_eq!(producer.try_pop().await.unwrap().unwrap().step_id, "second");
        assert!(consumer.try_pop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blocking_pop_wakes_on_push() {
        let queue = Arc::new(MemoryWorkQueue::new());
        let cancel = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.blocking_pop(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(WorkItem::new("e", "s")).await.unwrap();

        let item = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(item, Some(WorkItem::new("e", "s")));
    }

    #[tokio::test]
    async fn test_blocking_pop_returns_none_on_cancel() {
        let queue = MemoryWorkQueue::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(queue.blocking_pop(&cancel).await.unwrap().is_none());
    }
}
