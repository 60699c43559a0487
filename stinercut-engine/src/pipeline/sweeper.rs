//! Lease sweeper and staleness watchdog.
//!
//! A worker that dies mid-step leaves the step `running` with a lease that is
//! no longer renewed. The sweeper hands such steps back to the scheduler, and
//! does the same for steps left `queued` past `stale_after` with no item.
//! Executions that are running but have nothing queued or running for a long
//! time (typically a dependency that was never spawned) are re-evaluated and,
//! if still stuck, reported.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::database::time::{ms_before_now, now_ms};
use crate::pipeline::progress::PipelineEvent;
use crate::pipeline::scheduler::Scheduler;

/// Sweeper configuration.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    /// Idle time after which a running execution counts as stalled.
    pub stale_after: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(15 * 60),
        }
    }
}

/// Summary of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Keys of orphaned steps returned to `pending`.
    pub requeued: Vec<String>,
    /// Executions that were stale and still have nothing to run.
    pub stalled: Vec<String>,
    /// Executions a re-evaluation got moving again (or completed).
    pub recovered: Vec<String>,
}

pub struct Sweeper {
    scheduler: Arc<Scheduler>,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(scheduler: Arc<Scheduler>, config: SweeperConfig) -> Self {
        Self { scheduler, config }
    }

    /// Run one reclaim + watchdog pass.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let repository = self.scheduler.repository();

        for step in repository.expired_leases(now_ms()).await? {
            let Some(worker_id) = step.worker_id.as_deref() else {
                continue;
            };

            let _guard = self.scheduler.locks().lock(&step.execution_id).await;
            if !repository.requeue_step(&step.id, worker_id).await? {
                // Heartbeat or report landed in between.
                continue;
            }

            warn!(
                execution_id = %step.execution_id,
                step_key = %step.step_key,
                worker_id = %worker_id,
                "Reclaimed step with expired lease"
            );
            self.scheduler.notifier().emit(PipelineEvent::StepRequeued {
                execution_id: step.execution_id.clone(),
                step_key: step.step_key.clone(),
                previous_worker: Some(worker_id.to_string()),
            });
            self.scheduler.evaluate_locked(&step.execution_id).await?;
            report.requeued.push(step.step_key.clone());
        }

        // A queued step whose item was lost (push failed after the CAS, or a
        // worker died between pop and claim) is never claimed. Duplicates of
        // a slow but live item are harmless: only one claim can win.
        let cutoff = ms_before_now(self.config.stale_after);
        for step in repository.orphaned_queued_steps(cutoff).await? {
            let _guard = self.scheduler.locks().lock(&step.execution_id).await;
            if !repository.requeue_queued_step(&step.id, cutoff).await? {
                continue;
            }

            warn!(
                execution_id = %step.execution_id,
                step_key = %step.step_key,
                "Requeued step that sat in the queue past the stale threshold"
            );
            self.scheduler.notifier().emit(PipelineEvent::StepRequeued {
                execution_id: step.execution_id.clone(),
                step_key: step.step_key.clone(),
                previous_worker: None,
            });
            self.scheduler.evaluate_locked(&step.execution_id).await?;
            report.requeued.push(step.step_key.clone());
        }

        for stale in repository.stale_executions(cutoff).await? {
            let _guard = self.scheduler.locks().lock(&stale.id).await;
            let outcome = self.scheduler.evaluate_locked(&stale.id).await?;

            if outcome.completed || !outcome.queued.is_empty() {
                info!(
                    execution_id = %stale.id,
                    queued = ?outcome.queued,
                    completed = outcome.completed,
                    "Re-evaluation resumed an idle execution"
                );
                report.recovered.push(stale.id);
                continue;
            }

            let idle_secs = (now_ms() - stale.updated_at).max(0) / 1000;
            warn!(
                execution_id = %stale.id,
                pending_steps = stale.pending_steps,
                idle_secs,
                "Pipeline execution is stalled: pending steps wait on dependencies that never complete"
            );
            self.scheduler.notifier().emit(PipelineEvent::Stalled {
                execution_id: stale.id.clone(),
                pending_steps: stale.pending_steps,
            });
            report.stalled.push(stale.id);
        }

        self.scheduler.locks().prune();
        Ok(report)
    }

    /// Sweep every `interval` until `cancel` fires.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.config.interval.as_secs(),
                stale_after_secs = self.config.stale_after.as_secs(),
                "Sweeper started"
            );
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match self.sweep_once().await {
                    Ok(report) => debug!(
                        requeued = report.requeued.len(),
                        stalled = report.stalled.len(),
                        recovered = report.recovered.len(),
                        "Sweep finished"
                    ),
                    Err(e) => error!(error = %e, "Sweep failed"),
                }
            }
            info!("Sweeper stopped");
        })
    }
}
