//! Progress notifier: outbound pipeline events.
//!
//! Events are fire-and-forget. Nobody listening is not an error, and a slow
//! subscriber only lags itself.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Default broadcast capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Events emitted by the scheduler, orchestrator and sweeper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum PipelineEvent {
    #[serde(rename = "pipeline.started")]
    Started {
        execution_id: String,
        trigger_id: String,
        pipeline_type: String,
    },
    #[serde(rename = "pipeline.step_completed")]
    StepCompleted {
        execution_id: String,
        step_key: String,
        /// Completed share of the steps known so far (0-100).
        percent_complete: f64,
    },
    #[serde(rename = "pipeline.completed")]
    Completed { execution_id: String },
    #[serde(rename = "pipeline.failed")]
    Failed {
        execution_id: String,
        step_key: String,
        error: String,
    },
    #[serde(rename = "pipeline.retried")]
    Retried {
        execution_id: String,
        reset_steps: Vec<String>,
    },
    #[serde(rename = "pipeline.cancelled")]
    Cancelled { execution_id: String },
    #[serde(rename = "pipeline.step_requeued")]
    StepRequeued {
        execution_id: String,
        step_key: String,
        /// `None` when a queued step lost its work item.
        #[serde(skip_serializing_if = "Option::is_none")]
        previous_worker: Option<String>,
    },
    /// Running, nothing in flight, no progress for a while.
    #[serde(rename = "pipeline.stalled")]
    Stalled {
        execution_id: String,
        pending_steps: i64,
    },
}

impl PipelineEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            Self::Started { execution_id, .. }
            | Self::StepCompleted { execution_id, .. }
            | Self::Completed { execution_id }
            | Self::Failed { execution_id, .. }
            | Self::Retried { execution_id, .. }
            | Self::Cancelled { execution_id }
            | Self::StepRequeued { execution_id, .. }
            | Self::Stalled { execution_id, .. } => execution_id,
        }
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "pipeline.started",
            Self::StepCompleted { .. } => "pipeline.step_completed",
            Self::Completed { .. } => "pipeline.completed",
            Self::Failed { .. } => "pipeline.failed",
            Self::Retried { .. } => "pipeline.retried",
            Self::Cancelled { .. } => "pipeline.cancelled",
            Self::StepRequeued { .. } => "pipeline.step_requeued",
            Self::Stalled { .. } => "pipeline.stalled",
        }
    }
}

/// Broadcasts [`PipelineEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct ProgressNotifier {
    tx: broadcast::Sender<PipelineEvent>,
}

impl ProgressNotifier {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: PipelineEvent) {
        trace!(
            event = event.name(),
            execution_id = %event.execution_id(),
            "Emitting pipeline event"
        );
        let _ = self.tx.send(event);
    }
}

impl Default for ProgressNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format() {
        let event = PipelineEvent::StepCompleted {
            execution_id: "e".to_string(),
            step_key: "scan".to_string(),
            percent_complete: 50.0,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "event": "pipeline.step_completed",
                "execution_id": "e",
                "step_key": "scan",
                "percent_complete": 50.0
            })
        );
        assert_eq!(event.name(), "pipeline.step_completed");
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_fine() {
        let notifier = ProgressNotifier::new();
        notifier.emit(PipelineEvent::Completed {
            execution_id: "e".to_string(),
        });

        let mut rx = notifier.subscribe();
        notifier.emit(PipelineEvent::Cancelled {
            execution_id: "e".to_string(),
        });
        assert_eq!(rx.recv().await.unwrap().name(), "pipeline.cancelled");
    }
}
