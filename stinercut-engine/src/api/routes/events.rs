//! Pipeline event stream.
//!
//! `GET /api/events/ws[?execution_id=...]` upgrades to a WebSocket that
//! receives every [`PipelineEvent`] as a JSON text frame, optionally
//! restricted to one execution.

use std::time::Duration;

use axum::{
    Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::api::server::AppState;
use crate::pipeline::PipelineEvent;

/// Heartbeat ping interval in seconds.
const HEARTBEAT_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Default, Deserialize)]
pub struct EventStreamParams {
    /// Only forward events of this execution
    #[serde(default)]
    pub execution_id: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(pipeline_events_ws))
}

async fn pipeline_events_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<EventStreamParams>,
) -> impl IntoResponse {
    // Subscribe before the upgrade completes so nothing emitted meanwhile is missed.
    let events = state.orchestrator.scheduler().notifier().subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, events, params.execution_id))
}

/// JSON frame for `event`, or `None` when the filter excludes it.
fn encode_event(event: &PipelineEvent, filter: Option<&str>) -> Option<String> {
    if let Some(execution_id) = filter
        && event.execution_id() != execution_id
    {
        return None;
    }
    match serde_json::to_string(event) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(event = event.name(), error = %e, "Failed to encode pipeline event");
            None
        }
    }
}

async fn handle_socket(
    socket: WebSocket,
    mut events: broadcast::Receiver<PipelineEvent>,
    filter: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();
    let mut heartbeat_interval =
        tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    heartbeat_interval.tick().await;
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                    Some(Err(e)) => {
                        debug!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if let Some(text) = encode_event(&event, filter.as_deref())
                            && sender.send(Message::Text(text.into())).await.is_err()
                        {
                            debug!("Event stream client went away");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Event stream receiver lagged by {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Event channel closed");
                        break;
                    }
                }
            }

            _ = heartbeat_interval.tick() => {
                if awaiting_pong {
                    debug!("Client failed to respond to Ping, closing connection");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }
        }
    }

    let _ = sender.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn completed(execution_id: &str) -> PipelineEvent {
        PipelineEvent::Completed {
            execution_id: execution_id.to_string(),
        }
    }

    #[test]
    fn test_encode_without_filter() {
        let text = encode_event(&completed("e-1"), None).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "pipeline.completed");
        assert_eq!(value["execution_id"], "e-1");
    }

    #[test]
    fn test_encode_applies_execution_filter() {
        assert!(encode_event(&completed("e-1"), Some("e-1")).is_some());
        assert!(encode_event(&completed("e-2"), Some("e-1")).is_none());
    }
}
