//! WebSocket adapter for a run's event log.
//!
//! Sends `{"type":"boot"}`, then one JSON message per event, and closes after
//! the `done` event. The cursor is attached before the upgrade completes, so
//! nothing published after the handshake is missed.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

use crate::api::stream::attach_reader;
use crate::api::ApiState;
use crate::events::{CursorItem, EventCursor};

const PING_INTERVAL: Duration = Duration::from_secs(20);

/// `GET /ws/runs/{run_id}`
pub async fn run_events_websocket(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    Path(run_id): Path<Uuid>,
) -> impl IntoResponse {
    let cursor = attach_reader(&state, run_id).await;
    tracing::info!(run_id = %run_id, reader = %cursor.id(), "Run WebSocket reader attached");
    ws.on_upgrade(move |socket| relay_run_events(socket, cursor))
}

async fn send_json(sender: &mut SplitSink<WebSocket, Message>, value: &Value) -> Result<(), axum::Error> {
    sender.send(Message::Text(value.to_string().into())).await
}

async fn relay_run_events(socket: WebSocket, mut cursor: EventCursor) {
    let run_id = cursor.run_id();
    let (mut sender, mut receiver) = socket.split();

    if send_json(&mut sender, &json!({"type": "boot"})).await.is_err() {
        return;
    }

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            item = cursor.next() => match item {
                CursorItem::Event(event) => {
                    let done = event.kind.is_done();
                    if let Err(e) = send_json(&mut sender, &event.to_wire()).await {
                        tracing::debug!(run_id = %run_id, error = %e, "Run WebSocket write failed");
                        break;
                    }
                    cursor.ack(event.seq);
                    if done {
                        break;
                    }
                }
                CursorItem::Gap { missed } => {
                    tracing::debug!(run_id = %run_id, reader = %cursor.id(), missed, "Run WebSocket reader skipped evicted events");
                }
                CursorItem::Closed => {
                    let _ = send_json(&mut sender, &json!({"type": "done"})).await;
                    break;
                }
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Ping(data))) => {
                    let _ = sender.send(Message::Pong(data)).await;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(run_id = %run_id, error = %e, "Run WebSocket receive error");
                    break;
                }
            },
            _ = ping.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sender.close().await;
    tracing::info!(run_id = %run_id, reader = %cursor.id(), "Run WebSocket reader detached");
}
