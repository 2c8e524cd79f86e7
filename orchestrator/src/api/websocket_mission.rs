//! WebSocket relay for an organization's mission stream.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::actors::MissionSubscription;
use crate::api::error::{ApiError, ApiErrorCode};
use crate::api::ApiState;

pub const ORG_HEADER: &str = "x-org-id";

#[derive(Debug, Deserialize)]
pub struct MissionQuery {
    pub org_id: Option<String>,
}

/// `GET /ws/mission?org_id=...`
///
/// The first message is the organization's last known signal (or
/// `offline`); after that every signal, alert and crew change, plus a
/// re-sent signal whenever the stream has been quiet for the idle window.
pub async fn mission_websocket(
    ws: WebSocketUpgrade,
    Query(query): Query<MissionQuery>,
    headers: HeaderMap,
    State(state): State<ApiState>,
) -> Response {
    let org_id = query
        .org_id
        .or_else(|| {
            headers
                .get(ORG_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        })
        .map(|org| org.trim().to_string())
        .filter(|org| !org.is_empty());
    let Some(org_id) = org_id else {
        return ApiError::new(ApiErrorCode::InvalidRequest, "org_id is required").into_response();
    };

    let subscription = match state.app_state.mission.subscribe(&org_id).await {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::error!(org_id = %org_id, error = %e, "Mission subscribe failed");
            return ApiError::new(ApiErrorCode::MissionBusUnavailable, e.to_string())
                .into_response();
        }
    };

    ws.on_upgrade(move |socket| relay_mission(socket, subscription))
        .into_response()
}

async fn relay_mission(socket: WebSocket, mut subscription: MissionSubscription) {
    let (mut sender, mut receiver) = socket.split();
    tracing::info!(
        org_id = %subscription.org_id(),
        subscriber_id = %subscription.id(),
        "Mission WebSocket connected"
    );

    // Only outgoing messages push the heartbeat back; client chatter does not.
    let idle_window = subscription.idle_window();
    let heartbeat = tokio::time::sleep(idle_window);
    tokio::pin!(heartbeat);

    loop {
        let message = tokio::select! {
            message = subscription.recv() => match message {
                Some(message) => message,
                None => break,
            },
            () = &mut heartbeat => subscription.heartbeat(),
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "Mission WebSocket receive error");
                        break;
                    }
                }
                continue;
            }
        };

        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode mission message");
                continue;
            }
        };
        if sender.send(Message::Text(text.into())).await.is_err() {
            break;
        }
        heartbeat
            .as_mut()
            .reset(tokio::time::Instant::now() + idle_window);
    }

    let _ = sender.close().await;
    tracing::info!(
        org_id = %subscription.org_id(),
        subscriber_id = %subscription.id(),
        dropped = subscription.dropped(),
        "Mission WebSocket disconnected"
    );
}
