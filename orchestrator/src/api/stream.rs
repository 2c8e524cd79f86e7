//! Server-Sent Events adapter for a run's event log.
//!
//! Frame sequence: `event: boot`, one `data:` frame per event in sequence
//! order, then a synthetic `event: done` frame, then end of stream. A client
//! that connects after the run finished gets `boot` followed by `done`.

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::{self, Stream};
use std::convert::Infallible;
use std::time::Duration;
use uuid::Uuid;

use crate::api::ApiState;
use crate::events::{CursorItem, EventCursor};

const SSE_KEEPALIVE: Duration = Duration::from_secs(15);

/// `GET /events/runs/{run_id}`
pub async fn run_events_sse(
    State(state): State<ApiState>,
    Path(run_id): Path<Uuid>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let cursor = attach_reader(&state, run_id).await;
    tracing::info!(run_id = %run_id, reader = %cursor.id(), "SSE reader attached");
    Sse::new(sse_frames(cursor)).keep_alive(KeepAlive::new().interval(SSE_KEEPALIVE))
}

/// Cursor for a transport reader. Runs that are terminal or unknown to the
/// store get a cursor that ends once the retained log (if any) is drained.
pub async fn attach_reader(state: &ApiState, run_id: Uuid) -> EventCursor {
    let app = &state.app_state;
    match app.store.get_run(run_id).await {
        Ok(Some(run)) if !run.is_terminal() => app.events.subscribe(run_id),
        Ok(_) => app.events.subscribe_finished(run_id),
        Err(e) => {
            tracing::warn!(run_id = %run_id, error = %e, "Run lookup failed, attaching to live log");
            app.events.subscribe(run_id)
        }
    }
}

enum Phase {
    Boot(EventCursor),
    Streaming {
        cursor: EventCursor,
        /// Sequence id of the frame handed out last; acknowledged once the
        /// body asks for the next frame.
        pending_ack: Option<u64>,
    },
    Closing,
    Finished,
}

fn boot_frame() -> Event {
    Event::default().event("boot").data("{}")
}

fn done_frame() -> Event {
    Event::default().event("done").data("{}")
}

/// Turn a cursor into the SSE frame stream.
pub fn sse_frames(cursor: EventCursor) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(Phase::Boot(cursor), |phase| async move {
        match phase {
            Phase::Boot(cursor) => Some((
                Ok(boot_frame()),
                Phase::Streaming {
                    cursor,
                    pending_ack: None,
                },
            )),
            Phase::Streaming {
                mut cursor,
                pending_ack,
            } => {
                if let Some(seq) = pending_ack {
                    cursor.ack(seq);
                }
                loop {
                    match cursor.next().await {
                        CursorItem::Event(event) => {
                            let frame = Event::default().data(event.to_wire().to_string());
                            let next = if event.kind.is_done() {
                                tracing::debug!(run_id = %event.run_id, reader = %cursor.id(), "SSE stream reached done");
                                Phase::Closing
                            } else {
                                Phase::Streaming {
                                    cursor,
                                    pending_ack: Some(event.seq),
                                }
                            };
                            return Some((Ok(frame), next));
                        }
                        CursorItem::Gap { missed } => {
                            tracing::debug!(reader = %cursor.id(), missed, "SSE reader skipped evicted events");
                        }
                        CursorItem::Closed => return Some((Ok(done_frame()), Phase::Finished)),
                    }
                }
            }
            Phase::Closing => Some((Ok(done_frame()), Phase::Finished)),
            Phase::Finished => None,
        }
    })
}
